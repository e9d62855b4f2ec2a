//! Responses-style upstream for codex/gpt models: the chat request is
//! bridged into a Responses request and its event stream is mapped back
//! into chat chunks by [`stream`].

use crate::chat::{ChatCompletionRequest, ChatMessage, ChatRole, ContentPart, MessageContent};
use crate::tools;
use serde::Deserialize;
use serde_json::{Map, Value, json};

pub mod stream;

pub const RESPONSES_PATH: &str = "responses";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ResponsesEvent {
    #[serde(rename = "response.created")]
    Created,
    #[serde(rename = "response.in_progress")]
    InProgress,
    #[serde(rename = "response.output_item.added")]
    OutputItemAdded {
        #[serde(default)]
        output_index: i64,
        item: OutputItem,
    },
    #[serde(rename = "response.output_text.delta")]
    OutputTextDelta {
        #[serde(default)]
        delta: String,
    },
    #[serde(rename = "response.function_call_arguments.delta")]
    FunctionCallArgumentsDelta {
        #[serde(default)]
        output_index: Option<i64>,
        #[serde(default)]
        delta: String,
    },
    #[serde(rename = "response.completed")]
    Completed,
    #[serde(rename = "response.incomplete")]
    Incomplete {
        #[serde(default)]
        response: Option<ResponseStatus>,
    },
    #[serde(rename = "response.failed")]
    Failed {
        #[serde(default)]
        response: Option<ResponseStatus>,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputItem {
    Message,
    FunctionCall {
        #[serde(default)]
        call_id: String,
        #[serde(default)]
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ResponseStatus {
    #[serde(default)]
    pub incomplete_details: Option<IncompleteDetails>,
    #[serde(default)]
    pub error: Option<ResponseErrorBody>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct IncompleteDetails {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ResponseErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

pub fn encode_request(req: &ChatCompletionRequest) -> Value {
    let mut instructions: Vec<String> = Vec::new();
    let mut input: Vec<Value> = Vec::new();

    for message in &req.messages {
        match message.role {
            ChatRole::System | ChatRole::Developer => {
                let text = message.text_content();
                if !text.is_empty() {
                    instructions.push(text);
                }
            }
            ChatRole::Assistant => encode_assistant(&mut input, message),
            ChatRole::Tool => input.push(json!({
                "type": "function_call_output",
                "call_id": message.tool_call_id.clone().unwrap_or_default(),
                "output": message.text_content(),
            })),
            ChatRole::User | ChatRole::Other => input.push(json!({
                "type": "message",
                "role": "user",
                "content": encode_user_parts(message.content.as_ref()),
            })),
        }
    }

    let mut body = Map::new();
    body.insert("model".to_string(), Value::String(req.model.clone()));
    body.insert("input".to_string(), Value::Array(input));
    body.insert("stream".to_string(), Value::Bool(true));
    if !instructions.is_empty() {
        body.insert(
            "instructions".to_string(),
            Value::String(instructions.join("\n")),
        );
    }
    if let Some(max_tokens) = req.max_tokens {
        body.insert("max_output_tokens".to_string(), Value::from(max_tokens));
    }
    if let Some(temperature) = req.temperature {
        body.insert("temperature".to_string(), Value::from(temperature));
    }
    if let Some(top_p) = req.top_p {
        body.insert("top_p".to_string(), Value::from(top_p));
    }
    if let Some(tools) = tools::to_responses_tools(req.tools.as_deref()) {
        body.insert("tools".to_string(), Value::Array(tools));
        body.insert("tool_choice".to_string(), Value::String("auto".to_string()));
    }
    Value::Object(body)
}

fn encode_user_parts(content: Option<&MessageContent>) -> Vec<Value> {
    match content {
        None => Vec::new(),
        Some(MessageContent::Text(text)) => vec![json!({ "type": "input_text", "text": text })],
        Some(MessageContent::Parts(parts)) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(json!({ "type": "input_text", "text": text })),
                ContentPart::ImageUrl { image_url } => Some(json!({
                    "type": "input_image",
                    "image_url": image_url.url,
                })),
                ContentPart::Unsupported => None,
            })
            .collect(),
    }
}

fn encode_assistant(input: &mut Vec<Value>, message: &ChatMessage) {
    let text = message.text_content();
    if !text.is_empty() {
        input.push(json!({
            "type": "message",
            "role": "assistant",
            "content": [{ "type": "output_text", "text": text }],
        }));
    }
    for call in message.tool_calls.iter().flatten() {
        input.push(json!({
            "type": "function_call",
            "call_id": call.id,
            "name": call.function.name,
            "arguments": call.function.arguments,
        }));
    }
}
