//! Anthropic Messages API: request encoding from the chat shape and the
//! typed upstream payloads the mappers consume.

use crate::chat::{ChatCompletionRequest, ChatMessage, ChatRole, ContentPart, MessageContent};
use crate::config::DEFAULT_MAX_TOKENS_VALUE;
use crate::tools::{self, tag_tool_name};
use serde::Deserialize;
use serde_json::{Map, Value, json};

pub mod response;
pub mod stream;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const MESSAGES_PATH: &str = "/v1/messages";

/// Upstream stream events. Unknown event types land in `Unknown` and are
/// ignored by the mapper.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        #[serde(default)]
        message: Option<MessageHeader>,
    },
    ContentBlockStart {
        #[serde(default)]
        index: i64,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        #[serde(default)]
        index: i64,
        delta: BlockDelta,
    },
    ContentBlockStop {
        #[serde(default)]
        index: i64,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<Usage>,
    },
    MessageStop,
    Ping,
    Error {
        error: UpstreamErrorBody,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MessageHeader {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        #[serde(default)]
        id: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: Value,
    },
    /// thinking, redacted_thinking, server tool blocks and future kinds
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    TextDelta {
        #[serde(default)]
        text: String,
    },
    InputJsonDelta {
        #[serde(default)]
        partial_json: String,
    },
    ThinkingDelta {
        #[serde(default)]
        thinking: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MessageDeltaBody {
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub stop_sequence: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct UpstreamErrorBody {
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(default)]
    pub message: String,
}

/// Complete (non-streaming) Messages response.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MessageResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// Total mapping from Anthropic `stop_reason` to chat `finish_reason`.
pub fn finish_reason(stop_reason: &str) -> &'static str {
    match stop_reason {
        "end_turn" | "stop_sequence" => "stop",
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        _ => "stop",
    }
}

pub fn encode_request(req: &ChatCompletionRequest, stream: bool, tag_tool_names: bool) -> Value {
    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<Value> = Vec::new();

    for message in &req.messages {
        match message.role {
            ChatRole::System | ChatRole::Developer => {
                let text = message.text_content();
                if !text.is_empty() {
                    system_parts.push(text);
                }
            }
            ChatRole::Tool => push_tool_result(&mut messages, message),
            ChatRole::Assistant => {
                if let Some(encoded) = encode_assistant_message(message, tag_tool_names) {
                    messages.push(encoded);
                }
            }
            ChatRole::User | ChatRole::Other => messages.push(json!({
                "role": "user",
                "content": encode_user_content(message.content.as_ref()),
            })),
        }
    }

    let mut body = Map::new();
    body.insert("model".to_string(), Value::String(req.model.clone()));
    body.insert("messages".to_string(), Value::Array(messages));
    body.insert(
        "max_tokens".to_string(),
        Value::from(
            req.max_tokens
                .unwrap_or(DEFAULT_MAX_TOKENS_VALUE.unsigned_abs()),
        ),
    );
    if !system_parts.is_empty() {
        body.insert("system".to_string(), Value::String(system_parts.join("\n")));
    }
    if stream {
        body.insert("stream".to_string(), Value::Bool(true));
    }
    if let Some(temperature) = req.temperature {
        body.insert("temperature".to_string(), Value::from(temperature));
    }
    if let Some(top_p) = req.top_p {
        body.insert("top_p".to_string(), Value::from(top_p));
    }
    if let Some(stop) = req.stop.clone() {
        body.insert("stop_sequences".to_string(), json!(stop.into_vec()));
    }
    if let Some(tools) = tools::to_anthropic_tools(req.tools.as_deref(), tag_tool_names) {
        body.insert("tools".to_string(), Value::Array(tools));
        if let Some(choice) = req
            .tool_choice
            .as_ref()
            .and_then(|c| encode_tool_choice(c, tag_tool_names))
        {
            body.insert("tool_choice".to_string(), choice);
        }
    }
    Value::Object(body)
}

fn encode_tool_choice(choice: &Value, tag_tool_names: bool) -> Option<Value> {
    if let Some(mode) = choice.as_str() {
        return match mode {
            "auto" => Some(json!({ "type": "auto" })),
            "required" => Some(json!({ "type": "any" })),
            "none" => Some(json!({ "type": "none" })),
            _ => None,
        };
    }
    let name = choice
        .get("function")
        .and_then(|f| f.get("name"))
        .and_then(|v| v.as_str())?;
    let name = if tag_tool_names {
        tag_tool_name(name)
    } else {
        name.to_string()
    };
    Some(json!({ "type": "tool", "name": name }))
}

fn encode_user_content(content: Option<&MessageContent>) -> Value {
    match content {
        None => Value::String(String::new()),
        Some(MessageContent::Text(text)) => Value::String(text.clone()),
        Some(MessageContent::Parts(parts)) => Value::Array(
            parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(json!({ "type": "text", "text": text })),
                    ContentPart::ImageUrl { image_url } => Some(encode_image(&image_url.url)),
                    ContentPart::Unsupported => None,
                })
                .collect(),
        ),
    }
}

fn encode_image(url: &str) -> Value {
    if let Some((media_type, data)) = parse_data_url(url) {
        return json!({
            "type": "image",
            "source": { "type": "base64", "media_type": media_type, "data": data }
        });
    }
    json!({ "type": "image", "source": { "type": "url", "url": url } })
}

fn parse_data_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let media_type = meta.strip_suffix(";base64")?;
    Some((media_type, data))
}

fn encode_assistant_message(message: &ChatMessage, tag_tool_names: bool) -> Option<Value> {
    let mut content: Vec<Value> = Vec::new();
    let text = message.text_content();
    if !text.is_empty() {
        content.push(json!({ "type": "text", "text": text }));
    }
    for call in message.tool_calls.iter().flatten() {
        let input = parse_tool_arguments(&call.function.arguments);
        let name = if tag_tool_names {
            tag_tool_name(&call.function.name)
        } else {
            call.function.name.clone()
        };
        content.push(json!({
            "type": "tool_use",
            "id": call.id,
            "name": name,
            "input": input
        }));
    }
    if content.is_empty() {
        return None;
    }
    Some(json!({ "role": "assistant", "content": content }))
}

fn parse_tool_arguments(arguments: &str) -> Value {
    if arguments.trim().is_empty() {
        return json!({});
    }
    match serde_json::from_str::<Value>(arguments) {
        Ok(value) if value.is_object() => value,
        Ok(_) | Err(_) => {
            tracing::warn!("tool call arguments are not a JSON object, sending empty input");
            json!({})
        }
    }
}

fn push_tool_result(messages: &mut Vec<Value>, message: &ChatMessage) {
    let block = json!({
        "type": "tool_result",
        "tool_use_id": message.tool_call_id.clone().unwrap_or_default(),
        "content": message.text_content(),
    });
    if let Some(blocks) = messages.last_mut().and_then(trailing_tool_results) {
        blocks.push(block);
        return;
    }
    messages.push(json!({ "role": "user", "content": [block] }));
}

/// The content array of the last message when it is a user turn holding
/// only tool results, so consecutive tool messages share one turn.
fn trailing_tool_results(last: &mut Value) -> Option<&mut Vec<Value>> {
    if last.get("role").and_then(|v| v.as_str()) != Some("user") {
        return None;
    }
    let blocks = last.get_mut("content")?.as_array_mut()?;
    let all_results = !blocks.is_empty()
        && blocks
            .iter()
            .all(|b| b.get("type").and_then(|v| v.as_str()) == Some("tool_result"));
    if all_results { Some(blocks) } else { None }
}
