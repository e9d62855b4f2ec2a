use super::{ContentBlock, MessageResponse, finish_reason};
use crate::chat::{
    AssistantMessage, COMPLETION_OBJECT, ChatCompletion, CompletionChoice, CompletionUsage,
    FunctionCall, ToolCall, now_ts,
};
use crate::tools::strip_tool_prefix;
use serde::Serialize;
use serde_json::Value;
use serde_json::ser::Formatter;
use std::io;

const UPSTREAM_ID_PREFIX: &str = "msg_";
const COMPLETION_ID_PREFIX: &str = "chatcmpl-";

/// `msg_ABC` becomes `chatcmpl-ABC`; ids without the upstream prefix keep
/// their full text after the gateway prefix.
pub fn convert_id(upstream_id: &str) -> String {
    let suffix = upstream_id
        .strip_prefix(UPSTREAM_ID_PREFIX)
        .unwrap_or(upstream_id);
    format!("{COMPLETION_ID_PREFIX}{suffix}")
}

pub fn map_message(message: MessageResponse, requested_model: &str) -> ChatCompletion {
    let mut texts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    for block in message.content {
        match block {
            ContentBlock::Text { text } => texts.push(text),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id,
                call_type: "function".to_string(),
                function: FunctionCall {
                    name: strip_tool_prefix(&name).to_string(),
                    arguments: serialize_arguments(&input),
                },
            }),
            ContentBlock::Other => {}
        }
    }

    let id = if message.id.is_empty() {
        format!("{COMPLETION_ID_PREFIX}{}", uuid::Uuid::new_v4().simple())
    } else {
        convert_id(&message.id)
    };
    let model = if message.model.is_empty() {
        requested_model.to_string()
    } else {
        message.model
    };
    let usage = message.usage.unwrap_or_default();
    let prompt_tokens = usage.input_tokens.unwrap_or(0);
    let completion_tokens = usage.output_tokens.unwrap_or(0);

    ChatCompletion {
        id,
        object: COMPLETION_OBJECT.to_string(),
        created: now_ts(),
        model,
        choices: vec![CompletionChoice {
            index: 0,
            message: AssistantMessage {
                role: "assistant".to_string(),
                content: if texts.is_empty() {
                    None
                } else {
                    Some(texts.join("\n"))
                },
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
            },
            finish_reason: finish_reason(message.stop_reason.as_deref().unwrap_or_default())
                .to_string(),
        }],
        usage: CompletionUsage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        },
    }
}

/// Tool input rendered as the arguments string clients expect, with a space
/// after every `:` and `,` separator. String input is passed through.
pub fn serialize_arguments(input: &Value) -> String {
    match input {
        Value::Null => "{}".to_string(),
        Value::String(raw) => raw.clone(),
        other => {
            let mut buf = Vec::new();
            let mut ser = serde_json::Serializer::with_formatter(&mut buf, SpacedFormatter);
            match other.serialize(&mut ser) {
                Ok(()) => String::from_utf8(buf).unwrap_or_else(|_| other.to_string()),
                Err(_) => other.to_string(),
            }
        }
    }
}

struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(value: Value) -> MessageResponse {
        serde_json::from_value(value).expect("message")
    }

    #[test]
    fn convert_id_swaps_prefix_and_keeps_suffix() {
        assert_eq!(convert_id("msg_ABC123"), "chatcmpl-ABC123");
        assert_eq!(convert_id("xyz789"), "chatcmpl-xyz789");
        assert_eq!(convert_id("msg_msg_1"), "chatcmpl-msg_1");
    }

    #[test]
    fn text_blocks_join_with_newline() {
        let out = map_message(
            response(json!({
                "id": "msg_1",
                "model": "claude-sonnet-4-5",
                "content": [{"type": "text", "text": "a"}, {"type": "thinking", "thinking": "x"}, {"type": "text", "text": "b"}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 10, "output_tokens": 5}
            })),
            "claude",
        );
        assert_eq!(out.id, "chatcmpl-1");
        assert_eq!(out.object, "chat.completion");
        assert_eq!(out.model, "claude-sonnet-4-5");
        let choice = &out.choices[0];
        assert_eq!(choice.message.content.as_deref(), Some("a\nb"));
        assert_eq!(choice.message.tool_calls, None);
        assert_eq!(choice.finish_reason, "stop");
        assert_eq!(
            out.usage,
            CompletionUsage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15 }
        );
    }

    #[test]
    fn empty_content_maps_to_null_and_usage_defaults_to_zero() {
        let out = map_message(
            response(json!({"id": "msg_2", "content": [], "stop_reason": "max_tokens", "usage": {"input_tokens": null}})),
            "claude-haiku",
        );
        assert_eq!(out.model, "claude-haiku");
        assert_eq!(out.choices[0].message.content, None);
        assert_eq!(out.choices[0].finish_reason, "length");
        assert_eq!(out.usage, CompletionUsage::default());
        let value = serde_json::to_value(&out).expect("json");
        assert!(value["choices"][0]["message"]["content"].is_null());
    }

    #[test]
    fn tool_use_arguments_are_a_spaced_json_string() {
        let out = map_message(
            response(json!({
                "id": "msg_3",
                "content": [{"type": "tool_use", "id": "toolu_1", "name": "op_horoscope", "input": {"sign": "Leo"}}],
                "stop_reason": "tool_use"
            })),
            "claude",
        );
        let calls = out.choices[0].message.tool_calls.as_ref().expect("tool calls");
        assert_eq!(calls[0].id, "toolu_1");
        assert_eq!(calls[0].call_type, "function");
        assert_eq!(calls[0].function.name, "horoscope");
        assert_eq!(calls[0].function.arguments, r#"{"sign": "Leo"}"#);
        assert_eq!(out.choices[0].finish_reason, "tool_calls");
    }

    #[test]
    fn argument_formatting_handles_nesting() {
        assert_eq!(
            serialize_arguments(&json!({"a": [1, 2], "b": {"c": null}})),
            r#"{"a": [1, 2], "b": {"c": null}}"#
        );
        assert_eq!(serialize_arguments(&json!({})), "{}");
        assert_eq!(serialize_arguments(&Value::Null), "{}");
    }
}
