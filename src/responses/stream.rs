use super::{OutputItem, ResponsesEvent};
use crate::anthropic::stream::{BlockKind, StreamState};
use crate::chat::{ChatCompletionChunk, ChunkDelta};
use crate::error::StreamError;
use crate::tools::strip_tool_prefix;
use serde_json::Value;
use std::collections::HashMap;

/// [`StreamState`] plus the output-index to tool-ordinal map the Responses
/// protocol needs, since its argument deltas address items by output index.
#[derive(Debug, Clone)]
pub struct ResponsesStreamState {
    pub base: StreamState,
    ordinals: HashMap<i64, u32>,
}

impl ResponsesStreamState {
    pub fn new(base: StreamState) -> Self {
        Self {
            base,
            ordinals: HashMap::new(),
        }
    }

    fn saw_tool_call(&self) -> bool {
        self.base.tool_ordinal.is_some()
    }
}

pub fn map_data(
    state: &mut ResponsesStreamState,
    data: &str,
) -> Result<Option<ChatCompletionChunk>, StreamError> {
    let raw: Value = serde_json::from_str(data).map_err(|err| {
        StreamError::new("stream_error", format!("malformed upstream event: {err}"))
    })?;
    match serde_json::from_value::<ResponsesEvent>(raw) {
        Ok(event) => map_event(state, event),
        Err(err) => {
            tracing::warn!(message_id = %state.base.message_id, "skipping unexpected upstream event shape: {err}");
            Ok(None)
        }
    }
}

pub fn map_event(
    state: &mut ResponsesStreamState,
    event: ResponsesEvent,
) -> Result<Option<ChatCompletionChunk>, StreamError> {
    match event {
        ResponsesEvent::Created | ResponsesEvent::InProgress => Ok(state.base.role_chunk()),
        ResponsesEvent::OutputItemAdded { output_index, item } => {
            state.base.current_block_index = output_index;
            match item {
                OutputItem::Message => {
                    state.base.current_block_type = Some(BlockKind::Text);
                    Ok(state.base.role_chunk())
                }
                OutputItem::FunctionCall { call_id, name } => {
                    state.base.current_block_type = Some(BlockKind::ToolUse);
                    let ordinal = state.base.next_tool_ordinal();
                    state.ordinals.insert(output_index, ordinal);
                    let delta = ChunkDelta::tool_call_start(ordinal, call_id, strip_tool_prefix(&name));
                    Ok(Some(state.base.chunk(delta, None)))
                }
                OutputItem::Other => {
                    state.base.current_block_type = None;
                    Ok(None)
                }
            }
        }
        ResponsesEvent::OutputTextDelta { delta } => {
            Ok(Some(state.base.chunk(ChunkDelta::content(delta), None)))
        }
        ResponsesEvent::FunctionCallArgumentsDelta {
            output_index,
            delta,
        } => {
            let ordinal = output_index
                .and_then(|idx| state.ordinals.get(&idx).copied())
                .or(state.base.tool_ordinal);
            match ordinal {
                Some(ordinal) => {
                    let delta = ChunkDelta::tool_call_arguments(ordinal, delta);
                    Ok(Some(state.base.chunk(delta, None)))
                }
                None => {
                    tracing::warn!(
                        message_id = %state.base.message_id,
                        "argument fragment arrived before any function call item, dropping"
                    );
                    Ok(None)
                }
            }
        }
        ResponsesEvent::Completed => {
            let reason = if state.saw_tool_call() { "tool_calls" } else { "stop" };
            Ok(Some(state.base.finish_chunk(reason)))
        }
        ResponsesEvent::Incomplete { response } => {
            let reason = response
                .and_then(|r| r.incomplete_details)
                .and_then(|d| d.reason);
            let finish = match reason.as_deref() {
                Some("max_output_tokens") => "length",
                _ => "stop",
            };
            Ok(Some(state.base.finish_chunk(finish)))
        }
        ResponsesEvent::Failed { response } => {
            let error = response.and_then(|r| r.error).unwrap_or_default();
            let message = if error.message.is_empty() {
                "upstream response failed".to_string()
            } else {
                error.message
            };
            Err(StreamError::new(
                error.code.unwrap_or_else(|| "upstream_error".to_string()),
                message,
            ))
        }
        ResponsesEvent::Error { code, message } => Err(StreamError::new(
            code.unwrap_or_else(|| "upstream_error".to_string()),
            message,
        )),
        ResponsesEvent::Unknown => Ok(None),
    }
}
