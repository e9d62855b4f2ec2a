//! Anthropic stream events to chat-completion chunks.
//!
//! One [`StreamState`] lives for one outbound stream. The mapper is fed the
//! upstream events in order and returns at most one chunk per event.

use super::{BlockDelta, ContentBlock, StreamEvent, finish_reason};
use crate::chat::{ChatCompletionChunk, ChunkDelta, now_ts};
use crate::error::StreamError;
use crate::tools::strip_tool_prefix;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Text,
    ToolUse,
}

/// Cross-event bookkeeping for one response stream.
#[derive(Debug, Clone)]
pub struct StreamState {
    pub message_id: String,
    pub created: i64,
    pub model: String,
    pub role_announced: bool,
    /// Upstream index of the open block, -1 before the first block starts.
    pub current_block_index: i64,
    pub current_block_type: Option<BlockKind>,
    /// Outbound tool-call index of the latest tool block. `None` until the
    /// first tool block opens.
    pub tool_ordinal: Option<u32>,
}

impl StreamState {
    pub fn new(model: impl Into<String>) -> Self {
        Self::with_id(
            format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            now_ts(),
            model,
        )
    }

    pub fn with_id(message_id: impl Into<String>, created: i64, model: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            created,
            model: model.into(),
            role_announced: false,
            current_block_index: -1,
            current_block_type: None,
            tool_ordinal: None,
        }
    }

    /// Builds a chunk on this stream. Any chunk going out closes the window
    /// for a role announcement.
    pub fn chunk(&mut self, delta: ChunkDelta, finish_reason: Option<&str>) -> ChatCompletionChunk {
        self.role_announced = true;
        ChatCompletionChunk::new(
            &self.message_id,
            self.created,
            &self.model,
            delta,
            finish_reason.map(str::to_string),
        )
    }

    pub fn role_chunk(&mut self) -> Option<ChatCompletionChunk> {
        if self.role_announced {
            return None;
        }
        Some(self.chunk(ChunkDelta::role_announcement(), None))
    }

    pub fn finish_chunk(&mut self, reason: &str) -> ChatCompletionChunk {
        self.chunk(ChunkDelta::default(), Some(reason))
    }

    pub fn next_tool_ordinal(&mut self) -> u32 {
        let next = self.tool_ordinal.map_or(0, |o| o + 1);
        self.tool_ordinal = Some(next);
        next
    }
}

/// Parses one SSE `data:` payload and maps it.
///
/// Data that is not JSON at all is fatal for the stream. JSON that does not
/// fit the shape of its event type is logged and skipped.
pub fn map_data(
    state: &mut StreamState,
    data: &str,
) -> Result<Option<ChatCompletionChunk>, StreamError> {
    let raw: Value = serde_json::from_str(data).map_err(|err| {
        StreamError::new("stream_error", format!("malformed upstream event: {err}"))
    })?;
    match serde_json::from_value::<StreamEvent>(raw) {
        Ok(event) => map_event(state, event),
        Err(err) => {
            tracing::warn!(message_id = %state.message_id, "skipping unexpected upstream event shape: {err}");
            Ok(None)
        }
    }
}

pub fn map_event(
    state: &mut StreamState,
    event: StreamEvent,
) -> Result<Option<ChatCompletionChunk>, StreamError> {
    match event {
        StreamEvent::MessageStart { .. } => Ok(state.role_chunk()),
        StreamEvent::ContentBlockStart {
            index,
            content_block,
        } => {
            state.current_block_index = index;
            match content_block {
                ContentBlock::Text { .. } => {
                    state.current_block_type = Some(BlockKind::Text);
                    Ok(state.role_chunk())
                }
                ContentBlock::ToolUse { id, name, .. } => {
                    state.current_block_type = Some(BlockKind::ToolUse);
                    let ordinal = state.next_tool_ordinal();
                    let delta = ChunkDelta::tool_call_start(ordinal, id, strip_tool_prefix(&name));
                    Ok(Some(state.chunk(delta, None)))
                }
                ContentBlock::Other => {
                    state.current_block_type = None;
                    Ok(None)
                }
            }
        }
        StreamEvent::ContentBlockDelta { delta, .. } => match delta {
            BlockDelta::TextDelta { text } => Ok(Some(state.chunk(ChunkDelta::content(text), None))),
            BlockDelta::InputJsonDelta { partial_json } => match state.tool_ordinal {
                Some(ordinal) => {
                    let delta = ChunkDelta::tool_call_arguments(ordinal, partial_json);
                    Ok(Some(state.chunk(delta, None)))
                }
                None => {
                    tracing::warn!(
                        message_id = %state.message_id,
                        "argument fragment arrived before any tool block, dropping"
                    );
                    Ok(None)
                }
            },
            BlockDelta::ThinkingDelta { .. } | BlockDelta::Other => Ok(None),
        },
        StreamEvent::ContentBlockStop { .. } => {
            state.current_block_type = None;
            Ok(None)
        }
        StreamEvent::MessageDelta { delta, .. } => Ok(delta
            .stop_reason
            .as_deref()
            .filter(|reason| !reason.is_empty())
            .map(|reason| state.finish_chunk(finish_reason(reason)))),
        StreamEvent::Error { error } => {
            let error_type = if error.error_type.is_empty() {
                "upstream_error".to_string()
            } else {
                error.error_type
            };
            Err(StreamError::new(error_type, error.message))
        }
        StreamEvent::MessageStop | StreamEvent::Ping => Ok(None),
        StreamEvent::Unknown => {
            tracing::debug!(message_id = %state.message_id, "ignoring unknown upstream event");
            Ok(None)
        }
    }
}
