//! Backend selection and the upstream stream pump.

use crate::anthropic::stream::StreamState;
use crate::anthropic::{self, ANTHROPIC_VERSION, MESSAGES_PATH, MessageResponse};
use crate::chat::{ChatCompletion, ChatCompletionChunk, ChatCompletionRequest};
use crate::config::{
    ANTHROPIC_API_KEY, ANTHROPIC_BASE_URL, ConfigService, DEFAULT_MAX_TOKENS,
    DEFAULT_MAX_TOKENS_VALUE, NON_STREAMING_ENABLED, OPENAI_API_KEY, OPENAI_BASE_URL,
    TOOL_NAME_TAGGING,
};
use crate::error::{AppError, StreamError};
use crate::responses::stream::ResponsesStreamState;
use crate::responses::{self, RESPONSES_PATH};
use crate::upstream::{self, UpstreamCallError, UpstreamTarget};
use axum::http::StatusCode;
use axum::response::sse::Event;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use tokio::sync::mpsc;

const STREAM_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Anthropic,
    Responses,
}

impl Backend {
    /// Case-insensitive substring match on the model name.
    pub fn select(model: &str) -> Result<Self, DispatchError> {
        let lower = model.to_lowercase();
        if lower.contains("claude") {
            Ok(Backend::Anthropic)
        } else if lower.contains("codex") || lower.contains("gpt") {
            Ok(Backend::Responses)
        } else {
            Err(DispatchError::UnsupportedModel(model.to_string()))
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Anthropic => "anthropic",
            Backend::Responses => "responses",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("model '{0}' is not supported; use a claude, codex or gpt model")]
    UnsupportedModel(String),
    #[error("{0} is not set, set it in env or the settings store")]
    MissingConfig(&'static str),
    #[error("non-streaming requests are not supported for {0} models")]
    NonStreamingUnsupported(&'static str),
    #[error("no upstream API key: configure {0} or send a bearer token")]
    MissingApiKey(&'static str),
    #[error("{0}")]
    Upstream(#[from] UpstreamCallError),
    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),
}

impl From<DispatchError> for AppError {
    fn from(err: DispatchError) -> Self {
        let message = err.to_string();
        match err {
            DispatchError::UnsupportedModel(_) => {
                AppError::new(StatusCode::BAD_REQUEST, "model_not_supported", message)
            }
            DispatchError::MissingConfig(_) => AppError::internal("configuration_error", message),
            DispatchError::NonStreamingUnsupported(_) => {
                AppError::new(StatusCode::BAD_REQUEST, "unsupported", message)
            }
            DispatchError::MissingApiKey(_) => AppError::unauthorized(message),
            DispatchError::Upstream(err) => err.into(),
            DispatchError::InvalidResponse(_) => {
                AppError::new(StatusCode::BAD_GATEWAY, "upstream_error", message)
                    .with_type("upstream_error")
            }
        }
    }
}

pub enum Dispatched {
    /// SSE frames, ending with `[DONE]`.
    Stream(mpsc::Receiver<Event>),
    Completion(ChatCompletion),
}

/// Maps raw `data:` payloads of one upstream protocol to chunks.
pub trait ChunkMapper: Send + 'static {
    fn map_data(&mut self, data: &str) -> Result<Option<ChatCompletionChunk>, StreamError>;
    fn message_id(&self) -> &str;
}

impl ChunkMapper for StreamState {
    fn map_data(&mut self, data: &str) -> Result<Option<ChatCompletionChunk>, StreamError> {
        anthropic::stream::map_data(self, data)
    }

    fn message_id(&self) -> &str {
        &self.message_id
    }
}

impl ChunkMapper for ResponsesStreamState {
    fn map_data(&mut self, data: &str) -> Result<Option<ChatCompletionChunk>, StreamError> {
        responses::stream::map_data(self, data)
    }

    fn message_id(&self) -> &str {
        &self.base.message_id
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    http: reqwest::Client,
    config: ConfigService,
}

impl Dispatcher {
    pub fn new(http: reqwest::Client, config: ConfigService) -> Self {
        Self { http, config }
    }

    /// Routes one chat request. Every error returned here happens before
    /// the outbound stream exists; later failures travel in-band.
    pub async fn dispatch(
        &self,
        client_key: Option<&str>,
        mut req: ChatCompletionRequest,
    ) -> Result<Dispatched, DispatchError> {
        let backend = Backend::select(&req.model)?;
        if req.max_tokens.is_none() {
            let configured = self
                .config
                .get_int(DEFAULT_MAX_TOKENS, DEFAULT_MAX_TOKENS_VALUE)
                .await;
            req.max_tokens = Some(
                u64::try_from(configured).unwrap_or(DEFAULT_MAX_TOKENS_VALUE.unsigned_abs()),
            );
        }
        tracing::info!(
            model = %req.model,
            backend = backend.as_str(),
            stream = req.is_stream(),
            "dispatching chat completion"
        );
        match backend {
            Backend::Anthropic => self.dispatch_anthropic(client_key, req).await,
            Backend::Responses => self.dispatch_responses(client_key, req).await,
        }
    }

    async fn dispatch_anthropic(
        &self,
        client_key: Option<&str>,
        req: ChatCompletionRequest,
    ) -> Result<Dispatched, DispatchError> {
        let stream = req.is_stream();
        if !stream && !self.config.get_bool(NON_STREAMING_ENABLED, true).await {
            return Err(DispatchError::NonStreamingUnsupported("claude"));
        }
        let base_url = self.config.get(ANTHROPIC_BASE_URL, None).await;
        if base_url.trim().is_empty() {
            return Err(DispatchError::MissingConfig(ANTHROPIC_BASE_URL));
        }
        let api_key = resolve_api_key(
            self.config.get(ANTHROPIC_API_KEY, None).await,
            client_key,
            ANTHROPIC_API_KEY,
        )?;
        let tag_tool_names = self.config.get_bool(TOOL_NAME_TAGGING, false).await;
        let body = anthropic::encode_request(&req, stream, tag_tool_names);
        let headers = [
            ("x-api-key", api_key.as_str()),
            ("anthropic-version", ANTHROPIC_VERSION),
        ];
        let target = UpstreamTarget {
            base_url: &base_url,
            path: MESSAGES_PATH,
            api_key: &api_key,
            extra_headers: &headers,
        };

        if stream {
            let resp = upstream::post(&self.http, &target, &body).await?;
            return Ok(Dispatched::Stream(spawn_pump(
                resp,
                StreamState::new(req.model.clone()),
            )));
        }
        let value = upstream::post_json(&self.http, &target, &body).await?;
        let message: MessageResponse = serde_json::from_value(value)
            .map_err(|err| DispatchError::InvalidResponse(err.to_string()))?;
        Ok(Dispatched::Completion(anthropic::response::map_message(
            message, &req.model,
        )))
    }

    async fn dispatch_responses(
        &self,
        client_key: Option<&str>,
        req: ChatCompletionRequest,
    ) -> Result<Dispatched, DispatchError> {
        if !req.is_stream() {
            return Err(DispatchError::NonStreamingUnsupported("codex/gpt"));
        }
        let base_url = self.config.get(OPENAI_BASE_URL, None).await;
        if base_url.trim().is_empty() {
            return Err(DispatchError::MissingConfig(OPENAI_BASE_URL));
        }
        let api_key = resolve_api_key(
            self.config.get(OPENAI_API_KEY, None).await,
            client_key,
            OPENAI_API_KEY,
        )?;
        let body = responses::encode_request(&req);
        let target = UpstreamTarget {
            base_url: &base_url,
            path: RESPONSES_PATH,
            api_key: &api_key,
            extra_headers: &[],
        };
        let resp = upstream::post(&self.http, &target, &body).await?;
        Ok(Dispatched::Stream(spawn_pump(
            resp,
            ResponsesStreamState::new(StreamState::new(req.model.clone())),
        )))
    }
}

/// The configured provider key when set, else the client's bearer token.
fn resolve_api_key(
    configured: String,
    client_key: Option<&str>,
    setting: &'static str,
) -> Result<String, DispatchError> {
    let configured = configured.trim();
    if !configured.is_empty() {
        return Ok(configured.to_string());
    }
    client_key
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
        .ok_or(DispatchError::MissingApiKey(setting))
}

pub fn spawn_pump<M: ChunkMapper>(resp: reqwest::Response, mapper: M) -> mpsc::Receiver<Event> {
    let (tx, rx) = mpsc::channel::<Event>(STREAM_BUFFER);
    tokio::spawn(pump(resp, mapper, tx));
    rx
}

/// Reads upstream events one at a time and forwards each mapped chunk
/// before reading the next. Returns as soon as the receiver is gone, even
/// while upstream only sends events that map to nothing, which drops the
/// upstream response and closes its connection.
async fn pump<M: ChunkMapper>(resp: reqwest::Response, mut mapper: M, tx: mpsc::Sender<Event>) {
    let mut stream = resp.bytes_stream().eventsource();
    let mut failure: Option<StreamError> = None;

    loop {
        let next = tokio::select! {
            _ = tx.closed() => {
                log_disconnect(mapper.message_id());
                return;
            }
            next = stream.next() => next,
        };
        let Some(ev) = next else {
            break;
        };
        let ev = match ev {
            Ok(ev) => ev,
            Err(err) => {
                failure = Some(StreamError::new(
                    "stream_error",
                    format!("upstream stream interrupted: {err}"),
                ));
                break;
            }
        };
        let data = ev.data.trim();
        if data.is_empty() {
            continue;
        }
        if data == "[DONE]" {
            break;
        }
        let chunk = match mapper.map_data(data) {
            Ok(Some(chunk)) => chunk,
            Ok(None) => continue,
            Err(err) => {
                failure = Some(err);
                break;
            }
        };
        let payload = match serde_json::to_string(&chunk) {
            Ok(payload) => payload,
            Err(err) => {
                failure = Some(StreamError::new("stream_error", err.to_string()));
                break;
            }
        };
        if tx.send(Event::default().data(payload)).await.is_err() {
            log_disconnect(mapper.message_id());
            return;
        }
    }

    if let Some(err) = failure {
        tracing::warn!(
            message_id = %mapper.message_id(),
            error_type = %err.error_type,
            "stream failed: {}",
            err.message
        );
        if tx.send(Event::default().data(err.to_frame_data())).await.is_err() {
            return;
        }
    }
    let _ = tx.send(Event::default().data("[DONE]")).await;
}

fn log_disconnect(message_id: &str) {
    tracing::info!(message_id = %message_id, "client disconnected, closing upstream stream");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySettingsStore;
    use std::sync::Arc;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            reqwest::Client::new(),
            ConfigService::new(Arc::new(MemorySettingsStore::new())),
        )
    }

    fn request(model: &str, stream: bool) -> ChatCompletionRequest {
        serde_json::from_value(serde_json::json!({
            "model": model,
            "stream": stream,
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .expect("request")
    }

    #[test]
    fn backend_selection_is_case_insensitive() {
        assert_eq!(Backend::select("claude-sonnet-4-5").ok(), Some(Backend::Anthropic));
        assert_eq!(Backend::select("Anthropic/CLAUDE-3").ok(), Some(Backend::Anthropic));
        assert_eq!(Backend::select("gpt-5").ok(), Some(Backend::Responses));
        assert_eq!(Backend::select("GPT-5-CODEX").ok(), Some(Backend::Responses));
        assert_eq!(Backend::select("my-codex-mini").ok(), Some(Backend::Responses));
        assert!(matches!(
            Backend::select("llama-3"),
            Err(DispatchError::UnsupportedModel(m)) if m == "llama-3"
        ));
    }

    #[test]
    fn provider_key_wins_over_client_bearer() {
        assert_eq!(
            resolve_api_key("sk-ant".to_string(), Some("client"), ANTHROPIC_API_KEY).ok(),
            Some("sk-ant".to_string())
        );
        assert_eq!(
            resolve_api_key(" ".to_string(), Some("client"), ANTHROPIC_API_KEY).ok(),
            Some("client".to_string())
        );
        assert!(matches!(
            resolve_api_key(String::new(), None, OPENAI_API_KEY),
            Err(DispatchError::MissingApiKey(OPENAI_API_KEY))
        ));
    }

    #[tokio::test]
    async fn unsupported_model_fails_before_any_call() {
        let err = dispatcher()
            .dispatch(Some("k"), request("llama-3", true))
            .await
            .err()
            .expect("unsupported");
        let app: AppError = err.into();
        assert_eq!(app.status, StatusCode::BAD_REQUEST);
        assert_eq!(app.code, "model_not_supported");
    }

    #[tokio::test]
    async fn responses_path_rejects_non_stream_and_missing_base_url() {
        let err = dispatcher()
            .dispatch(Some("k"), request("gpt-5", false))
            .await
            .err()
            .expect("non-stream");
        assert!(matches!(err, DispatchError::NonStreamingUnsupported(_)));

        let err = dispatcher()
            .dispatch(Some("k"), request("gpt-5", true))
            .await
            .err()
            .expect("no base url");
        assert!(matches!(err, DispatchError::MissingConfig(OPENAI_BASE_URL)));
        let app: AppError = err.into();
        assert_eq!(app.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn non_stream_flag_gates_anthropic_path() {
        let dispatcher = dispatcher();
        dispatcher
            .config
            .set(NON_STREAMING_ENABLED, "false")
            .await
            .expect("set");
        let err = dispatcher
            .dispatch(Some("k"), request("claude-haiku", false))
            .await
            .err()
            .expect("disabled");
        assert!(matches!(err, DispatchError::NonStreamingUnsupported("claude")));
    }
}
