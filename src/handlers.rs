use crate::app::AppState;
use crate::auth::authenticate;
use crate::chat::ChatCompletionRequest;
use crate::dispatch::Dispatched;
use crate::error::{AppError, AppResult};
use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response, Sse};
use futures_util::StreamExt;
use serde_json::{Value, json};
use std::convert::Infallible;

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn create_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    let auth = authenticate(&headers, &state.config).await?;
    let req: ChatCompletionRequest = serde_json::from_value(body).map_err(|err| {
        AppError::new(StatusCode::BAD_REQUEST, "invalid_request", err.to_string())
    })?;
    match state.dispatcher.dispatch(auth.bearer.as_deref(), req).await {
        Ok(Dispatched::Stream(rx)) => Ok(sse_response(rx)),
        Ok(Dispatched::Completion(completion)) => Ok(Json(completion).into_response()),
        Err(err) => {
            let err = AppError::from(err);
            tracing::warn!(status = %err.status, code = %err.code, "chat completion rejected: {}", err.message);
            Err(err)
        }
    }
}

fn sse_response(rx: tokio::sync::mpsc::Receiver<axum::response::sse::Event>) -> Response {
    let stream = tokio_stream::wrappers::ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    let mut response = Sse::new(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("*"),
    );
    response
}
