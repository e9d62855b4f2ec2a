use crate::error::AppError;
use axum::http::StatusCode;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network,
    Http,
}

#[derive(Debug, Clone)]
pub struct UpstreamCallError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub code: Option<String>,
    pub message: String,
}

impl UpstreamCallError {
    pub fn new(kind: UpstreamErrorKind, status: Option<StatusCode>, message: String) -> Self {
        Self {
            kind,
            status,
            code: None,
            message,
        }
    }

    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }
}

impl std::fmt::Display for UpstreamCallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for UpstreamCallError {}

impl From<UpstreamCallError> for AppError {
    fn from(err: UpstreamCallError) -> Self {
        let status = match err.kind {
            UpstreamErrorKind::Network => StatusCode::BAD_GATEWAY,
            UpstreamErrorKind::Http => err.status.unwrap_or(StatusCode::BAD_GATEWAY),
        };
        let code = err.code.unwrap_or_else(|| "upstream_error".to_string());
        AppError::new(status, code, err.message).with_type("upstream_error")
    }
}

/// Where and how to reach one upstream.
#[derive(Debug, Clone)]
pub struct UpstreamTarget<'a> {
    pub base_url: &'a str,
    pub path: &'a str,
    pub api_key: &'a str,
    pub extra_headers: &'a [(&'a str, &'a str)],
}

/// Sends `body` and returns the response once its status is a success.
/// The body is left unread so callers can stream it.
pub async fn post(
    client: &reqwest::Client,
    target: &UpstreamTarget<'_>,
    body: &Value,
) -> Result<reqwest::Response, UpstreamCallError> {
    let url = join_url(target.base_url, target.path);
    let mut req = client.post(&url).bearer_auth(target.api_key).json(body);
    for (k, v) in target.extra_headers {
        req = req.header(*k, *v);
    }
    tracing::debug!(url = %url, "calling upstream");
    let resp = req
        .send()
        .await
        .map_err(|err| UpstreamCallError::new(UpstreamErrorKind::Network, None, err.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        let code = extract_error_code(&text);
        return Err(UpstreamCallError::new(
            UpstreamErrorKind::Http,
            Some(status),
            format!("upstream status {}: {}", status, text),
        )
        .with_code(code));
    }
    Ok(resp)
}

pub async fn post_json(
    client: &reqwest::Client,
    target: &UpstreamTarget<'_>,
    body: &Value,
) -> Result<Value, UpstreamCallError> {
    let resp = post(client, target, body).await?;
    let status = resp.status();
    let text = resp.text().await.map_err(|err| {
        UpstreamCallError::new(UpstreamErrorKind::Network, Some(status), err.to_string())
    })?;
    serde_json::from_str(&text).map_err(|err| {
        UpstreamCallError::new(UpstreamErrorKind::Http, Some(status), err.to_string())
    })
}

/// Joins `path` onto `base`, dropping a leading `v1/` from `path` when the
/// base already ends in `/v1`.
pub fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    if base.ends_with("/v1") {
        if path == "v1" {
            path = "";
        } else if let Some(stripped) = path.strip_prefix("v1/") {
            path = stripped;
        }
    }
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

/// Error code from an upstream error body, in either the OpenAI
/// (`error.code`) or Anthropic (`error.type`) shape.
fn extract_error_code(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    let error = value.get("error")?;
    error
        .get("code")
        .and_then(|v| v.as_str())
        .or_else(|| error.get("type").and_then(|v| v.as_str()))
        .map(|s| s.to_string())
}
