use crate::config::{API_KEY, ConfigService};
use crate::error::{AppError, AppResult};
use axum::http::HeaderMap;

/// Outcome of gateway authentication. The client's bearer token is kept so
/// it can be forwarded upstream when no provider key is configured.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuthResult {
    pub bearer: Option<String>,
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Checks the bearer token against the configured `API_KEY`. An empty
/// `API_KEY` turns authentication off.
pub async fn authenticate(headers: &HeaderMap, config: &ConfigService) -> AppResult<AuthResult> {
    let bearer = bearer_token(headers).map(str::to_string);
    let expected = config.get(API_KEY, None).await;
    if expected.is_empty() {
        return Ok(AuthResult { bearer });
    }
    match bearer.as_deref() {
        None => Err(AppError::unauthorized("missing auth")),
        Some(token) if token == expected => Ok(AuthResult { bearer }),
        Some(_) => {
            tracing::debug!("rejected request with invalid gateway key");
            Err(AppError::unauthorized("invalid token"))
        }
    }
}
