use crate::config::ConfigService;
use crate::dispatch::Dispatcher;
use crate::error::{AppError, AppResult};
use crate::store::SqliteSettingsStore;
use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 600;
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub config: ConfigService,
    pub dispatcher: Dispatcher,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub database_dsn: String,
    pub upstream_timeout_secs: u64,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let listen = std::env::var("CHATBRIDGE_LISTEN")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "0.0.0.0:8000".to_string());
        let upstream_timeout_secs = std::env::var("CHATBRIDGE_UPSTREAM_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_SECS);
        Self {
            listen,
            database_dsn: resolve_database_dsn(),
            upstream_timeout_secs,
        }
    }
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent("chatbridge/0.1")
        .connect_timeout(UPSTREAM_CONNECT_TIMEOUT)
        .read_timeout(Duration::from_secs(runtime.upstream_timeout_secs))
        .build()
        .map_err(|err| AppError::internal("http_client_init_failed", err.to_string()))?;

    ensure_sqlite_file(&runtime.database_dsn)
        .map_err(|err| AppError::internal("database_init_failed", err))?;

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(
            runtime
                .database_dsn
                .parse::<sqlx::sqlite::SqliteConnectOptions>()
                .map_err(|err| {
                    AppError::new(
                        StatusCode::BAD_REQUEST,
                        "database_dsn_parse_failed",
                        err.to_string(),
                    )
                })?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .busy_timeout(Duration::from_secs(5)),
        )
        .await
        .map_err(|err| AppError::internal("database_init_failed", err.to_string()))?;

    let store = SqliteSettingsStore::new(pool)
        .await
        .map_err(|err| AppError::internal("settings_store_init_failed", err))?;
    let config = ConfigService::new(Arc::new(store));
    config
        .initialize()
        .await
        .map_err(|err| AppError::internal("settings_store_init_failed", err))?;

    let dispatcher = Dispatcher::new(http, config.clone());
    Ok(AppState {
        runtime: Arc::new(runtime),
        config,
        dispatcher,
    })
}

fn resolve_database_dsn() -> String {
    std::env::var("CHATBRIDGE_DATABASE_DSN")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| {
            std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty())
        })
        .unwrap_or_else(|| "sqlite://./data/chatbridge.db".to_string())
}

/// Creates the sqlite file and its directory for file-backed DSNs.
pub fn ensure_sqlite_file(dsn: &str) -> Result<(), String> {
    let dsn = dsn.trim();
    if !dsn.starts_with("sqlite://") {
        return Ok(());
    }
    if dsn.contains(":memory:") || dsn.contains("mode=memory") {
        return Ok(());
    }
    let path_part = dsn.trim_start_matches("sqlite://");
    let path_part = path_part.split('?').next().unwrap_or("");
    if path_part.is_empty() {
        return Ok(());
    }
    let path = PathBuf::from(path_part);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format!("sqlite_dir_create_failed: {err}"))?;
        }
    }
    if !path.exists() {
        std::fs::File::create(&path).map_err(|err| format!("sqlite_file_create_failed: {err}"))?;
    }
    Ok(())
}

pub fn build_app(state: AppState) -> Router {
    Router::<AppState>::new()
        .route(
            "/v1/chat/completions",
            post(crate::handlers::create_chat_completions),
        )
        .route("/health", get(crate::handlers::health))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}
