use crate::store::SettingsStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

pub const ANTHROPIC_BASE_URL: &str = "ANTHROPIC_BASE_URL";
pub const ANTHROPIC_API_KEY: &str = "ANTHROPIC_API_KEY";
pub const OPENAI_BASE_URL: &str = "OPENAI_BASE_URL";
pub const OPENAI_API_KEY: &str = "OPENAI_API_KEY";
pub const DEFAULT_MAX_TOKENS: &str = "DEFAULT_MAX_TOKENS";
pub const API_KEY: &str = "API_KEY";
pub const NON_STREAMING_ENABLED: &str = "NON_STREAMING_ENABLED";
pub const TOOL_NAME_TAGGING: &str = "TOOL_NAME_TAGGING";

pub const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
pub const DEFAULT_MAX_TOKENS_VALUE: i64 = 40960;

/// A setting the gateway knows about, with the value it is seeded with when
/// neither the store nor the environment provides one.
#[derive(Debug, Clone, Copy)]
pub struct KnownSetting {
    pub key: &'static str,
    pub default: &'static str,
    pub description: &'static str,
}

pub const KNOWN_SETTINGS: &[KnownSetting] = &[
    KnownSetting {
        key: ANTHROPIC_BASE_URL,
        default: DEFAULT_ANTHROPIC_BASE_URL,
        description: "Anthropic API base URL",
    },
    KnownSetting {
        key: ANTHROPIC_API_KEY,
        default: "",
        description: "Anthropic API key (empty forwards the client bearer token)",
    },
    KnownSetting {
        key: OPENAI_BASE_URL,
        default: "",
        description: "Responses API base URL for codex/gpt models",
    },
    KnownSetting {
        key: OPENAI_API_KEY,
        default: "",
        description: "Responses API key (empty forwards the client bearer token)",
    },
    KnownSetting {
        key: DEFAULT_MAX_TOKENS,
        default: "40960",
        description: "max_tokens injected when a request omits it",
    },
    KnownSetting {
        key: API_KEY,
        default: "",
        description: "API key for accessing this service (leave empty to disable auth)",
    },
    KnownSetting {
        key: NON_STREAMING_ENABLED,
        default: "true",
        description: "Allow non-streaming requests on the Anthropic path",
    },
    KnownSetting {
        key: TOOL_NAME_TAGGING,
        default: "false",
        description: "Prefix tool names sent to Anthropic with the internal tag",
    },
];

fn builtin_default(key: &str) -> Option<&'static str> {
    KNOWN_SETTINGS
        .iter()
        .find(|s| s.key == key)
        .map(|s| s.default)
}

/// Read-through cached view of the settings store.
///
/// Readers hit the cache first and fall back to the store on a miss.
/// `refresh` reloads the whole map while holding `refresh_lock`, then swaps
/// it in with one write so no reader sees a half-built cache.
#[derive(Clone)]
pub struct ConfigService {
    store: Arc<dyn SettingsStore>,
    cache: Arc<RwLock<HashMap<String, String>>>,
    refresh_lock: Arc<Mutex<()>>,
}

impl ConfigService {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self {
            store,
            cache: Arc::new(RwLock::new(HashMap::new())),
            refresh_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Seeds every known key that the store lacks (environment value first,
    /// built-in default second) and loads the cache.
    pub async fn initialize(&self) -> Result<(), String> {
        for setting in KNOWN_SETTINGS {
            let value = std::env::var(setting.key).unwrap_or_else(|_| setting.default.to_string());
            self.store
                .set_if_absent(setting.key, &value, setting.description)
                .await?;
        }
        self.refresh().await?;
        tracing::info!("config service initialized");
        Ok(())
    }

    pub async fn refresh(&self) -> Result<(), String> {
        let _guard = self.refresh_lock.lock().await;
        let fresh = self.store.all().await?;
        let count = fresh.len();
        *self.cache.write().await = fresh;
        tracing::debug!(count, "config cache refreshed");
        Ok(())
    }

    /// Returns the value for `key`, else `default`, else the built-in
    /// default, else an empty string. Store failures degrade to the
    /// fallback chain.
    pub async fn get(&self, key: &str, default: Option<&str>) -> String {
        if let Some(value) = self.cache.read().await.get(key) {
            return value.clone();
        }
        match self.store.get(key).await {
            Ok(Some(value)) => {
                self.cache
                    .write()
                    .await
                    .insert(key.to_string(), value.clone());
                return value;
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(key, "config store read failed: {err}"),
        }
        default
            .or_else(|| builtin_default(key))
            .unwrap_or_default()
            .to_string()
    }

    pub async fn get_int(&self, key: &str, default: i64) -> i64 {
        let value = self.get(key, None).await;
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return default;
        }
        match trimmed.parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(
                    key,
                    value = trimmed,
                    default,
                    "config value is not a valid integer, using default"
                );
                default
            }
        }
    }

    pub async fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key, None).await.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => true,
            "false" | "0" | "no" | "off" => false,
            _ => default,
        }
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        self.store.set(key, value).await?;
        self.cache
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        tracing::info!(key, "config updated");
        Ok(())
    }

    pub async fn get_all(&self) -> Result<HashMap<String, String>, String> {
        if self.cache.read().await.is_empty() {
            self.refresh().await?;
        }
        Ok(self.cache.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySettingsStore;

    fn service_with(store: MemorySettingsStore) -> ConfigService {
        ConfigService::new(Arc::new(store))
    }

    #[tokio::test]
    async fn get_falls_back_to_builtin_default() {
        let config = service_with(MemorySettingsStore::new());
        assert_eq!(
            config.get(ANTHROPIC_BASE_URL, None).await,
            DEFAULT_ANTHROPIC_BASE_URL
        );
        assert_eq!(config.get("UNKNOWN_KEY", Some("x")).await, "x");
        assert_eq!(config.get("UNKNOWN_KEY", None).await, "");
    }

    #[tokio::test]
    async fn get_reads_through_and_caches() {
        let store = MemorySettingsStore::new();
        store.set(OPENAI_BASE_URL, "http://a").await.expect("set");
        let config = service_with(store.clone());
        assert_eq!(config.get(OPENAI_BASE_URL, None).await, "http://a");

        // Cached: a direct store write is invisible until refresh.
        store.set(OPENAI_BASE_URL, "http://b").await.expect("set");
        assert_eq!(config.get(OPENAI_BASE_URL, None).await, "http://a");
        config.refresh().await.expect("refresh");
        assert_eq!(config.get(OPENAI_BASE_URL, None).await, "http://b");
    }

    #[tokio::test]
    async fn set_writes_through_to_store_and_cache() {
        let store = MemorySettingsStore::new();
        let config = service_with(store.clone());
        config.set(API_KEY, "k1").await.expect("set");
        assert_eq!(config.get(API_KEY, None).await, "k1");
        assert_eq!(store.get(API_KEY).await.expect("get").as_deref(), Some("k1"));
    }

    #[tokio::test]
    async fn get_int_falls_back_on_garbage() {
        let store = MemorySettingsStore::new();
        store.set(DEFAULT_MAX_TOKENS, "lots").await.expect("set");
        let config = service_with(store);
        assert_eq!(config.get_int(DEFAULT_MAX_TOKENS, 7).await, 7);
        config.set(DEFAULT_MAX_TOKENS, " 2048 ").await.expect("set");
        assert_eq!(config.get_int(DEFAULT_MAX_TOKENS, 7).await, 2048);
    }

    #[tokio::test]
    async fn get_bool_parses_common_spellings() {
        let config = service_with(MemorySettingsStore::new());
        assert!(config.get_bool(NON_STREAMING_ENABLED, false).await);
        assert!(!config.get_bool(TOOL_NAME_TAGGING, true).await);
        config.set(TOOL_NAME_TAGGING, "ON").await.expect("set");
        assert!(config.get_bool(TOOL_NAME_TAGGING, false).await);
    }

    #[tokio::test]
    async fn initialize_seeds_missing_keys_without_overwriting() {
        let store = MemorySettingsStore::new();
        store
            .set(DEFAULT_MAX_TOKENS, "100")
            .await
            .expect("set");
        let config = service_with(store.clone());
        config.initialize().await.expect("init");
        let all = config.get_all().await.expect("all");
        assert_eq!(all.get(DEFAULT_MAX_TOKENS).map(String::as_str), Some("100"));
        for setting in KNOWN_SETTINGS {
            assert!(all.contains_key(setting.key), "{} seeded", setting.key);
        }
    }

    #[tokio::test]
    async fn concurrent_refreshes_leave_a_complete_cache() {
        let store = MemorySettingsStore::new();
        for i in 0..50 {
            store.set(&format!("K{i}"), "v").await.expect("set");
        }
        let config = service_with(store);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let config = config.clone();
            handles.push(tokio::spawn(async move { config.refresh().await }));
        }
        for handle in handles {
            handle.await.expect("join").expect("refresh");
        }
        assert_eq!(config.get_all().await.expect("all").len(), 50);
    }
}
