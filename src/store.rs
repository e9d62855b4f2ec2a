use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Persistent key/value backing for [`crate::config::ConfigService`].
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, String>;
    async fn set(&self, key: &str, value: &str) -> Result<(), String>;
    /// Inserts only when `key` has no stored value yet.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        description: &str,
    ) -> Result<(), String>;
    async fn all(&self) -> Result<HashMap<String, String>, String>;
}

#[derive(Clone, Default)]
pub struct MemorySettingsStore {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn get(&self, key: &str) -> Result<Option<String>, String> {
        let guard = self.inner.read().await;
        Ok(guard.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        let mut guard = self.inner.write().await;
        guard.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        _description: &str,
    ) -> Result<(), String> {
        let mut guard = self.inner.write().await;
        guard
            .entry(key.to_string())
            .or_insert_with(|| value.to_string());
        Ok(())
    }

    async fn all(&self) -> Result<HashMap<String, String>, String> {
        let guard = self.inner.read().await;
        Ok(guard.clone())
    }
}

#[derive(Clone)]
pub struct SqliteSettingsStore {
    pool: Pool<Sqlite>,
}

impl SqliteSettingsStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS configs (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                description TEXT,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl SettingsStore for SqliteSettingsStore {
    async fn get(&self, key: &str) -> Result<Option<String>, String> {
        let row = sqlx::query("SELECT value FROM configs WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        match row {
            Some(row) => row
                .try_get::<String, _>("value")
                .map(Some)
                .map_err(|e| e.to_string()),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO configs (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        description: &str,
    ) -> Result<(), String> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT OR IGNORE INTO configs (key, value, description, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(key)
        .bind(value)
        .bind(description)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn all(&self) -> Result<HashMap<String, String>, String> {
        let rows = sqlx::query("SELECT key, value FROM configs")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("key").map_err(|e| e.to_string())?;
            let value: String = row.try_get("value").map_err(|e| e.to_string())?;
            out.insert(key, value);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_pool() -> Pool<Sqlite> {
        sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("sqlite memory pool")
    }

    #[tokio::test]
    async fn sqlite_set_if_absent_keeps_existing_value() {
        let store = SqliteSettingsStore::new(memory_pool().await)
            .await
            .expect("store");
        store.set("API_KEY", "secret").await.expect("set");
        store
            .set_if_absent("API_KEY", "", "gateway key")
            .await
            .expect("seed");
        assert_eq!(
            store.get("API_KEY").await.expect("get").as_deref(),
            Some("secret")
        );
    }

    #[tokio::test]
    async fn sqlite_set_overwrites_and_all_lists_every_key() {
        let store = SqliteSettingsStore::new(memory_pool().await)
            .await
            .expect("store");
        store
            .set_if_absent("DEFAULT_MAX_TOKENS", "40960", "")
            .await
            .expect("seed");
        store.set("DEFAULT_MAX_TOKENS", "1024").await.expect("set");
        store.set("LOG_LEVEL", "DEBUG").await.expect("set");
        let all = store.all().await.expect("all");
        assert_eq!(all.len(), 2);
        assert_eq!(all.get("DEFAULT_MAX_TOKENS").map(String::as_str), Some("1024"));
    }

    #[tokio::test]
    async fn memory_store_missing_key_is_none() {
        let store = MemorySettingsStore::new();
        assert_eq!(store.get("nope").await.expect("get"), None);
    }
}
