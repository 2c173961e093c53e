//! Key-value store with TTL
//!
//! Holds snapshot bodies, version pointers, rolling counters and short
//! lived locks. Expiry is lazy: expired entries are invisible to reads and
//! replaceable by `put_if_absent`, and are physically removed by `purge_expired`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use edgestat_core::time::now_ms;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::Row;

use crate::database::{Database, Statement};
use crate::error::{Result, StorageError};

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;

    /// Store `value` only when `key` has no live entry. Returns whether the
    /// value was stored.
    async fn put_if_absent(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Atomically add `by` to an integer counter (missing counts as 0) and
    /// return the new value.
    async fn increment(&self, key: &str, by: i64) -> Result<i64>;

    /// Atomically raise an integer pointer to `value`. A missing, expired
    /// or non-integer entry is replaced; a larger or equal one is kept.
    /// Returns whether `value` was stored.
    async fn advance(&self, key: &str, value: i64) -> Result<bool>;

    /// Live keys starting with `prefix`, sorted.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Read a JSON value.
pub async fn get_json<T: DeserializeOwned>(kv: &dyn KvStore, key: &str) -> Result<Option<T>> {
    match kv.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Write a JSON value.
pub async fn put_json<T: Serialize + Sync>(
    kv: &dyn KvStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<()> {
    kv.put(key, serde_json::to_string(value)?, ttl).await
}

fn expiry_ms(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| now_ms() + i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX / 2))
}

/// `KvStore` backed by the `kv_store` table, shared across instances.
#[derive(Debug, Clone)]
pub struct SqliteKv {
    db: Database,
}

impl SqliteKv {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Physically remove expired entries.
    pub async fn purge_expired(&self) -> Result<u64> {
        self.db
            .execute(
                &Statement::new("DELETE FROM kv_store WHERE expires_at IS NOT NULL AND expires_at <= ?")
                    .bind(now_ms()),
            )
            .await
    }
}

#[async_trait]
impl KvStore for SqliteKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT value FROM kv_store WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(now_ms())
        .fetch_optional(self.db.pool())
        .await?;
        Ok(row.map(|r| r.try_get("value")).transpose()?)
    }

    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        self.db
            .execute(
                &Statement::new(
                    "INSERT INTO kv_store (key, value, expires_at) VALUES (?, ?, ?) \
                     ON CONFLICT (key) DO UPDATE SET value = excluded.value, \
                     expires_at = excluded.expires_at",
                )
                .bind(key)
                .bind(value)
                .bind(expiry_ms(ttl)),
            )
            .await?;
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<bool> {
        let affected = self
            .db
            .execute(
                &Statement::new(
                    "INSERT INTO kv_store (key, value, expires_at) VALUES (?, ?, ?) \
                     ON CONFLICT (key) DO UPDATE SET value = excluded.value, \
                     expires_at = excluded.expires_at \
                     WHERE kv_store.expires_at IS NOT NULL AND kv_store.expires_at <= ?",
                )
                .bind(key)
                .bind(value)
                .bind(expiry_ms(ttl))
                .bind(now_ms()),
            )
            .await?;
        Ok(affected > 0)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.db
            .execute(&Statement::new("DELETE FROM kv_store WHERE key = ?").bind(key))
            .await?;
        Ok(())
    }

    async fn increment(&self, key: &str, by: i64) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO kv_store (key, value, expires_at) VALUES (?, ?, NULL) \
             ON CONFLICT (key) DO UPDATE SET \
               value = CAST(CAST(kv_store.value AS INTEGER) + ? AS TEXT) \
             RETURNING value",
        )
        .bind(key)
        .bind(by.to_string())
        .bind(by)
        .fetch_one(self.db.pool())
        .await?;
        let value: String = row.try_get("value")?;
        value
            .parse()
            .map_err(|e| StorageError::invalid_data("kv_store", "value", e))
    }

    async fn advance(&self, key: &str, value: i64) -> Result<bool> {
        let affected = self
            .db
            .execute(
                &Statement::new(
                    "INSERT INTO kv_store (key, value, expires_at) VALUES (?, ?, NULL) \
                     ON CONFLICT (key) DO UPDATE SET value = excluded.value, expires_at = NULL \
                     WHERE kv_store.value GLOB '*[^0-9]*' \
                        OR CAST(kv_store.value AS INTEGER) < ? \
                        OR (kv_store.expires_at IS NOT NULL AND kv_store.expires_at <= ?)",
                )
                .bind(key)
                .bind(value.to_string())
                .bind(value)
                .bind(now_ms()),
            )
            .await?;
        Ok(affected > 0)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT key FROM kv_store WHERE substr(key, 1, length(?)) = ? \
             AND (expires_at IS NULL OR expires_at > ?) ORDER BY key",
        )
        .bind(prefix)
        .bind(prefix)
        .bind(now_ms())
        .fetch_all(self.db.pool())
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("key").map_err(Into::into))
            .collect()
    }
}

/// Process-local `KvStore`, for tests and single-node runs.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(entry: &(String, Option<Instant>)) -> bool {
        entry.1.map_or(true, |expires| expires > Instant::now())
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock();
        Ok(entries
            .get(key)
            .filter(|entry| Self::live(entry))
            .map(|(value, _)| value.clone()))
    }

    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let expires = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.lock().insert(key.to_string(), (value, expires));
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<bool> {
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(Self::live) {
            return Ok(false);
        }
        let expires = ttl.map(|ttl| Instant::now() + ttl);
        entries.insert(key.to_string(), (value, expires));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn increment(&self, key: &str, by: i64) -> Result<i64> {
        let mut entries = self.entries.lock();
        let current = match entries.get(key).filter(|entry| Self::live(entry)) {
            Some((value, _)) => value
                .parse::<i64>()
                .map_err(|e| StorageError::invalid_data("memory_kv", "value", e))?,
            None => 0,
        };
        let next = current + by;
        entries.insert(key.to_string(), (next.to_string(), None));
        Ok(next)
    }

    async fn advance(&self, key: &str, value: i64) -> Result<bool> {
        let mut entries = self.entries.lock();
        let current = entries
            .get(key)
            .filter(|entry| Self::live(entry))
            .and_then(|(stored, _)| stored.parse::<i64>().ok());
        if current.is_some_and(|current| current >= value) {
            return Ok(false);
        }
        entries.insert(key.to_string(), (value.to_string(), None));
        Ok(true)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.lock();
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && Self::live(entry))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn exercise(kv: Arc<dyn KvStore>) {
        assert_eq!(kv.get("missing").await.unwrap(), None);

        kv.put("snapshot:latest", "3".into(), None).await.unwrap();
        assert_eq!(kv.get("snapshot:latest").await.unwrap().as_deref(), Some("3"));

        assert!(kv.put_if_absent("lock", "a".into(), Some(Duration::from_secs(60))).await.unwrap());
        assert!(!kv.put_if_absent("lock", "b".into(), Some(Duration::from_secs(60))).await.unwrap());
        assert_eq!(kv.get("lock").await.unwrap().as_deref(), Some("a"));

        assert_eq!(kv.increment("counter", 1).await.unwrap(), 1);
        assert_eq!(kv.increment("counter", 4).await.unwrap(), 5);

        kv.put("snapshot:v1", "{}".into(), None).await.unwrap();
        kv.put("snapshot:v2", "{}".into(), None).await.unwrap();
        assert_eq!(
            kv.list_prefix("snapshot:v").await.unwrap(),
            vec!["snapshot:v1".to_string(), "snapshot:v2".to_string()]
        );

        kv.delete("snapshot:v1").await.unwrap();
        assert_eq!(kv.get("snapshot:v1").await.unwrap(), None);

        // Pointers only move forward; garbage is replaced
        assert!(kv.advance("pointer", 5).await.unwrap());
        assert!(!kv.advance("pointer", 4).await.unwrap());
        assert!(!kv.advance("pointer", 5).await.unwrap());
        assert_eq!(kv.get("pointer").await.unwrap().as_deref(), Some("5"));
        assert!(kv.advance("pointer", 12).await.unwrap());
        assert_eq!(kv.get("pointer").await.unwrap().as_deref(), Some("12"));
        kv.put("pointer", "not-a-version".into(), None).await.unwrap();
        assert!(kv.advance("pointer", 2).await.unwrap());
        assert_eq!(kv.get("pointer").await.unwrap().as_deref(), Some("2"));
    }

    async fn expiry(kv: Arc<dyn KvStore>) {
        kv.put("short", "x".into(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(kv.get("short").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(kv.get("short").await.unwrap().is_none());
        assert!(kv.put_if_absent("short", "y".into(), None).await.unwrap());
        assert_eq!(kv.get("short").await.unwrap().as_deref(), Some("y"));
    }

    #[tokio::test]
    async fn test_memory_kv() {
        exercise(Arc::new(MemoryKv::new())).await;
        expiry(Arc::new(MemoryKv::new())).await;
    }

    #[tokio::test]
    async fn test_sqlite_kv() {
        let db = Database::in_memory(10).await.unwrap();
        exercise(Arc::new(SqliteKv::new(db.clone()))).await;
        expiry(Arc::new(SqliteKv::new(db))).await;
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let kv = MemoryKv::new();
        put_json(&kv, "k", &vec![1u64, 2, 3], None).await.unwrap();
        let back: Option<Vec<u64>> = get_json(&kv, "k").await.unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));
    }
}
