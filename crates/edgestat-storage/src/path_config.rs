//! Per-path configuration (method, enabled features)
//!
//! Rows are edited by operators. The snapshot publisher only ever fills a
//! method that is unset or still the default placeholder.

use std::collections::HashMap;

use edgestat_core::time::now_ms;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::database::{Database, Statement};
use crate::error::{Result, StorageError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathConfig {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default)]
    pub features: Vec<String>,
}

/// Outcome of a conditional method write-back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteBack {
    Written,
    /// The stored method was a manual value and was left untouched
    Conflict,
}

#[derive(Debug, Clone)]
pub struct PathConfigStore {
    db: Database,
}

impl PathConfigStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn get(&self, path: &str) -> Result<Option<PathConfig>> {
        let row = sqlx::query("SELECT path, method, features FROM path_config WHERE path = ?")
            .bind(path)
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(config_from_row).transpose()
    }

    /// Configs for the given paths, keyed by path. Unknown paths are absent.
    pub async fn get_many(&self, paths: &[String]) -> Result<HashMap<String, PathConfig>> {
        if paths.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            "SELECT path, method, features FROM path_config \
             WHERE path IN (SELECT value FROM json_each(?))",
        )
        .bind(serde_json::to_string(paths)?)
        .fetch_all(self.db.pool())
        .await?;

        rows.iter()
            .map(|row| config_from_row(row).map(|config| (config.path.clone(), config)))
            .collect()
    }

    /// Unconditional write, as done by an operator edit.
    pub async fn upsert(&self, config: &PathConfig) -> Result<()> {
        self.db
            .execute(
                &Statement::new(
                    "INSERT INTO path_config (path, method, features, updated_at) VALUES (?, ?, ?, ?) \
                     ON CONFLICT (path) DO UPDATE SET method = excluded.method, \
                     features = excluded.features, updated_at = excluded.updated_at",
                )
                .bind(config.path.as_str())
                .bind(config.method.clone())
                .bind(serde_json::to_string(&config.features)?)
                .bind(now_ms()),
            )
            .await?;
        Ok(())
    }

    /// Store an inferred method for `path` unless a manual value is present.
    ///
    /// The check and the write are one statement, so an operator edit that
    /// lands between the caller's read and this call is never overwritten.
    pub async fn write_back_method(
        &self,
        path: &str,
        method: &str,
        placeholder: &str,
    ) -> Result<WriteBack> {
        let affected = self
            .db
            .execute(
                &Statement::new(
                    "INSERT INTO path_config (path, method, features, updated_at) \
                     VALUES (?, ?, '[]', ?) \
                     ON CONFLICT (path) DO UPDATE SET method = excluded.method, \
                     updated_at = excluded.updated_at \
                     WHERE path_config.method IS NULL OR path_config.method = ?",
                )
                .bind(path)
                .bind(method)
                .bind(now_ms())
                .bind(placeholder),
            )
            .await?;

        Ok(if affected > 0 {
            WriteBack::Written
        } else {
            WriteBack::Conflict
        })
    }
}

fn config_from_row(row: &SqliteRow) -> Result<PathConfig> {
    let features: String = row.try_get("features")?;
    Ok(PathConfig {
        path: row.try_get("path")?,
        method: row.try_get("method")?,
        features: serde_json::from_str(&features)
            .map_err(|e| StorageError::invalid_data("path_config", "features", e))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_back_only_replaces_unset_or_placeholder() {
        let db = Database::in_memory(10).await.unwrap();
        let store = PathConfigStore::new(db);

        // Missing row is created
        assert_eq!(
            store.write_back_method("/new", "POST", "GET").await.unwrap(),
            WriteBack::Written
        );

        store
            .upsert(&PathConfig {
                path: "/placeholder".into(),
                method: Some("GET".into()),
                features: vec!["rate_limit".into()],
            })
            .await
            .unwrap();
        assert_eq!(
            store.write_back_method("/placeholder", "PUT", "GET").await.unwrap(),
            WriteBack::Written
        );
        let updated = store.get("/placeholder").await.unwrap().unwrap();
        assert_eq!(updated.method.as_deref(), Some("PUT"));
        assert_eq!(updated.features, vec!["rate_limit".to_string()]);

        store
            .upsert(&PathConfig {
                path: "/manual".into(),
                method: Some("PATCH".into()),
                features: vec![],
            })
            .await
            .unwrap();
        assert_eq!(
            store.write_back_method("/manual", "POST", "GET").await.unwrap(),
            WriteBack::Conflict
        );
        let manual = store.get("/manual").await.unwrap().unwrap();
        assert_eq!(manual.method.as_deref(), Some("PATCH"));

        let many = store
            .get_many(&["/new".to_string(), "/manual".to_string(), "/none".to_string()])
            .await
            .unwrap();
        assert_eq!(many.len(), 2);
        assert_eq!(many["/new"].method.as_deref(), Some("POST"));
    }
}
