//! Per-stage aggregation bookkeeping
//!
//! A row appears in `pending_aggregation` for every raw event actually
//! inserted (written by a trigger in the same statement as the insert).
//! Each aggregation stage marks its events done in the same batch as its
//! own upserts, so a retried delivery can tell which stages an already
//! stored event still owes.

use std::collections::HashMap;

use sqlx::Row;

use crate::database::{Database, Statement};
use crate::error::Result;

/// Completion state of one stored event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingStages {
    pub path_done: bool,
    pub actor_done: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Path,
    Actor,
}

impl Stage {
    fn column(self) -> &'static str {
        match self {
            Stage::Path => "path_done",
            Stage::Actor => "actor_done",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingAggregations {
    db: Database,
}

impl PendingAggregations {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Stage state for the given ids. Ids never inserted, or whose row was
    /// already cleared, are absent from the result.
    pub async fn lookup<S: AsRef<str>>(&self, ids: &[S]) -> Result<HashMap<String, PendingStages>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let ids: Vec<&str> = ids.iter().map(AsRef::as_ref).collect();
        let rows = sqlx::query(
            "SELECT event_id, path_done, actor_done FROM pending_aggregation \
             WHERE event_id IN (SELECT value FROM json_each(?))",
        )
        .bind(serde_json::to_string(&ids)?)
        .fetch_all(self.db.pool())
        .await?;

        let mut stages = HashMap::with_capacity(rows.len());
        for row in &rows {
            stages.insert(
                row.try_get::<String, _>("event_id")?,
                PendingStages {
                    path_done: row.try_get("path_done")?,
                    actor_done: row.try_get("actor_done")?,
                },
            );
        }
        Ok(stages)
    }

    /// Statement marking `stage` done for `ids`, for inclusion in the
    /// stage's own batch.
    pub fn mark_done<S: AsRef<str>>(stage: Stage, ids: &[S]) -> Result<Statement> {
        let ids: Vec<&str> = ids.iter().map(AsRef::as_ref).collect();
        Ok(Statement::new(format!(
            "UPDATE pending_aggregation SET {} = 1 \
             WHERE event_id IN (SELECT value FROM json_each(?))",
            stage.column()
        ))
        .bind(serde_json::to_string(&ids)?))
    }

    /// Drop rows whose stages have all completed.
    pub async fn clear_completed(&self) -> Result<u64> {
        self.db
            .execute(&Statement::new(
                "DELETE FROM pending_aggregation WHERE path_done = 1 AND actor_done = 1",
            ))
            .await
    }

    /// Drop rows of `ids` whose stages have all completed.
    pub async fn clear_completed_ids<S: AsRef<str>>(&self, ids: &[S]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<&str> = ids.iter().map(AsRef::as_ref).collect();
        self.db
            .execute(
                &Statement::new(
                    "DELETE FROM pending_aggregation WHERE path_done = 1 AND actor_done = 1 \
                     AND event_id IN (SELECT value FROM json_each(?))",
                )
                .bind(serde_json::to_string(&ids)?),
            )
            .await
    }

    /// Drop bookkeeping older than `older_than_ms`, whatever its state.
    ///
    /// Anything this old belongs to deliveries that were dead-lettered or
    /// never redelivered.
    pub async fn expire(&self, older_than_ms: i64) -> Result<u64> {
        self.db
            .execute(
                &Statement::new("DELETE FROM pending_aggregation WHERE created_at < ?")
                    .bind(older_than_ms),
            )
            .await
    }

    pub async fn outstanding(&self) -> Result<u64> {
        let n: i64 = sqlx::query("SELECT COUNT(*) AS n FROM pending_aggregation")
            .fetch_one(self.db.pool())
            .await?
            .try_get("n")?;
        Ok(crate::database::to_u64(n))
    }
}
