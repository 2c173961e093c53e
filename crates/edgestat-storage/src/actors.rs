//! Per-actor daily rollups and their path detail rows

use edgestat_core::actor::{ActorAccumulator, CountEntry};
use edgestat_core::{ActorDayStats, ActorGroupKey, ActorPathDetail};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::database::{to_u64, Database, Statement};
use crate::error::{Result, StorageError};
use crate::events::limit_param;

const DAY_COLUMNS: &str = "date, actor_hash, total_requests, total_errors, blocked, throttled, \
     unique_paths, top_paths, top_countries, top_user_agents, first_seen, last_seen";

/// Summary row plus the complete per-path breakdown.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorDayView {
    pub summary: ActorDayStats,
    pub paths: Vec<ActorPathDetail>,
}

/// Display lists written with a summary upsert.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DisplayLists {
    pub paths: Vec<CountEntry>,
    pub countries: Vec<CountEntry>,
    pub user_agents: Vec<CountEntry>,
}

#[derive(Debug, Clone)]
pub struct ActorStore {
    db: Database,
}

impl ActorStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn get_day(&self, date: &str, actor_hash: &str) -> Result<Option<ActorDayStats>> {
        let sql = format!(
            "SELECT {} FROM actor_day_stats WHERE date = ? AND actor_hash = ?",
            DAY_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(date)
            .bind(actor_hash)
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(day_from_row).transpose()
    }

    /// Summary and every detail row, busiest path first.
    pub async fn get_actor_day(&self, date: &str, actor_hash: &str) -> Result<Option<ActorDayView>> {
        let Some(summary) = self.get_day(date, actor_hash).await? else {
            return Ok(None);
        };

        let rows = sqlx::query(
            "SELECT date, actor_hash, path, requests FROM actor_path_detail \
             WHERE date = ? AND actor_hash = ? ORDER BY requests DESC, path ASC",
        )
        .bind(date)
        .bind(actor_hash)
        .fetch_all(self.db.pool())
        .await?;

        let paths = rows
            .iter()
            .map(|row| {
                Ok(ActorPathDetail {
                    date: row.try_get("date")?,
                    actor_hash: row.try_get("actor_hash")?,
                    path: row.try_get("path")?,
                    requests: to_u64(row.try_get("requests")?),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(ActorDayView { summary, paths }))
    }

    /// Busiest actors of a date.
    pub async fn list_top_actors(&self, date: &str, limit: usize) -> Result<Vec<ActorDayStats>> {
        let sql = format!(
            "SELECT {} FROM actor_day_stats WHERE date = ? \
             ORDER BY total_requests DESC, actor_hash ASC LIMIT ?",
            DAY_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(date)
            .bind(limit_param(limit))
            .fetch_all(self.db.pool())
            .await?;
        rows.iter().map(day_from_row).collect()
    }

    /// Additive upsert of a group's summary row.
    ///
    /// First and last seen keep the earliest and latest values across
    /// batches; display lists are replaced with the merged lists computed
    /// by the caller. `unique_paths` is left to the trailing refresh.
    pub fn summary_upsert(
        key: &ActorGroupKey,
        acc: &ActorAccumulator,
        lists: &DisplayLists,
        now_ms: i64,
    ) -> Result<Statement> {
        Ok(Statement::new(
            "INSERT INTO actor_day_stats (date, actor_hash, total_requests, total_errors, \
             blocked, throttled, unique_paths, top_paths, top_countries, top_user_agents, \
             first_seen, last_seen, updated_at) VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (date, actor_hash) DO UPDATE SET \
               total_requests = total_requests + excluded.total_requests, \
               total_errors = total_errors + excluded.total_errors, \
               blocked = blocked + excluded.blocked, \
               throttled = throttled + excluded.throttled, \
               top_paths = excluded.top_paths, \
               top_countries = excluded.top_countries, \
               top_user_agents = excluded.top_user_agents, \
               first_seen = CASE WHEN excluded.first_seen < first_seen \
                            THEN excluded.first_seen ELSE first_seen END, \
               last_seen = CASE WHEN excluded.last_seen > last_seen \
                           THEN excluded.last_seen ELSE last_seen END, \
               updated_at = excluded.updated_at",
        )
        .bind(key.date.as_str())
        .bind(key.actor_hash.as_str())
        .bind(acc.requests)
        .bind(acc.errors)
        .bind(acc.blocked)
        .bind(acc.throttled)
        .bind(serde_json::to_string(&lists.paths)?)
        .bind(serde_json::to_string(&lists.countries)?)
        .bind(serde_json::to_string(&lists.user_agents)?)
        .bind(acc.first_seen)
        .bind(acc.last_seen)
        .bind(now_ms))
    }

    /// Additive upsert of one (date, actor, path) counter.
    pub fn detail_upsert(key: &ActorGroupKey, path: &str, requests: u64) -> Statement {
        Statement::new(
            "INSERT INTO actor_path_detail (date, actor_hash, path, requests) VALUES (?, ?, ?, ?) \
             ON CONFLICT (date, actor_hash, path) DO UPDATE SET \
               requests = requests + excluded.requests",
        )
        .bind(key.date.as_str())
        .bind(key.actor_hash.as_str())
        .bind(path)
        .bind(requests)
    }

    /// Recompute the exact unique-path count from the detail rows. The
    /// detail key holds one row per distinct path.
    pub fn refresh_unique_paths(key: &ActorGroupKey) -> Statement {
        Statement::new(
            "UPDATE actor_day_stats SET unique_paths = \
               (SELECT COUNT(*) FROM actor_path_detail WHERE date = ? AND actor_hash = ?) \
             WHERE date = ? AND actor_hash = ?",
        )
        .bind(key.date.as_str())
        .bind(key.actor_hash.as_str())
        .bind(key.date.as_str())
        .bind(key.actor_hash.as_str())
    }

    /// Delete at most `limit` detail rows dated before `cutoff_date`.
    pub async fn purge_details_before(&self, cutoff_date: &str, limit: usize) -> Result<u64> {
        self.db
            .execute(
                &Statement::new(
                    "DELETE FROM actor_path_detail WHERE rowid IN \
                     (SELECT rowid FROM actor_path_detail WHERE date < ? LIMIT ?)",
                )
                .bind(cutoff_date)
                .bind(limit),
            )
            .await
    }

    /// Delete at most `limit` summary rows dated before `cutoff_date`.
    pub async fn purge_days_before(&self, cutoff_date: &str, limit: usize) -> Result<u64> {
        self.db
            .execute(
                &Statement::new(
                    "DELETE FROM actor_day_stats WHERE rowid IN \
                     (SELECT rowid FROM actor_day_stats WHERE date < ? LIMIT ?)",
                )
                .bind(cutoff_date)
                .bind(limit),
            )
            .await
    }
}

fn day_from_row(row: &SqliteRow) -> Result<ActorDayStats> {
    Ok(ActorDayStats {
        date: row.try_get("date")?,
        actor_hash: row.try_get("actor_hash")?,
        total_requests: to_u64(row.try_get("total_requests")?),
        total_errors: to_u64(row.try_get("total_errors")?),
        blocked: to_u64(row.try_get("blocked")?),
        throttled: to_u64(row.try_get("throttled")?),
        unique_paths: to_u64(row.try_get("unique_paths")?),
        top_paths: count_list(row, "top_paths")?,
        top_countries: count_list(row, "top_countries")?,
        top_user_agents: count_list(row, "top_user_agents")?,
        first_seen: row.try_get("first_seen")?,
        last_seen: row.try_get("last_seen")?,
    })
}

fn count_list(row: &SqliteRow, column: &'static str) -> Result<Vec<CountEntry>> {
    let raw: String = row.try_get(column)?;
    serde_json::from_str(&raw).map_err(|e| StorageError::invalid_data("actor_day_stats", column, e))
}
