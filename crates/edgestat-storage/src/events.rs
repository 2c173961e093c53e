//! Raw event store (hot tier) and the ingestion writer

use std::collections::{HashMap, HashSet};

use edgestat_core::TrafficEvent;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::database::{Database, Statement};
use crate::error::Result;

const EVENT_COLUMNS: &str = "id, path, method, status, response_time_ms, actor_hash, \
     actor_address, timestamp, event_date, country, city, user_agent, edge_location, \
     geo_decision, is_error";

#[derive(Debug, Clone)]
pub struct EventStore {
    db: Database,
}

impl EventStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Write events with insert-if-absent semantics.
    ///
    /// Returns exactly the IDs that were newly inserted by this call.
    /// Repeated IDs within `events` are collapsed (first occurrence wins)
    /// before writing, so a repeat is never reported as inserted. Chunks of
    /// at most `max_batch_statements` run sequentially; a failure leaves
    /// earlier chunks committed and the caller re-derives on retry.
    #[tracing::instrument(name = "events.insert", skip_all, fields(events = events.len()))]
    pub async fn insert_events(&self, events: &[TrafficEvent]) -> Result<HashSet<String>> {
        let mut seen = HashSet::with_capacity(events.len());
        let unique: Vec<&TrafficEvent> = events
            .iter()
            .filter(|event| seen.insert(event.id.as_str()))
            .collect();

        let mut inserted = HashSet::with_capacity(unique.len());
        for chunk in unique.chunks(self.db.max_batch_statements()) {
            let statements: Vec<Statement> = chunk.iter().map(|e| insert_statement(e)).collect();
            let affected = self.db.batch(&statements).await?;
            for (event, rows) in chunk.iter().zip(affected) {
                if rows > 0 {
                    inserted.insert(event.id.clone());
                }
            }
        }

        tracing::debug!(
            unique = unique.len(),
            inserted = inserted.len(),
            "Raw events written"
        );
        Ok(inserted)
    }

    /// One page of a date's events, ordered by id, after `after_id`.
    pub async fn page_for_date(
        &self,
        date: &str,
        after_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<TrafficEvent>> {
        let sql = format!(
            "SELECT {} FROM traffic_events WHERE event_date = ? AND id > ? ORDER BY id LIMIT ?",
            EVENT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(date)
            .bind(after_id.unwrap_or(""))
            .bind(limit_param(limit))
            .fetch_all(self.db.pool())
            .await?;
        rows.iter().map(event_from_row).collect()
    }

    pub async fn count_for_date(&self, date: &str) -> Result<u64> {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM traffic_events WHERE event_date = ?")
            .bind(date)
            .fetch_one(self.db.pool())
            .await?
            .try_get("n")?;
        Ok(crate::database::to_u64(count))
    }

    /// Distinct event dates strictly before `cutoff_date`, oldest first.
    pub async fn dates_before(&self, cutoff_date: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT event_date FROM traffic_events WHERE event_date < ? ORDER BY event_date",
        )
        .bind(cutoff_date)
        .fetch_all(self.db.pool())
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("event_date").map_err(Into::into))
            .collect()
    }

    /// Delete at most `limit` rows of one date. Returns the rows removed.
    pub async fn delete_batch_for_date(&self, date: &str, limit: usize) -> Result<u64> {
        let statement = Statement::new(
            "DELETE FROM traffic_events WHERE id IN \
             (SELECT id FROM traffic_events WHERE event_date = ? LIMIT ?)",
        )
        .bind(date)
        .bind(limit);
        self.db.execute(&statement).await
    }

    /// Delete at most `limit` rows dated before `cutoff_date`.
    pub async fn delete_batch_before(&self, cutoff_date: &str, limit: usize) -> Result<u64> {
        let statement = Statement::new(
            "DELETE FROM traffic_events WHERE id IN \
             (SELECT id FROM traffic_events WHERE event_date < ? LIMIT ?)",
        )
        .bind(cutoff_date)
        .bind(limit);
        self.db.execute(&statement).await
    }

    /// Most frequent HTTP method per path since `since_ms`.
    ///
    /// Ties resolve to the alphabetically first method so repeated runs
    /// agree.
    pub async fn most_frequent_methods(
        &self,
        since_ms: i64,
        paths: &[String],
    ) -> Result<HashMap<String, String>> {
        if paths.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            "SELECT path, method, COUNT(*) AS hits FROM traffic_events \
             WHERE timestamp >= ? AND method IS NOT NULL \
               AND path IN (SELECT value FROM json_each(?)) \
             GROUP BY path, method \
             ORDER BY path, hits DESC, method ASC",
        )
        .bind(since_ms)
        .bind(serde_json::to_string(paths)?)
        .fetch_all(self.db.pool())
        .await?;

        let mut methods = HashMap::new();
        for row in &rows {
            let path: String = row.try_get("path")?;
            let method: String = row.try_get("method")?;
            methods.entry(path).or_insert(method);
        }
        Ok(methods)
    }
}

fn insert_statement(event: &TrafficEvent) -> Statement {
    Statement::new(
        "INSERT OR IGNORE INTO traffic_events (id, path, method, status, response_time_ms, \
         actor_hash, actor_address, timestamp, event_date, hour_bucket, country, city, \
         user_agent, edge_location, geo_decision, is_error) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(event.id.as_str())
    .bind(event.path.as_str())
    .bind(event.method.clone())
    .bind(event.status)
    .bind(event.response_time_ms)
    .bind(event.actor_hash.as_str())
    .bind(event.actor_address.clone())
    .bind(event.timestamp)
    .bind(event.event_date.as_str())
    .bind(event.hour_bucket())
    .bind(event.country.clone())
    .bind(event.city.clone())
    .bind(event.user_agent.clone())
    .bind(event.edge_location.clone())
    .bind(event.geo_decision.clone())
    .bind(event.is_error)
}

fn event_from_row(row: &SqliteRow) -> Result<TrafficEvent> {
    let status: i64 = row.try_get("status")?;
    Ok(TrafficEvent {
        id: row.try_get("id")?,
        path: row.try_get("path")?,
        method: row.try_get("method")?,
        status: u16::try_from(status).unwrap_or(0),
        response_time_ms: row.try_get("response_time_ms")?,
        actor_hash: row.try_get("actor_hash")?,
        actor_address: row.try_get("actor_address")?,
        timestamp: row.try_get("timestamp")?,
        event_date: row.try_get("event_date")?,
        country: row.try_get("country")?,
        city: row.try_get("city")?,
        user_agent: row.try_get("user_agent")?,
        edge_location: row.try_get("edge_location")?,
        geo_decision: row.try_get("geo_decision")?,
        is_error: row.try_get("is_error")?,
    })
}

pub(crate) fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}
