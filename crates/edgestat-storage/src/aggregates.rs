//! Path-level rollups keyed by (path, hour bucket)
//!
//! Counters are written as additive deltas so concurrent batches on the
//! same bucket never lose counts. Reservoirs are replaced with the value
//! computed from the state read by the writer; under concurrent writers on
//! one bucket the last reservoir wins, which keeps it bounded but may drop
//! some of the other writer's samples.

use edgestat_core::{PathHourKey, PathHourStats};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::database::{to_u64, Database, Statement};
use crate::error::{Result, StorageError};

#[derive(Debug, Clone)]
pub struct PathAggregateStore {
    db: Database,
}

impl PathAggregateStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn get(&self, key: &PathHourKey) -> Result<Option<PathHourStats>> {
        let row = sqlx::query(
            "SELECT path, hour_bucket, requests, errors, response_time_sum, response_time_count, \
             response_samples, actor_reservoir, unique_actors_seen, last_event_at \
             FROM path_hour_stats WHERE path = ? AND hour_bucket = ?",
        )
        .bind(key.path.as_str())
        .bind(key.hour_bucket)
        .fetch_optional(self.db.pool())
        .await?;

        row.as_ref().map(stats_from_row).transpose()
    }

    /// Upsert statement for `updated`, the result of folding a batch into
    /// `previous` (the state read before aggregation, if any).
    pub fn upsert_statement(
        updated: &PathHourStats,
        previous: Option<&PathHourStats>,
        now_ms: i64,
    ) -> Result<Statement> {
        let (requests, errors, rt_sum, rt_count) = match previous {
            Some(prev) => (
                updated.requests.saturating_sub(prev.requests),
                updated.errors.saturating_sub(prev.errors),
                updated.response_time_sum - prev.response_time_sum,
                updated
                    .response_time_count
                    .saturating_sub(prev.response_time_count),
            ),
            None => (
                updated.requests,
                updated.errors,
                updated.response_time_sum,
                updated.response_time_count,
            ),
        };

        Ok(Statement::new(
            "INSERT INTO path_hour_stats (path, hour_bucket, requests, errors, response_time_sum, \
             response_time_count, response_samples, actor_reservoir, unique_actors_seen, \
             last_event_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (path, hour_bucket) DO UPDATE SET \
               requests = requests + excluded.requests, \
               errors = errors + excluded.errors, \
               response_time_sum = response_time_sum + excluded.response_time_sum, \
               response_time_count = response_time_count + excluded.response_time_count, \
               response_samples = excluded.response_samples, \
               actor_reservoir = excluded.actor_reservoir, \
               unique_actors_seen = excluded.unique_actors_seen, \
               last_event_at = MAX(last_event_at, excluded.last_event_at), \
               updated_at = excluded.updated_at",
        )
        .bind(updated.path.as_str())
        .bind(updated.hour_bucket)
        .bind(requests)
        .bind(errors)
        .bind(rt_sum)
        .bind(rt_count)
        .bind(serde_json::to_string(&updated.response_samples)?)
        .bind(serde_json::to_string(&updated.actor_reservoir)?)
        .bind(updated.unique_actors_seen)
        .bind(updated.last_event_at)
        .bind(now_ms))
    }

    /// Top `limit` paths by summed requests over buckets at or after
    /// `since_bucket`.
    ///
    /// Counters are summed across buckets. The response samples come from
    /// the most recently updated bucket of each path, not a merge of every
    /// bucket. The unique-actor figure is the largest bucket value, which
    /// stays a lower bound for the window. Actor reservoirs are not loaded.
    pub async fn top_paths(&self, since_bucket: i64, limit: usize) -> Result<Vec<PathHourStats>> {
        let rows = sqlx::query(
            "WITH windowed AS ( \
                 SELECT * FROM path_hour_stats WHERE hour_bucket >= ? \
             ), totals AS ( \
                 SELECT path, SUM(requests) AS requests, SUM(errors) AS errors, \
                        SUM(response_time_sum) AS response_time_sum, \
                        SUM(response_time_count) AS response_time_count, \
                        MAX(unique_actors_seen) AS unique_actors_seen, \
                        MAX(last_event_at) AS last_event_at, \
                        MAX(hour_bucket) AS hour_bucket \
                 FROM windowed GROUP BY path \
                 ORDER BY requests DESC, path ASC LIMIT ? \
             ), latest AS ( \
                 SELECT path, response_samples, \
                        ROW_NUMBER() OVER ( \
                            PARTITION BY path ORDER BY updated_at DESC, hour_bucket DESC \
                        ) AS rn \
                 FROM windowed \
             ) \
             SELECT t.path, t.hour_bucket, t.requests, t.errors, t.response_time_sum, \
                    t.response_time_count, l.response_samples, '[]' AS actor_reservoir, \
                    t.unique_actors_seen, t.last_event_at \
             FROM totals t JOIN latest l ON l.path = t.path AND l.rn = 1 \
             ORDER BY t.requests DESC, t.path ASC",
        )
        .bind(since_bucket)
        .bind(crate::events::limit_param(limit))
        .fetch_all(self.db.pool())
        .await?;

        rows.iter().map(stats_from_row).collect()
    }

    /// Every bucket of one path at or after `since_bucket`, oldest first.
    pub async fn buckets_for_path(&self, path: &str, since_bucket: i64) -> Result<Vec<PathHourStats>> {
        let rows = sqlx::query(
            "SELECT path, hour_bucket, requests, errors, response_time_sum, response_time_count, \
             response_samples, actor_reservoir, unique_actors_seen, last_event_at \
             FROM path_hour_stats WHERE path = ? AND hour_bucket >= ? ORDER BY hour_bucket",
        )
        .bind(path)
        .bind(since_bucket)
        .fetch_all(self.db.pool())
        .await?;

        rows.iter().map(stats_from_row).collect()
    }
}

fn stats_from_row(row: &SqliteRow) -> Result<PathHourStats> {
    let samples: String = row.try_get("response_samples")?;
    let actors: String = row.try_get("actor_reservoir")?;
    Ok(PathHourStats {
        path: row.try_get("path")?,
        hour_bucket: row.try_get("hour_bucket")?,
        requests: to_u64(row.try_get("requests")?),
        errors: to_u64(row.try_get("errors")?),
        response_time_sum: row.try_get("response_time_sum")?,
        response_time_count: to_u64(row.try_get("response_time_count")?),
        response_samples: serde_json::from_str(&samples)
            .map_err(|e| StorageError::invalid_data("path_hour_stats", "response_samples", e))?,
        actor_reservoir: serde_json::from_str(&actors)
            .map_err(|e| StorageError::invalid_data("path_hour_stats", "actor_reservoir", e))?,
        unique_actors_seen: to_u64(row.try_get("unique_actors_seen")?),
        last_event_at: row.try_get("last_event_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUCKET: i64 = 1_705_327_200_000;

    fn stats(path: &str, bucket: i64, requests: u64, samples: Vec<f64>) -> PathHourStats {
        PathHourStats {
            path: path.into(),
            hour_bucket: bucket,
            requests,
            errors: 1,
            response_time_sum: samples.iter().sum(),
            response_time_count: samples.len() as u64,
            actor_reservoir: vec!["a".into()],
            unique_actors_seen: 1,
            response_samples: samples,
            last_event_at: bucket + 10,
        }
    }

    #[tokio::test]
    async fn test_upsert_adds_deltas() {
        let db = Database::in_memory(10).await.unwrap();
        let store = PathAggregateStore::new(db.clone());

        let first = stats("/a", BUCKET, 3, vec![1.0, 2.0, 3.0]);
        db.batch(&[PathAggregateStore::upsert_statement(&first, None, 1).unwrap()])
            .await
            .unwrap();

        let mut second = first.clone();
        second.requests = 5;
        second.errors = 2;
        second.response_samples = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        second.response_time_sum = 15.0;
        second.response_time_count = 5;
        db.batch(&[PathAggregateStore::upsert_statement(&second, Some(&first), 2).unwrap()])
            .await
            .unwrap();

        let key = PathHourKey {
            path: "/a".into(),
            hour_bucket: BUCKET,
        };
        let stored = store.get(&key).await.unwrap().unwrap();
        assert_eq!(stored.requests, 5);
        assert_eq!(stored.errors, 2);
        assert_eq!(stored.response_time_count, 5);
        assert_eq!(stored.response_samples.len(), 5);
    }

    #[tokio::test]
    async fn test_top_paths_sums_and_picks_latest_samples() {
        let db = Database::in_memory(10).await.unwrap();
        let store = PathAggregateStore::new(db.clone());

        let older = stats("/a", BUCKET, 10, vec![100.0]);
        let newer = stats("/a", BUCKET + 3_600_000, 5, vec![7.0, 9.0]);
        let other = stats("/b", BUCKET, 4, vec![1.0]);
        db.batch(&[
            PathAggregateStore::upsert_statement(&older, None, 10).unwrap(),
            PathAggregateStore::upsert_statement(&newer, None, 20).unwrap(),
            PathAggregateStore::upsert_statement(&other, None, 30).unwrap(),
        ])
        .await
        .unwrap();

        let top = store.top_paths(BUCKET, 10).await.unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].path, "/a");
        assert_eq!(top[0].requests, 15);
        assert_eq!(top[0].errors, 2);
        assert_eq!(top[0].response_samples, vec![7.0, 9.0]);
        assert_eq!(top[1].path, "/b");

        let limited = store.top_paths(BUCKET, 1).await.unwrap();
        assert_eq!(limited.len(), 1);

        let later = store.top_paths(BUCKET + 3_600_000, 10).await.unwrap();
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].requests, 5);
    }
}
