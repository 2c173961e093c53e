//! Relational schema
//!
//! Applied idempotently at startup. Every table lives in one SQLite
//! database so a single batch can touch raw events, aggregates and stage
//! bookkeeping atomically.

use sqlx::SqlitePool;

use crate::error::Result;

const STATEMENTS: &[&str] = &[
    // Raw events (hot tier)
    r#"
    CREATE TABLE IF NOT EXISTS traffic_events (
        id TEXT PRIMARY KEY,
        path TEXT NOT NULL,
        method TEXT,
        status INTEGER NOT NULL,
        response_time_ms REAL NOT NULL,
        actor_hash TEXT NOT NULL,
        actor_address TEXT,
        timestamp INTEGER NOT NULL,
        event_date TEXT NOT NULL,
        hour_bucket INTEGER NOT NULL,
        country TEXT,
        city TEXT,
        user_agent TEXT,
        edge_location TEXT,
        geo_decision TEXT,
        is_error INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_traffic_events_date ON traffic_events (event_date)",
    "CREATE INDEX IF NOT EXISTS idx_traffic_events_timestamp ON traffic_events (timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_traffic_events_path_ts ON traffic_events (path, timestamp)",
    // Per-stage aggregation bookkeeping for newly inserted events
    r#"
    CREATE TABLE IF NOT EXISTS pending_aggregation (
        event_id TEXT PRIMARY KEY,
        path_done INTEGER NOT NULL DEFAULT 0,
        actor_done INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL
    )
    "#,
    // Fires only for rows actually inserted, never for ignored duplicates.
    // changes() of the outer insert does not count rows written here.
    r#"
    CREATE TRIGGER IF NOT EXISTS trg_traffic_events_pending
    AFTER INSERT ON traffic_events
    BEGIN
        INSERT OR IGNORE INTO pending_aggregation (event_id, created_at)
        VALUES (NEW.id, CAST(strftime('%s', 'now') AS INTEGER) * 1000);
    END
    "#,
    // Path rollups (permanent)
    r#"
    CREATE TABLE IF NOT EXISTS path_hour_stats (
        path TEXT NOT NULL,
        hour_bucket INTEGER NOT NULL,
        requests INTEGER NOT NULL,
        errors INTEGER NOT NULL,
        response_time_sum REAL NOT NULL,
        response_time_count INTEGER NOT NULL,
        response_samples TEXT NOT NULL,
        actor_reservoir TEXT NOT NULL,
        unique_actors_seen INTEGER NOT NULL,
        last_event_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (path, hour_bucket)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_path_hour_stats_bucket ON path_hour_stats (hour_bucket)",
    // Actor rollups
    r#"
    CREATE TABLE IF NOT EXISTS actor_day_stats (
        date TEXT NOT NULL,
        actor_hash TEXT NOT NULL,
        total_requests INTEGER NOT NULL,
        total_errors INTEGER NOT NULL,
        blocked INTEGER NOT NULL,
        throttled INTEGER NOT NULL,
        unique_paths INTEGER NOT NULL,
        top_paths TEXT NOT NULL,
        top_countries TEXT NOT NULL,
        top_user_agents TEXT NOT NULL,
        first_seen INTEGER NOT NULL,
        last_seen INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (date, actor_hash)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS actor_path_detail (
        date TEXT NOT NULL,
        actor_hash TEXT NOT NULL,
        path TEXT NOT NULL,
        requests INTEGER NOT NULL,
        PRIMARY KEY (date, actor_hash, path)
    )
    "#,
    // Lifecycle bookkeeping
    r#"
    CREATE TABLE IF NOT EXISTS archive_records (
        date TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        record_count INTEGER NOT NULL DEFAULT 0,
        compressed_bytes INTEGER NOT NULL DEFAULT 0,
        blob_path TEXT,
        content_hash TEXT,
        evicted INTEGER NOT NULL DEFAULT 0,
        error TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    // Per-path configuration, edited by operators and the snapshot publisher
    r#"
    CREATE TABLE IF NOT EXISTS path_config (
        path TEXT PRIMARY KEY,
        method TEXT,
        features TEXT NOT NULL DEFAULT '[]',
        updated_at INTEGER NOT NULL
    )
    "#,
    // Key-value table backing SqliteKv
    r#"
    CREATE TABLE IF NOT EXISTS kv_store (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        expires_at INTEGER
    )
    "#,
];

/// Create every table, index and trigger that does not exist yet.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::debug!(statements = STATEMENTS.len(), "Schema applied");
    Ok(())
}
