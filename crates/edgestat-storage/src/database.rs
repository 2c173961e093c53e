//! SQLite access with a per-call statement ceiling
//!
//! `batch` mirrors the batch API of edge SQL stores: a fixed, small number
//! of statements per call, executed atomically, with one affected-row
//! count per statement. Callers that need more statements chunk them and
//! execute the chunks sequentially.

use std::str::FromStr;
use std::time::Duration;

use edgestat_config::DatabaseConfig;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use sqlx::Sqlite;

use crate::error::{Result, StorageError};
use crate::schema;

/// A bindable parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<u64> for SqlValue {
    fn from(v: u64) -> Self {
        SqlValue::Integer(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<usize> for SqlValue {
    fn from(v: usize) -> Self {
        SqlValue::Integer(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<u16> for SqlValue {
    fn from(v: u16) -> Self {
        SqlValue::Integer(i64::from(v))
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Integer(i64::from(v))
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// One SQL statement with its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    sql: String,
    params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[SqlValue] {
        &self.params
    }

    pub(crate) fn query(&self) -> Query<'_, Sqlite, SqliteArguments<'_>> {
        let mut query = sqlx::query(&self.sql);
        for param in &self.params {
            query = match param {
                SqlValue::Null => query.bind(Option::<i64>::None),
                SqlValue::Integer(v) => query.bind(*v),
                SqlValue::Real(v) => query.bind(*v),
                SqlValue::Text(v) => query.bind(v.as_str()),
            };
        }
        query
    }
}

/// Shared handle to the relational store.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    max_batch_statements: usize,
}

impl Database {
    /// Open (or create) the database at `config.url` and apply the schema.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        if config.url.contains(":memory:") {
            return Self::in_memory(config.max_batch_statements).await;
        }

        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        Self::with_pool(pool, config.max_batch_statements).await
    }

    /// Private in-memory database (for tests and single-node runs).
    ///
    /// Every pooled connection to `:memory:` would be a separate database,
    /// so the pool holds exactly one connection that never expires.
    pub async fn in_memory(max_batch_statements: usize) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Self::with_pool(pool, max_batch_statements).await
    }

    async fn with_pool(pool: SqlitePool, max_batch_statements: usize) -> Result<Self> {
        if max_batch_statements == 0 {
            return Err(StorageError::Config(
                "max_batch_statements must be greater than 0".to_string(),
            ));
        }
        schema::apply(&pool).await?;
        Ok(Self {
            pool,
            max_batch_statements,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn max_batch_statements(&self) -> usize {
        self.max_batch_statements
    }

    /// Execute up to `max_batch_statements` statements in one transaction.
    ///
    /// Returns the affected-row count of each statement, in order. Either
    /// every statement applies or none does.
    pub async fn batch(&self, statements: &[Statement]) -> Result<Vec<u64>> {
        if statements.is_empty() {
            return Ok(Vec::new());
        }
        if statements.len() > self.max_batch_statements {
            return Err(StorageError::BatchTooLarge {
                size: statements.len(),
                max: self.max_batch_statements,
            });
        }

        let mut tx = self.pool.begin().await?;
        let mut affected = Vec::with_capacity(statements.len());
        for statement in statements {
            let result = statement.query().execute(&mut *tx).await?;
            affected.push(result.rows_affected());
        }
        tx.commit().await?;

        Ok(affected)
    }

    /// Execute statements in sequential ceiling-sized chunks.
    ///
    /// Each chunk is atomic on its own; a failure leaves earlier chunks
    /// applied.
    pub async fn batch_chunked(&self, statements: &[Statement]) -> Result<Vec<u64>> {
        let mut affected = Vec::with_capacity(statements.len());
        for chunk in statements.chunks(self.max_batch_statements) {
            affected.extend(self.batch(chunk).await?);
        }
        Ok(affected)
    }

    /// Execute a single statement outside any batch.
    pub async fn execute(&self, statement: &Statement) -> Result<u64> {
        let result = statement.query().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

/// Clamp a stored integer counter to `u64`.
pub(crate) fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Row;

    async fn scratch_db(max: usize) -> Database {
        let db = Database::in_memory(max).await.unwrap();
        sqlx::query("CREATE TABLE scratch (k TEXT PRIMARY KEY, n INTEGER NOT NULL)")
            .execute(db.pool())
            .await
            .unwrap();
        db
    }

    fn insert(k: &str) -> Statement {
        Statement::new("INSERT OR IGNORE INTO scratch (k, n) VALUES (?, ?)")
            .bind(k)
            .bind(1i64)
    }

    #[tokio::test]
    async fn test_batch_reports_affected_rows() {
        let db = scratch_db(10).await;
        let affected = db
            .batch(&[insert("a"), insert("b"), insert("a")])
            .await
            .unwrap();
        assert_eq!(affected, vec![1, 1, 0]);
    }

    #[tokio::test]
    async fn test_batch_rejects_more_than_ceiling() {
        let db = scratch_db(3).await;
        let statements: Vec<_> = (0..4).map(|i| insert(&i.to_string())).collect();
        let err = db.batch(&statements).await.unwrap_err();
        assert!(matches!(err, StorageError::BatchTooLarge { size: 4, max: 3 }));

        let affected = db.batch_chunked(&statements).await.unwrap();
        assert_eq!(affected, vec![1, 1, 1, 1]);
    }

    #[tokio::test]
    async fn test_batch_is_atomic() {
        let db = scratch_db(10).await;
        let bad = Statement::new("INSERT INTO scratch (k, n) VALUES (?, NULL)").bind("z");
        assert!(db.batch(&[insert("x"), bad]).await.is_err());

        let count: i64 = sqlx::query("SELECT COUNT(*) AS c FROM scratch")
            .fetch_one(db.pool())
            .await
            .unwrap()
            .get("c");
        assert_eq!(count, 0);
    }

    #[test]
    fn test_sql_value_conversions() {
        assert_eq!(SqlValue::from(Option::<String>::None), SqlValue::Null);
        assert_eq!(SqlValue::from(Some("x")), SqlValue::Text("x".into()));
        assert_eq!(SqlValue::from(true), SqlValue::Integer(1));
        assert_eq!(SqlValue::from(u64::MAX), SqlValue::Integer(i64::MAX));
    }
}
