//! Storage adapters for edgestat
//!
//! One SQLite database holds raw events, aggregates, archive records, path
//! configuration and stage bookkeeping. Compressed archives and dead
//! letters go to an OpenDAL blob store. Snapshot bodies, pointers and
//! counters go to a [`KvStore`].

mod actors;
mod aggregates;
mod archive_records;
mod blob;
mod database;
mod error;
mod events;
mod kv;
mod path_config;
mod pending;
mod retry;
mod schema;

use std::sync::Arc;

use edgestat_config::{KvBackend, RuntimeConfig};

pub use actors::{ActorDayView, ActorStore, DisplayLists};
pub use aggregates::PathAggregateStore;
pub use archive_records::{ArchiveRecordStore, CompletedArchive};
pub use blob::BlobStore;
pub use database::{Database, SqlValue, Statement};
pub use error::{Result, StorageError};
pub use events::EventStore;
pub use kv::{get_json, put_json, KvStore, MemoryKv, SqliteKv};
pub use path_config::{PathConfig, PathConfigStore, WriteBack};
pub use pending::{PendingAggregations, PendingStages, Stage};
pub use retry::RetryPolicy;

/// Every store, opened over one database and one blob operator.
#[derive(Clone)]
pub struct Stores {
    pub db: Database,
    pub events: EventStore,
    pub pending: PendingAggregations,
    pub paths: PathAggregateStore,
    pub actors: ActorStore,
    pub archives: ArchiveRecordStore,
    pub path_configs: PathConfigStore,
    pub kv: Arc<dyn KvStore>,
    pub blobs: BlobStore,
}

impl Stores {
    /// Open the configured database, KV backend and blob backend.
    pub async fn open(config: &RuntimeConfig) -> Result<Self> {
        let db = Database::connect(&config.database).await?;
        let kv: Arc<dyn KvStore> = match config.kv.backend {
            KvBackend::Sqlite => Arc::new(SqliteKv::new(db.clone())),
            KvBackend::Memory => Arc::new(MemoryKv::new()),
        };
        let blobs = BlobStore::from_config(&config.storage)?;
        Ok(Self::assemble(db, kv, blobs))
    }

    /// In-memory database, KV and blob store (for tests).
    pub async fn in_memory(max_batch_statements: usize) -> Result<Self> {
        let db = Database::in_memory(max_batch_statements).await?;
        Ok(Self::assemble(db, Arc::new(MemoryKv::new()), BlobStore::memory()?))
    }

    pub fn assemble(db: Database, kv: Arc<dyn KvStore>, blobs: BlobStore) -> Self {
        Self {
            events: EventStore::new(db.clone()),
            pending: PendingAggregations::new(db.clone()),
            paths: PathAggregateStore::new(db.clone()),
            actors: ActorStore::new(db.clone()),
            archives: ArchiveRecordStore::new(db.clone()),
            path_configs: PathConfigStore::new(db.clone()),
            db,
            kv,
            blobs,
        }
    }
}
