//! Snapshot publisher for edgestat
//!
//! Builds versioned, read-optimized snapshots of the busiest paths from
//! the aggregate store and serves them with stale-while-revalidate
//! semantics. Snapshot bodies, pointers and counters live in the KV store
//! under the keys in [`keys`].

mod error;
pub mod keys;
mod methods;
mod publisher;

pub use error::{Result, SnapshotError};
pub use methods::EnrichmentStats;
pub use publisher::{PruneReport, RegenerationReport, SnapshotPublisher, SnapshotResponse};
