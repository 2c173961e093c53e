// edgestat-core - Platform-agnostic core logic
//
// Traffic event model, identity derivation and the approximate
// statistics engine. No I/O, no async, no runtime dependencies.
//
// Storage, queueing and publishing live in the sibling crates and call
// into this one with plain values.

pub mod actor;
pub mod archive;
mod error;
pub mod event;
pub mod identity;
pub mod snapshot;
pub mod stats;
pub mod time;

pub use actor::{ActorAccumulator, ActorDayStats, ActorGroupKey, ActorPathDetail, TopK};
pub use archive::{ArchiveRecord, ArchiveStatus};
pub use error::{EventError, Result};
pub use event::{RawTrafficEvent, TrafficEvent};
pub use identity::{derive_idempotent_id, hash_actor};
pub use snapshot::{DataSource, Snapshot, SnapshotMeta, SnapshotRow};
pub use stats::{
    aggregate, compute_percentiles, merge, PathHourKey, PathHourStats, Percentiles,
    DEFAULT_RESERVOIR_CAPACITY,
};
