//! Tiered storage lifecycle for raw traffic events
//!
//! Only the raw `traffic_events` table is tiered. Aged dates are archived
//! to compressed NDJSON blobs ([`Archiver`]), then evicted from the hot
//! store in bounded batches ([`Cleaner`]). Retention sweeps expire raw
//! events and actor rollups unconditionally ([`RetentionSweeper`]). Path
//! rollups are permanent and never touched here.
//!
//! Every entrypoint returns a structured report and only fails on
//! infrastructure errors raised before any per-date work starts.

mod archiver;
mod cleaner;
mod error;
mod report;
mod retention;

pub use archiver::{archive_key, read_archive, Archiver};
pub use cleaner::Cleaner;
pub use error::{LifecycleError, Result};
pub use report::{DateOutcome, DateStatus, RetentionReport, StageReport};
pub use retention::RetentionSweeper;
