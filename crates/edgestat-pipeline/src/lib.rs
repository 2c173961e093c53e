// edgestat-pipeline - From queue deliveries to aggregates
//
// The in-process queue buffers raw event messages from the ingest edge.
// The consumer hands each delivered batch to the orchestrator, which
// writes the raw events idempotently and feeds only the new ones to the
// path and actor aggregation stages.

mod actor_aggregator;
mod consumer;
mod dead_letter;
mod error;
mod orchestrator;
mod path_aggregator;
mod queue;

pub use actor_aggregator::{pack, ActorAggregator};
pub use consumer::Consumer;
pub use dead_letter::DeadLetterSink;
pub use error::{PipelineError, Result};
pub use orchestrator::{decode, BatchOrchestrator, BatchReport, Disposition};
pub use path_aggregator::{group_by_bucket, PathAggregator};
pub use queue::{Delivery, MemoryQueue, RetryOutcome};
