//! Queue consumer loop
//!
//! Pulls batches off the [`MemoryQueue`], runs them through the
//! orchestrator and settles them: acked on success, redelivered after a
//! backoff on failure. Malformed messages are always acked.

use std::sync::Arc;

use edgestat_storage::RetryPolicy;
use tokio_util::sync::CancellationToken;

use crate::orchestrator::{BatchOrchestrator, BatchReport, Disposition};
use crate::queue::{Delivery, MemoryQueue};

#[derive(Clone)]
pub struct Consumer {
    queue: MemoryQueue,
    orchestrator: Arc<BatchOrchestrator>,
    /// Delay before a failed batch is made visible again
    redelivery: RetryPolicy,
}

impl Consumer {
    pub fn new(queue: MemoryQueue, orchestrator: BatchOrchestrator) -> Self {
        Self {
            queue,
            orchestrator: Arc::new(orchestrator),
            redelivery: RetryPolicy::default(),
        }
    }

    pub fn with_redelivery_backoff(mut self, policy: RetryPolicy) -> Self {
        self.redelivery = policy;
        self
    }

    /// Consume until cancelled or the queue closes, then drain what is
    /// already buffered once.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!("Queue consumer started");
        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => break,
                batch = self.queue.next_batch() => batch,
            };
            let Some(batch) = batch else {
                break;
            };
            self.handle(batch).await;
        }

        let drained = self.drain().await;
        tracing::info!(drained, "Queue consumer stopped");
    }

    /// Process the messages buffered right now, each at most once more.
    /// Returns the number of messages handled.
    pub async fn drain(&self) -> usize {
        let mut remaining = self.queue.len();
        let mut handled = 0;
        while remaining > 0 {
            let Some(batch) = self.queue.try_next_batch() else {
                break;
            };
            remaining = remaining.saturating_sub(batch.len());
            handled += batch.len();
            self.settle(batch, false).await;
        }
        handled
    }

    /// Process and settle one batch.
    pub async fn handle(&self, batch: Vec<Delivery>) -> BatchReport {
        self.settle(batch, true).await
    }

    async fn settle(&self, batch: Vec<Delivery>, backoff: bool) -> BatchReport {
        let report = self.orchestrator.process(&batch).await;
        if report.disposition == Disposition::Ack {
            self.queue.ack(&batch);
            return report;
        }

        let (malformed, retry): (Vec<Delivery>, Vec<Delivery>) = batch
            .into_iter()
            .partition(|d| report.malformed_deliveries.contains(&d.id));
        self.queue.ack(&malformed);

        if backoff {
            let attempt = retry.iter().map(|d| d.attempts).max().unwrap_or(1);
            let delay = self
                .redelivery
                .backoff(usize::try_from(attempt.saturating_sub(1)).unwrap_or(usize::MAX));
            tokio::time::sleep(delay).await;
        }

        let reason = report.error.as_deref().unwrap_or("batch failed");
        let outcome = self.queue.retry(retry, reason).await;
        tracing::debug!(
            requeued = outcome.requeued,
            dead_lettered = outcome.dead_lettered,
            "Failed batch settled"
        );
        report
    }
}
