//! In-process delivery queue
//!
//! Bounded buffer between the ingest endpoint and the batch consumer with
//! at-least-once semantics:
//! - `next_batch` hands out up to `max_batch_size` messages, lingering up
//!   to `max_batch_wait` for a batch to fill once the first one arrives
//! - handed-out messages stay in flight (and count against capacity)
//!   until they are acked or retried
//! - a retried message is redelivered with its attempt count bumped; past
//!   `max_retries` redeliveries it goes to the dead-letter sink instead
//!
//! The state lives behind a `parking_lot` mutex that is never held across
//! an await point.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use edgestat_config::QueueConfig;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

use crate::dead_letter::DeadLetterSink;
use crate::error::{PipelineError, Result};

/// One message handed to the consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub id: u64,
    pub body: Bytes,
    /// Times this message has been delivered, this delivery included
    pub attempts: u32,
}

impl Delivery {
    /// Whether an earlier delivery of this message failed.
    pub fn is_redelivery(&self) -> bool {
        self.attempts > 1
    }
}

/// Result of settling a failed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryOutcome {
    pub requeued: usize,
    pub dead_lettered: usize,
    pub dead_letter_path: Option<String>,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Delivery>,
    in_flight: usize,
    next_id: u64,
    closed: bool,
}

impl QueueState {
    fn buffered(&self) -> usize {
        self.ready.len() + self.in_flight
    }
}

#[derive(Clone)]
pub struct MemoryQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    config: Arc<QueueConfig>,
    dead_letters: Option<DeadLetterSink>,
}

impl MemoryQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            notify: Arc::new(Notify::new()),
            config: Arc::new(config),
            dead_letters: None,
        }
    }

    /// Dead-letter exhausted messages to blob storage instead of dropping
    /// them.
    pub fn with_dead_letters(mut self, sink: DeadLetterSink) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Enqueue one message. Returns its delivery id.
    pub fn send(&self, body: impl Into<Bytes>) -> Result<u64> {
        let ids = self.send_batch(vec![body.into()])?;
        ids.first().copied().ok_or(PipelineError::QueueClosed)
    }

    /// Enqueue several messages, all or none.
    pub fn send_batch(&self, bodies: Vec<Bytes>) -> Result<Vec<u64>> {
        let ids = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PipelineError::QueueClosed);
            }
            if state.buffered() + bodies.len() > self.config.capacity {
                counter!("edgestat.queue.rejected").increment(bodies.len() as u64);
                return Err(PipelineError::QueueFull {
                    capacity: self.config.capacity,
                });
            }

            let mut ids = Vec::with_capacity(bodies.len());
            for body in bodies {
                state.next_id += 1;
                let id = state.next_id;
                state.ready.push_back(Delivery {
                    id,
                    body,
                    attempts: 0,
                });
                ids.push(id);
            }
            gauge!("edgestat.queue.depth").set(state.ready.len() as f64);
            ids
        };

        counter!("edgestat.queue.enqueued").increment(ids.len() as u64);
        self.notify.notify_waiters();
        Ok(ids)
    }

    /// Wait for the next batch.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn next_batch(&self) -> Option<Vec<Delivery>> {
        loop {
            // Wait for a first message
            loop {
                let notified = self.notify.notified();
                {
                    let state = self.state.lock();
                    if !state.ready.is_empty() {
                        break;
                    }
                    if state.closed {
                        return None;
                    }
                }
                notified.await;
            }

            // Linger while the batch fills
            let deadline = Instant::now() + self.config.max_batch_wait();
            loop {
                let notified = self.notify.notified();
                {
                    let state = self.state.lock();
                    if state.ready.len() >= self.config.max_batch_size || state.closed {
                        break;
                    }
                }
                if timeout_at(deadline, notified).await.is_err() {
                    break;
                }
            }

            let batch = self.take_ready();
            if !batch.is_empty() {
                return Some(batch);
            }
            // Another consumer emptied the queue while we lingered
        }
    }

    /// Everything currently ready, up to one batch, without waiting.
    pub fn try_next_batch(&self) -> Option<Vec<Delivery>> {
        let batch = self.take_ready();
        (!batch.is_empty()).then_some(batch)
    }

    fn take_ready(&self) -> Vec<Delivery> {
        let mut state = self.state.lock();
        let take = state.ready.len().min(self.config.max_batch_size);
        let batch: Vec<Delivery> = state
            .ready
            .drain(..take)
            .map(|mut delivery| {
                delivery.attempts += 1;
                delivery
            })
            .collect();
        state.in_flight += batch.len();
        gauge!("edgestat.queue.depth").set(state.ready.len() as f64);
        batch
    }

    /// Settle deliveries that were processed (or dropped) for good.
    pub fn ack(&self, deliveries: &[Delivery]) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(deliveries.len());
        counter!("edgestat.queue.acked").increment(deliveries.len() as u64);
    }

    /// Settle deliveries that failed: redeliver them, or dead-letter the
    /// ones that used up their retries.
    ///
    /// When the dead-letter write fails the messages are requeued rather
    /// than lost.
    pub async fn retry(&self, deliveries: Vec<Delivery>, reason: &str) -> RetryOutcome {
        let max_attempts = self.config.max_retries.saturating_add(1);
        let (exhausted, again): (Vec<Delivery>, Vec<Delivery>) = deliveries
            .into_iter()
            .partition(|delivery| delivery.attempts >= max_attempts);

        let mut outcome = RetryOutcome::default();
        let mut requeue = again;

        if !exhausted.is_empty() {
            match &self.dead_letters {
                Some(sink) => match sink.write(&exhausted, reason).await {
                    Ok(path) => {
                        tracing::warn!(
                            messages = exhausted.len(),
                            dead_letter_path = %path,
                            reason,
                            "Messages moved to dead-letter storage after exhausting retries"
                        );
                        outcome.dead_lettered = exhausted.len();
                        outcome.dead_letter_path = Some(path);
                    }
                    Err(e) => {
                        tracing::error!(
                            messages = exhausted.len(),
                            error = %e,
                            "Dead-letter write failed, keeping messages queued"
                        );
                        counter!("edgestat.queue.dead_letter_failures").increment(1);
                        requeue.extend(exhausted);
                    }
                },
                None => {
                    tracing::error!(
                        messages = exhausted.len(),
                        reason,
                        "Dropping messages after exhausting retries (no dead-letter storage)"
                    );
                    outcome.dead_lettered = exhausted.len();
                }
            }
        }
        counter!("edgestat.queue.dead_lettered").increment(outcome.dead_lettered as u64);

        outcome.requeued = requeue.len();
        {
            let mut state = self.state.lock();
            state.in_flight = state
                .in_flight
                .saturating_sub(outcome.requeued + outcome.dead_lettered);
            state.ready.extend(requeue);
            gauge!("edgestat.queue.depth").set(state.ready.len() as f64);
        }
        counter!("edgestat.queue.redelivered").increment(outcome.requeued as u64);
        if outcome.requeued > 0 {
            self.notify.notify_waiters();
        }
        outcome
    }

    /// Stop accepting messages. Consumers drain what is left and then see
    /// `None`.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Messages waiting for delivery.
    pub fn len(&self) -> usize {
        self.state.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }
}
