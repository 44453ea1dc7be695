// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Drain cycles: queue to batches to transport.
//!
//! A cycle repeatedly dequeues records into a batch (until the queue is empty or
//! the batch reaches `max_batch_bytes`) and hands the batch to the
//! [`Transport`]. Accepted and discarded batches are done with. A batch that
//! failed after all retries, or whose delivery was cancelled, is requeued in
//! order and ends the cycle; the next scheduled cycle picks it up again.
//!
//! At most one cycle runs per engine. A cycle started while another one is in
//! flight returns [`DrainOutcome::Skipped`] without touching the queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::SenderError;
use crate::queue::LogsQueue;
use crate::reporter::StatusReporter;
use crate::transport::{Delivery, Transport};

/// Poll interval while waiting for an in-flight cycle to finish.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Another cycle was already running
    Skipped,
    /// The queue was emptied
    Completed { delivered: usize, discarded: usize },
    /// A batch failed and was put back; the cycle stopped
    Requeued(usize),
    /// Cancellation was observed; any batch in flight was put back
    Cancelled,
}

pub struct DrainEngine {
    queue: Arc<dyn LogsQueue>,
    transport: Transport,
    max_batch_bytes: usize,
    draining: AtomicBool,
    reporter: Arc<dyn StatusReporter>,
}

/// Holds the engine's drain flag; clears it on drop.
struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| DrainGuard(flag))
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl DrainEngine {
    pub fn new(
        queue: Arc<dyn LogsQueue>,
        transport: Transport,
        max_batch_bytes: usize,
        reporter: Arc<dyn StatusReporter>,
    ) -> Self {
        DrainEngine {
            queue,
            transport,
            max_batch_bytes,
            draining: AtomicBool::new(false),
            reporter,
        }
    }

    pub fn queue(&self) -> &Arc<dyn LogsQueue> {
        &self.queue
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Runs one cycle unless another is in flight.
    pub async fn drain(&self, cancel: &CancellationToken) -> DrainOutcome {
        let Some(_guard) = DrainGuard::acquire(&self.draining) else {
            debug!("Drain already in progress, skipping");
            return DrainOutcome::Skipped;
        };
        self.run_cycle(cancel).await
    }

    /// Waits for any in-flight cycle to finish, then runs one.
    pub async fn drain_when_idle(&self, cancel: &CancellationToken) -> DrainOutcome {
        loop {
            if let Some(_guard) = DrainGuard::acquire(&self.draining) {
                return self.run_cycle(cancel).await;
            }
            tokio::select! {
                biased;
                () = cancel.cancelled() => return DrainOutcome::Cancelled,
                () = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
            }
        }
    }

    async fn run_cycle(&self, cancel: &CancellationToken) -> DrainOutcome {
        let mut delivered = 0;
        let mut discarded = 0;

        loop {
            if cancel.is_cancelled() {
                return DrainOutcome::Cancelled;
            }

            let batch = self.next_batch();
            if batch.is_empty() {
                break;
            }

            match self.transport.send_batch(&batch, cancel).await {
                Ok(Delivery::Accepted) => delivered += batch.len(),
                Ok(Delivery::Discarded(status)) => {
                    debug!("Listener rejected {} logs with {}", batch.len(), status);
                    discarded += batch.len();
                }
                Err(SenderError::Cancelled) => {
                    let count = self.requeue(batch);
                    debug!("Drain cancelled, requeued {} logs", count);
                    return DrainOutcome::Cancelled;
                }
                Err(e) => {
                    let count = self.requeue(batch);
                    self.reporter.error(&format!(
                        "Could not send {count} logs to logz.io, will try again on the next drain: {e}"
                    ));
                    return DrainOutcome::Requeued(count);
                }
            }
        }

        if delivered + discarded > 0 {
            debug!(
                "Drain completed: {} logs delivered, {} discarded",
                delivered, discarded
            );
        }
        DrainOutcome::Completed {
            delivered,
            discarded,
        }
    }

    fn next_batch(&self) -> Vec<Bytes> {
        let mut batch = Vec::new();
        let mut bytes = 0;
        while bytes < self.max_batch_bytes {
            let Some(record) = self.queue.dequeue() else {
                break;
            };
            bytes += record.len();
            batch.push(record);
        }
        batch
    }

    fn requeue(&self, batch: Vec<Bytes>) -> usize {
        let count = batch.len();
        for record in batch {
            self.queue.requeue(record);
        }
        count
    }
}
