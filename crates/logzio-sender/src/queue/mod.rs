// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Record queues.
//!
//! Every sender buffers serialized records in a [`LogsQueue`] between `send` and
//! delivery. Two backends exist:
//!
//! - [`memory::BoundedMemoryQueue`]: a `VecDeque` bounded by bytes and/or count
//! - [`disk::PersistentDiskQueue`]: append-only page files that survive restarts
//!
//! Queues never block the producer. A record that does not fit is dropped and
//! the drop is reported once per transition into the dropping state.
//!
//! Records are stored without a trailing newline; framing is added by the
//! transport when a batch is encoded.

pub mod disk;
pub mod memory;
pub mod pages;
pub mod statfs;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::config::QueueConfig;
use crate::error::Result;
use crate::reporter::StatusReporter;

/// Ordered, capacity-bounded mailbox of serialized records.
pub trait LogsQueue: Send + Sync {
    /// Appends `record`, or drops it when the queue has no room.
    fn enqueue(&self, record: Bytes);

    /// Removes and returns the oldest record.
    fn dequeue(&self) -> Option<Bytes>;

    fn is_empty(&self) -> bool;

    /// Number of records currently queued.
    fn len(&self) -> usize;

    /// Flushes pending state to storage. The queue stays usable.
    fn close(&self);

    /// Discards every queued record.
    fn clear(&self);

    /// Re-inserts a record that was already accepted once (failed delivery).
    fn requeue(&self, record: Bytes) {
        self.enqueue(record);
    }

    /// Background maintenance the backend needs, e.g. garbage collection.
    fn periodic_jobs(self: Arc<Self>) -> Vec<ScheduledJob> {
        Vec::new()
    }
}

/// A synchronous job run on a fixed-delay schedule.
#[derive(Clone)]
pub struct ScheduledJob {
    pub name: &'static str,
    pub interval: Duration,
    pub run: Arc<dyn Fn() + Send + Sync>,
}

impl fmt::Debug for ScheduledJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledJob")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

/// Builds the queue backend described by `config`.
pub fn build(
    config: &QueueConfig,
    reporter: Arc<dyn StatusReporter>,
) -> Result<Arc<dyn LogsQueue>> {
    match config {
        QueueConfig::InMemory {
            capacity_bytes,
            capacity_count,
        } => Ok(Arc::new(memory::BoundedMemoryQueue::new(
            *capacity_bytes,
            *capacity_count,
            reporter,
        ))),
        QueueConfig::Disk {
            dir,
            fs_percent_threshold,
            gc_interval,
            probe_interval,
            page_size,
        } => Ok(Arc::new(disk::PersistentDiskQueue::open(
            disk::DiskQueueOptions {
                dir: dir.clone(),
                fs_percent_threshold: *fs_percent_threshold,
                gc_interval: *gc_interval,
                probe_interval: *probe_interval,
                page_size: *page_size,
            },
            reporter,
        )?)),
    }
}
