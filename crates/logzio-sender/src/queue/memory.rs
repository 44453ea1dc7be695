// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory record queue bounded by total bytes and record count.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tracing::debug;

use crate::queue::LogsQueue;
use crate::reporter::StatusReporter;

#[derive(Debug, Default)]
struct State {
    records: VecDeque<Bytes>,
    /// Sum of the lengths of `records`
    bytes: u64,
    /// Set on the first drop, cleared by the next accepted record
    dropping: bool,
}

/// FIFO queue holding records in memory.
///
/// Either bound may be `None` (unlimited). The capacity check and the insert
/// happen under the same lock, so concurrent producers can never push the queue
/// past its bounds.
pub struct BoundedMemoryQueue {
    state: Mutex<State>,
    capacity_bytes: Option<u64>,
    capacity_count: Option<usize>,
    reporter: Arc<dyn StatusReporter>,
}

impl BoundedMemoryQueue {
    pub fn new(
        capacity_bytes: Option<u64>,
        capacity_count: Option<usize>,
        reporter: Arc<dyn StatusReporter>,
    ) -> Self {
        BoundedMemoryQueue {
            state: Mutex::new(State::default()),
            capacity_bytes,
            capacity_count,
            reporter,
        }
    }

    /// Total bytes currently held.
    pub fn size_bytes(&self) -> u64 {
        self.lock().bytes
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // Every push/pop is paired with its byte update, so a poisoned State is still consistent.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn has_room(&self, state: &State, len: u64) -> bool {
        let bytes_ok = self
            .capacity_bytes
            .map_or(true, |cap| state.bytes.saturating_add(len) <= cap);
        let count_ok = self
            .capacity_count
            .map_or(true, |cap| state.records.len() < cap);
        bytes_ok && count_ok
    }
}

impl LogsQueue for BoundedMemoryQueue {
    fn enqueue(&self, record: Bytes) {
        let len = record.len() as u64;
        let mut state = self.lock();

        if !self.has_room(&state, len) {
            let first_drop = !state.dropping;
            state.dropping = true;
            drop(state);
            if first_drop {
                self.reporter.warning(&format!(
                    "Logs queue reached its capacity (bytes: {}, records: {}), dropping logs until there is room",
                    describe_limit(self.capacity_bytes),
                    describe_limit(self.capacity_count),
                ));
            }
            return;
        }

        state.bytes += len;
        state.records.push_back(record);
        state.dropping = false;
    }

    fn dequeue(&self) -> Option<Bytes> {
        let mut state = self.lock();
        let record = state.records.pop_front()?;
        state.bytes -= record.len() as u64;
        Some(record)
    }

    fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    fn len(&self) -> usize {
        self.lock().records.len()
    }

    fn close(&self) {
        debug!("Nothing to flush for the in-memory logs queue");
    }

    fn clear(&self) {
        let mut state = self.lock();
        state.records.clear();
        state.bytes = 0;
    }
}

fn describe_limit<T: std::fmt::Display>(limit: Option<T>) -> String {
    limit.map_or_else(|| "unlimited".to_string(), |value| value.to_string())
}
