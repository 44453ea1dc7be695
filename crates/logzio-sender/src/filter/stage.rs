// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tracing::trace;

use crate::filter::{filter_document, FilterSet};
use crate::queue::{LogsQueue, ScheduledJob};
use crate::reporter::StatusReporter;

/// Queue decorator dropping records rejected by the current [`FilterSet`].
///
/// Records that are not valid JSON are forwarded unfiltered. Requeued records
/// were filtered when first accepted and bypass the filters.
pub struct FilterStage {
    inner: Arc<dyn LogsQueue>,
    filters: Arc<FilterSet>,
    reporter: Arc<dyn StatusReporter>,
}

impl FilterStage {
    pub fn new(
        inner: Arc<dyn LogsQueue>,
        filters: Arc<FilterSet>,
        reporter: Arc<dyn StatusReporter>,
    ) -> Self {
        FilterStage {
            inner,
            filters,
            reporter,
        }
    }

    pub fn filters(&self) -> &Arc<FilterSet> {
        &self.filters
    }
}

impl LogsQueue for FilterStage {
    fn enqueue(&self, record: Bytes) {
        let parsed = match serde_json::from_slice::<Value>(&record) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.reporter.error(&format!(
                    "Could not parse log for filtering, queueing it unfiltered: {e}"
                ));
                self.inner.enqueue(record);
                return;
            }
        };

        if self.filters.should_keep(&filter_document(parsed)) {
            self.inner.enqueue(record);
        } else {
            trace!("Log dropped by filters");
        }
    }

    fn dequeue(&self) -> Option<Bytes> {
        self.inner.dequeue()
    }

    fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn close(&self) {
        self.inner.close();
    }

    fn clear(&self) {
        self.inner.clear();
    }

    fn requeue(&self, record: Bytes) {
        self.inner.requeue(record);
    }

    fn periodic_jobs(self: Arc<Self>) -> Vec<ScheduledJob> {
        Arc::clone(&self.inner).periodic_jobs()
    }
}
