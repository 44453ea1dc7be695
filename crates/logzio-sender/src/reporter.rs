// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Status reporting for sender components.
//!
//! The sender never logs user-facing status directly: dropped records, rejected
//! batches and failing background jobs are all reported through a
//! [`StatusReporter`] supplied by the embedding application (usually the logging
//! framework adapter, which must not feed these messages back into itself).

use tracing::{error, info, warn};

/// Callback receiving the sender's status messages.
pub trait StatusReporter: Send + Sync {
    fn info(&self, msg: &str);
    fn warning(&self, msg: &str);
    fn error(&self, msg: &str);
}

/// Reporter forwarding every message to `tracing` at the matching level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingStatusReporter;

impl StatusReporter for TracingStatusReporter {
    fn info(&self, msg: &str) {
        info!("{msg}");
    }

    fn warning(&self, msg: &str) {
        warn!("{msg}");
    }

    fn error(&self, msg: &str) {
        error!("{msg}");
    }
}
