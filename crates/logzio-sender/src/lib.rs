// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Logz.io Sender
//!
//! An embeddable client that buffers structured log records inside the application
//! process and ships them to a Logz.io style bulk listener over HTTP.
//!
//! ## Overview
//!
//! ```text
//!   producer threads
//!         │ send()
//!         v
//!   ┌─────────────┐     ┌──────────────┐     ┌──────────────────────┐
//!   │  SizeGuard  │ ──> │ FilterStage  │ ──> │ Memory / Disk queue  │
//!   └─────────────┘     │  (optional)  │     └──────────┬───────────┘
//!                       └──────────────┘                │ dequeue
//!                                                       v
//!                                              ┌─────────────────┐
//!                                              │  DrainEngine    │ (scheduled)
//!                                              └────────┬────────┘
//!                                                       │ batch
//!                                                       v
//!                                              ┌─────────────────┐
//!                                              │   Transport     │ (retry + backoff)
//!                                              └─────────────────┘
//! ```
//!
//! - [`queue`]: bounded in-memory and persistent on-disk record queues
//! - [`size_guard`]: truncation or rejection of oversized records
//! - [`filter`]: JSON-path filters and the real-time filter stage
//! - [`transport`]: batch delivery with bounded retries
//! - [`drain`]: single-flight batching and requeue-on-failure
//! - [`sender`]: the `send` / `start` / `stop` surface
//! - [`registry`]: one live sender per destination per process
//!
//! Delivery is at-least-once: a batch that fails after all retries is put back
//! into its queue and retried on the next scheduled drain.

#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_comparisons)]
#![allow(clippy::module_name_repetitions)]

/// Configuration: destination, queue backend, limits and retry constants
pub mod config;

/// Single-flight drain cycles turning queued records into delivery batches
pub mod drain;

/// Error types shared by every component
pub mod error;

/// JSON-path record filters and the filtering queue decorator
pub mod filter;

/// Hostname detection for the filter registry
pub mod hostname;

/// HTTP client construction
pub mod http;

/// Tracing subscriber setup and line formatter
pub mod logger;

/// Record queues: in-memory and persistent on-disk
pub mod queue;

/// Process-wide registry of live senders
pub mod registry;

/// Status reporting callback used instead of direct logging
pub mod reporter;

/// Periodic background jobs bound to a tokio runtime
pub mod scheduler;

/// Public sender surface
pub mod sender;

/// Oversized record handling
pub mod size_guard;

/// Batch delivery over HTTP
pub mod transport;

pub use config::SenderConfig;
pub use error::{Result, SenderError};
pub use registry::SenderRegistry;
pub use reporter::{StatusReporter, TracingStatusReporter};
pub use scheduler::Scheduler;
pub use sender::LogzioSender;

/// Maximum accumulated size of one delivery batch (3 MiB).
pub const MAX_BATCH_BYTES: usize = 3 * 1024 * 1024;

/// Number of delivery attempts for one batch before it is requeued.
pub const MAX_RETRIES: u32 = 3;

/// Backoff before the second attempt; doubled after every failed attempt.
pub const INITIAL_BACKOFF_MS: u64 = 2000;

/// Upper bound on the final drain performed by [`LogzioSender::stop`].
pub const FINAL_DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(20);

/// Crate version reported in the `User-Agent` header.
pub const SENDER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Logs the crate version at INFO level.
pub fn log_build_info() {
    tracing::info!("logzio-sender version: {}", SENDER_VERSION);
}
