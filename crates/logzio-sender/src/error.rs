// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub type Result<T> = std::result::Result<T, SenderError>;

/// Errors surfaced by the sender and its components.
///
/// Only [`SenderError::Parameter`] ever reaches the caller of a public
/// constructor. Everything else is raised inside background jobs, where it is
/// handled (requeue, fail open) and reported through the status reporter.
#[derive(Debug, thiserror::Error)]
pub enum SenderError {
    /// Invalid configuration. Fatal at construction, never retried.
    #[error("Invalid parameter '{param}': {reason}")]
    Parameter { param: String, reason: String },

    /// A batch could not be delivered after exhausting retryable attempts.
    #[error("Server error: {0}")]
    Server(String),

    /// The operation observed cancellation before it could complete.
    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A filter expression could not be parsed.
    #[error("Invalid filter '{query}': {reason}")]
    Filter { query: String, reason: String },
}

impl SenderError {
    pub fn parameter(param: impl Into<String>, reason: impl Into<String>) -> Self {
        SenderError::Parameter {
            param: param.into(),
            reason: reason.into(),
        }
    }
}
