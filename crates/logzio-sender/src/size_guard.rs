// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Enforcement of the listener's record size limits.
//!
//! The listener rejects records above [`MAX_RECORD_BYTES`] and indexes at most
//! [`MAX_FIELD_BYTES`] of the message field. Every record passes through
//! [`SizeGuard::apply`] once, before it is queued:
//!
//! - records within both limits are passed through untouched
//! - with [`OversizedPolicy::Cut`] the message field is shortened and suffixed
//!   with [`TRUNCATION_MARKER`]
//! - with [`OversizedPolicy::Drop`], or when cutting cannot bring the record under
//!   the limits, the record is dropped and reported
//!
//! All sizes are UTF-8 byte lengths. A cut never splits a code point.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tracing::debug;

use crate::config::OversizedPolicy;
use crate::reporter::StatusReporter;

/// Largest record the listener accepts.
pub const MAX_RECORD_BYTES: usize = 500_000;

/// Largest message field the listener indexes.
pub const MAX_FIELD_BYTES: usize = 32_700;

/// Appended to a message field that was cut.
pub const TRUNCATION_MARKER: &str = "...truncated";

pub struct SizeGuard {
    policy: OversizedPolicy,
    message_field: String,
    reporter: Arc<dyn StatusReporter>,
}

impl SizeGuard {
    pub fn new(
        policy: OversizedPolicy,
        message_field: impl Into<String>,
        reporter: Arc<dyn StatusReporter>,
    ) -> Self {
        SizeGuard {
            policy,
            message_field: message_field.into(),
            reporter,
        }
    }

    /// Returns the record to queue, or `None` when it must be dropped.
    pub fn apply(&self, record: Bytes) -> Option<Bytes> {
        let total = record.len();
        // Neither limit can be exceeded
        if total <= MAX_FIELD_BYTES {
            return Some(record);
        }

        let Ok(Value::Object(mut object)) = serde_json::from_slice::<Value>(&record) else {
            if total > MAX_RECORD_BYTES {
                self.drop_record(total, "it is not a JSON object and cannot be cut");
                return None;
            }
            return Some(record);
        };

        let field_len = match object.get(&self.message_field) {
            Some(Value::String(message)) => message.len(),
            _ => {
                if total > MAX_RECORD_BYTES {
                    self.drop_record(
                        total,
                        &format!("it has no '{}' string field to cut", self.message_field),
                    );
                    return None;
                }
                return Some(record);
            }
        };

        if total <= MAX_RECORD_BYTES && field_len <= MAX_FIELD_BYTES {
            return Some(record);
        }

        if self.policy == OversizedPolicy::Drop {
            self.drop_record(total, "the oversized policy is drop");
            return None;
        }

        let overflow = total.saturating_sub(MAX_RECORD_BYTES);
        let allowance = MAX_FIELD_BYTES
            .checked_sub(TRUNCATION_MARKER.len() + overflow)
            .filter(|allowance| *allowance > 0);
        let Some(allowance) = allowance else {
            self.drop_record(total, "cutting the message field cannot make it fit");
            return None;
        };

        if let Some(Value::String(message)) = object.get_mut(&self.message_field) {
            let cut = floor_char_boundary(message, allowance);
            message.truncate(cut);
            message.push_str(TRUNCATION_MARKER);
        }

        let cut_record = match serde_json::to_vec(&Value::Object(object)) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.drop_record(total, &format!("it could not be re-encoded: {e}"));
                return None;
            }
        };
        if cut_record.len() > MAX_RECORD_BYTES {
            self.drop_record(total, "it is still too large after cutting the message field");
            return None;
        }

        debug!(
            "Cut oversized log from {} to {} bytes",
            total,
            cut_record.len()
        );
        Some(Bytes::from(cut_record))
    }

    fn drop_record(&self, size: usize, reason: &str) {
        self.reporter.warning(&format!(
            "Dropping oversized log of {size} bytes (limits: {MAX_RECORD_BYTES} bytes per log, {MAX_FIELD_BYTES} bytes per message) because {reason}"
        ));
    }
}

/// Largest index `<= index` that lies on a char boundary of `s`.
fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut cut = index;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    cut
}
