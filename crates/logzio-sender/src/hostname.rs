// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hostname reported to the real-time filter registry

use std::env;
use tracing::warn;

/// Get the system hostname
///
/// Tried in order:
/// 1. `LOGZIO_HOSTNAME` environment variable
/// 2. `HOSTNAME` environment variable
/// 3. `nix::unistd::gethostname()`
/// 4. `"unknown"`
#[must_use]
pub fn get_hostname() -> String {
    for var in ["LOGZIO_HOSTNAME", "HOSTNAME"] {
        if let Ok(hostname) = env::var(var) {
            if !hostname.is_empty() {
                return hostname;
            }
        }
    }

    match nix::unistd::gethostname() {
        Ok(hostname) => {
            if let Some(hostname) = hostname.to_str().filter(|h| !h.is_empty()) {
                return hostname.to_string();
            }
        }
        Err(e) => warn!("Failed to get system hostname: {}", e),
    }

    warn!("Could not determine hostname, using 'unknown'");
    "unknown".to_string()
}
