// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use logzio_sender::config::QueueConfig;
use logzio_sender::{SenderConfig, StatusReporter};

/// Keeps every status message for assertions.
#[derive(Debug, Default)]
pub struct CollectingReporter {
    pub infos: Mutex<Vec<String>>,
    pub warnings: Mutex<Vec<String>>,
    pub errors: Mutex<Vec<String>>,
}

impl StatusReporter for CollectingReporter {
    fn info(&self, message: &str) {
        self.infos.lock().unwrap().push(message.to_string());
    }

    fn warning(&self, message: &str) {
        self.warnings.lock().unwrap().push(message.to_string());
    }

    fn error(&self, message: &str) {
        self.errors.lock().unwrap().push(message.to_string());
    }
}

pub fn reporter() -> Arc<CollectingReporter> {
    Arc::new(CollectingReporter::default())
}

/// Configuration pointed at a mock listener with fast retries and a drain
/// interval long enough that tests trigger drains themselves.
pub fn test_config(listener_url: &str) -> SenderConfig {
    SenderConfig {
        listener_url: listener_url.to_string(),
        initial_backoff: Duration::from_millis(10),
        drain_interval: Duration::from_secs(3600),
        final_drain_timeout: Duration::from_secs(5),
        ..SenderConfig::new("integration-token")
    }
}

/// Disk queue without the free-space check, so a busy build host cannot make
/// it refuse records.
pub fn disk_queue(dir: &Path) -> QueueConfig {
    QueueConfig::Disk {
        dir: dir.to_path_buf(),
        fs_percent_threshold: None,
        gc_interval: Duration::from_millis(50),
        probe_interval: Duration::from_millis(50),
        page_size: 4096,
    }
}

pub fn record(i: usize) -> serde_json::Value {
    serde_json::json!({ "message": format!("log-{i}"), "level": "INFO" })
}

/// The body a listener receives for records `range`.
pub fn expected_body(range: std::ops::Range<usize>) -> String {
    range
        .map(|i| format!("{{\"level\":\"INFO\",\"message\":\"log-{i}\"}}\n"))
        .collect()
}
