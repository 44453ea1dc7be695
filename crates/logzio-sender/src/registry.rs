// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One live sender per destination.
//!
//! Two senders shipping to the same token and type would double every drain
//! and, for disk queues, fight over one directory. The registry hands out the
//! existing sender instead. Keys are the SHA-256 of the destination, so tokens
//! are never kept around in plain text as map keys.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::SenderConfig;
use crate::error::Result;
use crate::reporter::StatusReporter;
use crate::scheduler::Scheduler;
use crate::sender::LogzioSender;

static GLOBAL: OnceLock<SenderRegistry> = OnceLock::new();

#[derive(Default)]
pub struct SenderRegistry {
    senders: Mutex<HashMap<String, Arc<LogzioSender>>>,
}

impl SenderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry shared by the whole process.
    pub fn global() -> &'static SenderRegistry {
        GLOBAL.get_or_init(SenderRegistry::new)
    }

    /// Returns the sender for `config`'s destination, creating it on first use.
    ///
    /// An existing sender keeps its original configuration. If its scheduler was
    /// shut down in the meantime it is moved onto `scheduler`.
    pub fn get_or_create(
        &self,
        config: SenderConfig,
        reporter: Arc<dyn StatusReporter>,
        scheduler: Arc<Scheduler>,
    ) -> Result<Arc<LogzioSender>> {
        let key = destination_key(&config.token, &config.log_type);
        let mut senders = self.lock();

        if let Some(existing) = senders.get(&key) {
            reporter.info(&format!(
                "A sender for type '{}' already exists, reusing it",
                config.log_type
            ));
            if existing.scheduler().is_shut_down() {
                existing.rebind_scheduler(scheduler);
            }
            return Ok(Arc::clone(existing));
        }

        let sender = Arc::new(LogzioSender::new(config, reporter, scheduler)?);
        senders.insert(key, Arc::clone(&sender));
        debug!("Registered sender, {} live", senders.len());
        Ok(sender)
    }

    /// Forgets the sender for a destination, returning it if present. The
    /// sender itself is left running.
    pub fn remove(&self, token: &str, log_type: &str) -> Option<Arc<LogzioSender>> {
        self.lock().remove(&destination_key(token, log_type))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<LogzioSender>>> {
        self.senders
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Stable hex SHA-256 of a destination.
pub fn destination_key(token: &str, log_type: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    // Separator keeps ("ab", "c") and ("a", "bc") apart
    hasher.update([0u8]);
    hasher.update(log_type.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::test_support::RecordingReporter;
    use tokio::runtime::Handle;

    fn config(token: &str, log_type: &str) -> SenderConfig {
        SenderConfig {
            listener_url: "http://127.0.0.1:1".to_string(),
            log_type: log_type.to_string(),
            ..SenderConfig::new(token)
        }
    }

    #[test]
    fn test_destination_key_is_stable_and_distinct() {
        assert_eq!(destination_key("token", "rust"), destination_key("token", "rust"));
        assert_eq!(destination_key("token", "rust").len(), 64);
        assert_ne!(destination_key("token", "rust"), destination_key("token", "java"));
        assert_ne!(destination_key("ab", "c"), destination_key("a", "bc"));
    }

    #[tokio::test]
    async fn test_same_destination_is_reused() {
        let reporter = Arc::new(RecordingReporter::default());
        let scheduler = Arc::new(Scheduler::new(Handle::current(), reporter.clone()));
        let registry = SenderRegistry::new();

        let first = registry
            .get_or_create(config("token", "rust"), reporter.clone(), scheduler.clone())
            .unwrap();
        let second = registry
            .get_or_create(config("token", "rust"), reporter.clone(), scheduler.clone())
            .unwrap();
        let other = registry
            .get_or_create(config("token", "nginx"), reporter.clone(), scheduler)
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(registry.len(), 2);
        assert_eq!(reporter.infos.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_config_is_not_registered() {
        let reporter = Arc::new(RecordingReporter::default());
        let scheduler = Arc::new(Scheduler::new(Handle::current(), reporter.clone()));
        let registry = SenderRegistry::new();

        let result = registry.get_or_create(config("", "rust"), reporter, scheduler);
        assert!(result.is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_shut_down_scheduler_is_replaced() {
        let reporter = Arc::new(RecordingReporter::default());
        let old = Arc::new(Scheduler::new(Handle::current(), reporter.clone()));
        let registry = SenderRegistry::new();

        let sender = registry
            .get_or_create(config("token", "rust"), reporter.clone(), old.clone())
            .unwrap();
        old.shutdown();

        let new = Arc::new(Scheduler::new(Handle::current(), reporter.clone()));
        let again = registry
            .get_or_create(config("token", "rust"), reporter, new.clone())
            .unwrap();
        assert!(Arc::ptr_eq(&sender, &again));
        assert!(Arc::ptr_eq(&again.scheduler(), &new));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reused_sender_works_after_stop_and_scheduler_shutdown() {
        let reporter = Arc::new(RecordingReporter::default());
        let old = Arc::new(Scheduler::new(Handle::current(), reporter.clone()));
        let registry = SenderRegistry::new();

        let sender = registry
            .get_or_create(config("token", "rust"), reporter.clone(), old.clone())
            .unwrap();
        sender.start();
        sender.stop();
        old.shutdown();

        let new = Arc::new(Scheduler::new(Handle::current(), reporter.clone()));
        let again = registry
            .get_or_create(config("token", "rust"), reporter.clone(), new.clone())
            .unwrap();
        assert!(Arc::ptr_eq(&sender, &again));

        again.start();
        assert!(again.is_started());
        assert!(Arc::ptr_eq(&again.scheduler(), &new));
        // Let the first scheduled drain find the queue empty
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        again.send(&serde_json::json!({"message": "after restart"}));
        assert_eq!(again.queue_len(), 1);
        assert_eq!(reporter.warning_count(), 0);
    }

    #[tokio::test]
    async fn test_remove() {
        let reporter = Arc::new(RecordingReporter::default());
        let scheduler = Arc::new(Scheduler::new(Handle::current(), reporter.clone()));
        let registry = SenderRegistry::new();

        registry
            .get_or_create(config("token", "rust"), reporter, scheduler)
            .unwrap();
        assert!(registry.remove("token", "rust").is_some());
        assert!(registry.remove("token", "rust").is_none());
        assert!(registry.is_empty());
    }
}
