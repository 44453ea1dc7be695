// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, trace};

use crate::config::SenderConfig;
use crate::drain::{DrainEngine, DrainOutcome};
use crate::error::{Result, SenderError};
use crate::filter::poller::RealTimeFilterPoller;
use crate::filter::stage::FilterStage;
use crate::filter::FilterSet;
use crate::queue::{self, LogsQueue};
use crate::reporter::StatusReporter;
use crate::scheduler::Scheduler;
use crate::size_guard::SizeGuard;
use crate::transport::Transport;

/// Grace period for a final drain that was cancelled after its timeout to put
/// its batch back.
const FINAL_DRAIN_REQUEUE_GRACE: Duration = Duration::from_secs(1);

/// Buffers records and ships them in the background.
///
/// `send` is synchronous and never waits on the network. Delivery happens in
/// periodic drains started by [`LogzioSender::start`]; [`LogzioSender::stop`]
/// runs one last bounded drain. A stopped sender keeps queueing records and can
/// be started again.
pub struct LogzioSender {
    config: SenderConfig,
    queue: Arc<dyn LogsQueue>,
    size_guard: SizeGuard,
    engine: Arc<DrainEngine>,
    poller: Option<Arc<RealTimeFilterPoller>>,
    scheduler: Mutex<Arc<Scheduler>>,
    /// Cancels the background jobs; `Some` while started
    jobs: Mutex<Option<CancellationToken>>,
    /// Serializes `start` and `stop`
    lifecycle: Mutex<()>,
    reporter: Arc<dyn StatusReporter>,
}

impl LogzioSender {
    pub fn new(
        config: SenderConfig,
        reporter: Arc<dyn StatusReporter>,
        scheduler: Arc<Scheduler>,
    ) -> Result<Self> {
        config.validate()?;

        let backend = queue::build(&config.queue, Arc::clone(&reporter))?;
        let client = crate::http::get_client(&config);

        let (queue, poller) = match &config.filters {
            Some(filter_config) => {
                let filters = Arc::new(FilterSet::from_queries(&filter_config.default_filters)?);
                let poller = RealTimeFilterPoller::new(
                    filter_config,
                    client.clone(),
                    Arc::clone(&filters),
                    Arc::clone(&reporter),
                )?;
                let stage: Arc<dyn LogsQueue> =
                    Arc::new(FilterStage::new(backend, filters, Arc::clone(&reporter)));
                (stage, Some(Arc::new(poller)))
            }
            None => (backend, None),
        };

        let transport = Transport::new(&config, client, Arc::clone(&reporter))?;
        let engine = Arc::new(DrainEngine::new(
            Arc::clone(&queue),
            transport,
            config.max_batch_bytes,
            Arc::clone(&reporter),
        ));
        let size_guard = SizeGuard::new(
            config.oversized_policy,
            config.message_field.clone(),
            Arc::clone(&reporter),
        );

        debug!(
            "Created sender for type '{}' with {:?} queue",
            config.log_type, config.queue
        );

        Ok(LogzioSender {
            config,
            queue,
            size_guard,
            engine,
            poller,
            scheduler: Mutex::new(scheduler),
            jobs: Mutex::new(None),
            lifecycle: Mutex::new(()),
            reporter,
        })
    }

    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    /// Serializes `record` and queues it.
    pub fn send(&self, record: &Value) {
        match serde_json::to_vec(record) {
            Ok(encoded) => self.send_bytes(Bytes::from(encoded)),
            Err(e) => self
                .reporter
                .error(&format!("Could not serialize log, dropping it: {e}")),
        }
    }

    /// Queues an already serialized record. A trailing line break is removed.
    pub fn send_line(&self, line: &str) {
        let line = line.trim_end_matches(['\r', '\n']);
        self.send_bytes(Bytes::copy_from_slice(line.as_bytes()));
    }

    fn send_bytes(&self, record: Bytes) {
        if record.is_empty() {
            trace!("Skipping empty log");
            return;
        }
        if let Some(record) = self.size_guard.apply(record) {
            self.queue.enqueue(record);
        }
    }

    /// Starts the periodic drain, the queue maintenance jobs and, when
    /// configured, the filter poll. Calling it again is a no-op.
    pub fn start(&self) {
        let _lifecycle = lock(&self.lifecycle);
        let mut jobs = lock(&self.jobs);
        if jobs.is_some() {
            return;
        }
        let scheduler = self.scheduler();
        *jobs = Some(self.spawn_jobs(&scheduler));
    }

    fn spawn_jobs(&self, scheduler: &Scheduler) -> CancellationToken {
        let token = scheduler.child_token();

        let engine = Arc::clone(&self.engine);
        let drain_token = token.clone();
        scheduler.spawn_periodic(
            "drain",
            self.config.drain_interval,
            token.clone(),
            move || {
                let engine = Arc::clone(&engine);
                let cancel = drain_token.clone();
                async move {
                    engine.drain(&cancel).await;
                }
            },
        );

        for job in Arc::clone(&self.queue).periodic_jobs() {
            scheduler.spawn_periodic_blocking(job, token.clone());
        }

        if let (Some(poller), Some(filter_config)) = (&self.poller, &self.config.filters) {
            let poller = Arc::clone(poller);
            let poll_token = token.clone();
            scheduler.spawn_periodic(
                "filter-poll",
                filter_config.poll_interval,
                token.clone(),
                move || {
                    let poller = Arc::clone(&poller);
                    let cancel = poll_token.clone();
                    async move {
                        poller.poll(&cancel).await;
                    }
                },
            );
        }

        debug!("Sender started");
        token
    }

    pub fn is_started(&self) -> bool {
        lock(&self.jobs).is_some()
    }

    /// Stops the background jobs, drains what is left for at most
    /// `final_drain_timeout`, and flushes the queue.
    ///
    /// Blocks the calling thread. Records still queued after the timeout stay
    /// queued (in memory they are lost if the process exits). The sender keeps
    /// accepting records and [`LogzioSender::start`] may be called again.
    pub fn stop(&self) {
        let _lifecycle = lock(&self.lifecycle);
        if let Some(jobs) = lock(&self.jobs).take() {
            jobs.cancel();
        }

        let _span = info_span!("final_drain", log_type = %self.config.log_type).entered();
        self.final_drain();
        self.queue.close();
        debug!("Sender stopped");
    }

    /// Runs one drain on a dedicated thread with its own runtime, so `stop`
    /// works whether or not the shared scheduler is still alive.
    fn final_drain(&self) {
        let engine = Arc::clone(&self.engine);
        let cancel = CancellationToken::new();
        let drain_cancel = cancel.clone();
        let (tx, rx) = mpsc::channel();

        let spawned = std::thread::Builder::new()
            .name("logzio-final-drain".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = tx.send(Err(SenderError::Io(e)));
                        return;
                    }
                };
                let outcome = runtime.block_on(engine.drain_when_idle(&drain_cancel));
                let _ = tx.send(Ok(outcome));
            });
        if let Err(e) = spawned {
            self.reporter
                .error(&format!("Could not start the final drain: {e}"));
            return;
        }

        match rx.recv_timeout(self.config.final_drain_timeout) {
            Ok(Ok(outcome)) => debug!("Final drain finished: {:?}", outcome),
            Ok(Err(e)) => self
                .reporter
                .error(&format!("Could not run the final drain: {e}")),
            Err(_) => {
                cancel.cancel();
                // Let the cancelled drain put its batch back before the queue is flushed
                let _ = rx.recv_timeout(FINAL_DRAIN_REQUEUE_GRACE);
                self.reporter.warning(&format!(
                    "Final drain did not finish within {:?}, {} logs left in the queue",
                    self.config.final_drain_timeout,
                    self.queue.len()
                ));
            }
        }
    }

    /// Runs one drain cycle now, unless one is already in flight.
    pub async fn drain_now(&self) -> DrainOutcome {
        let cancel = self.scheduler().child_token();
        self.engine.drain(&cancel).await
    }

    /// Number of records waiting for delivery.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        Arc::clone(&lock(&self.scheduler))
    }

    /// Moves the background jobs to `scheduler`. Jobs running on the previous
    /// one are cancelled and, if the sender was started, restarted.
    pub(crate) fn rebind_scheduler(&self, scheduler: Arc<Scheduler>) {
        let _lifecycle = lock(&self.lifecycle);
        let mut jobs = lock(&self.jobs);
        *lock(&self.scheduler) = Arc::clone(&scheduler);
        if let Some(previous) = jobs.take() {
            previous.cancel();
            *jobs = Some(self.spawn_jobs(&scheduler));
        }
        debug!("Sender rebound to a new scheduler");
    }
}

impl Drop for LogzioSender {
    fn drop(&mut self) {
        let jobs = match self.jobs.get_mut() {
            Ok(jobs) => jobs.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(jobs) = jobs {
            jobs.cancel();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
