// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic background jobs.
//!
//! Every sender runs its drain, queue maintenance and filter polling as
//! independent periodic jobs on a shared tokio runtime:
//!
//! - **Fixed delay**: the next run starts `interval` after the previous one ends
//! - **Failure isolation**: each run is spawned as its own task; a panic is
//!   reported and the job keeps its schedule
//! - **Cooperative cancellation**: runs are never aborted. They receive the
//!   cancellation token and stop at their next suspension point, so a drain
//!   that is cancelled mid-delivery still requeues its batch.
//!
//! The runtime is either borrowed from the caller ([`Scheduler::new`] with a
//! `Handle`) or owned ([`Scheduler::with_runtime`]) for applications that do not
//! run tokio themselves.

use std::any::Any;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::{Handle, Runtime};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, SenderError};
use crate::queue::ScheduledJob;
use crate::reporter::StatusReporter;

pub struct Scheduler {
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
    root: CancellationToken,
    reporter: Arc<dyn StatusReporter>,
}

impl Scheduler {
    /// Scheduler running jobs on an existing runtime.
    pub fn new(handle: Handle, reporter: Arc<dyn StatusReporter>) -> Self {
        Scheduler {
            handle,
            runtime: Mutex::new(None),
            root: CancellationToken::new(),
            reporter,
        }
    }

    /// Scheduler owning a dedicated multi-threaded runtime.
    pub fn with_runtime(worker_threads: usize, reporter: Arc<dyn StatusReporter>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("logzio-sender")
            .enable_all()
            .build()
            .map_err(|e| SenderError::parameter("scheduler", format!("cannot start runtime: {e}")))?;
        Ok(Scheduler {
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            root: CancellationToken::new(),
            reporter,
        })
    }

    /// Uses the ambient runtime when called from within one, otherwise starts a
    /// dedicated single-worker runtime.
    pub fn current_or_owned(reporter: Arc<dyn StatusReporter>) -> Result<Self> {
        match Handle::try_current() {
            Ok(handle) => Ok(Self::new(handle, reporter)),
            Err(_) => Self::with_runtime(1, reporter),
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Token cancelled when this scheduler shuts down.
    pub fn child_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    pub fn is_shut_down(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Cancels every job and releases an owned runtime.
    pub fn shutdown(&self) {
        self.root.cancel();
        let runtime = match self.runtime.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
        debug!("Scheduler shut down");
    }

    /// Runs `job` every `interval` (fixed delay, first run immediately) until
    /// `cancel` fires.
    pub fn spawn_periodic<F, Fut>(
        &self,
        name: &'static str,
        interval: Duration,
        cancel: CancellationToken,
        job: F,
    ) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = self.handle.clone();
        self.spawn_loop(name, interval, cancel, move || handle.spawn(job()))
    }

    /// Like [`Scheduler::spawn_periodic`] for a synchronous job, run on the
    /// blocking pool.
    pub fn spawn_periodic_blocking(
        &self,
        job: ScheduledJob,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let handle = self.handle.clone();
        let run = job.run;
        self.spawn_loop(job.name, job.interval, cancel, move || {
            let run = Arc::clone(&run);
            handle.spawn_blocking(move || (*run)())
        })
    }

    fn spawn_loop<S>(
        &self,
        name: &'static str,
        interval: Duration,
        cancel: CancellationToken,
        start: S,
    ) -> JoinHandle<()>
    where
        S: Fn() -> JoinHandle<()> + Send + 'static,
    {
        let reporter = Arc::clone(&self.reporter);
        self.handle.spawn(async move {
            debug!("Scheduled job {} every {:?}", name, interval);
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                if let Err(e) = start().await {
                    report_failure(reporter.as_ref(), name, e);
                }
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
            }
            debug!("Scheduled job {} stopped", name);
        })
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.root.cancel();
        let runtime = match self.runtime.get_mut() {
            Ok(runtime) => runtime.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        // Dropping a runtime from async context panics; shutting it down in the background does not
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
    }
}

fn report_failure(reporter: &dyn StatusReporter, name: &str, error: JoinError) {
    if error.is_panic() {
        let panic = error.into_panic();
        reporter.error(&format!(
            "Background job {name} failed: {}",
            panic_message(panic.as_ref())
        ));
    } else {
        debug!("Background job {} was cancelled", name);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
