// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Persistent record queue on local disk.
//!
//! Records are kept in the append-only page files of [`PageStore`] and survive a
//! process restart. The queue exclusively owns its directory: two processes (or
//! two senders) pointed at the same directory will corrupt each other's cursor.
//! This is not detected.
//!
//! Two background jobs keep the queue healthy:
//! - **GC** deletes fully consumed pages and syncs the cursor
//! - **Disk-space probe** stops accepting records once the filesystem is fuller
//!   than the configured threshold, and resumes once it is not

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use crate::error::{Result, SenderError};
use crate::queue::pages::PageStore;
use crate::queue::statfs::{DiskUsageProbe, StatfsProbe};
use crate::queue::{LogsQueue, ScheduledJob};
use crate::reporter::StatusReporter;

#[derive(Debug, Clone)]
pub struct DiskQueueOptions {
    pub dir: PathBuf,
    /// `None` disables the disk-space check
    pub fs_percent_threshold: Option<u8>,
    pub gc_interval: Duration,
    pub probe_interval: Duration,
    pub page_size: u64,
}

pub struct PersistentDiskQueue {
    store: Mutex<PageStore>,
    options: DiskQueueOptions,
    enough_space: AtomicBool,
    /// Set while appends fail; cleared by the next successful one
    write_failing: AtomicBool,
    probe: Box<dyn DiskUsageProbe>,
    reporter: Arc<dyn StatusReporter>,
}

impl PersistentDiskQueue {
    /// Opens the queue in `options.dir`, creating the directory when needed.
    ///
    /// # Errors
    ///
    /// [`SenderError::Parameter`] when the path is empty, has no parent or name,
    /// or cannot be created and written.
    pub fn open(options: DiskQueueOptions, reporter: Arc<dyn StatusReporter>) -> Result<Self> {
        Self::with_probe(options, Box::new(StatfsProbe), reporter)
    }

    /// Like [`PersistentDiskQueue::open`] with a custom disk usage probe.
    pub fn with_probe(
        options: DiskQueueOptions,
        probe: Box<dyn DiskUsageProbe>,
        reporter: Arc<dyn StatusReporter>,
    ) -> Result<Self> {
        validate_dir(&options.dir)?;

        let store = PageStore::open(&options.dir, options.page_size).map_err(|e| {
            SenderError::parameter(
                "queue_dir",
                format!("cannot use {} as a queue directory: {e}", options.dir.display()),
            )
        })?;

        let queue = PersistentDiskQueue {
            store: Mutex::new(store),
            options,
            enough_space: AtomicBool::new(true),
            write_failing: AtomicBool::new(false),
            probe,
            reporter,
        };
        queue.check_disk_space();
        Ok(queue)
    }

    pub fn dir(&self) -> &Path {
        &self.options.dir
    }

    /// Whether the last probe found the filesystem below the threshold.
    pub fn has_enough_space(&self) -> bool {
        self.enough_space.load(Ordering::Acquire)
    }

    /// Re-evaluates filesystem usage against the threshold.
    pub fn check_disk_space(&self) {
        let Some(threshold) = self.options.fs_percent_threshold else {
            return;
        };

        let used = match self.probe.used_percent(&self.options.dir) {
            Ok(used) => used,
            Err(e) => {
                debug!(
                    "Could not read filesystem usage of {}: {}",
                    self.options.dir.display(),
                    e
                );
                return;
            }
        };

        let enough = used < f64::from(threshold);
        let was_enough = self.enough_space.swap(enough, Ordering::AcqRel);
        if was_enough && !enough {
            self.reporter.warning(&format!(
                "Logs queue filesystem at {} is {used:.1}% full, over the {threshold}% threshold. Dropping logs until space is freed",
                self.options.dir.display(),
            ));
        } else if !was_enough && enough {
            self.reporter.info(&format!(
                "Logs queue filesystem at {} is back under the {threshold}% threshold, accepting logs again",
                self.options.dir.display(),
            ));
        }
    }

    /// Deletes consumed pages.
    pub fn gc(&self) {
        if let Err(e) = self.lock().gc() {
            self.reporter
                .error(&format!("Failed to clean up logs queue pages: {e}"));
        }
    }

    fn lock(&self) -> MutexGuard<'_, PageStore> {
        self.store
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl LogsQueue for PersistentDiskQueue {
    fn enqueue(&self, record: Bytes) {
        if !self.has_enough_space() {
            return;
        }
        match self.lock().append(&record) {
            Ok(()) => {
                if self.write_failing.swap(false, Ordering::AcqRel) {
                    self.reporter
                        .info("Disk queue writes succeed again, accepting logs");
                }
            }
            Err(e) => {
                if !self.write_failing.swap(true, Ordering::AcqRel) {
                    self.reporter.error(&format!(
                        "Failed to write log to the disk queue, dropping logs until writes succeed: {e}"
                    ));
                }
            }
        }
    }

    fn dequeue(&self) -> Option<Bytes> {
        match self.lock().pop() {
            Ok(record) => record.map(Bytes::from),
            Err(e) => {
                self.reporter
                    .error(&format!("Failed to read log from the disk queue: {e}"));
                None
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn close(&self) {
        if let Err(e) = self.lock().sync() {
            self.reporter
                .error(&format!("Failed to sync the disk queue on close: {e}"));
        }
    }

    fn clear(&self) {
        if let Err(e) = self.lock().clear() {
            self.reporter
                .error(&format!("Failed to clear the disk queue: {e}"));
        }
    }

    fn periodic_jobs(self: Arc<Self>) -> Vec<ScheduledJob> {
        let mut jobs = Vec::with_capacity(2);

        let queue = Arc::clone(&self);
        jobs.push(ScheduledJob {
            name: "disk-queue-gc",
            interval: self.options.gc_interval,
            run: Arc::new(move || queue.gc()),
        });

        if self.options.fs_percent_threshold.is_some() {
            let queue = Arc::clone(&self);
            jobs.push(ScheduledJob {
                name: "disk-space-probe",
                interval: self.options.probe_interval,
                run: Arc::new(move || queue.check_disk_space()),
            });
        }
        jobs
    }
}

fn validate_dir(dir: &Path) -> Result<()> {
    if dir.as_os_str().is_empty() {
        return Err(SenderError::parameter("queue_dir", "value is empty"));
    }
    if dir.file_name().is_none() || dir.parent().is_none() {
        return Err(SenderError::parameter(
            "queue_dir",
            format!("{} has no parent directory or name", dir.display()),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_GC_INTERVAL, DEFAULT_PAGE_SIZE, DEFAULT_PROBE_INTERVAL};
    use crate::reporter::test_support::RecordingReporter;
    use std::io;
    use std::sync::atomic::AtomicU64;

    /// Probe returning whatever percentage the test sets.
    #[derive(Clone, Default)]
    struct FakeProbe(Arc<AtomicU64>);

    impl FakeProbe {
        fn set(&self, percent: f64) {
            self.0.store(percent.to_bits(), Ordering::SeqCst);
        }
    }

    impl DiskUsageProbe for FakeProbe {
        fn used_percent(&self, _path: &Path) -> io::Result<f64> {
            Ok(f64::from_bits(self.0.load(Ordering::SeqCst)))
        }
    }

    fn options(dir: &Path, threshold: Option<u8>) -> DiskQueueOptions {
        DiskQueueOptions {
            dir: dir.to_path_buf(),
            fs_percent_threshold: threshold,
            gc_interval: DEFAULT_GC_INTERVAL,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    #[test]
    fn test_write_failures_reported_once_per_transition() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = Arc::new(RecordingReporter::default());
        let queue =
            PersistentDiskQueue::open(options(&dir.path().join("q"), None), reporter.clone())
                .unwrap();

        queue.enqueue(Bytes::from_static(b"{\"message\":\"kept\"}"));
        queue.lock().fail_writes = 3;
        for _ in 0..3 {
            queue.enqueue(Bytes::from_static(b"{\"message\":\"dropped\"}"));
        }
        assert_eq!(reporter.error_count(), 1);
        assert_eq!(queue.len(), 1);

        queue.enqueue(Bytes::from_static(b"{\"message\":\"resumed\"}"));
        assert_eq!(reporter.infos.lock().unwrap().len(), 1);
        assert_eq!(
            queue.dequeue().unwrap(),
            Bytes::from_static(b"{\"message\":\"kept\"}")
        );
        assert_eq!(
            queue.dequeue().unwrap(),
            Bytes::from_static(b"{\"message\":\"resumed\"}")
        );
        assert!(queue.dequeue().is_none());
        assert_eq!(reporter.error_count(), 1);
    }

    #[test]
    fn test_enqueue_dequeue_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = Arc::new(RecordingReporter::default());
        let queue = PersistentDiskQueue::open(options(&dir.path().join("q"), None), reporter)
            .unwrap();

        queue.enqueue(Bytes::from_static(b"{\"message\":\"a\"}"));
        queue.enqueue(Bytes::from_static(b"{\"message\":\"b\"}"));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dequeue().unwrap(), Bytes::from_static(b"{\"message\":\"a\"}"));
        assert_eq!(queue.dequeue().unwrap(), Bytes::from_static(b"{\"message\":\"b\"}"));
        assert!(queue.dequeue().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_empty_dir_is_parameter_error() {
        let reporter = Arc::new(RecordingReporter::default());
        let result = PersistentDiskQueue::open(options(Path::new(""), None), reporter);
        assert!(matches!(result, Err(SenderError::Parameter { .. })));
    }

    #[test]
    fn test_root_dir_is_parameter_error() {
        let reporter = Arc::new(RecordingReporter::default());
        let result = PersistentDiskQueue::open(options(Path::new("/"), None), reporter);
        assert!(matches!(result, Err(SenderError::Parameter { .. })));
    }

    #[test]
    fn test_unwritable_dir_is_parameter_error() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the directory should be
        let file = dir.path().join("occupied");
        std::fs::write(&file, b"not a directory").unwrap();

        let reporter = Arc::new(RecordingReporter::default());
        let result = PersistentDiskQueue::open(options(&file.join("q"), None), reporter);
        assert!(matches!(result, Err(SenderError::Parameter { .. })));
    }

    #[test]
    fn test_low_disk_space_drops_and_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = Arc::new(RecordingReporter::default());
        let probe = FakeProbe::default();
        probe.set(50.0);
        let queue = PersistentDiskQueue::with_probe(
            options(dir.path(), Some(90)),
            Box::new(probe.clone()),
            reporter.clone(),
        )
        .unwrap();

        queue.enqueue(Bytes::from_static(b"kept"));

        probe.set(95.0);
        queue.check_disk_space();
        queue.check_disk_space();
        assert!(!queue.has_enough_space());
        assert_eq!(reporter.warning_count(), 1);

        queue.enqueue(Bytes::from_static(b"dropped"));
        assert_eq!(queue.len(), 1);

        probe.set(40.0);
        queue.check_disk_space();
        assert!(queue.has_enough_space());
        assert_eq!(reporter.infos.lock().unwrap().len(), 1);

        queue.enqueue(Bytes::from_static(b"accepted"));
        assert_eq!(queue.len(), 2);
        assert_eq!(reporter.warning_count(), 1);
    }

    #[test]
    fn test_no_threshold_disables_probe() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = Arc::new(RecordingReporter::default());
        let probe = FakeProbe::default();
        probe.set(100.0);
        let queue = Arc::new(
            PersistentDiskQueue::with_probe(
                options(dir.path(), None),
                Box::new(probe),
                reporter.clone(),
            )
            .unwrap(),
        );

        queue.check_disk_space();
        queue.enqueue(Bytes::from_static(b"record"));
        assert_eq!(queue.len(), 1);
        assert_eq!(reporter.warning_count(), 0);

        let names: Vec<_> = queue.periodic_jobs().iter().map(|job| job.name).collect();
        assert_eq!(names, vec!["disk-queue-gc"]);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = Arc::new(RecordingReporter::default());
        {
            let queue = PersistentDiskQueue::open(options(dir.path(), None), reporter.clone())
                .unwrap();
            for i in 0..3 {
                queue.enqueue(Bytes::from(format!("record-{i}")));
            }
            queue.dequeue();
            queue.close();
        }

        let queue = PersistentDiskQueue::open(options(dir.path(), None), reporter).unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dequeue().unwrap(), Bytes::from("record-1"));
        assert_eq!(queue.dequeue().unwrap(), Bytes::from("record-2"));
    }

    #[test]
    fn test_gc_job_runs() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = Arc::new(RecordingReporter::default());
        let mut opts = options(dir.path(), None);
        opts.page_size = 16;
        let queue = Arc::new(PersistentDiskQueue::open(opts, reporter.clone()).unwrap());

        for _ in 0..4 {
            queue.enqueue(Bytes::from_static(b"0123456789"));
        }
        while queue.dequeue().is_some() {}

        let page_count = || {
            std::fs::read_dir(dir.path())
                .unwrap()
                .filter(|entry| {
                    entry
                        .as_ref()
                        .unwrap()
                        .file_name()
                        .to_string_lossy()
                        .starts_with("page-")
                })
                .count()
        };
        assert_eq!(page_count(), 4);

        for job in Arc::clone(&queue).periodic_jobs() {
            (*job.run)();
        }
        assert_eq!(page_count(), 1);
        assert_eq!(reporter.error_count(), 0);
    }
}
