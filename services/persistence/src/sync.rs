//! Cloud sync and local retention
//!
//! Newly published files are announced through a `SyncHandle`. Each cycle
//! uploads everything pending, re-queues failures for the next cycle, and
//! then deletes local files that are both old enough and known to be
//! uploaded. A file that was never uploaded is never deleted.

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use market_data::integrity::{IntegrityTracker, SyncStatus};

use crate::writer::{FileCreatedHook, FILE_EXTENSION};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("no remote configured")]
    NotConfigured,

    #[error("could not start uploader: {0}")]
    Spawn(#[from] io::Error),

    #[error("uploader exited with {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },
}

#[async_trait]
pub trait Uploader: Send + Sync {
    /// False when there is nowhere to upload to.
    fn is_configured(&self) -> bool {
        true
    }

    async fn upload(&self, path: &Path) -> Result<(), UploadError>;
}

/// `rclone copy <local> <remote>:<path>`
#[derive(Debug, Clone)]
pub struct RcloneUploader {
    binary: String,
    remote: String,
    remote_path: String,
}

impl RcloneUploader {
    pub fn new(remote: impl Into<String>, remote_path: impl Into<String>) -> Self {
        Self {
            binary: "rclone".to_string(),
            remote: remote.into(),
            remote_path: remote_path.into(),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn destination(&self) -> String {
        format!("{}:{}", self.remote, self.remote_path)
    }
}

#[async_trait]
impl Uploader for RcloneUploader {
    fn is_configured(&self) -> bool {
        !self.remote.is_empty()
    }

    async fn upload(&self, path: &Path) -> Result<(), UploadError> {
        if !self.is_configured() {
            return Err(UploadError::NotConfigured);
        }
        let output = Command::new(&self.binary)
            .arg("copy")
            .arg(path)
            .arg(self.destination())
            .kill_on_drop(true)
            .output()
            .await?;
        if output.status.success() {
            return Ok(());
        }
        Err(UploadError::Failed {
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Retention predicate: old enough and safely uploaded.
pub fn is_deletion_eligible(age: Duration, retention: Duration, uploaded: bool) -> bool {
    uploaded && age >= retention
}

/// Sender side, handed to the writer as its file-created hook.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    tx: mpsc::UnboundedSender<PathBuf>,
}

impl SyncHandle {
    pub fn enqueue(&self, path: &Path) {
        if self.tx.send(path.to_path_buf()).is_err() {
            warn!(path = %path.display(), "Sync manager gone, file not queued");
        }
    }

    pub fn hook(&self) -> FileCreatedHook {
        let handle = self.clone();
        Arc::new(move |path: &Path| handle.enqueue(path))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncCycleReport {
    pub uploaded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub deleted: usize,
}

pub struct SyncManager {
    data_dir: PathBuf,
    retention: Duration,
    uploader: Arc<dyn Uploader>,
    tracker: Arc<IntegrityTracker>,
    announced: mpsc::UnboundedReceiver<PathBuf>,
    pending: VecDeque<PathBuf>,
    /// File names confirmed uploaded during this process lifetime.
    uploaded: HashSet<String>,
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl SyncManager {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        retention: Duration,
        uploader: Arc<dyn Uploader>,
        tracker: Arc<IntegrityTracker>,
    ) -> (Self, SyncHandle) {
        let (tx, announced) = mpsc::unbounded_channel();
        let manager = Self {
            data_dir: data_dir.into(),
            retention,
            uploader,
            tracker,
            announced,
            pending: VecDeque::new(),
            uploaded: HashSet::new(),
        };
        (manager, SyncHandle { tx })
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_uploaded(&self, path: &Path) -> bool {
        self.uploaded.contains(&file_name_of(path))
    }

    /// One pass: upload what is pending, then apply retention as of `now`.
    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> SyncCycleReport {
        while let Ok(path) = self.announced.try_recv() {
            self.pending.push_back(path);
        }

        let mut report = SyncCycleReport::default();
        let batch: Vec<PathBuf> = self.pending.drain(..).collect();
        for path in batch {
            if !path.exists() {
                debug!(path = %path.display(), "Pending file no longer exists, dropping");
                continue;
            }
            if !self.uploader.is_configured() {
                warn!(path = %path.display(), "No cloud remote configured, upload skipped");
                self.tracker.record_sync(&path, SyncStatus::Skipped, now);
                report.skipped += 1;
                continue;
            }
            match self.uploader.upload(&path).await {
                Ok(()) => {
                    info!(path = %path.display(), "Uploaded");
                    self.uploaded.insert(file_name_of(&path));
                    self.tracker.record_sync(&path, SyncStatus::Success, now);
                    report.uploaded += 1;
                }
                Err(err) => {
                    error!(path = %path.display(), error = %err, "Upload failed, will retry next cycle");
                    self.tracker.record_sync(&path, SyncStatus::Failed, now);
                    self.pending.push_back(path);
                    report.failed += 1;
                }
            }
        }

        match self.apply_retention(now) {
            Ok(deleted) => report.deleted = deleted,
            Err(err) => error!(dir = %self.data_dir.display(), error = %err, "Retention pass failed"),
        }
        report
    }

    /// Delete `*.parquet` files that are both uploaded and older than the
    /// retention window as of `now`. Returns how many were deleted.
    pub fn apply_retention(&mut self, now: DateTime<Utc>) -> io::Result<usize> {
        let entries = match fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };

        let mut deleted = 0;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXTENSION) {
                continue;
            }
            let modified: DateTime<Utc> = entry.metadata()?.modified()?.into();
            let age = (now - modified).to_std().unwrap_or(Duration::ZERO);
            if !is_deletion_eligible(age, self.retention, self.is_uploaded(&path)) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    info!(path = %path.display(), age_days = age.as_secs() / 86_400, "Deleted after retention");
                    self.uploaded.remove(&file_name_of(&path));
                    deleted += 1;
                }
                Err(err) => error!(path = %path.display(), error = %err, "Retention delete failed"),
            }
        }
        Ok(deleted)
    }

    /// Run a cycle every `every` until cancelled.
    pub async fn run(mut self, every: Duration, cancel: CancellationToken) {
        info!(
            interval_secs = every.as_secs(),
            retention_days = self.retention.as_secs() / 86_400,
            configured = self.uploader.is_configured(),
            "Sync manager starting"
        );
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let report = self.run_cycle(Utc::now()).await;
            info!(
                uploaded = report.uploaded,
                failed = report.failed,
                skipped = report.skipped,
                deleted = report.deleted,
                pending = self.pending.len(),
                "Sync cycle complete"
            );
        }
        info!("Sync manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;
    use types::ids::Instrument;

    const DAY: Duration = Duration::from_secs(86_400);

    struct FakeUploader {
        configured: bool,
        fail_first: Mutex<usize>,
        calls: Mutex<Vec<PathBuf>>,
    }

    impl FakeUploader {
        fn new(configured: bool, fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                configured,
                fail_first: Mutex::new(fail_first),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Uploader for FakeUploader {
        fn is_configured(&self) -> bool {
            self.configured
        }

        async fn upload(&self, path: &Path) -> Result<(), UploadError> {
            self.calls.lock().unwrap().push(path.to_path_buf());
            let mut remaining = self.fail_first.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(UploadError::Failed {
                    code: Some(1),
                    stderr: "quota".into(),
                });
            }
            Ok(())
        }
    }

    fn setup(uploader: Arc<FakeUploader>) -> (tempfile::TempDir, SyncManager, SyncHandle, Arc<IntegrityTracker>) {
        let dir = tempfile::tempdir().unwrap();
        let tracker = Arc::new(IntegrityTracker::new([Instrument::new("BTCUSDT")], 1));
        let (manager, handle) = SyncManager::new(dir.path(), 7 * DAY, uploader, tracker.clone());
        (dir, manager, handle, tracker)
    }

    fn publish(dir: &Path, name: &str, handle: &SyncHandle) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"PAR1").unwrap();
        (handle.hook())(&path);
        path
    }

    #[tokio::test]
    async fn test_failed_upload_is_retried_next_cycle() {
        let uploader = FakeUploader::new(true, 1);
        let (dir, mut manager, handle, tracker) = setup(uploader.clone());
        let path = publish(dir.path(), "BTCUSDT_trade_20240101_0000.parquet", &handle);

        let first = manager.run_cycle(Utc::now()).await;
        assert_eq!((first.uploaded, first.failed), (0, 1));
        assert_eq!(manager.pending_len(), 1);

        let second = manager.run_cycle(Utc::now()).await;
        assert_eq!((second.uploaded, second.failed), (1, 0));
        assert!(manager.is_uploaded(&path));
        assert_eq!(uploader.calls.lock().unwrap().len(), 2);

        let syncs = tracker.snapshot(Utc::now()).sync_events;
        assert_eq!(syncs.len(), 2);
        assert_eq!(syncs[0].status, SyncStatus::Failed);
        assert_eq!(syncs[1].status, SyncStatus::Success);
    }

    #[tokio::test]
    async fn test_unconfigured_remote_skips_and_keeps_files() {
        let uploader = FakeUploader::new(false, 0);
        let (dir, mut manager, handle, _) = setup(uploader.clone());
        let path = publish(dir.path(), "ETHUSDT_kline_20240101_0000.parquet", &handle);

        let report = manager.run_cycle(Utc::now() + chrono::Duration::days(30)).await;
        assert_eq!(report.skipped, 1);
        assert_eq!(report.deleted, 0);
        assert_eq!(manager.pending_len(), 0);
        assert!(path.exists());
        assert!(uploader.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retention_deletes_only_old_uploaded_parquet() {
        let uploader = FakeUploader::new(true, 0);
        let (dir, mut manager, handle, _) = setup(uploader);
        let uploaded = publish(dir.path(), "BTCUSDT_orderbook_20240101_0000.parquet", &handle);
        let never_announced = dir.path().join("XRPUSDT_trade_20240101_0000.parquet");
        fs::write(&never_announced, b"PAR1").unwrap();
        let ledger = dir.path().join("checksums.json");
        fs::write(&ledger, b"[]").unwrap();

        let today = manager.run_cycle(Utc::now()).await;
        assert_eq!((today.uploaded, today.deleted), (1, 0));

        let later = manager.run_cycle(Utc::now() + chrono::Duration::days(8)).await;
        assert_eq!(later.deleted, 1);
        assert!(!uploaded.exists());
        assert!(never_announced.exists());
        assert!(ledger.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rclone_exit_status_decides_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.parquet");
        fs::write(&path, b"x").unwrap();

        let ok = RcloneUploader::new("remote", "bucket/data").with_binary("true");
        assert_eq!(ok.destination(), "remote:bucket/data");
        assert!(ok.upload(&path).await.is_ok());

        let failing = RcloneUploader::new("remote", "bucket").with_binary("false");
        assert!(matches!(failing.upload(&path).await, Err(UploadError::Failed { .. })));

        let unset = RcloneUploader::new("", "");
        assert!(!unset.is_configured());
        assert!(matches!(unset.upload(&path).await, Err(UploadError::NotConfigured)));
    }

    fn set_age(path: &Path, age: Duration) {
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(std::time::SystemTime::now() - age).unwrap();
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn retention_deletes_exactly_old_uploaded_files(
            files in prop::collection::vec((0u64..(20 * 24), any::<bool>()), 1..12),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let (dir, mut manager, handle, _) = setup(FakeUploader::new(true, 0));

            let mut paths = Vec::new();
            for (i, (age_hours, synced)) in files.iter().enumerate() {
                let name = format!("BTCUSDT_trade_20240101_{i:04}.parquet");
                let path = if *synced {
                    publish(dir.path(), &name, &handle)
                } else {
                    let path = dir.path().join(&name);
                    fs::write(&path, b"PAR1").unwrap();
                    path
                };
                set_age(&path, Duration::from_secs(age_hours * 3600));
                paths.push(path);
            }

            let report = runtime.block_on(manager.run_cycle(Utc::now()));
            let expected_gone = files.iter().filter(|(age, synced)| *synced && *age >= 7 * 24).count();
            prop_assert_eq!(report.deleted, expected_gone);

            for ((age_hours, synced), path) in files.iter().zip(&paths) {
                let should_be_gone = *synced && *age_hours >= 7 * 24;
                prop_assert_eq!(!path.exists(), should_be_gone, "{} age {}h synced {}", path.display(), age_hours, synced);
                // Deleted files leave the uploaded set.
                prop_assert_eq!(manager.is_uploaded(path), *synced && !should_be_gone);
            }

            // A second pass finds nothing more to delete.
            prop_assert_eq!(manager.apply_retention(Utc::now()).unwrap(), 0);
        }
    }
}
