//! Periodic persistence of buffered records
//!
//! A flush drains the whole buffer at once and writes one immutable Parquet
//! file per non-empty (instrument, kind) group, plus one file for funding
//! records. Every published file gets a ledger entry, a flush stat in the
//! integrity tracker, and is announced to the file-created hook.
//!
//! Two loops trigger flushes: a fixed interval, and a backpressure monitor
//! that flushes early once the buffer's estimated size crosses a threshold.
//! Flushes are serialized, so the two can never interleave.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use market_data::buffer::EventBuffer;
use market_data::integrity::{FlushStat, IntegrityTracker};
use types::ids::Instrument;
use types::records::{EventKind, Record};

use crate::atomic::write_atomic;
use crate::columnar::{self, EncodeError};
use crate::ledger::{sha256_hex, ChecksumLedger, LedgerEntry, LedgerError};

pub const FILE_EXTENSION: &str = "parquet";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("encoding failed: {0}")]
    Encode(#[from] EncodeError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("flush task failed: {0}")]
    Join(String),
}

/// Called with the path of every newly published file.
pub type FileCreatedHook = Arc<dyn Fn(&Path) + Send + Sync>;

/// `{INSTRUMENT}_{kind}_{YYYYMMDD}_{HHMM}`
pub fn file_stem(instrument: &Instrument, kind: EventKind, now: DateTime<Utc>) -> String {
    format!("{}_{}_{}", instrument.as_str(), kind.as_str(), now.format("%Y%m%d_%H%M"))
}

/// `funding_rate_{YYYYMMDD}_{HHMM}`
pub fn funding_file_stem(now: DateTime<Utc>) -> String {
    format!("{}_{}", EventKind::Funding.as_str(), now.format("%Y%m%d_%H%M"))
}

/// First of `{stem}.parquet`, `{stem}_1.parquet`, ... that does not exist yet.
pub fn unused_path(dir: &Path, stem: &str) -> PathBuf {
    let first = dir.join(format!("{stem}.{FILE_EXTENSION}"));
    if !first.exists() {
        return first;
    }
    (1u32..)
        .map(|n| dir.join(format!("{stem}_{n}.{FILE_EXTENSION}")))
        .find(|path| !path.exists())
        .unwrap_or(first)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedFile {
    pub path: PathBuf,
    pub kind: EventKind,
    pub instrument: Option<Instrument>,
    pub record_count: usize,
    pub file_size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub published: Vec<PublishedFile>,
    /// Groups whose file could not be written. Their records are gone.
    pub failed_groups: usize,
}

impl FlushReport {
    pub fn records_written(&self) -> usize {
        self.published.iter().map(|f| f.record_count).sum()
    }
}

pub struct PersistenceWriter {
    data_dir: PathBuf,
    buffer: Arc<EventBuffer>,
    tracker: Arc<IntegrityTracker>,
    ledger: ChecksumLedger,
    on_file_created: Option<FileCreatedHook>,
    flush_lock: Mutex<()>,
}

impl PersistenceWriter {
    pub fn new(data_dir: impl Into<PathBuf>, buffer: Arc<EventBuffer>, tracker: Arc<IntegrityTracker>) -> Self {
        let data_dir = data_dir.into();
        let ledger = ChecksumLedger::new(&data_dir);
        Self {
            data_dir,
            buffer,
            tracker,
            ledger,
            on_file_created: None,
            flush_lock: Mutex::new(()),
        }
    }

    pub fn with_file_created_hook(mut self, hook: FileCreatedHook) -> Self {
        self.on_file_created = Some(hook);
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn ledger(&self) -> &ChecksumLedger {
        &self.ledger
    }

    pub fn flush_now(&self) -> FlushReport {
        self.flush_at(Utc::now())
    }

    /// Drain the buffer and publish every group, naming files after `now`.
    pub fn flush_at(&self, now: DateTime<Utc>) -> FlushReport {
        let _serialized = self.flush_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let drained = self.buffer.drain();
        let mut report = FlushReport::default();
        if drained.is_empty() {
            debug!("Flush skipped, buffer empty");
            return report;
        }

        for ((instrument, kind), records) in &drained.keyed {
            if records.is_empty() {
                continue;
            }
            let stem = file_stem(instrument, *kind, now);
            self.publish_into(&mut report, *kind, Some(instrument), records, &stem, now);
        }
        if !drained.funding.is_empty() {
            let stem = funding_file_stem(now);
            self.publish_into(&mut report, EventKind::Funding, None, &drained.funding, &stem, now);
        }

        info!(
            files = report.published.len(),
            records = report.records_written(),
            failed_groups = report.failed_groups,
            "Flush complete"
        );
        report
    }

    fn publish_into(
        &self,
        report: &mut FlushReport,
        kind: EventKind,
        instrument: Option<&Instrument>,
        records: &[Record],
        stem: &str,
        now: DateTime<Utc>,
    ) {
        match self.publish(kind, instrument, records, stem, now) {
            Ok(file) => report.published.push(file),
            Err(err) => {
                report.failed_groups += 1;
                error!(
                    kind = kind.as_str(),
                    instrument = instrument.map(Instrument::as_str).unwrap_or("-"),
                    records = records.len(),
                    error = %err,
                    "Failed to persist group, records dropped"
                );
            }
        }
    }

    fn publish(
        &self,
        kind: EventKind,
        instrument: Option<&Instrument>,
        records: &[Record],
        stem: &str,
        now: DateTime<Utc>,
    ) -> Result<PublishedFile, PersistenceError> {
        let bytes = columnar::encode(kind, records)?;
        let path = unused_path(&self.data_dir, stem);
        write_atomic(&path, &bytes).map_err(|source| PersistenceError::Io {
            path: path.clone(),
            source,
        })?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let sha256 = sha256_hex(&bytes);
        let file_size = bytes.len() as u64;

        // The file is already published; a ledger failure is reported but
        // does not un-publish it.
        if let Err(err) = self.ledger.append(LedgerEntry {
            filename: file_name.clone(),
            sha256: sha256.clone(),
            record_count: records.len(),
            file_size,
            created_at: now,
        }) {
            warn!(file = %file_name, error = %err, "Checksum ledger not updated");
        }

        let time_start = records.iter().map(Record::local_receive_time).min().unwrap_or(0);
        let time_end = records.iter().map(Record::local_receive_time).max().unwrap_or(0);
        self.tracker.record_flush(FlushStat {
            instrument: instrument.cloned(),
            kind,
            file_name: file_name.clone(),
            record_count: records.len(),
            file_size,
            time_start,
            time_end,
        });

        info!(file = %file_name, records = records.len(), bytes = file_size, "File published");
        if let Some(hook) = &self.on_file_created {
            hook(&path);
        }

        Ok(PublishedFile {
            path,
            kind,
            instrument: instrument.cloned(),
            record_count: records.len(),
            file_size,
            sha256,
        })
    }

    /// Run a flush on the blocking pool.
    pub async fn flush_blocking(self: &Arc<Self>) -> Result<FlushReport, PersistenceError> {
        let writer = Arc::clone(self);
        tokio::task::spawn_blocking(move || writer.flush_now())
            .await
            .map_err(|e| PersistenceError::Join(e.to_string()))
    }

    /// Flush every `every` until cancelled. The first tick fires one full
    /// interval after start.
    pub async fn run_flush_loop(self: Arc<Self>, every: Duration, cancel: CancellationToken) {
        info!(interval_secs = every.as_secs(), "Flush loop starting");
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(err) = self.flush_blocking().await {
                error!(error = %err, "Scheduled flush failed");
            }
        }
        info!("Flush loop stopped");
    }

    /// Check the buffer estimate every `every` and flush early once it
    /// reaches `threshold_bytes`.
    pub async fn run_backpressure_monitor(
        self: Arc<Self>,
        every: Duration,
        threshold_bytes: usize,
        cancel: CancellationToken,
    ) {
        info!(
            interval_secs = every.as_secs(),
            threshold_mb = threshold_bytes / (1024 * 1024),
            "Backpressure monitor starting"
        );
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !self.buffer.needs_flush(threshold_bytes) {
                continue;
            }
            warn!(
                estimate_mb = self.buffer.estimate_size() / (1024 * 1024),
                threshold_mb = threshold_bytes / (1024 * 1024),
                "Buffer over threshold, flushing early"
            );
            if let Err(err) = self.flush_blocking().await {
                error!(error = %err, "Backpressure flush failed");
            }
        }
        info!("Backpressure monitor stopped");
    }
}
