//! Data-integrity tracking and coverage reporting
//!
//! A passive recorder fed by ingestion, persistence and sync: sequence gaps,
//! reconnects, flush statistics and upload outcomes. Recording never fails
//! and never blocks for longer than a short critical section; only the
//! report writers return errors, and those go to the reporting loop.
//!
//! Coverage per instrument is `(observed - gapped) / observed`, where
//! observed time runs from tracker start and gapped time is reconnect
//! downtime plus the time each book spent waiting for a resync snapshot.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use types::ids::Instrument;
use types::records::EventKind;

use crate::order_book::GapRecord;

/// Upper bound on each in-memory log; on overflow the newest half is kept.
pub const MAX_LOG_ENTRIES: usize = 10_000;

pub const COVERAGE_FILE: &str = "coverage_summary.json";

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum IntegrityError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ── Log entries ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectRecord {
    /// Unix nanos at which the connection came back.
    pub timestamp: i64,
    pub channel: String,
    /// Error that caused the drop.
    pub reason: String,
    pub downtime_ms: u64,
}

/// One published file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushStat {
    /// `None` for the cross-instrument funding file.
    pub instrument: Option<Instrument>,
    pub kind: EventKind,
    pub file_name: String,
    pub record_count: usize,
    pub file_size: u64,
    /// Earliest local receive time in the file (Unix nanos).
    pub time_start: i64,
    /// Latest local receive time in the file (Unix nanos).
    pub time_end: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub path: String,
    pub status: SyncStatus,
    pub timestamp: String,
}

/// Current-period view, written hourly and then reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodStats {
    pub timestamp: String,
    pub period_start: String,
    pub gap_count: usize,
    pub gaps: Vec<GapRecord>,
    pub reconnect_count: usize,
    pub reconnects: Vec<ReconnectRecord>,
    pub flush_stats: Vec<FlushStat>,
    pub sync_events: Vec<SyncRecord>,
    pub message_counts: BTreeMap<Instrument, u64>,
}

/// Day-level totals. Counted separately from the period logs so that the
/// hourly reset does not zero them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailySummary {
    pub date: String,
    pub total_gaps: u64,
    pub total_reconnects: u64,
    pub total_flushes: u64,
    pub total_records_flushed: u64,
    pub sync_success: u64,
    pub sync_failed: u64,
    pub messages: u64,
}

/// Inputs to a coverage computation for one instrument.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoverageStats {
    pub total_seconds: f64,
    pub gap_seconds: f64,
    pub msg_count: u64,
}

/// One instrument's entry in the coverage summary file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageEntry {
    pub coverage: f64,
    pub total_seconds: f64,
    pub gap_seconds: f64,
    pub msg_count: u64,
    pub updated_at: String,
}

/// `(total - gap) / total`, with gap clamped to `[0, total]` and 0 when
/// nothing has been observed.
pub fn compute_coverage(total_seconds: f64, gap_seconds: f64) -> f64 {
    if total_seconds <= 0.0 {
        return 0.0;
    }
    let gap = gap_seconds.clamp(0.0, total_seconds);
    ((total_seconds - gap) / total_seconds).clamp(0.0, 1.0)
}

fn push_bounded<T>(log: &mut Vec<T>, item: T) {
    if log.len() >= MAX_LOG_ENTRIES {
        log.drain(..log.len() - MAX_LOG_ENTRIES / 2);
    }
    log.push(item);
}

// ── Tracker ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct CoverageState {
    gapped_ns: i64,
    open_gap_since: Option<i64>,
    messages: u64,
}

#[derive(Debug)]
struct TrackerState {
    gaps: Vec<GapRecord>,
    reconnects: Vec<ReconnectRecord>,
    flushes: Vec<FlushStat>,
    syncs: Vec<SyncRecord>,
    message_counts: BTreeMap<Instrument, u64>,
    period_start: DateTime<Utc>,
    daily: DailySummary,
    coverage: BTreeMap<Instrument, CoverageState>,
    started_at: i64,
}

#[derive(Debug)]
pub struct IntegrityTracker {
    state: Mutex<TrackerState>,
}

impl IntegrityTracker {
    /// `started_at` is Unix nanos; observed time is measured from it.
    pub fn new(instruments: impl IntoIterator<Item = Instrument>, started_at: i64) -> Self {
        let coverage = instruments
            .into_iter()
            .map(|instrument| (instrument, CoverageState::default()))
            .collect();
        Self {
            state: Mutex::new(TrackerState {
                gaps: Vec::new(),
                reconnects: Vec::new(),
                flushes: Vec::new(),
                syncs: Vec::new(),
                message_counts: BTreeMap::new(),
                period_start: DateTime::<Utc>::from_timestamp_nanos(started_at),
                daily: DailySummary::default(),
                coverage,
                started_at,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a gap and start its gapped-time clock.
    pub fn record_gap(&self, gap: &GapRecord) {
        let mut state = self.lock();
        push_bounded(&mut state.gaps, gap.clone());
        state.daily.total_gaps += 1;
        if let Some(cov) = state.coverage.get_mut(&gap.instrument) {
            cov.open_gap_since.get_or_insert(gap.detected_at);
        }
    }

    /// Stop the gapped-time clock for `instrument` (its book was resynced).
    pub fn close_gap(&self, instrument: &Instrument, now: i64) {
        let mut state = self.lock();
        if let Some(cov) = state.coverage.get_mut(instrument) {
            if let Some(since) = cov.open_gap_since.take() {
                cov.gapped_ns += now.saturating_sub(since).max(0);
            }
        }
    }

    /// Close every open gap. Reconnect downtime takes over from here.
    pub fn close_all_gaps(&self, now: i64) {
        let mut state = self.lock();
        for cov in state.coverage.values_mut() {
            if let Some(since) = cov.open_gap_since.take() {
                cov.gapped_ns += now.saturating_sub(since).max(0);
            }
        }
    }

    pub fn is_gap_open(&self, instrument: &Instrument) -> bool {
        self.lock()
            .coverage
            .get(instrument)
            .map(|cov| cov.open_gap_since.is_some())
            .unwrap_or(false)
    }

    pub fn record_reconnect(&self, record: ReconnectRecord) {
        let mut state = self.lock();
        info!(
            channel = %record.channel,
            downtime_ms = record.downtime_ms,
            reason = %record.reason,
            "Reconnect recorded"
        );
        push_bounded(&mut state.reconnects, record);
        state.daily.total_reconnects += 1;
    }

    /// Attribute connection downtime to every instrument.
    pub fn add_downtime(&self, downtime_ns: i64) {
        let mut state = self.lock();
        for cov in state.coverage.values_mut() {
            cov.gapped_ns += downtime_ns.max(0);
        }
    }

    pub fn record_flush(&self, stat: FlushStat) {
        let mut state = self.lock();
        state.daily.total_flushes += 1;
        state.daily.total_records_flushed += stat.record_count as u64;
        push_bounded(&mut state.flushes, stat);
    }

    pub fn record_sync(&self, path: &Path, status: SyncStatus, now: DateTime<Utc>) {
        let mut state = self.lock();
        match status {
            SyncStatus::Success => state.daily.sync_success += 1,
            SyncStatus::Failed => state.daily.sync_failed += 1,
            SyncStatus::Skipped => {}
        }
        push_bounded(
            &mut state.syncs,
            SyncRecord {
                path: path.display().to_string(),
                status,
                timestamp: now.to_rfc3339(),
            },
        );
    }

    pub fn increment_message_count(&self, instrument: &Instrument) {
        let mut state = self.lock();
        *state.message_counts.entry(instrument.clone()).or_insert(0) += 1;
        state.daily.messages += 1;
        if let Some(cov) = state.coverage.get_mut(instrument) {
            cov.messages += 1;
        }
    }

    /// Point-in-time copy of the current-period counters.
    pub fn snapshot(&self, now: DateTime<Utc>) -> PeriodStats {
        let state = self.lock();
        PeriodStats {
            timestamp: now.to_rfc3339(),
            period_start: state.period_start.to_rfc3339(),
            gap_count: state.gaps.len(),
            gaps: state.gaps.clone(),
            reconnect_count: state.reconnects.len(),
            reconnects: state.reconnects.clone(),
            flush_stats: state.flushes.clone(),
            sync_events: state.syncs.clone(),
            message_counts: state.message_counts.clone(),
        }
    }

    /// Clear current-period logs and counters. Cumulative state is kept.
    pub fn reset(&self, now: DateTime<Utc>) {
        let mut state = self.lock();
        state.gaps.clear();
        state.reconnects.clear();
        state.flushes.clear();
        state.syncs.clear();
        state.message_counts.clear();
        state.period_start = now;
    }

    /// Cumulative coverage inputs per instrument as of `now` (Unix nanos).
    pub fn coverage_stats(&self, now: i64) -> BTreeMap<Instrument, CoverageStats> {
        let state = self.lock();
        let observed_ns = now.saturating_sub(state.started_at).max(0);
        state
            .coverage
            .iter()
            .map(|(instrument, cov)| {
                let open = cov
                    .open_gap_since
                    .map(|since| now.saturating_sub(since).max(0))
                    .unwrap_or(0);
                let gapped_ns = cov.gapped_ns.saturating_add(open);
                (
                    instrument.clone(),
                    CoverageStats {
                        total_seconds: observed_ns as f64 / NANOS_PER_SEC,
                        gap_seconds: gapped_ns as f64 / NANOS_PER_SEC,
                        msg_count: cov.messages,
                    },
                )
            })
            .collect()
    }

    /// Take the day's totals and start a new day.
    pub fn take_daily_summary(&self, now: DateTime<Utc>) -> DailySummary {
        let mut state = self.lock();
        let mut summary = std::mem::take(&mut state.daily);
        summary.date = now.format("%Y-%m-%d").to_string();
        summary
    }

    /// Write `stats_{YYYYMMDD_HH}.json` and reset the period.
    pub fn write_periodic_log(&self, dir: &Path, now: DateTime<Utc>) -> Result<PathBuf, IntegrityError> {
        let stats = self.snapshot(now);
        let path = dir.join(format!("stats_{}.json", now.format("%Y%m%d_%H")));
        write_json_atomic(&path, &stats)?;
        self.reset(now);
        info!(path = %path.display(), gaps = stats.gap_count, "Periodic integrity log written");
        Ok(path)
    }

    /// Write `daily_{YYYYMMDD}.json` from the day's totals.
    pub fn write_daily_summary(
        &self,
        dir: &Path,
        now: DateTime<Utc>,
    ) -> Result<(PathBuf, DailySummary), IntegrityError> {
        let summary = self.take_daily_summary(now);
        let path = dir.join(format!("daily_{}.json", now.format("%Y%m%d")));
        write_json_atomic(&path, &summary)?;
        info!(path = %path.display(), "Daily summary written");
        Ok((path, summary))
    }
}

/// Merge `stats` into `{dir}/coverage_summary.json`, overwriting entries by
/// instrument and keeping the rest.
pub fn update_coverage_summary(
    dir: &Path,
    stats: &BTreeMap<Instrument, CoverageStats>,
    now: DateTime<Utc>,
) -> Result<BTreeMap<String, CoverageEntry>, IntegrityError> {
    let path = dir.join(COVERAGE_FILE);
    let mut existing: BTreeMap<String, CoverageEntry> = match fs::read(&path) {
        Ok(bytes) => serde_json::from_slice(&bytes)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
        Err(e) => return Err(e.into()),
    };

    for (instrument, s) in stats {
        existing.insert(
            instrument.to_string(),
            CoverageEntry {
                coverage: compute_coverage(s.total_seconds, s.gap_seconds),
                total_seconds: s.total_seconds,
                gap_seconds: s.gap_seconds,
                msg_count: s.msg_count,
                updated_at: now.to_rfc3339(),
            },
        );
    }

    write_json_atomic(&path, &existing)?;
    Ok(existing)
}

/// Serialize to `.{name}.tmp`, fsync, rename over `path`.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), IntegrityError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{name}.tmp"));
    let staged = File::create(&tmp)
        .and_then(|mut file| {
            file.write_all(&bytes)?;
            file.sync_all()
        })
        .and_then(|()| fs::rename(&tmp, path));
    if let Err(err) = staged {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }
    Ok(())
}
