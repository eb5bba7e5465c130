//! Operator alerts
//!
//! Alerts are fire-and-forget: `AlertSink::notify` has no error channel, so a
//! failing sink can never push an error back into ingestion.

use std::time::Duration;

use tracing::{error, info, warn};

use crate::integrity::DailySummary;
use crate::order_book::GapRecord;

/// Alert severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Alert {
    Disconnected { channel: &'static str, reason: String },
    Reconnected { channel: &'static str, downtime: Duration },
    SequenceGap(GapRecord),
    DailySummary(DailySummary),
}

impl Alert {
    pub fn level(&self) -> AlertLevel {
        match self {
            Alert::Disconnected { .. } => AlertLevel::Critical,
            Alert::SequenceGap(_) => AlertLevel::Warning,
            Alert::Reconnected { .. } | Alert::DailySummary(_) => AlertLevel::Info,
        }
    }

    /// One-line human-readable rendering.
    pub fn message(&self) -> String {
        match self {
            Alert::Disconnected { channel, reason } => {
                format!("{channel} stream disconnected: {reason}")
            }
            Alert::Reconnected { channel, downtime } => {
                format!("{channel} stream reconnected after {:.1}s", downtime.as_secs_f64())
            }
            Alert::SequenceGap(gap) => format!(
                "{} sequence gap: expected {}, got {}..{}",
                gap.instrument, gap.expected_id, gap.actual_first_id, gap.actual_final_id
            ),
            Alert::DailySummary(summary) => format!(
                "daily summary {}: {} gaps, {} reconnects, {} files",
                summary.date, summary.total_gaps, summary.total_reconnects, summary.total_flushes
            ),
        }
    }
}

pub trait AlertSink: Send + Sync {
    fn notify(&self, alert: Alert);
}

/// Writes alerts to the log at a level matching their severity.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn notify(&self, alert: Alert) {
        let message = alert.message();
        match alert.level() {
            AlertLevel::Info => info!(alert = %message, "Alert"),
            AlertLevel::Warning => warn!(alert = %message, "Alert"),
            AlertLevel::Critical => error!(alert = %message, "Alert"),
        }
    }
}
