//! Component wiring and lifecycle
//!
//! Everything is constructed here and handed its collaborators explicitly.
//! All long-running loops share one cancellation token; a termination
//! signal cancels it, the loops wind down, and one last flush runs before
//! the process exits.

use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use market_data::alerts::{Alert, AlertSink, LogAlertSink};
use market_data::buffer::EventBuffer;
use market_data::clock;
use market_data::funding::{FundingRatePoller, RestFundingSource};
use market_data::ingestion::{IngestorConfig, IngestorDeps, StreamIngestor};
use market_data::integrity::{update_coverage_summary, IntegrityTracker};
use market_data::order_book::BookConfig;
use market_data::snapshot::RestSnapshotSource;
use market_data::websocket::{ChannelKind, WsConnector};
use persistence::recovery::sweep_orphaned_temps;
use persistence::sync::{RcloneUploader, SyncManager};
use persistence::writer::PersistenceWriter;

use crate::config::CollectorConfig;

const DAILY_SUMMARY_INTERVAL: Duration = Duration::from_secs(86_400);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn run(config: CollectorConfig) -> anyhow::Result<()> {
    fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;
    fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("creating log dir {}", config.log_dir.display()))?;

    let swept = sweep_orphaned_temps(&config.data_dir).context("sweeping orphaned temp files")?;
    if !swept.is_empty() {
        warn!(count = swept.len(), "Previous run left partial files behind");
    }

    let instruments = config.instruments();
    info!(
        symbols = ?instruments.iter().map(|i| i.as_str()).collect::<Vec<_>>(),
        flush_interval_secs = config.flush_interval_secs,
        use_futures = config.use_futures,
        version = market_data::SERVICE_VERSION,
        "Collector starting"
    );

    let buffer = Arc::new(EventBuffer::new());
    let tracker = Arc::new(IntegrityTracker::new(instruments.iter().cloned(), clock::unix_nanos()));
    let alerts: Arc<dyn AlertSink> = Arc::new(LogAlertSink);
    let http = reqwest::Client::builder().build().context("building HTTP client")?;

    let uploader = Arc::new(RcloneUploader::new(config.cloud_remote.clone(), config.cloud_path.clone()));
    let (sync, sync_handle) = SyncManager::new(&config.data_dir, config.retention(), uploader, tracker.clone());
    let writer = Arc::new(
        PersistenceWriter::new(&config.data_dir, buffer.clone(), tracker.clone())
            .with_file_created_hook(sync_handle.hook()),
    );

    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();

    let deps = IngestorDeps {
        connector: Arc::new(WsConnector::default()),
        snapshots: Arc::new(RestSnapshotSource::new(http.clone(), config.spot_rest_url.clone())),
        buffer: buffer.clone(),
        tracker: tracker.clone(),
        alerts: alerts.clone(),
    };
    let market = StreamIngestor::new(
        ingestor_config(&config, ChannelKind::Market, &config.spot_ws_url),
        deps.clone(),
    );
    tasks.spawn(market.run(cancel.clone()));

    if config.use_futures {
        let liquidations = StreamIngestor::new(
            ingestor_config(&config, ChannelKind::Liquidation, &config.futures_ws_url),
            deps,
        );
        tasks.spawn(liquidations.run(cancel.clone()));

        let funding = FundingRatePoller::new(
            Arc::new(RestFundingSource::new(http.clone(), config.futures_rest_url.clone())),
            buffer.clone(),
            instruments.clone(),
        );
        tasks.spawn(funding.run(config.funding_interval(), cancel.clone()));
    }

    tasks.spawn(writer.clone().run_flush_loop(config.flush_interval(), cancel.clone()));
    tasks.spawn(writer.clone().run_backpressure_monitor(
        config.backpressure_check(),
        config.max_buffer_bytes(),
        cancel.clone(),
    ));
    tasks.spawn(sync.run(config.flush_interval(), cancel.clone()));
    tasks.spawn(run_periodic_reports(
        tracker.clone(),
        config.log_dir.clone(),
        config.flush_interval(),
        cancel.clone(),
    ));
    tasks.spawn(run_daily_summary(
        tracker.clone(),
        config.log_dir.clone(),
        alerts.clone(),
        cancel.clone(),
    ));

    info!(tasks = tasks.len(), "Collector running");
    wait_for_shutdown(shutdown_signal(), &mut tasks).await;

    info!("Shutting down");
    cancel.cancel();
    let drained = timeout(SHUTDOWN_TIMEOUT, async {
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "Task failed during shutdown");
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!(timeout_secs = SHUTDOWN_TIMEOUT.as_secs(), "Tasks did not stop in time, aborting");
        tasks.shutdown().await;
    }

    match writer.flush_blocking().await {
        Ok(report) => info!(
            files = report.published.len(),
            records = report.records_written(),
            "Final flush complete"
        ),
        Err(err) => error!(error = %err, "Final flush failed"),
    }
    write_reports(&tracker, &config.log_dir);

    info!("Collector stopped");
    Ok(())
}

/// Wait for `signal`, logging tasks that die along the way. The signal
/// future is created once, so handlers stay registered for the whole wait.
async fn wait_for_shutdown(signal: impl Future<Output = ()>, tasks: &mut JoinSet<()>) {
    tokio::pin!(signal);
    loop {
        tokio::select! {
            _ = &mut signal => break,
            Some(joined) = tasks.join_next() => {
                if let Err(err) = joined {
                    error!(error = %err, "Background task died");
                }
            }
        }
    }
}

fn ingestor_config(config: &CollectorConfig, channel: ChannelKind, endpoint: &str) -> IngestorConfig {
    let mut ingestor = IngestorConfig::new(channel, endpoint, config.instruments());
    ingestor.snapshot_depth = config.orderbook_depth;
    ingestor.book = BookConfig {
        top_levels: config.orderbook_top_levels,
        grace_period: config.grace_period(),
    };
    ingestor.read_timeout = config.read_timeout();
    ingestor.stale_timeout = config.stale_timeout();
    ingestor
}

/// Period stats plus the coverage summary. Failures are logged only.
fn write_reports(tracker: &IntegrityTracker, log_dir: &Path) {
    let now = Utc::now();
    if let Err(err) = tracker.write_periodic_log(log_dir, now) {
        error!(error = %err, "Periodic integrity log failed");
    }
    let coverage = tracker.coverage_stats(clock::unix_nanos());
    match update_coverage_summary(log_dir, &coverage, now) {
        Ok(entries) => {
            for (instrument, entry) in &entries {
                info!(instrument = %instrument, coverage = entry.coverage, "Coverage");
            }
        }
        Err(err) => error!(error = %err, "Coverage summary failed"),
    }
}

async fn run_periodic_reports(
    tracker: Arc<IntegrityTracker>,
    log_dir: PathBuf,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => write_reports(&tracker, &log_dir),
        }
    }
}

async fn run_daily_summary(
    tracker: Arc<IntegrityTracker>,
    log_dir: PathBuf,
    alerts: Arc<dyn AlertSink>,
    cancel: CancellationToken,
) {
    let mut ticker = interval(DAILY_SUMMARY_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match tracker.write_daily_summary(&log_dir, Utc::now()) {
            Ok((_, summary)) => alerts.notify(Alert::DailySummary(summary)),
            Err(err) => error!(error = %err, "Daily summary failed"),
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C"),
        () = terminate => info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_shutdown_wait_survives_task_deaths() {
        let mut tasks = JoinSet::new();
        tasks.spawn(async { panic!("ingestor crashed") });
        tasks.spawn(async {});
        tasks.spawn(std::future::pending::<()>());

        let (tx, rx) = oneshot::channel::<()>();
        let signal = async move {
            let _ = rx.await;
        };
        let waiter = tokio::spawn(async move {
            wait_for_shutdown(signal, &mut tasks).await;
            tasks
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        tx.send(()).unwrap();
        let mut tasks = timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
        assert_eq!(tasks.len(), 1);
        tasks.shutdown().await;
    }

    #[test]
    fn test_ingestor_config_follows_collector_config() {
        let config = CollectorConfig {
            orderbook_depth: 500,
            orderbook_top_levels: 10,
            grace_period_secs: 5,
            stale_timeout_secs: 90,
            ..CollectorConfig::default()
        };
        let ingestor = ingestor_config(&config, ChannelKind::Liquidation, &config.futures_ws_url);
        assert_eq!(ingestor.snapshot_depth, 500);
        assert_eq!(ingestor.book.top_levels, 10);
        assert_eq!(ingestor.book.grace_period, Duration::from_secs(5));
        assert_eq!(ingestor.stale_timeout, Duration::from_secs(90));
        assert_eq!(ingestor.instruments.len(), 3);
    }
}
