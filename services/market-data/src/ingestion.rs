//! Stream ingestion: connection state machine and frame routing
//!
//! One `StreamIngestor` owns one long-lived connection. Per connection:
//!
//! ```text
//! Disconnected → Connecting → Synchronizing → Streaming
//!       ▲                                         │
//!       └──────────────── (error) ────────────────┘
//! ```
//!
//! `Synchronizing` only exists on the market channel, which owns the order
//! books: every book is reloaded from a snapshot before diffs are trusted,
//! on the first connect and on every reconnect, because sequence state is
//! scoped to a connection.
//!
//! While streaming, depth frames go through the book reconstructor and
//! everything else is passed straight to the buffer. A book that gaps is
//! resynced by a background task; at most one task per instrument is in
//! flight, and results from a previous connection are discarded.
//!
//! Reconnection is unbounded with exponential backoff. Nothing here ends the
//! process; only cancellation stops the loop.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use types::ids::Instrument;
use types::records::Record;

use crate::alerts::{Alert, AlertSink};
use crate::backoff::ReconnectBackoff;
use crate::buffer::EventBuffer;
use crate::clock;
use crate::events::{decode_frame, DepthDiff, FrameError, FramePayload};
use crate::integrity::{IntegrityTracker, ReconnectRecord};
use crate::order_book::{BookConfig, BookReconstructor, DiffOutcome};
use crate::snapshot::{DepthSnapshot, SnapshotSource};
use crate::websocket::{ChannelKind, Connector, Frame, FrameStream};

/// Transport-level failures. All of them lead to a reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("stream closed by peer")]
    Closed,

    #[error("no message received for {0:?}")]
    Stale(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Synchronizing,
    Streaming,
}

/// Configuration for one ingestor.
#[derive(Debug, Clone)]
pub struct IngestorConfig {
    pub channel: ChannelKind,
    /// Combined-stream endpoint, without the `?streams=` query.
    pub endpoint: String,
    pub instruments: Vec<Instrument>,
    /// `limit` for snapshot queries.
    pub snapshot_depth: u32,
    pub book: BookConfig,
    /// Upper bound on a single read wait.
    pub read_timeout: Duration,
    /// No frame (heartbeats included) for this long means the connection is dead.
    pub stale_timeout: Duration,
}

impl IngestorConfig {
    pub fn new(channel: ChannelKind, endpoint: impl Into<String>, instruments: Vec<Instrument>) -> Self {
        Self {
            channel,
            endpoint: endpoint.into(),
            instruments,
            snapshot_depth: 1000,
            book: BookConfig::default(),
            read_timeout: Duration::from_secs(5),
            stale_timeout: Duration::from_secs(60),
        }
    }
}

/// Collaborators injected into an ingestor.
#[derive(Clone)]
pub struct IngestorDeps {
    pub connector: Arc<dyn Connector>,
    pub snapshots: Arc<dyn SnapshotSource>,
    pub buffer: Arc<EventBuffer>,
    pub tracker: Arc<IntegrityTracker>,
    pub alerts: Arc<dyn AlertSink>,
}

/// A finished resync fetch.
struct ResyncOutcome {
    epoch: u64,
    instrument: Instrument,
    snapshot: DepthSnapshot,
}

pub struct StreamIngestor {
    config: IngestorConfig,
    url: String,
    deps: IngestorDeps,
    /// Present only on the channel that carries depth diffs.
    books: Option<BookReconstructor>,
    backoff: ReconnectBackoff,
    state: watch::Sender<ConnectionState>,
    /// Incremented on every new connection.
    epoch: u64,
    resyncs: JoinSet<ResyncOutcome>,
    /// Running resync per instrument, by task id so a failed task can be
    /// matched back to its instrument.
    in_flight: BTreeMap<Instrument, task::Id>,
    disconnected_at: Option<i64>,
    last_error: Option<String>,
}

impl StreamIngestor {
    pub fn new(config: IngestorConfig, deps: IngestorDeps) -> Self {
        let url = config.channel.url(&config.endpoint, &config.instruments);
        let books = config
            .channel
            .owns_books()
            .then(|| BookReconstructor::new(config.instruments.iter().cloned(), config.book.clone()));
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        info!(
            channel = config.channel.as_str(),
            instruments = config.instruments.len(),
            snapshot_depth = config.snapshot_depth,
            "StreamIngestor initialized"
        );

        Self {
            config,
            url,
            deps,
            books,
            backoff: ReconnectBackoff::new(),
            state,
            epoch: 0,
            resyncs: JoinSet::new(),
            in_flight: BTreeMap::new(),
            disconnected_at: None,
            last_error: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn channel(&self) -> ChannelKind {
        self.config.channel
    }

    /// Observe state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn channel_label(&self) -> &'static str {
        self.config.channel.as_str()
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(channel = self.channel_label(), from = ?prev, to = ?next, "Connection state changed");
        }
    }

    /// Run until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(channel = self.channel_label(), url = %self.url, "Stream ingestor starting");

        while !cancel.is_cancelled() {
            self.set_state(ConnectionState::Connecting);
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.deps.connector.connect(&self.url) => result,
            };

            let result = match connected {
                Ok(stream) => {
                    self.on_connected();
                    let result = self.session(stream, &cancel).await;
                    self.end_session().await;
                    result
                }
                Err(err) => Err(err),
            };

            match result {
                Ok(()) => break,
                Err(err) => {
                    self.on_disconnected(&err);
                    let delay = self.backoff.next_delay();
                    warn!(
                        channel = self.channel_label(),
                        attempt = self.backoff.attempt(),
                        delay_secs = delay.as_secs(),
                        "Reconnecting after backoff"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }

        self.resyncs.shutdown().await;
        self.set_state(ConnectionState::Disconnected);
        info!(channel = self.channel_label(), "Stream ingestor stopped");
    }

    fn on_connected(&mut self) {
        let now = clock::unix_nanos();
        self.epoch += 1;
        info!(channel = self.channel_label(), epoch = self.epoch, "Stream connected");

        if let Some(since) = self.disconnected_at.take() {
            let downtime_ns = now.saturating_sub(since).max(0);
            let downtime = Duration::from_nanos(downtime_ns as u64);
            self.deps.tracker.record_reconnect(ReconnectRecord {
                timestamp: now,
                channel: self.channel_label().to_string(),
                reason: self.last_error.take().unwrap_or_default(),
                downtime_ms: downtime.as_millis() as u64,
            });
            if self.config.channel.owns_books() {
                self.deps.tracker.add_downtime(downtime_ns);
            }
            self.deps.alerts.notify(Alert::Reconnected {
                channel: self.channel_label(),
                downtime,
            });
        }
    }

    fn on_disconnected(&mut self, err: &IngestError) {
        self.set_state(ConnectionState::Disconnected);
        error!(channel = self.channel_label(), error = %err, "Stream disconnected");
        self.last_error = Some(err.to_string());
        if self.disconnected_at.is_none() {
            self.disconnected_at = Some(clock::unix_nanos());
            self.deps.alerts.notify(Alert::Disconnected {
                channel: self.channel_label(),
                reason: err.to_string(),
            });
        }
    }

    /// Drive one connection. `Ok` means cancelled, `Err` means dropped.
    async fn session(&mut self, mut stream: FrameStream, cancel: &CancellationToken) -> Result<(), IngestError> {
        if self.books.is_some() {
            self.set_state(ConnectionState::Synchronizing);
            if self.synchronize(cancel).await {
                return Ok(());
            }
        }
        self.set_state(ConnectionState::Streaming);

        let mut last_message = Instant::now();
        let mut healthy = false;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                Some(joined) = self.resyncs.join_next_with_id(), if !self.resyncs.is_empty() => {
                    self.on_resync_finished(joined);
                }
                next = timeout(self.config.read_timeout, stream.next()) => match next {
                    Err(_) => {
                        let silent = last_message.elapsed();
                        if silent >= self.config.stale_timeout {
                            return Err(IngestError::Stale(silent));
                        }
                    }
                    Ok(None) => return Err(IngestError::Closed),
                    Ok(Some(Err(err))) => return Err(err),
                    Ok(Some(Ok(frame))) => {
                        last_message = Instant::now();
                        if !healthy {
                            healthy = true;
                            self.backoff.reset();
                        }
                        if let Frame::Text(text) = frame {
                            self.handle_text(&text);
                        }
                    }
                },
            }
        }
    }

    /// Reload every book from a snapshot. Returns true if cancelled.
    async fn synchronize(&mut self, cancel: &CancellationToken) -> bool {
        let instruments = self.config.instruments.clone();
        for instrument in instruments {
            let Some(books) = self.books.as_mut() else {
                return false;
            };
            let result = tokio::select! {
                _ = cancel.cancelled() => return true,
                result = books.initialize(
                    self.deps.snapshots.as_ref(),
                    &instrument,
                    self.config.snapshot_depth,
                    clock::unix_nanos,
                ) => result,
            };
            match result {
                Ok(_) => self.deps.tracker.close_gap(&instrument, clock::unix_nanos()),
                Err(err) => {
                    warn!(instrument = %instrument, error = %err, "Initial snapshot failed, retrying in background");
                    self.schedule_resync(instrument);
                }
            }
        }
        false
    }

    async fn end_session(&mut self) {
        self.resyncs.shutdown().await;
        self.in_flight.clear();
        if let Some(books) = self.books.as_mut() {
            books.invalidate_all();
            self.deps.tracker.close_all_gaps(clock::unix_nanos());
        }
    }

    fn handle_text(&mut self, text: &str) {
        let frame = match decode_frame(text, clock::unix_nanos()) {
            Ok(frame) => frame,
            Err(FrameError::UnknownStream(tag)) => {
                debug!(channel = self.channel_label(), stream = %tag, "Skipping frame for unknown stream");
                return;
            }
            Err(err) => {
                warn!(channel = self.channel_label(), error = %err, "Skipping malformed frame");
                return;
            }
        };

        self.deps.tracker.increment_message_count(&frame.instrument);
        match frame.payload {
            FramePayload::Depth(diff) => self.on_depth(diff),
            FramePayload::Record(record) => self.push(record),
            FramePayload::Skipped => {}
        }
    }

    fn push(&self, record: Record) {
        if let Err(err) = self.deps.buffer.add(record) {
            warn!(channel = self.channel_label(), error = %err, "Record dropped");
        }
    }

    fn on_depth(&mut self, diff: DepthDiff) {
        let Some(books) = self.books.as_mut() else {
            debug!(channel = self.channel_label(), "Depth frame on a channel without books");
            return;
        };
        match books.apply_diff(&diff) {
            DiffOutcome::Applied(snapshot) => self.push(Record::Book(snapshot)),
            DiffOutcome::Stale | DiffOutcome::WithinGrace => {}
            DiffOutcome::Gap(gap) => {
                self.deps.tracker.record_gap(&gap);
                self.deps.alerts.notify(Alert::SequenceGap(gap));
                self.schedule_resync(diff.instrument);
            }
            DiffOutcome::NotInitialized => self.schedule_resync(diff.instrument),
            DiffOutcome::UnknownInstrument => {
                debug!(instrument = %diff.instrument, "Depth diff for untracked instrument");
            }
        }
    }

    /// Spawn a snapshot fetch for `instrument` unless one is already running.
    fn schedule_resync(&mut self, instrument: Instrument) {
        if self.books.is_none() || self.in_flight.contains_key(&instrument) {
            return;
        }
        let source = Arc::clone(&self.deps.snapshots);
        let depth = self.config.snapshot_depth;
        let epoch = self.epoch;
        info!(instrument = %instrument, epoch, "Scheduling order book resync");

        let key = instrument.clone();
        let handle = self.resyncs.spawn(async move {
            let mut backoff = ReconnectBackoff::new();
            loop {
                match source.fetch(&instrument, depth).await {
                    Ok(snapshot) => {
                        return ResyncOutcome {
                            epoch,
                            instrument,
                            snapshot,
                        }
                    }
                    Err(err) => {
                        let delay = backoff.next_delay();
                        warn!(
                            instrument = %instrument,
                            error = %err,
                            delay_secs = delay.as_secs(),
                            "Resync snapshot failed, retrying"
                        );
                        sleep(delay).await;
                    }
                }
            }
        });
        self.in_flight.insert(key, handle.id());
    }

    fn on_resync_finished(&mut self, joined: Result<(task::Id, ResyncOutcome), JoinError>) {
        let outcome = match joined {
            Ok((_, outcome)) => outcome,
            Err(err) if err.is_cancelled() => return,
            Err(err) => {
                let id = err.id();
                self.in_flight.retain(|instrument, task| {
                    if *task == id {
                        error!(instrument = %instrument, error = %err, "Resync task failed");
                    }
                    *task != id
                });
                return;
            }
        };

        if outcome.epoch != self.epoch {
            debug!(
                instrument = %outcome.instrument,
                epoch = outcome.epoch,
                current = self.epoch,
                "Discarding resync from a previous connection"
            );
            return;
        }
        self.in_flight.remove(&outcome.instrument);

        let Some(books) = self.books.as_mut() else {
            return;
        };
        let now = clock::unix_nanos();
        match books.install_snapshot(&outcome.instrument, outcome.snapshot, now) {
            Ok(_) => self.deps.tracker.close_gap(&outcome.instrument, now),
            Err(err) => warn!(error = %err, "Resync snapshot not installed"),
        }
    }
}
