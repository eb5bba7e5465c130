//! Connection state machine scenarios, driven by scripted in-memory
//! connections and snapshot sources.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use futures_util::SinkExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use market_data::alerts::{Alert, AlertSink};
use market_data::buffer::EventBuffer;
use market_data::ingestion::{ConnectionState, IngestError, IngestorConfig, IngestorDeps, StreamIngestor};
use market_data::integrity::IntegrityTracker;
use market_data::order_book::BookConfig;
use market_data::snapshot::{DepthSnapshot, SnapshotFetchError, SnapshotSource};
use market_data::websocket::{ChannelKind, Connector, Frame, FrameStream, WsConnector};
use types::ids::Instrument;
use types::numeric::PriceLevel;
use types::records::{EventKind, Record};

type FrameSender = mpsc::UnboundedSender<Result<String, IngestError>>;

/// Hands out pre-arranged connections in order; refuses once exhausted.
#[derive(Default)]
struct ScriptedConnector {
    connections: Mutex<VecDeque<FrameStream>>,
    urls: Mutex<Vec<String>>,
}

impl ScriptedConnector {
    fn push_connection(&self) -> FrameSender {
        let (tx, rx) = mpsc::unbounded_channel::<Result<String, IngestError>>();
        let frames = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item.map(Frame::Text), rx)) }).boxed();
        self.connections.lock().unwrap().push_back(frames);
        tx
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, url: &str) -> Result<FrameStream, IngestError> {
        self.urls.lock().unwrap().push(url.to_string());
        self.connections
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| IngestError::Connect("connection refused".into()))
    }
}

fn level(price: &str, qty: &str) -> PriceLevel {
    PriceLevel::new(price.parse().unwrap(), qty.parse().unwrap())
}

#[derive(Default)]
struct ScriptedSnapshots {
    queued: Mutex<HashMap<Instrument, VecDeque<u64>>>,
    calls: Mutex<usize>,
    latency: Mutex<Duration>,
    panic_next: AtomicBool,
}

impl ScriptedSnapshots {
    fn queue(&self, instrument: &Instrument, last_update_ids: &[u64]) {
        self.queued
            .lock()
            .unwrap()
            .entry(instrument.clone())
            .or_default()
            .extend(last_update_ids);
    }

    fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl SnapshotSource for ScriptedSnapshots {
    async fn fetch(&self, instrument: &Instrument, _depth: u32) -> Result<DepthSnapshot, SnapshotFetchError> {
        *self.calls.lock().unwrap() += 1;
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("snapshot source blew up");
        }
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            sleep(latency).await;
        }
        let next = self
            .queued
            .lock()
            .unwrap()
            .get_mut(instrument)
            .and_then(VecDeque::pop_front);
        match next {
            Some(last_update_id) => Ok(DepthSnapshot {
                last_update_id,
                bids: vec![level("100.0", "1.0")],
                asks: vec![level("101.0", "1.0")],
            }),
            None => Err(SnapshotFetchError::Status {
                instrument: instrument.clone(),
                status: 503,
            }),
        }
    }
}

#[derive(Default)]
struct RecordingAlerts {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlerts {
    fn count(&self, pred: impl Fn(&Alert) -> bool) -> usize {
        self.alerts.lock().unwrap().iter().filter(|a| pred(a)).count()
    }
}

impl AlertSink for RecordingAlerts {
    fn notify(&self, alert: Alert) {
        self.alerts.lock().unwrap().push(alert);
    }
}

struct Harness {
    connector: Arc<ScriptedConnector>,
    snapshots: Arc<ScriptedSnapshots>,
    buffer: Arc<EventBuffer>,
    tracker: Arc<IntegrityTracker>,
    alerts: Arc<RecordingAlerts>,
}

impl Harness {
    fn new(instruments: &[Instrument]) -> Self {
        Self {
            connector: Arc::new(ScriptedConnector::default()),
            snapshots: Arc::new(ScriptedSnapshots::default()),
            buffer: Arc::new(EventBuffer::new()),
            tracker: Arc::new(IntegrityTracker::new(instruments.iter().cloned(), market_data::clock::unix_nanos())),
            alerts: Arc::new(RecordingAlerts::default()),
        }
    }

    fn ingestor(&self, channel: ChannelKind, instruments: Vec<Instrument>, tune: impl FnOnce(&mut IngestorConfig)) -> StreamIngestor {
        let mut config = IngestorConfig::new(channel, "wss://example.invalid/stream", instruments);
        config.book = BookConfig {
            top_levels: 5,
            grace_period: Duration::ZERO,
        };
        config.read_timeout = Duration::from_millis(20);
        tune(&mut config);
        StreamIngestor::new(
            config,
            IngestorDeps {
                connector: self.connector.clone(),
                snapshots: self.snapshots.clone(),
                buffer: self.buffer.clone(),
                tracker: self.tracker.clone(),
                alerts: self.alerts.clone(),
            },
        )
    }

    fn book_records(&self) -> Vec<u64> {
        let drained = self.buffer.drain();
        drained
            .keyed
            .into_iter()
            .filter(|((_, kind), _)| *kind == EventKind::OrderBook)
            .flat_map(|(_, records)| records)
            .filter_map(|record| match record {
                Record::Book(book) => Some(book.last_update_id),
                _ => None,
            })
            .collect()
    }
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(10)).await;
    }
}

fn depth(first: u64, last: u64) -> String {
    format!(
        r#"{{"stream":"btcusdt@depth@100ms","data":{{"e":"depthUpdate","E":1700000000000,"s":"BTCUSDT","U":{first},"u":{last},"b":[["100.0","2.0"]],"a":[]}}}}"#
    )
}

fn btc() -> Instrument {
    Instrument::new("btcusdt")
}

#[tokio::test]
async fn test_gap_triggers_resync_and_stream_continues() {
    let h = Harness::new(&[btc()]);
    h.snapshots.queue(&btc(), &[100, 200]);
    let tx = h.connector.push_connection();

    let ingestor = h.ingestor(ChannelKind::Market, vec![btc()], |_| {});
    let mut state = ingestor.subscribe_state();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(ingestor.run(cancel.clone()));

    timeout(Duration::from_secs(5), state.wait_for(|s| *s == ConnectionState::Streaming))
        .await
        .unwrap()
        .unwrap();

    tx.send(Ok(depth(101, 101))).unwrap();
    wait_until("first diff applied", || h.buffer.len() == 1).await;
    assert_eq!(h.book_records(), vec![101]);

    tx.send(Ok(depth(150, 155))).unwrap();
    wait_until("gap resynced", || {
        h.alerts.count(|a| matches!(a, Alert::SequenceGap(_))) == 1 && !h.tracker.is_gap_open(&btc())
    })
    .await;
    assert_eq!(h.snapshots.calls(), 2);

    tx.send(Ok(depth(199, 201))).unwrap();
    wait_until("post-resync diff applied", || h.buffer.len() == 1).await;
    assert_eq!(h.book_records(), vec![201]);

    let stats = h.tracker.snapshot(Utc::now());
    assert_eq!(stats.gap_count, 1);
    assert_eq!(stats.gaps[0].expected_id, 102);
    assert_eq!(stats.message_counts.get(&btc()), Some(&3));

    cancel.cancel();
    timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_trades_and_malformed_frames() {
    let h = Harness::new(&[btc()]);
    h.snapshots.queue(&btc(), &[100]);
    let tx = h.connector.push_connection();

    let ingestor = h.ingestor(ChannelKind::Market, vec![btc()], |_| {});
    let cancel = CancellationToken::new();
    let task = tokio::spawn(ingestor.run(cancel.clone()));

    tx.send(Ok("not json".into())).unwrap();
    tx.send(Ok(r#"{"stream":"btcusdt@ticker","data":{}}"#.into())).unwrap();
    tx.send(Ok(
        r#"{"stream":"btcusdt@aggTrade","data":{"e":"aggTrade","E":1,"s":"BTCUSDT","a":5,"p":"100.5","q":"0.1","f":10,"l":11,"T":1700000000000,"m":true,"M":true}}"#.into(),
    ))
    .unwrap();

    wait_until("trade buffered", || h.buffer.len() == 1).await;
    let drained = h.buffer.drain();
    assert_eq!(drained.keyed[&(btc(), EventKind::Trade)].len(), 1);
    assert_eq!(h.alerts.count(|a| matches!(a, Alert::Disconnected { .. })), 0);

    cancel.cancel();
    timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_reconnect_reinitializes_and_reports_downtime() {
    let h = Harness::new(&[btc()]);
    h.snapshots.queue(&btc(), &[100, 300]);
    let first = h.connector.push_connection();
    let second = h.connector.push_connection();

    let ingestor = h.ingestor(ChannelKind::Market, vec![btc()], |_| {});
    let cancel = CancellationToken::new();
    let task = tokio::spawn(ingestor.run(cancel.clone()));

    first.send(Ok(depth(101, 101))).unwrap();
    wait_until("first diff applied", || h.buffer.len() == 1).await;
    drop(first);

    wait_until("reconnected", || h.alerts.count(|a| matches!(a, Alert::Reconnected { .. })) == 1).await;
    assert_eq!(h.alerts.count(|a| matches!(a, Alert::Disconnected { .. })), 1);
    assert_eq!(h.snapshots.calls(), 2);

    // Sequence state from the first connection no longer applies.
    second.send(Ok(depth(301, 302))).unwrap();
    wait_until("diff on new connection", || h.buffer.len() == 2).await;
    assert_eq!(h.book_records(), vec![101, 302]);

    let stats = h.tracker.snapshot(Utc::now());
    assert_eq!(stats.reconnect_count, 1);
    assert_eq!(stats.reconnects[0].channel, "market");
    assert!(stats.reconnects[0].reason.contains("closed"));
    let coverage = h.tracker.coverage_stats(market_data::clock::unix_nanos());
    assert!(coverage[&btc()].gap_seconds > 0.0);

    cancel.cancel();
    timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_liquidation_channel_has_no_books() {
    let h = Harness::new(&[btc()]);
    let tx = h.connector.push_connection();

    let ingestor = h.ingestor(ChannelKind::Liquidation, vec![btc()], |_| {});
    assert_eq!(ingestor.url(), "wss://example.invalid/stream?streams=btcusdt@forceOrder");
    let mut state = ingestor.subscribe_state();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(ingestor.run(cancel.clone()));

    timeout(Duration::from_secs(5), state.wait_for(|s| *s == ConnectionState::Streaming))
        .await
        .unwrap()
        .unwrap();
    tx.send(Ok(
        r#"{"stream":"btcusdt@forceOrder","data":{"e":"forceOrder","E":1,"o":{"s":"BTCUSDT","S":"SELL","o":"LIMIT","f":"IOC","q":"0.014","p":"9910","ap":"9910","X":"FILLED","l":"0.014","z":"0.014","T":1568014460893}}}"#.into(),
    ))
    .unwrap();

    wait_until("liquidation buffered", || h.buffer.len() == 1).await;
    assert_eq!(h.snapshots.calls(), 0);
    let drained = h.buffer.drain();
    assert!(drained.keyed.contains_key(&(btc(), EventKind::Liquidation)));

    cancel.cancel();
    timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_silent_connection_is_dropped_as_stale() {
    let h = Harness::new(&[btc()]);
    h.snapshots.queue(&btc(), &[100]);
    let _tx = h.connector.push_connection();

    let ingestor = h.ingestor(ChannelKind::Market, vec![btc()], |config| {
        config.stale_timeout = Duration::from_millis(100);
    });
    let cancel = CancellationToken::new();
    let task = tokio::spawn(ingestor.run(cancel.clone()));

    wait_until("stale disconnect", || {
        h.alerts.count(|a| matches!(a, Alert::Disconnected { reason, .. } if reason.contains("no message"))) == 1
    })
    .await;

    // Cancellation interrupts the backoff sleep.
    cancel.cancel();
    timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    assert!(h.connector.urls.lock().unwrap()[0].contains("btcusdt@depth@100ms"));
}

#[tokio::test]
async fn test_only_one_resync_in_flight_per_instrument() {
    let h = Harness::new(&[btc()]);
    h.snapshots.queue(&btc(), &[100, 200]);
    let tx = h.connector.push_connection();

    let ingestor = h.ingestor(ChannelKind::Market, vec![btc()], |_| {});
    let mut state = ingestor.subscribe_state();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(ingestor.run(cancel.clone()));

    timeout(Duration::from_secs(5), state.wait_for(|s| *s == ConnectionState::Streaming))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(h.snapshots.calls(), 1);

    h.snapshots.set_latency(Duration::from_millis(300));
    tx.send(Ok(depth(150, 155))).unwrap();
    // The book is uninitialized until the slow fetch lands; each of these
    // asks for a resync again.
    tx.send(Ok(depth(160, 165))).unwrap();
    tx.send(Ok(depth(170, 175))).unwrap();
    tx.send(Ok(depth(180, 185))).unwrap();

    wait_until("gap resynced", || {
        h.alerts.count(|a| matches!(a, Alert::SequenceGap(_))) == 1 && !h.tracker.is_gap_open(&btc())
    })
    .await;
    assert_eq!(h.snapshots.calls(), 2);
    assert_eq!(h.tracker.snapshot(Utc::now()).message_counts.get(&btc()), Some(&4));

    tx.send(Ok(depth(199, 201))).unwrap();
    wait_until("post-resync diff applied", || h.buffer.len() == 1).await;
    assert_eq!(h.book_records(), vec![201]);
    assert_eq!(h.snapshots.calls(), 2);

    cancel.cancel();
    timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
}

/// A local server that never sends data. With `server_pings` it pings every
/// 50 ms; otherwise it only reads, which answers the client's pings.
async fn quiet_server(server_pings: bool) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
        if server_pings {
            while ws.send(Message::Ping(Vec::new())).await.is_ok() {
                sleep(Duration::from_millis(50)).await;
            }
        } else {
            while let Some(Ok(_)) = ws.next().await {}
        }
    });
    format!("ws://{addr}/stream")
}

async fn assert_quiet_connection_survives(connector: WsConnector, server_pings: bool) {
    let h = Harness::new(&[btc()]);
    let mut config = IngestorConfig::new(ChannelKind::Liquidation, quiet_server(server_pings).await, vec![btc()]);
    config.read_timeout = Duration::from_millis(50);
    config.stale_timeout = Duration::from_millis(400);
    let ingestor = StreamIngestor::new(
        config,
        IngestorDeps {
            connector: Arc::new(connector),
            snapshots: h.snapshots.clone(),
            buffer: h.buffer.clone(),
            tracker: h.tracker.clone(),
            alerts: h.alerts.clone(),
        },
    );
    let mut state = ingestor.subscribe_state();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(ingestor.run(cancel.clone()));

    timeout(Duration::from_secs(5), state.wait_for(|s| *s == ConnectionState::Streaming))
        .await
        .unwrap()
        .unwrap();
    sleep(Duration::from_millis(1500)).await;

    assert_eq!(h.alerts.count(|a| matches!(a, Alert::Disconnected { .. })), 0);
    assert_eq!(*state.borrow(), ConnectionState::Streaming);
    assert_eq!(h.tracker.snapshot(Utc::now()).reconnect_count, 0);
    assert!(h.buffer.is_empty());

    cancel.cancel();
    timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_server_pings_keep_quiet_connection_alive() {
    // Client pings far apart, so only the server's pings count.
    assert_quiet_connection_survives(WsConnector::with_ping_interval(Duration::from_secs(3600)), true).await;
}

#[tokio::test]
async fn test_pongs_to_client_pings_keep_quiet_connection_alive() {
    assert_quiet_connection_survives(WsConnector::with_ping_interval(Duration::from_millis(100)), false).await;
}

#[tokio::test]
async fn test_panicked_resync_does_not_block_the_next_one() {
    let h = Harness::new(&[btc()]);
    h.snapshots.queue(&btc(), &[100]);
    let tx = h.connector.push_connection();

    let ingestor = h.ingestor(ChannelKind::Market, vec![btc()], |_| {});
    let mut state = ingestor.subscribe_state();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(ingestor.run(cancel.clone()));

    timeout(Duration::from_secs(5), state.wait_for(|s| *s == ConnectionState::Streaming))
        .await
        .unwrap()
        .unwrap();

    h.snapshots.queue(&btc(), &[300]);
    h.snapshots.panic_next.store(true, Ordering::SeqCst);
    tx.send(Ok(depth(150, 155))).unwrap();
    wait_until("resync attempted", || h.snapshots.calls() == 2).await;
    sleep(Duration::from_millis(50)).await;

    // Still uninitialized, so this asks for a fresh resync.
    tx.send(Ok(depth(160, 165))).unwrap();
    wait_until("second resync installed", || !h.tracker.is_gap_open(&btc())).await;
    assert_eq!(h.snapshots.calls(), 3);

    tx.send(Ok(depth(301, 301))).unwrap();
    wait_until("diff applied", || h.buffer.len() == 1).await;
    assert_eq!(h.book_records(), vec![301]);
    assert_eq!(h.alerts.count(|a| matches!(a, Alert::Disconnected { .. })), 0);

    cancel.cancel();
    timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
}
