//! WebSocket transport for the combined-stream endpoints
//!
//! Two channels are consumed:
//! - `Market`: `{sym}@depth@100ms`, `{sym}@aggTrade`, `{sym}@kline_1m`
//! - `Liquidation`: `{sym}@forceOrder` on the futures endpoint
//!
//! The `Connector` seam hands the ingestor a plain stream of frames so the
//! state machine can be driven by an in-memory fake in tests. Control frames
//! surface as `Frame::Heartbeat`: a quiet channel that is still being pinged
//! is alive.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::future;
use futures_util::stream::{BoxStream, StreamExt};
use futures_util::SinkExt;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use types::ids::Instrument;

use crate::ingestion::IngestError;

/// One inbound item worth telling the ingestor about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    /// Ping or pong from the peer. Carries no data but proves liveness.
    Heartbeat,
}

impl From<String> for Frame {
    fn from(text: String) -> Self {
        Frame::Text(text)
    }
}

/// Frames from one connection. The stream ends when the peer closes.
pub type FrameStream = BoxStream<'static, Result<Frame, IngestError>>;

/// Which combined stream a connection carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Market,
    Liquidation,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Market => "market",
            ChannelKind::Liquidation => "liquidation",
        }
    }

    /// Whether this channel carries depth diffs and so owns order books.
    pub fn owns_books(&self) -> bool {
        matches!(self, ChannelKind::Market)
    }

    /// Stream tags subscribed for `instruments`.
    pub fn streams(&self, instruments: &[Instrument]) -> Vec<String> {
        instruments
            .iter()
            .flat_map(|instrument| {
                let sym = instrument.stream_name();
                match self {
                    ChannelKind::Market => vec![
                        format!("{sym}@depth@100ms"),
                        format!("{sym}@aggTrade"),
                        format!("{sym}@kline_1m"),
                    ],
                    ChannelKind::Liquidation => vec![format!("{sym}@forceOrder")],
                }
            })
            .collect()
    }

    /// Combined-stream URL: `{base}?streams=a/b/c`.
    pub fn url(&self, base: &str, instruments: &[Instrument]) -> String {
        format!(
            "{}?streams={}",
            base.trim_end_matches('/'),
            self.streams(instruments).join("/")
        )
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<FrameStream, IngestError>;
}

/// Interval between client pings. The peer's pongs keep a quiet channel
/// (liquidations can go minutes without an event) from looking stale.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(20);

/// tokio-tungstenite connector. Sends a ping every `ping_interval`; pings and
/// pongs from the peer are reported as heartbeats (the library answers pings
/// itself). Binary frames are dropped and a close frame ends the stream.
#[derive(Debug, Clone, Copy)]
pub struct WsConnector {
    ping_interval: Duration,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::with_ping_interval(DEFAULT_PING_INTERVAL)
    }
}

impl WsConnector {
    pub fn with_ping_interval(ping_interval: Duration) -> Self {
        Self { ping_interval }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<FrameStream, IngestError> {
        let (ws, response) = connect_async(url)
            .await
            .map_err(|e| IngestError::Connect(e.to_string()))?;
        info!(url, status = response.status().as_u16(), "WebSocket connected");

        let (mut sink, read) = ws.split();
        let stop = CancellationToken::new();
        let pinger_stop = stop.clone();
        let every = self.ping_interval;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = pinger_stop.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                            debug!(error = %e, "Keepalive ping failed, stopping pinger");
                            break;
                        }
                    }
                }
            }
        });

        // The pinger stops once the frame stream is dropped.
        let guard = stop.drop_guard();
        let frames = read
            .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
            .filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Text(text)) => Some(Ok(Frame::Text(text))),
                    Ok(Message::Ping(_) | Message::Pong(_)) => Some(Ok(Frame::Heartbeat)),
                    Ok(other) => {
                        debug!(kind = frame_kind(&other), "Ignoring non-text frame");
                        None
                    }
                    Err(e) => Some(Err(IngestError::Transport(e.to_string()))),
                })
            })
            .map(move |item| {
                let _pinger = &guard;
                item
            });
        Ok(frames.boxed())
    }
}

fn frame_kind(msg: &Message) -> &'static str {
    match msg {
        Message::Text(_) => "text",
        Message::Binary(_) => "binary",
        Message::Ping(_) => "ping",
        Message::Pong(_) => "pong",
        Message::Close(_) => "close",
        Message::Frame(_) => "raw",
    }
}
