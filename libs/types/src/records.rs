//! Market-data records buffered in memory and persisted to disk
//!
//! Every record carries two clocks: the exchange-assigned time (exchange
//! milliseconds) and the local receive time (Unix nanoseconds). The local
//! receive time must be strictly positive; `Record::validate` enforces it
//! before anything is buffered.

use std::fmt;
use std::mem::size_of;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::RecordError;
use crate::ids::Instrument;
use crate::numeric::{Price, PriceLevel, Quantity};

/// Record families. Each gets its own file per instrument and flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    OrderBook,
    Trade,
    Kline,
    Liquidation,
    Funding,
}

impl EventKind {
    /// Label used in file names and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::OrderBook => "orderbook",
            EventKind::Trade => "trade",
            EventKind::Kline => "kline",
            EventKind::Liquidation => "liquidation",
            EventKind::Funding => "funding_rate",
        }
    }

    /// Kinds that are keyed per instrument in the buffer.
    pub const PER_INSTRUMENT: [EventKind; 4] = [
        EventKind::OrderBook,
        EventKind::Trade,
        EventKind::Kline,
        EventKind::Liquidation,
    ];
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggressor side of a liquidation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl FromStr for Side {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" | "buy" => Ok(Side::Buy),
            "SELL" | "sell" => Ok(Side::Sell),
            other => Err(RecordError::InvalidSide(other.to_string())),
        }
    }
}

/// Top-N view of a reconstructed book after a diff was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub instrument: Instrument,
    /// Exchange event time of the diff that produced this view (ms).
    pub exchange_event_time: i64,
    /// Local receive time of that diff (Unix nanos).
    pub local_receive_time: i64,
    pub last_update_id: u64,
    /// Highest price first.
    pub bids: Vec<PriceLevel>,
    /// Lowest price first.
    pub asks: Vec<PriceLevel>,
}

/// Aggregated trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub instrument: Instrument,
    pub agg_trade_id: u64,
    pub price: Price,
    pub quantity: Quantity,
    pub first_trade_id: u64,
    pub last_trade_id: u64,
    /// Exchange trade time (ms).
    pub trade_time: i64,
    pub local_receive_time: i64,
    pub is_buyer_maker: bool,
}

/// Closed one-minute candle. Open candles are never recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandleEvent {
    pub instrument: Instrument,
    pub open_time: i64,
    pub close_time: i64,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    pub volume: Quantity,
    pub quote_volume: Decimal,
    pub trade_count: u64,
    pub local_receive_time: i64,
}

/// Forced liquidation order observed on the futures channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationEvent {
    pub instrument: Instrument,
    pub side: Side,
    pub order_type: String,
    pub price: Price,
    pub quantity: Quantity,
    pub trade_time: i64,
    pub local_receive_time: i64,
}

/// Funding-rate observation from the premium index endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingEvent {
    pub instrument: Instrument,
    pub funding_rate: Decimal,
    /// Exchange time of the observation (ms).
    pub funding_time: i64,
    pub next_funding_time: i64,
    pub local_receive_time: i64,
}

/// Closed set of everything the buffer accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    Book(BookSnapshot),
    Trade(TradeEvent),
    Kline(CandleEvent),
    Liquidation(LiquidationEvent),
    Funding(FundingEvent),
}

impl Record {
    pub fn kind(&self) -> EventKind {
        match self {
            Record::Book(_) => EventKind::OrderBook,
            Record::Trade(_) => EventKind::Trade,
            Record::Kline(_) => EventKind::Kline,
            Record::Liquidation(_) => EventKind::Liquidation,
            Record::Funding(_) => EventKind::Funding,
        }
    }

    pub fn instrument(&self) -> &Instrument {
        match self {
            Record::Book(r) => &r.instrument,
            Record::Trade(r) => &r.instrument,
            Record::Kline(r) => &r.instrument,
            Record::Liquidation(r) => &r.instrument,
            Record::Funding(r) => &r.instrument,
        }
    }

    /// Exchange-assigned timestamp (ms).
    pub fn exchange_time(&self) -> i64 {
        match self {
            Record::Book(r) => r.exchange_event_time,
            Record::Trade(r) => r.trade_time,
            Record::Kline(r) => r.close_time,
            Record::Liquidation(r) => r.trade_time,
            Record::Funding(r) => r.funding_time,
        }
    }

    /// Local receive timestamp (Unix nanos).
    pub fn local_receive_time(&self) -> i64 {
        match self {
            Record::Book(r) => r.local_receive_time,
            Record::Trade(r) => r.local_receive_time,
            Record::Kline(r) => r.local_receive_time,
            Record::Liquidation(r) => r.local_receive_time,
            Record::Funding(r) => r.local_receive_time,
        }
    }

    /// Enforce the dual-timestamp invariant.
    pub fn validate(&self) -> Result<(), RecordError> {
        let value = self.local_receive_time();
        if value <= 0 {
            return Err(RecordError::NonPositiveReceiveTime {
                kind: self.kind().as_str(),
                instrument: self.instrument().to_string(),
                value,
            });
        }
        Ok(())
    }

    /// Approximate in-memory footprint, used only as a backpressure signal.
    pub fn estimated_size(&self) -> usize {
        let heap = match self {
            Record::Book(r) => (r.bids.len() + r.asks.len()) * size_of::<PriceLevel>(),
            Record::Liquidation(r) => r.order_type.len(),
            Record::Trade(_) | Record::Kline(_) | Record::Funding(_) => 0,
        };
        size_of::<Record>() + self.instrument().as_str().len() + heap
    }
}

impl From<BookSnapshot> for Record {
    fn from(value: BookSnapshot) -> Self {
        Record::Book(value)
    }
}

impl From<TradeEvent> for Record {
    fn from(value: TradeEvent) -> Self {
        Record::Trade(value)
    }
}

impl From<CandleEvent> for Record {
    fn from(value: CandleEvent) -> Self {
        Record::Kline(value)
    }
}

impl From<LiquidationEvent> for Record {
    fn from(value: LiquidationEvent) -> Self {
        Record::Liquidation(value)
    }
}

impl From<FundingEvent> for Record {
    fn from(value: FundingEvent) -> Self {
        Record::Funding(value)
    }
}
