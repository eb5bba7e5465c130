//! Wire frames from the combined-stream endpoint
//!
//! Every frame arrives wrapped as `{"stream": "<tag>", "data": {...}}`. The
//! tag names the instrument and the channel (`btcusdt@depth@100ms`,
//! `btcusdt@aggTrade`, `btcusdt@kline_1m`, `btcusdt@forceOrder`); the payload
//! shape depends on the channel.
//!
//! Decoding produces either a `DepthDiff` (consumed by the book
//! reconstructor) or a finished `Record` that goes straight to the buffer.

use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

use types::ids::Instrument;
use types::numeric::{Price, PriceLevel, Quantity};
use types::records::{CandleEvent, LiquidationEvent, Record, Side, TradeEvent};

/// Errors decoding a single frame. Never fatal to the connection.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unrecognised stream tag: {0:?}")]
    UnknownStream(String),
}

/// Channel named by a stream tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Depth,
    AggTrade,
    Kline,
    ForceOrder,
}

impl StreamKind {
    /// Split a stream tag into its instrument and channel.
    pub fn parse(tag: &str) -> Option<(Instrument, StreamKind)> {
        let (symbol, channel) = tag.split_once('@')?;
        if symbol.is_empty() {
            return None;
        }
        let kind = if channel.starts_with("depth") {
            StreamKind::Depth
        } else if channel == "aggTrade" {
            StreamKind::AggTrade
        } else if channel.starts_with("kline") {
            StreamKind::Kline
        } else if channel == "forceOrder" {
            StreamKind::ForceOrder
        } else {
            return None;
        };
        Some((Instrument::new(symbol), kind))
    }
}

/// Incremental order-book update covering the id range `[U, u]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepthDiff {
    pub instrument: Instrument,
    /// Exchange event time (ms).
    pub exchange_event_time: i64,
    /// Local receive time (Unix nanos).
    pub local_receive_time: i64,
    pub first_update_id: u64,
    pub final_update_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

#[derive(Debug, Deserialize)]
struct StreamFrame {
    stream: String,
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct DepthUpdate {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "U")]
    first_update_id: u64,
    #[serde(rename = "u")]
    final_update_id: u64,
    #[serde(rename = "b")]
    bids: Vec<(Price, Quantity)>,
    #[serde(rename = "a")]
    asks: Vec<(Price, Quantity)>,
}

#[derive(Debug, Deserialize)]
struct AggTrade {
    #[serde(rename = "a")]
    agg_trade_id: u64,
    #[serde(rename = "p")]
    price: Price,
    #[serde(rename = "q")]
    quantity: Quantity,
    #[serde(rename = "f")]
    first_trade_id: u64,
    #[serde(rename = "l")]
    last_trade_id: u64,
    #[serde(rename = "T")]
    trade_time: i64,
    #[serde(rename = "m")]
    is_buyer_maker: bool,
}

#[derive(Debug, Deserialize)]
struct KlineFrame {
    #[serde(rename = "k")]
    kline: KlineBody,
}

#[derive(Debug, Deserialize)]
struct KlineBody {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "T")]
    close_time: i64,
    #[serde(rename = "o")]
    open: Price,
    #[serde(rename = "h")]
    high: Price,
    #[serde(rename = "l")]
    low: Price,
    #[serde(rename = "c")]
    close: Price,
    #[serde(rename = "v")]
    volume: Quantity,
    #[serde(rename = "q")]
    quote_volume: Decimal,
    #[serde(rename = "n")]
    trade_count: u64,
    #[serde(rename = "x")]
    is_closed: bool,
}

#[derive(Debug, Deserialize)]
struct ForceOrderFrame {
    #[serde(rename = "o")]
    order: ForceOrderBody,
}

#[derive(Debug, Deserialize)]
struct ForceOrderBody {
    #[serde(rename = "S")]
    side: Side,
    #[serde(rename = "o")]
    order_type: String,
    #[serde(rename = "p")]
    price: Price,
    #[serde(rename = "q")]
    quantity: Quantity,
    #[serde(rename = "T")]
    trade_time: i64,
}

fn levels(raw: Vec<(Price, Quantity)>) -> Vec<PriceLevel> {
    raw.into_iter().map(|(p, q)| PriceLevel::new(p, q)).collect()
}

/// What a decoded frame carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramePayload {
    Depth(DepthDiff),
    Record(Record),
    /// Well-formed but not recorded (a candle that is still open).
    Skipped,
}

/// A decoded frame, keyed by the instrument in its stream tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub instrument: Instrument,
    pub kind: StreamKind,
    pub payload: FramePayload,
}

/// Decode one text frame received at `local_receive_time` (Unix nanos).
pub fn decode_frame(text: &str, local_receive_time: i64) -> Result<DecodedFrame, FrameError> {
    let frame: StreamFrame = serde_json::from_str(text)?;
    let (instrument, kind) =
        StreamKind::parse(&frame.stream).ok_or_else(|| FrameError::UnknownStream(frame.stream.clone()))?;

    let payload = match kind {
        StreamKind::Depth => {
            let update: DepthUpdate = serde_json::from_value(frame.data)?;
            FramePayload::Depth(DepthDiff {
                instrument: instrument.clone(),
                exchange_event_time: update.event_time,
                local_receive_time,
                first_update_id: update.first_update_id,
                final_update_id: update.final_update_id,
                bids: levels(update.bids),
                asks: levels(update.asks),
            })
        }
        StreamKind::AggTrade => {
            let trade: AggTrade = serde_json::from_value(frame.data)?;
            FramePayload::Record(Record::Trade(TradeEvent {
                instrument: instrument.clone(),
                agg_trade_id: trade.agg_trade_id,
                price: trade.price,
                quantity: trade.quantity,
                first_trade_id: trade.first_trade_id,
                last_trade_id: trade.last_trade_id,
                trade_time: trade.trade_time,
                local_receive_time,
                is_buyer_maker: trade.is_buyer_maker,
            }))
        }
        StreamKind::Kline => {
            let KlineFrame { kline } = serde_json::from_value(frame.data)?;
            if !kline.is_closed {
                FramePayload::Skipped
            } else {
                FramePayload::Record(Record::Kline(CandleEvent {
                    instrument: instrument.clone(),
                    open_time: kline.open_time,
                    close_time: kline.close_time,
                    open: kline.open,
                    high: kline.high,
                    low: kline.low,
                    close: kline.close,
                    volume: kline.volume,
                    quote_volume: kline.quote_volume,
                    trade_count: kline.trade_count,
                    local_receive_time,
                }))
            }
        }
        StreamKind::ForceOrder => {
            let ForceOrderFrame { order } = serde_json::from_value(frame.data)?;
            FramePayload::Record(Record::Liquidation(LiquidationEvent {
                instrument: instrument.clone(),
                side: order.side,
                order_type: order.order_type,
                price: order.price,
                quantity: order.quantity,
                trade_time: order.trade_time,
                local_receive_time,
            }))
        }
    };

    Ok(DecodedFrame {
        instrument,
        kind,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::records::EventKind;

    const DEPTH: &str = r#"{"stream":"btcusdt@depth@100ms","data":{"e":"depthUpdate","E":1700000000123,"s":"BTCUSDT","U":101,"u":103,"b":[["100.10","1.5"],["99.00","0.00000000"]],"a":[["101.00","2"]]}}"#;

    #[test]
    fn test_stream_tag_parsing() {
        let (inst, kind) = StreamKind::parse("ethusdt@kline_1m").unwrap();
        assert_eq!(inst.as_str(), "ETHUSDT");
        assert_eq!(kind, StreamKind::Kline);
        assert_eq!(StreamKind::parse("btcusdt@forceOrder").unwrap().1, StreamKind::ForceOrder);
        assert!(StreamKind::parse("btcusdt@ticker").is_none());
        assert!(StreamKind::parse("nochannel").is_none());
    }

    #[test]
    fn test_decode_depth_diff() {
        let frame = decode_frame(DEPTH, 42).unwrap();
        let FramePayload::Depth(diff) = frame.payload else {
            panic!("expected depth diff");
        };
        assert_eq!(diff.instrument.as_str(), "BTCUSDT");
        assert_eq!(diff.first_update_id, 101);
        assert_eq!(diff.final_update_id, 103);
        assert_eq!(diff.exchange_event_time, 1_700_000_000_123);
        assert_eq!(diff.local_receive_time, 42);
        assert_eq!(diff.bids.len(), 2);
        assert!(diff.bids[1].quantity.is_zero());
    }

    #[test]
    fn test_decode_agg_trade() {
        let text = r#"{"stream":"btcusdt@aggTrade","data":{"e":"aggTrade","E":1,"s":"BTCUSDT","a":5,"p":"100.5","q":"0.1","f":10,"l":11,"T":1700000000000,"m":true,"M":true}}"#;
        let frame = decode_frame(text, 7).unwrap();
        let FramePayload::Record(record) = frame.payload else {
            panic!("expected record");
        };
        assert_eq!(record.kind(), EventKind::Trade);
        assert_eq!(record.exchange_time(), 1_700_000_000_000);
        assert_eq!(record.local_receive_time(), 7);
    }

    #[test]
    fn test_open_kline_is_skipped() {
        let open = r#"{"stream":"btcusdt@kline_1m","data":{"e":"kline","E":1,"s":"BTCUSDT","k":{"t":0,"T":59999,"s":"BTCUSDT","i":"1m","o":"1","h":"2","l":"0.5","c":"1.5","v":"10","q":"15","n":3,"x":false}}}"#;
        assert_eq!(decode_frame(open, 1).unwrap().payload, FramePayload::Skipped);

        let closed = open.replace("\"x\":false", "\"x\":true");
        let frame = decode_frame(&closed, 1).unwrap();
        assert!(matches!(frame.payload, FramePayload::Record(Record::Kline(ref c)) if c.trade_count == 3));
    }

    #[test]
    fn test_decode_force_order() {
        let text = r#"{"stream":"btcusdt@forceOrder","data":{"e":"forceOrder","E":1,"o":{"s":"BTCUSDT","S":"SELL","o":"LIMIT","f":"IOC","q":"0.014","p":"9910","ap":"9910","X":"FILLED","l":"0.014","z":"0.014","T":1568014460893}}}"#;
        let frame = decode_frame(text, 3).unwrap();
        let FramePayload::Record(Record::Liquidation(liq)) = frame.payload else {
            panic!("expected liquidation");
        };
        assert_eq!(liq.side, Side::Sell);
        assert_eq!(liq.order_type, "LIMIT");
        assert_eq!(liq.trade_time, 1_568_014_460_893);
    }

    #[test]
    fn test_malformed_frames_are_errors() {
        assert!(matches!(decode_frame("not json", 1), Err(FrameError::Json(_))));
        assert!(matches!(
            decode_frame(r#"{"stream":"btcusdt@ticker","data":{}}"#, 1),
            Err(FrameError::UnknownStream(_))
        ));
        assert!(decode_frame(r#"{"result":null,"id":1}"#, 1).is_err());
    }
}
