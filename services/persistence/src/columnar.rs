//! Parquet encoding of buffered records
//!
//! One schema per `EventKind`. Prices, quantities and rates are written as
//! their exchange decimal strings so no precision is lost; book sides are a
//! list of `{price, quantity}` structs, best level first.

use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanArray, Int64Array, ListArray, StringArray, StructArray, UInt64Array};
use arrow::buffer::OffsetBuffer;
use arrow::datatypes::{DataType, Field, FieldRef, Fields, Schema, SchemaRef};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::errors::ParquetError;
use parquet::file::properties::WriterProperties;
use thiserror::Error;

use types::numeric::PriceLevel;
use types::records::{BookSnapshot, CandleEvent, EventKind, FundingEvent, LiquidationEvent, Record, TradeEvent};

pub const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("parquet error: {0}")]
    Parquet(#[from] ParquetError),

    #[error("{found} record in a {expected} group")]
    MixedKinds { expected: EventKind, found: EventKind },
}

fn level_fields() -> Fields {
    Fields::from(vec![
        Field::new("price", DataType::Utf8, false),
        Field::new("quantity", DataType::Utf8, false),
    ])
}

fn level_item() -> FieldRef {
    Arc::new(Field::new("item", DataType::Struct(level_fields()), false))
}

fn utf8(name: &str) -> Field {
    Field::new(name, DataType::Utf8, false)
}

fn int64(name: &str) -> Field {
    Field::new(name, DataType::Int64, false)
}

fn uint64(name: &str) -> Field {
    Field::new(name, DataType::UInt64, false)
}

/// Column layout for `kind`.
pub fn schema_for(kind: EventKind) -> SchemaRef {
    let fields = match kind {
        EventKind::OrderBook => vec![
            utf8("instrument"),
            int64("exchange_event_time"),
            int64("local_receive_time"),
            uint64("last_update_id"),
            Field::new("bids", DataType::List(level_item()), false),
            Field::new("asks", DataType::List(level_item()), false),
        ],
        EventKind::Trade => vec![
            utf8("instrument"),
            uint64("agg_trade_id"),
            utf8("price"),
            utf8("quantity"),
            uint64("first_trade_id"),
            uint64("last_trade_id"),
            int64("trade_time"),
            int64("local_receive_time"),
            Field::new("is_buyer_maker", DataType::Boolean, false),
        ],
        EventKind::Kline => vec![
            utf8("instrument"),
            int64("open_time"),
            int64("close_time"),
            utf8("open"),
            utf8("high"),
            utf8("low"),
            utf8("close"),
            utf8("volume"),
            utf8("quote_volume"),
            uint64("trade_count"),
            int64("local_receive_time"),
        ],
        EventKind::Liquidation => vec![
            utf8("instrument"),
            utf8("side"),
            utf8("order_type"),
            utf8("price"),
            utf8("quantity"),
            int64("trade_time"),
            int64("local_receive_time"),
        ],
        EventKind::Funding => vec![
            utf8("instrument"),
            utf8("funding_rate"),
            int64("funding_time"),
            int64("next_funding_time"),
            int64("local_receive_time"),
        ],
    };
    Arc::new(Schema::new(fields))
}

fn writer_properties() -> Result<WriterProperties, ParquetError> {
    Ok(WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::try_new(ZSTD_LEVEL)?))
        .build())
}

/// Encode a group of same-kind records into a complete Parquet file image.
pub fn encode(kind: EventKind, records: &[Record]) -> Result<Vec<u8>, EncodeError> {
    let batch = record_batch(kind, records)?;
    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), Some(writer_properties()?))?;
    writer.write(&batch)?;
    Ok(writer.into_inner()?)
}

pub fn record_batch(kind: EventKind, records: &[Record]) -> Result<RecordBatch, EncodeError> {
    let schema = schema_for(kind);
    let columns = match kind {
        EventKind::OrderBook => book_columns(&pick(kind, records, |r| match r {
            Record::Book(b) => Some(b),
            _ => None,
        })?)?,
        EventKind::Trade => trade_columns(&pick(kind, records, |r| match r {
            Record::Trade(t) => Some(t),
            _ => None,
        })?),
        EventKind::Kline => kline_columns(&pick(kind, records, |r| match r {
            Record::Kline(k) => Some(k),
            _ => None,
        })?),
        EventKind::Liquidation => liquidation_columns(&pick(kind, records, |r| match r {
            Record::Liquidation(l) => Some(l),
            _ => None,
        })?),
        EventKind::Funding => funding_columns(&pick(kind, records, |r| match r {
            Record::Funding(f) => Some(f),
            _ => None,
        })?),
    };
    Ok(RecordBatch::try_new(schema, columns)?)
}

fn pick<'a, T>(
    expected: EventKind,
    records: &'a [Record],
    f: impl Fn(&'a Record) -> Option<&'a T>,
) -> Result<Vec<&'a T>, EncodeError> {
    records
        .iter()
        .map(|record| {
            f(record).ok_or(EncodeError::MixedKinds {
                expected,
                found: record.kind(),
            })
        })
        .collect()
}

fn strings<T>(rows: &[&T], f: impl Fn(&T) -> String) -> ArrayRef {
    Arc::new(StringArray::from_iter_values(rows.iter().map(|r| f(r))))
}

fn i64s<T>(rows: &[&T], f: impl Fn(&T) -> i64) -> ArrayRef {
    Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| f(r))))
}

fn u64s<T>(rows: &[&T], f: impl Fn(&T) -> u64) -> ArrayRef {
    Arc::new(UInt64Array::from_iter_values(rows.iter().map(|r| f(r))))
}

fn level_list<'a>(sides: impl Iterator<Item = &'a [PriceLevel]>) -> Result<ArrayRef, ArrowError> {
    let mut lengths = Vec::new();
    let mut prices = Vec::new();
    let mut quantities = Vec::new();
    for levels in sides {
        lengths.push(levels.len());
        for level in levels {
            prices.push(level.price.to_string());
            quantities.push(level.quantity.to_string());
        }
    }
    let values = StructArray::try_new(
        level_fields(),
        vec![
            Arc::new(StringArray::from(prices)) as ArrayRef,
            Arc::new(StringArray::from(quantities)) as ArrayRef,
        ],
        None,
    )?;
    let list = ListArray::try_new(level_item(), OffsetBuffer::from_lengths(lengths), Arc::new(values), None)?;
    Ok(Arc::new(list))
}

fn book_columns(rows: &[&BookSnapshot]) -> Result<Vec<ArrayRef>, ArrowError> {
    Ok(vec![
        strings(rows, |r| r.instrument.to_string()),
        i64s(rows, |r| r.exchange_event_time),
        i64s(rows, |r| r.local_receive_time),
        u64s(rows, |r| r.last_update_id),
        level_list(rows.iter().map(|r| r.bids.as_slice()))?,
        level_list(rows.iter().map(|r| r.asks.as_slice()))?,
    ])
}

fn trade_columns(rows: &[&TradeEvent]) -> Vec<ArrayRef> {
    vec![
        strings(rows, |r| r.instrument.to_string()),
        u64s(rows, |r| r.agg_trade_id),
        strings(rows, |r| r.price.to_string()),
        strings(rows, |r| r.quantity.to_string()),
        u64s(rows, |r| r.first_trade_id),
        u64s(rows, |r| r.last_trade_id),
        i64s(rows, |r| r.trade_time),
        i64s(rows, |r| r.local_receive_time),
        Arc::new(BooleanArray::from(rows.iter().map(|r| r.is_buyer_maker).collect::<Vec<_>>())),
    ]
}

fn kline_columns(rows: &[&CandleEvent]) -> Vec<ArrayRef> {
    vec![
        strings(rows, |r| r.instrument.to_string()),
        i64s(rows, |r| r.open_time),
        i64s(rows, |r| r.close_time),
        strings(rows, |r| r.open.to_string()),
        strings(rows, |r| r.high.to_string()),
        strings(rows, |r| r.low.to_string()),
        strings(rows, |r| r.close.to_string()),
        strings(rows, |r| r.volume.to_string()),
        strings(rows, |r| r.quote_volume.to_string()),
        u64s(rows, |r| r.trade_count),
        i64s(rows, |r| r.local_receive_time),
    ]
}

fn liquidation_columns(rows: &[&LiquidationEvent]) -> Vec<ArrayRef> {
    vec![
        strings(rows, |r| r.instrument.to_string()),
        strings(rows, |r| r.side.as_str().to_string()),
        strings(rows, |r| r.order_type.clone()),
        strings(rows, |r| r.price.to_string()),
        strings(rows, |r| r.quantity.to_string()),
        i64s(rows, |r| r.trade_time),
        i64s(rows, |r| r.local_receive_time),
    ]
}

fn funding_columns(rows: &[&FundingEvent]) -> Vec<ArrayRef> {
    vec![
        strings(rows, |r| r.instrument.to_string()),
        strings(rows, |r| r.funding_rate.to_string()),
        i64s(rows, |r| r.funding_time),
        i64s(rows, |r| r.next_funding_time),
        i64s(rows, |r| r.local_receive_time),
    ]
}
