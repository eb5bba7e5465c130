//! Types library for the market-data collector
//!
//! Shared type definitions used by ingestion, persistence and the collector
//! binary.
//!
//! # Modules
//! - `ids`: Instrument symbols (case-normalized)
//! - `numeric`: Exact decimal types (Price, Quantity, PriceLevel)
//! - `records`: Buffered market-data records and their kinds
//! - `errors`: Error taxonomy

pub mod ids;
pub mod numeric;
pub mod records;
pub mod errors;
