//! Market Data Collection
//!
//! Consumes the exchange's public combined streams and produces validated,
//! dual-timestamped records ready for persistence:
//! - Order book reconstruction from snapshot plus diff replay
//! - Aggregate trades, closed 1m candles, liquidations
//! - Funding rates polled over REST
//! - Data-integrity accounting (gaps, reconnects, coverage)
//!
//! # Architecture
//!
//! ```text
//!  combined stream (market)     combined stream (liquidation)
//!          │                              │
//!   ┌──────▼───────┐               ┌──────▼───────┐
//!   │StreamIngestor│               │StreamIngestor│
//!   └──┬────────┬──┘               └──────┬───────┘
//!      │        │                         │
//! ┌────▼────┐   │    ┌───────────────┐    │
//! │  Book   │   │    │FundingPoller  │    │
//! │Recon.   │   │    └───────┬───────┘    │
//! └────┬────┘   │            │            │
//!   ┌──▼────────▼────────────▼────────────▼──┐
//!   │              EventBuffer               │
//!   └────────────────────────────────────────┘
//!              (drained by persistence)
//! ```
//!
//! `IntegrityTracker` is shared by every component that can observe a gap,
//! a reconnect, a flush or a sync outcome.

pub mod alerts;
pub mod backoff;
pub mod buffer;
pub mod clock;
pub mod events;
pub mod funding;
pub mod ingestion;
pub mod integrity;
pub mod order_book;
pub mod snapshot;
pub mod websocket;

pub const SERVICE_VERSION: &str = "0.1.0";
