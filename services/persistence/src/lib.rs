//! Persistence & Sync Service
//!
//! Turns drained buffer contents into immutable, checksummed Parquet files
//! and keeps the local data directory bounded:
//! - Stage-then-rename publishing, so no reader sees a partial file
//! - Append-only SHA-256 ledger (`checksums.json`)
//! - Interval and backpressure-triggered flushes
//! - Upload via rclone with retry, and age-based retention of uploaded files
//! - Startup sweep of staging artifacts left by a crash

pub mod atomic;
pub mod columnar;
pub mod ledger;
pub mod recovery;
pub mod sync;
pub mod writer;
