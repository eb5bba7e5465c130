//! Order book reconstruction from a snapshot plus ordered diff replay
//!
//! Each instrument's book starts from a point-in-time snapshot carrying a
//! `lastUpdateId` cursor. Diffs cover an id range `[first, final]`; a diff is
//! applied only when it bridges the cursor (`first <= last + 1 <= final`).
//!
//! - A diff entirely at or behind the cursor is stale and ignored.
//! - A non-bridging diff shortly after initialization is tolerated while the
//!   snapshot and the stream converge (grace period).
//! - Any other non-bridging diff is a sequence gap: the book is marked
//!   uninitialized and must be re-synchronized from a fresh snapshot.
//!
//! Levels are kept in `BTreeMap`s keyed by exact decimal price, so top-N
//! extraction is a bounded iteration with no sorting.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use types::ids::Instrument;
use types::numeric::{Price, PriceLevel, Quantity};
use types::records::BookSnapshot;

use crate::events::DepthDiff;
use crate::snapshot::{DepthSnapshot, SnapshotFetchError, SnapshotSource};

/// Default tolerance window after (re)initialization.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum BookError {
    #[error("instrument {0} is not tracked")]
    UnknownInstrument(Instrument),

    #[error(transparent)]
    Snapshot(#[from] SnapshotFetchError),
}

/// A detected sequence gap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapRecord {
    pub instrument: Instrument,
    /// The id the book needed next (`last_update_id + 1`).
    pub expected_id: u64,
    /// First id covered by the offending diff.
    pub actual_first_id: u64,
    /// Final id covered by the offending diff.
    pub actual_final_id: u64,
    /// Local receive time of the offending diff (Unix nanos).
    pub detected_at: i64,
}

/// Outcome of feeding one diff to the reconstructor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffOutcome {
    /// Diff applied; carries the top-N view after the update.
    Applied(BookSnapshot),
    /// Diff ends at or before the cursor. No-op.
    Stale,
    /// Diff did not bridge the cursor, but the book was initialized too
    /// recently to call it a gap. No-op.
    WithinGrace,
    /// Genuine gap. The book is now uninitialized.
    Gap(GapRecord),
    /// The book is waiting for a snapshot. No-op.
    NotInitialized,
    /// The diff names an instrument this reconstructor does not track.
    UnknownInstrument,
}

/// Continuity predicate: does `[first, final]` bridge `last_applied`?
pub fn bridges(first_update_id: u64, final_update_id: u64, last_applied: u64) -> bool {
    let expected = last_applied.saturating_add(1);
    first_update_id <= expected && expected <= final_update_id
}

/// Book state for a single instrument.
#[derive(Debug, Clone, Default)]
pub struct BookState {
    bids: BTreeMap<Price, Quantity>,
    asks: BTreeMap<Price, Quantity>,
    last_update_id: u64,
    initialized: bool,
    /// Unix nanos at which the current snapshot was installed.
    initialized_at: i64,
}

impl BookState {
    fn install(&mut self, snapshot: DepthSnapshot, now: i64) {
        self.bids = side_from_levels(snapshot.bids);
        self.asks = side_from_levels(snapshot.asks);
        self.last_update_id = snapshot.last_update_id;
        self.initialized = true;
        self.initialized_at = now;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    pub fn initialized_at(&self) -> i64 {
        self.initialized_at
    }

    pub fn bid_depth(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_depth(&self) -> usize {
        self.asks.len()
    }

    /// Best `n` bids, highest price first.
    pub fn top_bids(&self, n: usize) -> Vec<PriceLevel> {
        self.bids
            .iter()
            .rev()
            .take(n)
            .map(|(p, q)| PriceLevel::new(*p, *q))
            .collect()
    }

    /// Best `n` asks, lowest price first.
    pub fn top_asks(&self, n: usize) -> Vec<PriceLevel> {
        self.asks
            .iter()
            .take(n)
            .map(|(p, q)| PriceLevel::new(*p, *q))
            .collect()
    }

    pub fn quantity_at_bid(&self, price: &Price) -> Option<Quantity> {
        self.bids.get(price).copied()
    }

    pub fn quantity_at_ask(&self, price: &Price) -> Option<Quantity> {
        self.asks.get(price).copied()
    }
}

fn side_from_levels(levels: Vec<PriceLevel>) -> BTreeMap<Price, Quantity> {
    levels
        .into_iter()
        .filter(|level| !level.quantity.is_zero())
        .map(|level| (level.price, level.quantity))
        .collect()
}

/// Zero quantity removes the level; anything else upserts it.
pub fn apply_level_updates(side: &mut BTreeMap<Price, Quantity>, updates: &[PriceLevel]) {
    for level in updates {
        if level.quantity.is_zero() {
            side.remove(&level.price);
        } else {
            side.insert(level.price, level.quantity);
        }
    }
}

/// Tuning knobs for the reconstructor.
#[derive(Debug, Clone)]
pub struct BookConfig {
    /// Levels per side in each emitted `BookSnapshot`.
    pub top_levels: usize,
    /// Mismatches within this window after initialization are not gaps.
    pub grace_period: Duration,
}

impl Default for BookConfig {
    fn default() -> Self {
        Self {
            top_levels: 20,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

/// Owns one `BookState` per instrument. The instrument set is fixed at
/// construction.
#[derive(Debug)]
pub struct BookReconstructor {
    books: BTreeMap<Instrument, BookState>,
    config: BookConfig,
}

impl BookReconstructor {
    pub fn new(instruments: impl IntoIterator<Item = Instrument>, config: BookConfig) -> Self {
        let books: BTreeMap<_, _> = instruments
            .into_iter()
            .map(|instrument| (instrument, BookState::default()))
            .collect();
        info!(
            instruments = books.len(),
            top_levels = config.top_levels,
            grace_ms = config.grace_period.as_millis() as u64,
            "BookReconstructor initialized"
        );
        Self { books, config }
    }

    pub fn instruments(&self) -> impl Iterator<Item = &Instrument> {
        self.books.keys()
    }

    pub fn book(&self, instrument: &Instrument) -> Option<&BookState> {
        self.books.get(instrument)
    }

    pub fn is_initialized(&self, instrument: &Instrument) -> bool {
        self.books
            .get(instrument)
            .map(BookState::is_initialized)
            .unwrap_or(false)
    }

    /// Replace the instrument's state wholesale with `snapshot`.
    pub fn install_snapshot(
        &mut self,
        instrument: &Instrument,
        snapshot: DepthSnapshot,
        now: i64,
    ) -> Result<u64, BookError> {
        let book = self
            .books
            .get_mut(instrument)
            .ok_or_else(|| BookError::UnknownInstrument(instrument.clone()))?;
        book.install(snapshot, now);
        info!(
            instrument = %instrument,
            last_update_id = book.last_update_id,
            bids = book.bid_depth(),
            asks = book.ask_depth(),
            "Order book snapshot installed"
        );
        Ok(book.last_update_id)
    }

    /// Fetch a snapshot from `source` and install it, stamping the install
    /// time from `clock` once the fetch has resolved.
    pub async fn initialize(
        &mut self,
        source: &dyn SnapshotSource,
        instrument: &Instrument,
        depth: u32,
        clock: impl Fn() -> i64,
    ) -> Result<u64, BookError> {
        if !self.books.contains_key(instrument) {
            return Err(BookError::UnknownInstrument(instrument.clone()));
        }
        let snapshot = source.fetch(instrument, depth).await?;
        self.install_snapshot(instrument, snapshot, clock())
    }

    /// Mark every book uninitialized. Used when a connection drops, since
    /// sequence state does not survive a reconnect.
    pub fn invalidate_all(&mut self) {
        for book in self.books.values_mut() {
            book.initialized = false;
        }
    }

    /// Validate and apply one diff.
    pub fn apply_diff(&mut self, diff: &DepthDiff) -> DiffOutcome {
        let Some(book) = self.books.get_mut(&diff.instrument) else {
            return DiffOutcome::UnknownInstrument;
        };
        if !book.initialized {
            return DiffOutcome::NotInitialized;
        }

        let expected = book.last_update_id.saturating_add(1);
        if diff.final_update_id < expected {
            return DiffOutcome::Stale;
        }

        if !bridges(diff.first_update_id, diff.final_update_id, book.last_update_id) {
            let elapsed = diff.local_receive_time.saturating_sub(book.initialized_at);
            let grace = i64::try_from(self.config.grace_period.as_nanos()).unwrap_or(i64::MAX);
            if elapsed < grace {
                debug!(
                    instrument = %diff.instrument,
                    expected,
                    first = diff.first_update_id,
                    last = diff.final_update_id,
                    "Diff mismatch within grace period"
                );
                return DiffOutcome::WithinGrace;
            }

            book.initialized = false;
            let gap = GapRecord {
                instrument: diff.instrument.clone(),
                expected_id: expected,
                actual_first_id: diff.first_update_id,
                actual_final_id: diff.final_update_id,
                detected_at: diff.local_receive_time,
            };
            warn!(
                instrument = %gap.instrument,
                expected = gap.expected_id,
                first = gap.actual_first_id,
                last = gap.actual_final_id,
                "Sequence gap detected, book needs resync"
            );
            return DiffOutcome::Gap(gap);
        }

        apply_level_updates(&mut book.bids, &diff.bids);
        apply_level_updates(&mut book.asks, &diff.asks);
        book.last_update_id = diff.final_update_id;

        let n = self.config.top_levels;
        DiffOutcome::Applied(BookSnapshot {
            instrument: diff.instrument.clone(),
            exchange_event_time: diff.exchange_event_time,
            local_receive_time: diff.local_receive_time,
            last_update_id: book.last_update_id,
            bids: book.top_bids(n),
            asks: book.top_asks(n),
        })
    }

    /// Best `n` levels per side: bids descending, asks ascending.
    pub fn top_levels(&self, instrument: &Instrument, n: usize) -> Option<(Vec<PriceLevel>, Vec<PriceLevel>)> {
        self.books
            .get(instrument)
            .map(|book| (book.top_bids(n), book.top_asks(n)))
    }
}
