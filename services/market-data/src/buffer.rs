//! In-memory event buffer shared by ingestion and persistence
//!
//! Records accumulate per (instrument, kind) plus one unkeyed sequence for
//! funding observations. A single mutex guards the whole structure: appends
//! are a push under the lock, a drain swaps the contents out in one step.
//! Nothing awaits while the lock is held.
//!
//! The byte estimate is a running total updated on add and drain. It is only
//! a backpressure signal and makes no attempt to be exact.

use std::collections::BTreeMap;
use std::mem;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use types::errors::RecordError;
use types::ids::Instrument;
use types::records::{EventKind, Record};

/// Everything captured by one drain. The caller owns it exclusively.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DrainedEvents {
    /// Per-instrument groups, iterated in (instrument, kind) order.
    pub keyed: BTreeMap<(Instrument, EventKind), Vec<Record>>,
    /// Funding observations across all instruments.
    pub funding: Vec<Record>,
}

impl DrainedEvents {
    pub fn is_empty(&self) -> bool {
        self.keyed.values().all(Vec::is_empty) && self.funding.is_empty()
    }

    pub fn record_count(&self) -> usize {
        self.keyed.values().map(Vec::len).sum::<usize>() + self.funding.len()
    }
}

#[derive(Debug, Default)]
struct BufferInner {
    events: DrainedEvents,
    estimated_bytes: usize,
    record_count: usize,
}

/// Thread-safe append-only accumulator.
#[derive(Debug, Default)]
pub struct EventBuffer {
    inner: Mutex<BufferInner>,
}

impl EventBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The data is plain vectors, so a panic elsewhere cannot leave it in a
    /// state worse than "some records appended".
    fn lock(&self) -> MutexGuard<'_, BufferInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validate and append a record under the key it carries.
    pub fn add(&self, record: Record) -> Result<(), RecordError> {
        if let Err(err) = record.validate() {
            warn!(error = %err, "Rejecting record");
            return Err(err);
        }
        let size = record.estimated_size();
        let mut inner = self.lock();
        match record.kind() {
            EventKind::Funding => inner.events.funding.push(record),
            kind => {
                let key = (record.instrument().clone(), kind);
                inner.events.keyed.entry(key).or_default().push(record);
            }
        }
        inner.estimated_bytes = inner.estimated_bytes.saturating_add(size);
        inner.record_count += 1;
        Ok(())
    }

    /// Approximate bytes held.
    pub fn estimate_size(&self) -> usize {
        self.lock().estimated_bytes
    }

    pub fn len(&self) -> usize {
        self.lock().record_count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once the estimate reaches `threshold_bytes`.
    pub fn needs_flush(&self, threshold_bytes: usize) -> bool {
        self.estimate_size() >= threshold_bytes
    }

    /// Atomically take everything and leave the buffer empty.
    pub fn drain(&self) -> DrainedEvents {
        let mut inner = self.lock();
        let taken = mem::take(&mut *inner);
        drop(inner);
        debug!(
            records = taken.record_count,
            estimated_bytes = taken.estimated_bytes,
            "Buffer drained"
        );
        taken.events
    }
}
