//! Instrument identifiers
//!
//! Symbols arrive in mixed case: configuration and stream tags use the
//! lower-case form (`btcusdt@depth@100ms`), payloads and REST queries use
//! upper case (`BTCUSDT`). Past the edge of the system everything is keyed
//! by the upper-case form.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::RecordError;

/// Case-normalized instrument symbol.
///
/// The set of instruments is fixed at startup; ordering is lexicographic so
/// that per-instrument maps iterate deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Instrument(String);

impl Instrument {
    /// Normalize a symbol to its canonical upper-case form.
    pub fn new(symbol: impl AsRef<str>) -> Self {
        Self(symbol.as_ref().trim().to_ascii_uppercase())
    }

    /// Normalize and validate a symbol: non-empty, ASCII alphanumeric only.
    pub fn parse(symbol: impl AsRef<str>) -> Result<Self, RecordError> {
        let instrument = Self::new(symbol);
        if instrument.0.is_empty() || !instrument.0.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(RecordError::InvalidInstrument(instrument.0));
        }
        Ok(instrument)
    }

    /// Canonical symbol string (upper case).
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lower-case form used in combined-stream tags.
    pub fn stream_name(&self) -> String {
        self.0.to_ascii_lowercase()
    }
}

impl From<String> for Instrument {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for Instrument {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<Instrument> for String {
    fn from(value: Instrument) -> Self {
        value.0
    }
}

impl AsRef<str> for Instrument {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
