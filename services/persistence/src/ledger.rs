//! Checksum ledger
//!
//! `checksums.json` in the data directory is a JSON array with one entry per
//! published file. Entries are only ever appended. The ledger file itself is
//! rewritten through the same stage-then-rename path as data files.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::atomic::write_atomic;

pub const LEDGER_FILE: &str = "checksums.json";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("ledger is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub filename: String,
    /// Lowercase hex SHA-256 of the file bytes.
    pub sha256: String,
    pub record_count: usize,
    pub file_size: u64,
    pub created_at: DateTime<Utc>,
}

/// Result of checking a file against its ledger entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Match,
    Mismatch { expected: String, actual: String },
    NotInLedger,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Hash a file in fixed-size chunks.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = file.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Debug, Clone)]
pub struct ChecksumLedger {
    path: PathBuf,
}

impl ChecksumLedger {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join(LEDGER_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All entries in append order. A missing ledger is empty.
    pub fn load(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn append(&self, entry: LedgerEntry) -> Result<(), LedgerError> {
        let mut entries = self.load()?;
        entries.push(entry);
        let bytes = serde_json::to_vec_pretty(&entries)?;
        write_atomic(&self.path, &bytes)?;
        Ok(())
    }

    /// Latest entry for `filename`.
    pub fn find(&self, filename: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        Ok(self.load()?.into_iter().rev().find(|e| e.filename == filename))
    }

    /// Recompute the hash of `path` and compare it with the ledger.
    pub fn verify_file(&self, path: &Path) -> Result<Verification, LedgerError> {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let Some(entry) = self.find(&filename)? else {
            return Ok(Verification::NotInLedger);
        };
        let actual = sha256_file(path)?;
        if actual == entry.sha256 {
            Ok(Verification::Match)
        } else {
            Ok(Verification::Mismatch {
                expected: entry.sha256,
                actual,
            })
        }
    }
}
