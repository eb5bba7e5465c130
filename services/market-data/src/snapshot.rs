//! Point-query order-book snapshots
//!
//! A snapshot is the full book at one instant, tagged with a single
//! `lastUpdateId` cursor. The reconstructor replaces its state wholesale with
//! a snapshot and then replays diffs on top of it.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use types::ids::Instrument;
use types::numeric::{Price, PriceLevel, Quantity};

/// Request timeout for a single snapshot query.
pub const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SnapshotFetchError {
    #[error("snapshot request for {instrument} failed: {source}")]
    Transport {
        instrument: Instrument,
        #[source]
        source: reqwest::Error,
    },

    #[error("snapshot request for {instrument} returned HTTP {status}")]
    Status { instrument: Instrument, status: u16 },

    #[error("snapshot for {instrument} could not be parsed: {reason}")]
    Parse { instrument: Instrument, reason: String },
}

/// Full book returned by the point-query endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepthSnapshot {
    pub last_update_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

#[derive(Debug, Deserialize)]
struct RawDepthSnapshot {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    bids: Vec<(Price, Quantity)>,
    asks: Vec<(Price, Quantity)>,
}

impl From<RawDepthSnapshot> for DepthSnapshot {
    fn from(raw: RawDepthSnapshot) -> Self {
        let convert = |side: Vec<(Price, Quantity)>| {
            side.into_iter()
                .map(|(price, quantity)| PriceLevel::new(price, quantity))
                .collect()
        };
        Self {
            last_update_id: raw.last_update_id,
            bids: convert(raw.bids),
            asks: convert(raw.asks),
        }
    }
}

impl DepthSnapshot {
    /// Parse the JSON body of a depth query.
    pub fn from_json(instrument: &Instrument, body: &str) -> Result<Self, SnapshotFetchError> {
        serde_json::from_str::<RawDepthSnapshot>(body)
            .map(Self::from)
            .map_err(|e| SnapshotFetchError::Parse {
                instrument: instrument.clone(),
                reason: e.to_string(),
            })
    }
}

/// Anything that can produce a full book snapshot for an instrument.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self, instrument: &Instrument, depth: u32) -> Result<DepthSnapshot, SnapshotFetchError>;
}

/// REST implementation: `GET {base}/api/v3/depth?symbol=SYM&limit=DEPTH`.
#[derive(Debug, Clone)]
pub struct RestSnapshotSource {
    client: reqwest::Client,
    base_url: String,
}

impl RestSnapshotSource {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn depth_url(&self) -> String {
        format!("{}/api/v3/depth", self.base_url)
    }
}

#[async_trait]
impl SnapshotSource for RestSnapshotSource {
    async fn fetch(&self, instrument: &Instrument, depth: u32) -> Result<DepthSnapshot, SnapshotFetchError> {
        let transport = |source| SnapshotFetchError::Transport {
            instrument: instrument.clone(),
            source,
        };

        let limit = depth.to_string();
        let response = self
            .client
            .get(self.depth_url())
            .query(&[("symbol", instrument.as_str()), ("limit", limit.as_str())])
            .timeout(SNAPSHOT_TIMEOUT)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(SnapshotFetchError::Status {
                instrument: instrument.clone(),
                status: status.as_u16(),
            });
        }

        let body = response.text().await.map_err(transport)?;
        let snapshot = DepthSnapshot::from_json(instrument, &body)?;
        debug!(
            instrument = %instrument,
            last_update_id = snapshot.last_update_id,
            bids = snapshot.bids.len(),
            asks = snapshot.asks.len(),
            "Depth snapshot fetched"
        );
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rest_body() {
        let body = r#"{"lastUpdateId":1027024,"bids":[["4.00000000","431.00000000"]],"asks":[["4.00000200","12.00000000"],["4.1","0"]]}"#;
        let snapshot = DepthSnapshot::from_json(&Instrument::new("BNBBTC"), body).unwrap();
        assert_eq!(snapshot.last_update_id, 1_027_024);
        assert_eq!(snapshot.bids.len(), 1);
        assert_eq!(snapshot.asks.len(), 2);
    }

    #[test]
    fn test_parse_failure_names_instrument() {
        let err = DepthSnapshot::from_json(&Instrument::new("btcusdt"), "{}").unwrap_err();
        assert!(err.to_string().contains("BTCUSDT"));
    }

    #[test]
    fn test_depth_url_trims_trailing_slash() {
        let source = RestSnapshotSource::new(reqwest::Client::new(), "https://api.binance.com/");
        assert_eq!(source.depth_url(), "https://api.binance.com/api/v3/depth");
    }
}
