//! Funding-rate polling
//!
//! Funding rates are not streamed; they are queried per instrument from
//! `{futures_rest}/fapi/v1/premiumIndex` on a long interval and pushed into
//! the buffer's unkeyed funding sequence.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use types::ids::Instrument;
use types::records::{FundingEvent, Record};

use crate::buffer::EventBuffer;
use crate::clock;

pub const FUNDING_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum FundingError {
    #[error("funding request for {instrument} failed: {source}")]
    Transport {
        instrument: Instrument,
        #[source]
        source: reqwest::Error,
    },

    #[error("funding request for {instrument} returned HTTP {status}")]
    Status { instrument: Instrument, status: u16 },

    #[error("funding response for {instrument} could not be parsed: {reason}")]
    Parse { instrument: Instrument, reason: String },
}

/// The fields of a premium-index response this collector keeps.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FundingQuote {
    #[serde(rename = "lastFundingRate", with = "rust_decimal::serde::str")]
    pub last_funding_rate: Decimal,
    pub time: i64,
    #[serde(rename = "nextFundingTime")]
    pub next_funding_time: i64,
}

impl FundingQuote {
    pub fn from_json(instrument: &Instrument, body: &str) -> Result<Self, FundingError> {
        serde_json::from_str(body).map_err(|e| FundingError::Parse {
            instrument: instrument.clone(),
            reason: e.to_string(),
        })
    }

    pub fn into_event(self, instrument: Instrument, local_receive_time: i64) -> FundingEvent {
        FundingEvent {
            instrument,
            funding_rate: self.last_funding_rate,
            funding_time: self.time,
            next_funding_time: self.next_funding_time,
            local_receive_time,
        }
    }
}

/// One attempt at fetching the current funding quote.
#[async_trait]
pub trait FundingSource: Send + Sync {
    async fn fetch(&self, instrument: &Instrument) -> Result<FundingQuote, FundingError>;
}

#[derive(Debug, Clone)]
pub struct RestFundingSource {
    client: reqwest::Client,
    base_url: String,
}

impl RestFundingSource {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn premium_index_url(&self) -> String {
        format!("{}/fapi/v1/premiumIndex", self.base_url)
    }
}

#[async_trait]
impl FundingSource for RestFundingSource {
    async fn fetch(&self, instrument: &Instrument) -> Result<FundingQuote, FundingError> {
        let transport = |source| FundingError::Transport {
            instrument: instrument.clone(),
            source,
        };

        let response = self
            .client
            .get(self.premium_index_url())
            .query(&[("symbol", instrument.as_str())])
            .timeout(FUNDING_TIMEOUT)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FundingError::Status {
                instrument: instrument.clone(),
                status: status.as_u16(),
            });
        }

        let body = response.text().await.map_err(transport)?;
        FundingQuote::from_json(instrument, &body)
    }
}

pub struct FundingRatePoller {
    source: Arc<dyn FundingSource>,
    buffer: Arc<EventBuffer>,
    instruments: Vec<Instrument>,
}

impl FundingRatePoller {
    pub fn new(source: Arc<dyn FundingSource>, buffer: Arc<EventBuffer>, instruments: Vec<Instrument>) -> Self {
        Self {
            source,
            buffer,
            instruments,
        }
    }

    /// Fetch with up to `MAX_ATTEMPTS` tries, sleeping 1s then 2s between them.
    pub async fn fetch_with_retry(&self, instrument: &Instrument) -> Option<FundingEvent> {
        for attempt in 0..MAX_ATTEMPTS {
            match self.source.fetch(instrument).await {
                Ok(quote) => return Some(quote.into_event(instrument.clone(), clock::unix_nanos())),
                Err(err) => {
                    warn!(
                        instrument = %instrument,
                        attempt = attempt + 1,
                        max_attempts = MAX_ATTEMPTS,
                        error = %err,
                        "Funding rate fetch failed"
                    );
                    if attempt + 1 < MAX_ATTEMPTS {
                        sleep(Duration::from_secs(1u64 << attempt)).await;
                    }
                }
            }
        }
        None
    }

    /// One round over every instrument. Returns how many were buffered.
    pub async fn poll_once(&self) -> usize {
        let mut buffered = 0;
        for instrument in &self.instruments {
            let Some(event) = self.fetch_with_retry(instrument).await else {
                continue;
            };
            debug!(instrument = %instrument, rate = %event.funding_rate, "Funding rate fetched");
            match self.buffer.add(Record::Funding(event)) {
                Ok(()) => buffered += 1,
                Err(err) => warn!(instrument = %instrument, error = %err, "Funding record dropped"),
            }
        }
        buffered
    }

    /// Poll immediately, then every `interval`, until cancelled.
    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        info!(
            instruments = self.instruments.len(),
            interval_secs = interval.as_secs(),
            "Funding rate poller starting"
        );
        loop {
            let buffered = tokio::select! {
                _ = cancel.cancelled() => break,
                n = self.poll_once() => n,
            };
            info!(buffered, "Funding rate round complete");

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(interval) => {}
            }
        }
        info!("Funding rate poller stopped");
    }
}
