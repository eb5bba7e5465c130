//! Collector configuration
//!
//! A flat TOML file; every key is optional and falls back to its default.
//! A missing file means "all defaults".

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use types::ids::Instrument;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CollectorConfig {
    pub symbols: Vec<String>,
    pub flush_interval_secs: u64,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub max_buffer_mb: u64,
    pub backpressure_check_secs: u64,
    #[serde(alias = "cleanup_days")]
    pub retention_days: u64,
    pub cloud_remote: String,
    pub cloud_path: String,
    pub orderbook_depth: u32,
    pub orderbook_top_levels: usize,
    pub use_futures: bool,
    pub grace_period_secs: u64,
    pub read_timeout_secs: u64,
    pub stale_timeout_secs: u64,
    pub funding_interval_secs: u64,
    pub spot_ws_url: String,
    pub futures_ws_url: String,
    pub spot_rest_url: String,
    pub futures_rest_url: String,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["btcusdt".into(), "ethusdt".into(), "xrpusdt".into()],
            flush_interval_secs: 3600,
            data_dir: PathBuf::from("./data"),
            log_dir: PathBuf::from("./logs"),
            max_buffer_mb: 500,
            backpressure_check_secs: 30,
            retention_days: 7,
            cloud_remote: String::new(),
            cloud_path: String::new(),
            orderbook_depth: 1000,
            orderbook_top_levels: 20,
            use_futures: true,
            grace_period_secs: 3,
            read_timeout_secs: 5,
            stale_timeout_secs: 60,
            funding_interval_secs: 8 * 3600,
            spot_ws_url: "wss://stream.binance.com:9443/stream".into(),
            futures_ws_url: "wss://fstream.binance.com/stream".into(),
            spot_rest_url: "https://api.binance.com".into(),
            futures_rest_url: "https://fapi.binance.com".into(),
        }
    }
}

impl CollectorConfig {
    /// Load and validate `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = match fs::read_to_string(path) {
            Ok(text) => Self::from_toml_str(&text)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Self::default(),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbols.is_empty() {
            return Err(ConfigError::Invalid("symbols must not be empty".into()));
        }
        for symbol in &self.symbols {
            Instrument::parse(symbol).map_err(|e| ConfigError::Invalid(format!("symbols: {e}")))?;
        }
        let intervals = [
            ("flush_interval_secs", self.flush_interval_secs),
            ("backpressure_check_secs", self.backpressure_check_secs),
            ("read_timeout_secs", self.read_timeout_secs),
            ("stale_timeout_secs", self.stale_timeout_secs),
            ("funding_interval_secs", self.funding_interval_secs),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }
        if self.orderbook_top_levels == 0 {
            return Err(ConfigError::Invalid("orderbook_top_levels must be greater than zero".into()));
        }
        if self.orderbook_depth == 0 {
            return Err(ConfigError::Invalid("orderbook_depth must be greater than zero".into()));
        }
        Ok(())
    }

    /// Validated instruments. Symbols that fail validation are skipped;
    /// `load` has already rejected them.
    pub fn instruments(&self) -> Vec<Instrument> {
        self.symbols
            .iter()
            .filter_map(|symbol| Instrument::parse(symbol).ok())
            .collect()
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn backpressure_check(&self) -> Duration {
        Duration::from_secs(self.backpressure_check_secs)
    }

    pub fn max_buffer_bytes(&self) -> usize {
        usize::try_from(self.max_buffer_mb.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days.saturating_mul(86_400))
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs)
    }

    pub fn funding_interval(&self) -> Duration {
        Duration::from_secs(self.funding_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = CollectorConfig::load(&dir.path().join("collector.toml")).unwrap();
        assert_eq!(config, CollectorConfig::default());
        assert_eq!(config.instruments()[0].as_str(), "BTCUSDT");
        assert_eq!(config.max_buffer_bytes(), 500 * 1024 * 1024);
        assert_eq!(config.funding_interval(), Duration::from_secs(28_800));
    }

    #[test]
    fn test_partial_file_overrides_only_given_keys() {
        let config = CollectorConfig::from_toml_str(
            r#"
            symbols = ["solusdt"]
            flush_interval_secs = 600
            cloud_remote = "gdrive"
            cleanup_days = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.symbols, vec!["solusdt"]);
        assert_eq!(config.flush_interval(), Duration::from_secs(600));
        assert_eq!(config.retention(), Duration::from_secs(3 * 86_400));
        assert_eq!(config.orderbook_depth, 1000);
        assert!(config.use_futures);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let empty = CollectorConfig {
            symbols: vec![],
            ..CollectorConfig::default()
        };
        assert!(matches!(empty.validate(), Err(ConfigError::Invalid(_))));

        let zero_flush = CollectorConfig {
            flush_interval_secs: 0,
            ..CollectorConfig::default()
        };
        let err = zero_flush.validate().unwrap_err();
        assert!(err.to_string().contains("flush_interval_secs"));

        let slash = CollectorConfig {
            symbols: vec!["btcusdt".into(), "BTC/USDT".into()],
            ..CollectorConfig::default()
        };
        let err = slash.validate().unwrap_err();
        assert!(err.to_string().contains("BTC/USDT"), "{err}");
        assert_eq!(slash.instruments(), vec![Instrument::new("BTCUSDT")]);

        let blank = CollectorConfig {
            symbols: vec!["  ".into()],
            ..CollectorConfig::default()
        };
        assert!(blank.validate().is_err());

        let zero_levels = CollectorConfig {
            orderbook_top_levels: 0,
            ..CollectorConfig::default()
        };
        assert!(zero_levels.validate().is_err());
    }

    #[test]
    fn test_unknown_key_and_bad_type_are_errors() {
        assert!(matches!(
            CollectorConfig::from_toml_str("symbolz = []"),
            Err(ConfigError::Parse(_))
        ));
        assert!(CollectorConfig::from_toml_str("use_futures = \"yes\"").is_err());
    }

    #[test]
    fn test_load_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collector.toml");
        fs::write(&path, "symbols = []\n").unwrap();
        assert!(matches!(CollectorConfig::load(&path), Err(ConfigError::Invalid(_))));
    }
}
