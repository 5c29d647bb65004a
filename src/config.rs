//! Per-role service settings: role defaults overridden by the environment.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{FixedOffset, Local, Offset};
use config::{Config, Environment};
use thiserror::Error;

use crate::subject::{Subject, SubjectError};

pub const DEFAULT_NATS_URL: &str = "nats://localhost:4222";
pub const DEFAULT_MODEL_CACHE_DIR: &str = "/tmp/neural-trade/models";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),
    #[error("`{key}` is not a valid subject: {source}")]
    Subject {
        key: &'static str,
        #[source]
        source: SubjectError,
    },
    #[error("invalid value `{value}` for `{key}`: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Fetcher,
    Features,
    Predict,
}

impl Role {
    fn defaults(self) -> &'static [(&'static str, &'static str)] {
        match self {
            Role::Fetcher => &[
                ("stream_name", "market-data"),
                ("raw_subject", "market-data.raw"),
                ("cron_seconds", "900"),
                ("pairs", "BTC/USD"),
                ("kraken_url", "https://api.kraken.com"),
                ("port", "5500"),
            ],
            Role::Features => &[
                ("stream_name", "market-data"),
                ("consumer_name", "feature-engineering"),
                ("raw_subject", "market-data.raw.>"),
                ("processed_subject", "market-data.processed"),
                ("fetch_timeout_seconds", "5"),
                ("port", "5100"),
            ],
            Role::Predict => &[
                ("stream_name", "prediction"),
                ("consumer_name", "prediction-engine"),
                ("raw_subject", "market-data.processed.>"),
                ("prediction_subject", "prediction"),
                ("model_storage", "prediction-models"),
                ("run_model_watcher", "false"),
                ("model_cache_dir", DEFAULT_MODEL_CACHE_DIR),
                ("fetch_timeout_seconds", "5"),
                ("port", "5900"),
            ],
        }
    }
}

/// Builds the layered configuration for `role`. `vars` replaces the process
/// environment when given.
fn load(role: Role, vars: Option<HashMap<String, String>>) -> Result<Config, ConfigError> {
    let mut builder = Config::builder().set_default("nats_url", DEFAULT_NATS_URL)?;
    for (key, value) in role.defaults() {
        builder = builder.set_default(*key, *value)?;
    }
    let env = Environment::default().source(vars);
    Ok(builder.add_source(env).build()?)
}

fn subject(cfg: &Config, key: &'static str) -> Result<Subject, ConfigError> {
    let raw = cfg.get_string(key)?;
    Subject::parse(raw.trim()).map_err(|source| ConfigError::Subject { key, source })
}

fn seconds(cfg: &Config, key: &'static str) -> Result<Duration, ConfigError> {
    let raw = cfg.get_string(key)?;
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(ConfigError::Invalid {
            key,
            value: raw,
            reason: "expected a positive number of seconds".to_string(),
        }),
    }
}

fn port(cfg: &Config) -> Result<u16, ConfigError> {
    let raw = cfg.get_string("port")?;
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        key: "port",
        value: raw,
        reason: "expected a TCP port".to_string(),
    })
}

/// `true`, `1` and `t` (any case) enable a flag; anything else disables it.
pub fn parse_flag(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "true" | "1" | "t")
}

pub fn parse_pairs(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

fn local_offset() -> FixedOffset {
    Local::now().offset().fix()
}

#[derive(Debug, Clone)]
pub struct FetcherSettings {
    pub nats_url: String,
    pub stream_name: String,
    pub raw_subject: Subject,
    pub interval: Duration,
    pub pairs: Vec<String>,
    pub kraken_url: String,
    /// Offset the source's epoch timestamps are rendered in before being
    /// re-encoded as UTC milliseconds.
    pub source_offset: FixedOffset,
    pub port: u16,
}

impl FetcherSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::build(load(Role::Fetcher, None)?)
    }

    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::build(load(Role::Fetcher, Some(vars))?)
    }

    fn build(cfg: Config) -> Result<Self, ConfigError> {
        let source_offset = match cfg.get_string("source_utc_offset_minutes") {
            Ok(raw) => {
                let minutes: i32 = raw.trim().parse().map_err(|_| ConfigError::Invalid {
                    key: "source_utc_offset_minutes",
                    value: raw.clone(),
                    reason: "expected whole minutes".to_string(),
                })?;
                FixedOffset::east_opt(minutes * 60).ok_or(ConfigError::Invalid {
                    key: "source_utc_offset_minutes",
                    value: raw,
                    reason: "offset out of range".to_string(),
                })?
            }
            Err(config::ConfigError::NotFound(_)) => local_offset(),
            Err(e) => return Err(e.into()),
        };
        let pairs_raw = cfg.get_string("pairs")?;
        let pairs = parse_pairs(&pairs_raw);
        if pairs.is_empty() {
            return Err(ConfigError::Invalid {
                key: "pairs",
                value: pairs_raw,
                reason: "no trading pairs configured".to_string(),
            });
        }
        Ok(Self {
            nats_url: cfg.get_string("nats_url")?,
            stream_name: cfg.get_string("stream_name")?,
            raw_subject: subject(&cfg, "raw_subject")?,
            interval: seconds(&cfg, "cron_seconds")?,
            pairs,
            kraken_url: cfg.get_string("kraken_url")?.trim_end_matches('/').to_string(),
            source_offset,
            port: port(&cfg)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct StageSettings {
    pub nats_url: String,
    pub stream_name: String,
    pub consumer_name: String,
    pub source_filter: Subject,
    pub destination: Subject,
    pub fetch_timeout: Duration,
    pub port: u16,
}

impl StageSettings {
    fn build(cfg: &Config, destination_key: &'static str) -> Result<Self, ConfigError> {
        Ok(Self {
            nats_url: cfg.get_string("nats_url")?,
            stream_name: cfg.get_string("stream_name")?,
            consumer_name: cfg.get_string("consumer_name")?,
            source_filter: subject(cfg, "raw_subject")?,
            destination: subject(cfg, destination_key)?,
            fetch_timeout: seconds(cfg, "fetch_timeout_seconds")?,
            port: port(cfg)?,
        })
    }

    pub fn features_from_env() -> Result<Self, ConfigError> {
        Self::build(&load(Role::Features, None)?, "processed_subject")
    }

    pub fn features_from_vars(vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::build(&load(Role::Features, Some(vars))?, "processed_subject")
    }
}

#[derive(Debug, Clone)]
pub struct PredictSettings {
    pub stage: StageSettings,
    pub model_storage: String,
    pub run_model_watcher: bool,
    pub model_cache_dir: PathBuf,
}

impl PredictSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::build(load(Role::Predict, None)?)
    }

    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::build(load(Role::Predict, Some(vars))?)
    }

    fn build(cfg: Config) -> Result<Self, ConfigError> {
        Ok(Self {
            stage: StageSettings::build(&cfg, "prediction_subject")?,
            model_storage: cfg.get_string("model_storage")?,
            run_model_watcher: parse_flag(&cfg.get_string("run_model_watcher")?),
            model_cache_dir: PathBuf::from(cfg.get_string("model_cache_dir")?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_fetcher_defaults() {
        let settings = FetcherSettings::from_vars(HashMap::new()).unwrap();
        assert_eq!(settings.nats_url, DEFAULT_NATS_URL);
        assert_eq!(settings.raw_subject.as_str(), "market-data.raw");
        assert_eq!(settings.interval, Duration::from_secs(900));
        assert_eq!(settings.pairs, vec!["BTC/USD".to_string()]);
        assert_eq!(settings.kraken_url, "https://api.kraken.com");
        assert_eq!(settings.port, 5500);
    }

    #[test]
    fn test_fetcher_overrides() {
        let settings = FetcherSettings::from_vars(vars(&[
            ("CRON_SECONDS", "2"),
            ("PAIRS", "FOO/USD, BAR/EUR,"),
            ("SOURCE_UTC_OFFSET_MINUTES", "-360"),
            ("KRAKEN_URL", "http://127.0.0.1:9999/"),
        ]))
        .unwrap();
        assert_eq!(settings.interval, Duration::from_secs(2));
        assert_eq!(settings.pairs, vec!["FOO/USD".to_string(), "BAR/EUR".to_string()]);
        assert_eq!(settings.source_offset.local_minus_utc(), -6 * 3600);
        assert_eq!(settings.kraken_url, "http://127.0.0.1:9999");
    }

    #[test]
    fn test_fetcher_rejects_bad_values() {
        assert!(matches!(
            FetcherSettings::from_vars(vars(&[("CRON_SECONDS", "soon")])),
            Err(ConfigError::Invalid { key: "cron_seconds", .. })
        ));
        assert!(matches!(
            FetcherSettings::from_vars(vars(&[("PAIRS", " , ")])),
            Err(ConfigError::Invalid { key: "pairs", .. })
        ));
        assert!(matches!(
            FetcherSettings::from_vars(vars(&[("RAW_SUBJECT", "market-data..raw")])),
            Err(ConfigError::Subject { key: "raw_subject", .. })
        ));
    }

    #[test]
    fn test_stage_defaults() {
        let features = StageSettings::features_from_vars(HashMap::new()).unwrap();
        assert_eq!(features.stream_name, "market-data");
        assert_eq!(features.consumer_name, "feature-engineering");
        assert_eq!(features.source_filter.as_str(), "market-data.raw.>");
        assert_eq!(features.destination.as_str(), "market-data.processed");
        assert_eq!(features.fetch_timeout, Duration::from_secs(5));
        assert_eq!(features.port, 5100);

        let predict = PredictSettings::from_vars(HashMap::new()).unwrap();
        assert_eq!(predict.stage.stream_name, "prediction");
        assert_eq!(predict.stage.consumer_name, "prediction-engine");
        assert_eq!(predict.stage.source_filter.as_str(), "market-data.processed.>");
        assert_eq!(predict.stage.destination.as_str(), "prediction");
        assert_eq!(predict.stage.port, 5900);
        assert_eq!(predict.model_storage, "prediction-models");
        assert!(!predict.run_model_watcher);
        assert_eq!(predict.model_cache_dir, PathBuf::from(DEFAULT_MODEL_CACHE_DIR));
    }

    #[test]
    fn test_model_watcher_flag() {
        for raw in ["true", "1", "t", "T", "TRUE"] {
            assert!(parse_flag(raw), "{raw}");
        }
        for raw in ["false", "0", "no", "yes", ""] {
            assert!(!parse_flag(raw), "{raw}");
        }
        let predict = PredictSettings::from_vars(vars(&[("RUN_MODEL_WATCHER", "t")])).unwrap();
        assert!(predict.run_model_watcher);
    }
}
