//! Layered engine configuration.
//!
//! Every runtime component has its own config struct with defaults and
//! `with_*` setters. [`EngineConfig`] groups them so a deployment can supply
//! overrides from a TOML file and `BUILDWARDEN__SECTION__KEY` environment
//! variables. Durations are written in milliseconds (`*_ms` keys).

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::authority::AuthorityConfig;
use crate::healing::HealingConfig;
use crate::ledger::LedgerConfig;
use crate::parallel::ExecutorConfig;
use crate::resilience::CircuitBreakerConfig;

/// Prefix for environment overrides, e.g. `BUILDWARDEN__EXECUTOR__MAX_CONCURRENCY=8`.
pub const ENV_PREFIX: &str = "BUILDWARDEN";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("configuration file not found: {0}")]
    MissingFile(String),
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub executor: ExecutorConfig,
    pub circuit: CircuitBreakerConfig,
    pub healing: HealingConfig,
    pub authority: AuthorityConfig,
    pub ledger: LedgerConfig,
}

impl EngineConfig {
    /// Load defaults, then `path` (if any), then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::MissingFile(path.display().to_string()));
            }
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?.try_deserialize::<EngineConfig>()?;
        Ok(config)
    }
}

/// Serde helper storing a `Duration` as whole milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Same as [`duration_ms`] for optional durations.
pub mod option_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<u64>::deserialize(deserializer).map(|value| value.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_defaults_without_file() {
        let config = EngineConfig::load(None).expect("defaults load");
        assert_eq!(config.executor.max_concurrency, 4);
        assert_eq!(config.executor.retry.max_retries, 3);
        assert_eq!(config.executor.timeout.task_timeout, Duration::from_secs(300));
        assert_eq!(config.circuit.failure_threshold, 5);
        assert_eq!(config.authority.denial_penalty, 5);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("buildwarden.toml");
        let mut file = std::fs::File::create(&path).expect("create");
        writeln!(
            file,
            "[executor]\nmax_concurrency = 2\nfail_fast_on_critical = false\n\n\
             [executor.timeout]\ntask_timeout_ms = 1500\n\n\
             [circuit]\nreset_timeout_ms = 250\n"
        )
        .expect("write");

        let config = EngineConfig::load(Some(&path)).expect("load");

        assert_eq!(config.executor.max_concurrency, 2);
        assert!(!config.executor.fail_fast_on_critical);
        assert_eq!(config.executor.timeout.task_timeout, Duration::from_millis(1500));
        assert_eq!(config.circuit.reset_timeout, Duration::from_millis(250));
        assert_eq!(config.circuit.failure_threshold, 5);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = EngineConfig::load(Some(Path::new("/nonexistent/buildwarden.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::MissingFile(_)));
    }

    #[test]
    fn test_duration_ms_round_trips_through_json() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            #[serde(with = "duration_ms")]
            limit: Duration,
        }

        let json = serde_json::to_string(&Wrapper {
            limit: Duration::from_millis(42),
        })
        .expect("serialize");
        assert_eq!(json, r#"{"limit":42}"#);
    }
}
