//! Receiver runtime configuration and log setup.

use ingest_core::config::DEFAULT_LOG_LEVEL;
use ingest_core::function::{ENV_BUCKET, ENV_LOG_LEVEL, ENV_STAGE};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverConfig {
    pub bucket: String,
    pub stage: String,
    pub log_level: String,
}

impl ReceiverConfig {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the function environment through `lookup`. The bucket is
    /// required; stage and log level fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let bucket = lookup(ENV_BUCKET)
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| format!("{ENV_BUCKET} must be configured"))?;
        let stage = lookup(ENV_STAGE).unwrap_or_else(|| "dev".to_string());
        let log_level = lookup(ENV_LOG_LEVEL)
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());
        Ok(Self {
            bucket,
            stage,
            log_level,
        })
    }
}

/// Installs the JSON log formatter on stderr. An unparsable level falls back
/// to `info`; a second call is a no-op.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL));
    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_current_span(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn bucket_is_required() {
        let error = ReceiverConfig::from_lookup(lookup(&[("STAGE", "prod")])).expect_err("missing");
        assert_eq!(error, "INGEST_BUCKET must be configured");
    }

    #[test]
    fn defaults_apply_for_optional_keys() {
        let config = ReceiverConfig::from_lookup(lookup(&[("INGEST_BUCKET", "insurance-emails")]))
            .expect("config");
        assert_eq!(config.stage, "dev");
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn values_pass_through_unchanged() {
        let config = ReceiverConfig::from_lookup(lookup(&[
            ("INGEST_BUCKET", "insurance-emails"),
            ("STAGE", "prod"),
            ("LOG_LEVEL", "ingest_lambda=debug"),
        ]))
        .expect("config");
        assert_eq!(config.stage, "prod");
        assert_eq!(config.log_level, "ingest_lambda=debug");
    }
}
