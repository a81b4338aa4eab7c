//! Deployment configuration: the declaration surface an operator edits.

use std::collections::BTreeMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::function::{FunctionEnvironment, RuntimeConfig};
use crate::router::NotificationFilter;
use crate::storage::StoreSettings;

pub const DEFAULT_TIMEOUT_SECONDS: u32 = 30;
pub const DEFAULT_MEMORY_MB: u32 = 128;
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_ARTIFACT_PATH: &str = "dist/email_receiver.zip";
pub const MAX_FUNCTION_NAME_LEN: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentConfig {
    pub bucket_name: String,
    pub stage: String,
    pub function_name: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u32,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,
    #[serde(default)]
    pub store: StoreSettings,
    pub filter: NotificationFilter,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_artifact_path")]
    pub artifact_path: PathBuf,
    /// Extra opaque variables passed to the function unchanged.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

pub fn default_timeout_seconds() -> u32 {
    DEFAULT_TIMEOUT_SECONDS
}

pub fn default_memory_mb() -> u32 {
    DEFAULT_MEMORY_MB
}

pub fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

pub fn default_artifact_path() -> PathBuf {
    PathBuf::from(DEFAULT_ARTIFACT_PATH)
}

impl DeploymentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|error| {
            Error::io(
                format!("failed to read deployment config '{}'", path.display()),
                error,
            )
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|error| {
            Error::validation(format!(
                "malformed deployment config '{}': {error}",
                path.display()
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_bucket_name(&self.bucket_name)?;
        validate_function_name(&self.function_name)?;

        if self.stage.trim().is_empty() {
            return Err(Error::validation("stage cannot be empty"));
        }
        if self.filter.is_unbounded() {
            return Err(Error::validation(
                "notification filter must set a prefix or a suffix",
            ));
        }

        self.store.validate()?;
        self.runtime_config().validate()
    }

    pub fn function_environment(&self) -> FunctionEnvironment {
        FunctionEnvironment {
            bucket: self.bucket_name.clone(),
            stage: self.stage.clone(),
            log_level: self.log_level.clone(),
            extra: self.environment.clone(),
        }
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            timeout_seconds: self.timeout_seconds,
            memory_mb: self.memory_mb,
            environment: self.function_environment(),
        }
    }

    /// Key prefix the function may read; empty when the filter has none.
    pub fn read_prefix(&self) -> &str {
        self.filter.prefix.as_deref().unwrap_or_default()
    }
}

/// Bucket names are global: 3–63 characters of lowercase letters, digits,
/// dots and hyphens, starting and ending alphanumeric, never IP-shaped.
pub fn validate_bucket_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| Err(Error::validation(format!("invalid bucket name '{name}': {reason}")));

    if !(3..=63).contains(&name.len()) {
        return invalid("must be between 3 and 63 characters");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-')
    {
        return invalid("only lowercase letters, digits, '.' and '-' are allowed");
    }
    let starts_ok = name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
    let ends_ok = name.chars().last().is_some_and(|c| c.is_ascii_alphanumeric());
    if !starts_ok || !ends_ok {
        return invalid("must start and end with a letter or digit");
    }
    if name.contains("..") || name.contains(".-") || name.contains("-.") {
        return invalid("dots cannot be adjacent to dots or hyphens");
    }
    if name.parse::<Ipv4Addr>().is_ok() {
        return invalid("must not be formatted as an IP address");
    }
    if name.starts_with("xn--") || name.ends_with("-s3alias") {
        return invalid("uses a reserved prefix or suffix");
    }
    Ok(())
}

pub fn validate_function_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_FUNCTION_NAME_LEN {
        return Err(Error::validation(format!(
            "function name must be between 1 and {MAX_FUNCTION_NAME_LEN} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::validation(format!(
            "function name '{name}' may only contain letters, digits, '-' and '_'"
        )));
    }
    Ok(())
}
