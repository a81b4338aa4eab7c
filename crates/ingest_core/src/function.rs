//! Compute function registration.
//!
//! A registration binds an artifact hash, runtime limits, a typed environment
//! and an execution identity. Registries publish immutable versions and move a
//! live pointer once a new version is complete, so the previous version keeps
//! serving invocations until the swap.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::validate_function_name;
use crate::error::{Error, Result};
use crate::identity::{IdentityId, PermissionBoundary, COMPUTE_SERVICE_PRINCIPAL};
use crate::orchestrator::ApplyOutcome;

pub const MIN_TIMEOUT_SECONDS: u32 = 1;
pub const MAX_TIMEOUT_SECONDS: u32 = 900;
pub const MIN_MEMORY_MB: u32 = 128;
pub const MAX_MEMORY_MB: u32 = 10_240;

pub const ENV_BUCKET: &str = "INGEST_BUCKET";
pub const ENV_STAGE: &str = "STAGE";
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";
pub const REQUIRED_ENVIRONMENT_KEYS: [&str; 3] = [ENV_BUCKET, ENV_STAGE, ENV_LOG_LEVEL];

/// Published versions kept per function: the live one and its predecessor.
pub const RETAINED_VERSIONS: usize = 2;

/// Typed function environment. Values are opaque strings: only presence of the
/// required keys is checked, never their content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionEnvironment {
    pub bucket: String,
    pub stage: String,
    pub log_level: String,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl FunctionEnvironment {
    /// Parses an untyped variable map, failing on the first missing required key.
    pub fn from_variables(mut variables: BTreeMap<String, String>) -> Result<Self> {
        let mut take = |key: &str| {
            variables.remove(key).ok_or_else(|| {
                Error::validation(format!("missing required environment key '{key}'"))
            })
        };
        let bucket = take(ENV_BUCKET)?;
        let stage = take(ENV_STAGE)?;
        let log_level = take(ENV_LOG_LEVEL)?;
        Ok(Self {
            bucket,
            stage,
            log_level,
            extra: variables,
        })
    }

    pub fn validate(&self) -> Result<()> {
        for (key, value) in [
            (ENV_BUCKET, &self.bucket),
            (ENV_STAGE, &self.stage),
            (ENV_LOG_LEVEL, &self.log_level),
        ] {
            if value.is_empty() {
                return Err(Error::validation(format!(
                    "required environment key '{key}' has no value"
                )));
            }
        }

        for key in self.extra.keys() {
            if REQUIRED_ENVIRONMENT_KEYS.contains(&key.as_str()) {
                return Err(Error::validation(format!(
                    "extra environment key '{key}' shadows a required key"
                )));
            }
            if !is_env_key(key) {
                return Err(Error::validation(format!(
                    "environment key '{key}' must match [A-Za-z_][A-Za-z0-9_]*"
                )));
            }
        }
        Ok(())
    }

    pub fn variables(&self) -> BTreeMap<String, String> {
        let mut variables = self.extra.clone();
        variables.insert(ENV_BUCKET.to_string(), self.bucket.clone());
        variables.insert(ENV_STAGE.to_string(), self.stage.clone());
        variables.insert(ENV_LOG_LEVEL.to_string(), self.log_level.clone());
        variables
    }
}

fn is_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub timeout_seconds: u32,
    pub memory_mb: u32,
    pub environment: FunctionEnvironment,
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<()> {
        if !(MIN_TIMEOUT_SECONDS..=MAX_TIMEOUT_SECONDS).contains(&self.timeout_seconds) {
            return Err(Error::validation(format!(
                "timeout_seconds must be within {MIN_TIMEOUT_SECONDS}..={MAX_TIMEOUT_SECONDS}, got {}",
                self.timeout_seconds
            )));
        }
        if !(MIN_MEMORY_MB..=MAX_MEMORY_MB).contains(&self.memory_mb) {
            return Err(Error::validation(format!(
                "memory_mb must be within {MIN_MEMORY_MB}..={MAX_MEMORY_MB}, got {}",
                self.memory_mb
            )));
        }
        self.environment.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionRegistration {
    pub name: String,
    pub version: u64,
    pub artifact_hash: String,
    pub identity: IdentityId,
    pub timeout_seconds: u32,
    pub memory_mb: u32,
    pub environment: BTreeMap<String, String>,
}

impl FunctionRegistration {
    fn same_definition(&self, other: &FunctionRegistration) -> bool {
        self.artifact_hash == other.artifact_hash
            && self.identity == other.identity
            && self.timeout_seconds == other.timeout_seconds
            && self.memory_mb == other.memory_mb
            && self.environment == other.environment
    }
}

#[derive(Debug, Default)]
struct FunctionRecord {
    versions: Vec<FunctionRegistration>,
    live: usize,
}

#[derive(Debug, Default)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, FunctionRecord>,
}

pub fn is_content_hash(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces `name`. An identical definition is `Unchanged`
    /// and publishes nothing.
    pub fn register(
        &mut self,
        name: &str,
        artifact_hash: &str,
        identity: &IdentityId,
        runtime: &RuntimeConfig,
        boundary: &PermissionBoundary,
    ) -> Result<(ApplyOutcome, FunctionRegistration)> {
        validate_function_name(name)?;
        if !is_content_hash(artifact_hash) {
            return Err(Error::validation(format!(
                "function '{name}' references '{artifact_hash}', which is not a sha256 artifact hash"
            )));
        }
        runtime.validate()?;

        let execution = boundary.identity(identity).ok_or_else(|| Error::NotFound {
            kind: "identity",
            name: identity.to_string(),
        })?;
        if execution.trust.principal != COMPUTE_SERVICE_PRINCIPAL {
            return Err(Error::validation(format!(
                "identity '{identity}' trusts '{}', not {COMPUTE_SERVICE_PRINCIPAL}",
                execution.trust.principal
            )));
        }

        let record = self.functions.entry(name.to_string()).or_default();
        let candidate = FunctionRegistration {
            name: name.to_string(),
            version: record.versions.last().map_or(1, |latest| latest.version + 1),
            artifact_hash: artifact_hash.to_string(),
            identity: identity.clone(),
            timeout_seconds: runtime.timeout_seconds,
            memory_mb: runtime.memory_mb,
            environment: runtime.environment.variables(),
        };

        if let Some(live) = record.versions.get(record.live) {
            if live.same_definition(&candidate) {
                return Ok((ApplyOutcome::Unchanged, live.clone()));
            }
        }

        let outcome = if record.versions.is_empty() {
            ApplyOutcome::Created
        } else {
            ApplyOutcome::Updated
        };
        record.versions.push(candidate.clone());
        let pruned = record.versions.len().saturating_sub(RETAINED_VERSIONS);
        record.versions.drain(..pruned);
        record.live = record.versions.len() - 1;

        info!(
            component = "function_registry",
            event = "function_published",
            function = %name,
            version = candidate.version,
            artifact_hash = %candidate.artifact_hash,
            ?outcome,
        );
        Ok((outcome, candidate))
    }

    pub fn live(&self, name: &str) -> Option<&FunctionRegistration> {
        self.functions
            .get(name)
            .and_then(|record| record.versions.get(record.live))
    }

    pub fn invoke_target(&self, name: &str) -> Result<&FunctionRegistration> {
        self.live(name).ok_or_else(|| Error::NotFound {
            kind: "function",
            name: name.to_string(),
        })
    }

    /// Retained versions, oldest first.
    pub fn versions(&self, name: &str) -> &[FunctionRegistration] {
        self.functions
            .get(name)
            .map(|record| record.versions.as_slice())
            .unwrap_or_default()
    }
}
