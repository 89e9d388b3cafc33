use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_TOKEN_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
pub const DEFAULT_OBJECT_STORE_ROOT: &str = "/var/lib/imgshift/locations";
/// Upper bound for `retry.backoff_step_secs`.
pub const MAX_BACKOFF_STEP_SECS: u64 = 3600;
/// Upper bound for `registry.request_timeout_secs`.
pub const MAX_REQUEST_TIMEOUT_SECS: u64 = 24 * 3600;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("retry.attempts must be at least 1")]
    ZeroAttempts,
    #[error("registry.token_file must not be empty")]
    EmptyTokenFile,
    #[error("object_store.root must not be empty")]
    EmptyObjectStoreRoot,
    #[error("retry.backoff_step_secs must be at most {max}, got {value}")]
    BackoffStepTooLarge { value: u64, max: u64 },
    #[error("registry.request_timeout_secs must be at most {max}, got {value}")]
    RequestTimeoutTooLarge { value: u64, max: u64 },
}

/// Relocation settings, usually loaded from `imgshift.toml`.
///
/// Every section is optional; an empty file yields the defaults.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RelocationConfig {
    #[serde(default)]
    pub registry: RegistrySection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub object_store: ObjectStoreSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RegistrySection {
    /// Internal registry host path. Overrides the backup annotation when set.
    #[serde(default)]
    pub internal: Option<String>,
    #[serde(default = "default_token_file")]
    pub token_file: PathBuf,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Registry hosts reached over plain HTTP.
    #[serde(default)]
    pub plain_http_hosts: Vec<String>,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            internal: None,
            token_file: default_token_file(),
            request_timeout_secs: default_request_timeout(),
            plain_http_hosts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RetrySection {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_backoff_step")]
    pub backoff_step_secs: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            backoff_step_secs: default_backoff_step(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ObjectStoreSection {
    /// Directory holding one object-store registry per storage location.
    #[serde(default = "default_object_store_root")]
    pub root: PathBuf,
}

impl Default for ObjectStoreSection {
    fn default() -> Self {
        Self {
            root: default_object_store_root(),
        }
    }
}

fn default_token_file() -> PathBuf {
    PathBuf::from(DEFAULT_TOKEN_FILE)
}

fn default_request_timeout() -> u64 {
    300
}

fn default_attempts() -> u32 {
    7
}

fn default_backoff_step() -> u64 {
    5
}

fn default_object_store_root() -> PathBuf {
    PathBuf::from(DEFAULT_OBJECT_STORE_ROOT)
}

impl RelocationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if self.retry.backoff_step_secs > MAX_BACKOFF_STEP_SECS {
            return Err(ConfigError::BackoffStepTooLarge {
                value: self.retry.backoff_step_secs,
                max: MAX_BACKOFF_STEP_SECS,
            });
        }
        if self.registry.request_timeout_secs > MAX_REQUEST_TIMEOUT_SECS {
            return Err(ConfigError::RequestTimeoutTooLarge {
                value: self.registry.request_timeout_secs,
                max: MAX_REQUEST_TIMEOUT_SECS,
            });
        }
        if self.registry.token_file.as_os_str().is_empty() {
            return Err(ConfigError::EmptyTokenFile);
        }
        if self.object_store.root.as_os_str().is_empty() {
            return Err(ConfigError::EmptyObjectStoreRoot);
        }
        Ok(())
    }

    /// The configured internal registry override, ignoring blank values.
    pub fn internal_registry(&self) -> Option<&str> {
        self.registry
            .internal
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

pub fn parse_config_str(input: &str) -> Result<RelocationConfig, ConfigError> {
    let config: RelocationConfig = toml::from_str(input)?;
    config.validate()?;
    Ok(config)
}

pub fn parse_config_file(path: impl AsRef<Path>) -> Result<RelocationConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config_str(&content)
}
