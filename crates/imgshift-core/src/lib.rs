//! Relocation engine for imgshift.
//!
//! This crate ties the schema and registry layers together: the tag walker
//! (`walker`) drives classification, locator building, copy and digest
//! reconciliation over an image stream's tag histories, and the `Relocator`
//! (`engine`) decides from backup/restore annotations whether and where to
//! walk. It also provides the shared virtual-transport cache and Ctrl-C
//! handling for the CLI.

pub mod concurrency;
pub mod engine;
pub mod transports;
pub mod walker;

pub use concurrency::{install_signal_handler, shutdown_requested};
pub use engine::{BackupRequest, Plan, Relocation, Relocator, RestoreRequest, SkipReason};
pub use transports::TransportCache;
pub use walker::{plan_copies, walk, CopyOutcome, Direction, PlannedCopy, Route, WalkPlan};

use imgshift_registry::RegistryError;
use imgshift_schema::{ConfigError, SchemaError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Registry(#[from] RegistryError),
}

impl CoreError {
    /// Errors caused by settings or input rather than by a registry.
    pub fn is_configuration(&self) -> bool {
        match self {
            Self::Schema(_) | Self::Config(_) => true,
            Self::Registry(e) => matches!(e, RegistryError::Config(_) | RegistryError::Locator(_)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Registry(RegistryError::Cancelled(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_error_kinds() {
        let config = CoreError::from(RegistryError::Config("no token".to_owned()));
        assert!(config.is_configuration());
        assert!(!config.is_cancelled());

        let locator = CoreError::from(RegistryError::Locator("bad".to_owned()));
        assert!(locator.is_configuration());

        let http = CoreError::from(RegistryError::Http("HTTP 500".to_owned()));
        assert!(!http.is_configuration());

        let cancelled = CoreError::from(RegistryError::Cancelled("ctrl-c".to_owned()));
        assert!(cancelled.is_cancelled());
        assert!(!cancelled.is_configuration());

        assert!(CoreError::from(ConfigError::ZeroAttempts).is_configuration());
    }

    #[test]
    fn registry_errors_display_unwrapped() {
        let e = CoreError::from(RegistryError::NotFound("manifest ns/app:v1".to_owned()));
        assert_eq!(e.to_string(), "not found: manifest ns/app:v1");
    }
}
