//! Resource model, migration annotations, and configuration for imgshift.
//!
//! This crate defines the schema layer: the image-stream-like resource
//! (`ImageVersionSet`) with its tag histories and tag specs, the annotation
//! keys that steer image relocation during backup and restore, and the TOML
//! configuration (`RelocationConfig`) shared by the engine and the CLI.

pub mod annotations;
pub mod config;
pub mod imagestream;
pub mod types;

pub use annotations::{parse_pairs, MigrationAnnotations};
pub use config::{parse_config_file, parse_config_str, ConfigError, RelocationConfig};
pub use imagestream::{
    ImageVersionSet, ObjectMeta, ObjectReference, TagHistory, TagSource, TagSpec, VersionRecord,
};
pub use types::{ImageDigest, PullSpec};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read resource: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid resource JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid resource: {0}")]
    InvalidResource(String),
    #[error("invalid annotation {0}")]
    InvalidAnnotation(String),
}
