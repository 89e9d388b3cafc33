//! Registry access and image copy for imgshift.
//!
//! This crate provides the pieces the relocation walk is assembled from:
//! reference classification against the internal registry (`classify`),
//! transport-aware source/destination locators (`locator`), authentication and
//! TLS policy per registry (`context`), manifest digest reconciliation
//! (`digest`), and a retrying copier (`copier`) that moves a manifest and its
//! blobs between two [`ImageRepository`] implementations: a registry v2 HTTP
//! client (`http`) and an object-store backed virtual registry (`objstore`).

pub mod cancel;
pub mod classify;
pub mod context;
pub mod copier;
pub mod digest;
pub mod http;
pub mod locator;
pub mod manifest;
pub mod objstore;
#[cfg(feature = "test-util")]
pub mod testing;
pub mod transfer;

pub use cancel::CancelToken;
pub use classify::{classify, Classification};
pub use context::{
    internal_context, migration_context, CredentialProvider, Credentials, RegistryContext,
    ServiceAccountToken, StaticToken,
};
pub use copier::{Copier, ImageCopier, RetryPolicy, Sleeper};
pub use digest::{reconcile, Reconciled};
pub use locator::{build_locators, Locator, LocatorRequest, Reference, TransportFamily};
pub use manifest::RawManifest;
pub use objstore::{ObjectStoreLocations, ObjectStoreRegistry};
pub use transfer::{PolicyContext, RegistryTransfer, Transfer, TrustPolicy};

use std::sync::Arc;
use thiserror::Error;

/// Message registries return when a manifest references a blob they do not have.
pub const BLOB_UNKNOWN_MESSAGE: &str = "blob unknown to registry";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry configuration error: {0}")]
    Config(String),
    #[error("invalid image locator: {0}")]
    Locator(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("registry I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("integrity failure for '{key}': expected {expected}, got {actual}")]
    IntegrityFailure {
        key: String,
        expected: String,
        actual: String,
    },
    #[error("invalid manifest: {0}")]
    Manifest(String),
    #[error("digest computation failed: {0}")]
    Digest(String),
    #[error("rejected by trust policy: {0}")]
    PolicyRejected(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl RegistryError {
    /// Whether the error text carries the registry's "blob unknown" signal.
    pub fn is_blob_unknown(&self) -> bool {
        self.to_string().contains(BLOB_UNKNOWN_MESSAGE)
    }
}

/// Storage backend holding repositories of manifests and blobs.
///
/// Implemented by the registry v2 HTTP client for direct registries and by
/// object-store backed virtual registries. `repository` is always the
/// `namespace/name` path without registry host.
pub trait ImageRepository: Send + Sync {
    /// Host name for direct registries, transport name for virtual ones.
    fn name(&self) -> &str;

    /// Fetch a manifest by tag or digest.
    fn get_manifest(&self, repository: &str, reference: &str) -> Result<RawManifest, RegistryError>;

    /// Store a manifest under a tag or digest.
    fn put_manifest(
        &self,
        repository: &str,
        reference: &str,
        manifest: &RawManifest,
    ) -> Result<(), RegistryError>;

    fn has_blob(&self, repository: &str, digest: &str) -> Result<bool, RegistryError>;

    fn get_blob(&self, repository: &str, digest: &str) -> Result<Vec<u8>, RegistryError>;

    fn put_blob(&self, repository: &str, digest: &str, data: &[u8]) -> Result<(), RegistryError>;
}

/// Shared handle to a virtual transport.
pub type TransportHandle = Arc<dyn ImageRepository>;

/// Looks up the virtual transport serving a storage location.
pub trait TransportResolver: Send + Sync {
    fn resolve(&self, location: &str) -> Result<TransportHandle, RegistryError>;
}
