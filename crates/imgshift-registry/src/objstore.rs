//! Virtual registry backed by a directory tree in the distribution storage
//! layout, one tree per storage location.
//!
//! ```text
//! docker/registry/v2/blobs/sha256/<hex[0..2]>/<hex>/data
//! docker/registry/v2/repositories/<repo>/_layers/sha256/<hex>/link
//! docker/registry/v2/repositories/<repo>/_manifests/revisions/sha256/<hex>/link
//! docker/registry/v2/repositories/<repo>/_manifests/tags/<tag>/current/link
//! ```
//!
//! Every write goes through a temp file and an atomic rename. Blob reads are
//! verified against their digest.

use crate::digest::sha256_digest;
use crate::manifest::{sniff_media_type, RawManifest};
use crate::{ImageRepository, RegistryError, TransportHandle, TransportResolver};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::debug;

/// Prefix of the transport name of an object-store location.
pub const TRANSPORT_PREFIX: &str = "objstore-";

pub struct ObjectStoreRegistry {
    name: String,
    root: PathBuf,
}

impl ObjectStoreRegistry {
    pub fn open(location: &str, root: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let name = transport_name(location)?;
        let root = root.into();
        fs::create_dir_all(root.join("docker/registry/v2"))?;
        Ok(Self { name, root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn v2(&self) -> PathBuf {
        self.root.join("docker/registry/v2")
    }

    fn blob_path(&self, digest: &str) -> Result<PathBuf, RegistryError> {
        let (algorithm, hex) = split_digest(digest)?;
        Ok(self
            .v2()
            .join("blobs")
            .join(algorithm)
            .join(&hex[..2])
            .join(hex)
            .join("data"))
    }

    fn repository_dir(&self, repository: &str) -> Result<PathBuf, RegistryError> {
        let valid = !repository.is_empty()
            && repository
                .split('/')
                .all(|c| !c.is_empty() && c != "." && c != ".." && !c.starts_with('_'));
        if !valid {
            return Err(RegistryError::Locator(format!(
                "invalid repository path '{repository}'"
            )));
        }
        Ok(self.v2().join("repositories").join(repository))
    }

    fn tag_link(&self, repository: &str, tag: &str) -> Result<PathBuf, RegistryError> {
        if tag.is_empty() || tag.contains('/') || tag.starts_with('.') {
            return Err(RegistryError::Locator(format!("invalid tag '{tag}'")));
        }
        Ok(self
            .repository_dir(repository)?
            .join("_manifests/tags")
            .join(tag)
            .join("current/link"))
    }

    fn revision_link(&self, repository: &str, digest: &str) -> Result<PathBuf, RegistryError> {
        let (algorithm, hex) = split_digest(digest)?;
        Ok(self
            .repository_dir(repository)?
            .join("_manifests/revisions")
            .join(algorithm)
            .join(hex)
            .join("link"))
    }

    fn layer_link(&self, repository: &str, digest: &str) -> Result<PathBuf, RegistryError> {
        let (algorithm, hex) = split_digest(digest)?;
        Ok(self
            .repository_dir(repository)?
            .join("_layers")
            .join(algorithm)
            .join(hex)
            .join("link"))
    }

    fn write_blob(&self, digest: &str, data: &[u8]) -> Result<(), RegistryError> {
        let path = self.blob_path(digest)?;
        if path.exists() {
            return Ok(());
        }
        write_atomic(&path, data)
    }

    fn read_blob(&self, digest: &str) -> Result<Vec<u8>, RegistryError> {
        let path = self.blob_path(digest)?;
        if !path.exists() {
            return Err(RegistryError::NotFound(format!("blob {digest} in {}", self.name)));
        }
        let data = fs::read(&path)?;
        let actual = sha256_digest(&data);
        if actual != digest {
            return Err(RegistryError::IntegrityFailure {
                key: digest.to_owned(),
                expected: digest.to_owned(),
                actual,
            });
        }
        Ok(data)
    }

    fn resolve_reference(&self, repository: &str, reference: &str) -> Result<String, RegistryError> {
        if reference.contains(':') {
            return Ok(reference.to_owned());
        }
        let link = self.tag_link(repository, reference)?;
        if !link.exists() {
            return Err(RegistryError::NotFound(format!(
                "{repository}:{reference} in {}",
                self.name
            )));
        }
        Ok(fs::read_to_string(link)?.trim().to_owned())
    }
}

impl ImageRepository for ObjectStoreRegistry {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_manifest(&self, repository: &str, reference: &str) -> Result<RawManifest, RegistryError> {
        let digest = self.resolve_reference(repository, reference)?;
        if !self.revision_link(repository, &digest)?.exists() {
            return Err(RegistryError::NotFound(format!(
                "manifest {repository}@{digest} in {}",
                self.name
            )));
        }
        let data = self.read_blob(&digest)?;
        Ok(RawManifest::new(sniff_media_type(&data), data))
    }

    fn put_manifest(
        &self,
        repository: &str,
        reference: &str,
        manifest: &RawManifest,
    ) -> Result<(), RegistryError> {
        let digest = manifest.digest();
        if reference.contains(':') && reference != digest {
            return Err(RegistryError::IntegrityFailure {
                key: format!("{repository}@{reference}"),
                expected: reference.to_owned(),
                actual: digest,
            });
        }
        self.write_blob(&digest, &manifest.data)?;
        write_atomic(&self.revision_link(repository, &digest)?, digest.as_bytes())?;
        if !reference.contains(':') {
            write_atomic(&self.tag_link(repository, reference)?, digest.as_bytes())?;
        }
        debug!("{}: stored manifest {repository}:{reference} ({digest})", self.name);
        Ok(())
    }

    fn has_blob(&self, repository: &str, digest: &str) -> Result<bool, RegistryError> {
        Ok(self.layer_link(repository, digest)?.exists() && self.blob_path(digest)?.exists())
    }

    fn get_blob(&self, repository: &str, digest: &str) -> Result<Vec<u8>, RegistryError> {
        if !self.layer_link(repository, digest)?.exists() {
            return Err(RegistryError::NotFound(format!(
                "blob {digest} in {repository} ({})",
                self.name
            )));
        }
        self.read_blob(digest)
    }

    fn put_blob(&self, repository: &str, digest: &str, data: &[u8]) -> Result<(), RegistryError> {
        let actual = sha256_digest(data);
        if actual != digest {
            return Err(RegistryError::IntegrityFailure {
                key: digest.to_owned(),
                expected: digest.to_owned(),
                actual,
            });
        }
        self.write_blob(digest, data)?;
        write_atomic(&self.layer_link(repository, digest)?, digest.as_bytes())
    }
}

/// Resolves storage locations to object-store registries under one root.
#[derive(Debug, Clone)]
pub struct ObjectStoreLocations {
    root: PathBuf,
}

impl ObjectStoreLocations {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl TransportResolver for ObjectStoreLocations {
    fn resolve(&self, location: &str) -> Result<TransportHandle, RegistryError> {
        let registry = ObjectStoreRegistry::open(location, self.root.join(location))?;
        debug!("opened object-store transport {} at {}", registry.name, registry.root.display());
        Ok(Arc::new(registry))
    }
}

/// Transport name for a storage location.
///
/// Locations are limited to `[a-z0-9.-]` (excluding `.` and `..`) so each
/// maps to a distinct name and a single directory under the root.
pub fn transport_name(location: &str) -> Result<String, RegistryError> {
    let valid = !location.is_empty()
        && location != "."
        && location != ".."
        && location
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'.' || b == b'-');
    if !valid {
        return Err(RegistryError::Config(format!(
            "invalid storage location '{location}': expected lowercase letters, digits, '.' or '-'"
        )));
    }
    Ok(format!("{TRANSPORT_PREFIX}{location}"))
}

fn split_digest(digest: &str) -> Result<(&str, &str), RegistryError> {
    match digest.split_once(':') {
        Some((algorithm, hex))
            if algorithm == "sha256"
                && hex.len() == 64
                && hex.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) =>
        {
            Ok((algorithm, hex))
        }
        _ => Err(RegistryError::Digest(format!("unsupported digest '{digest}'"))),
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<(), RegistryError> {
    let dir = path
        .parent()
        .ok_or_else(|| RegistryError::Config(format!("no parent for {}", path.display())))?;
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| RegistryError::Io(e.error))?;
    Ok(())
}
