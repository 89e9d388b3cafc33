use crate::context::RegistryContext;
use crate::digest::sha256_digest;
use crate::http::HttpRegistry;
use crate::locator::{Locator, Reference, Transport};
use crate::manifest::RawManifest;
use crate::{ImageRepository, RegistryError, TransportHandle};
use std::sync::Arc;
use tracing::{debug, info};

/// Signature policy applied to every source image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TrustPolicy {
    /// No signature verification.
    #[default]
    InsecureAcceptAnything,
    Reject,
}

/// Policy evaluation scope for one copy call. Released on drop.
#[derive(Debug)]
pub struct PolicyContext {
    policy: TrustPolicy,
}

impl PolicyContext {
    pub fn acquire(policy: TrustPolicy) -> Self {
        debug!("trust policy context acquired ({policy:?})");
        Self { policy }
    }

    pub fn evaluate(&self, image: &Locator) -> Result<(), RegistryError> {
        match self.policy {
            TrustPolicy::InsecureAcceptAnything => Ok(()),
            TrustPolicy::Reject => Err(RegistryError::PolicyRejected(format!(
                "{image} refused by reject policy"
            ))),
        }
    }
}

impl Drop for PolicyContext {
    fn drop(&mut self) {
        debug!("trust policy context released ({:?})", self.policy);
    }
}

/// A single copy attempt from `src` to `dest`.
pub trait Transfer: Send + Sync {
    fn transfer(
        &self,
        src: &Locator,
        dest: &Locator,
        src_ctx: &RegistryContext,
        dest_ctx: &RegistryContext,
        policy: &PolicyContext,
    ) -> Result<Vec<u8>, RegistryError>;
}

/// Opens direct locators over HTTP and virtual ones through their handle.
#[derive(Debug, Clone, Default)]
pub struct RegistryTransfer {
    plain_http_hosts: Vec<String>,
}

impl RegistryTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hosts contacted over plain HTTP regardless of context.
    #[must_use]
    pub fn with_plain_http_hosts(mut self, hosts: impl IntoIterator<Item = String>) -> Self {
        self.plain_http_hosts = hosts.into_iter().collect();
        self
    }

    fn open(&self, locator: &Locator, ctx: &RegistryContext) -> Result<TransportHandle, RegistryError> {
        match locator.transport() {
            Transport::Direct => {
                let host = locator.registry();
                let mut ctx = ctx.clone();
                if self.plain_http_hosts.iter().any(|h| h == host) {
                    ctx.plain_http = true;
                }
                Ok(Arc::new(HttpRegistry::new(host, ctx)?))
            }
            Transport::Virtual(handle) => Ok(Arc::clone(handle)),
        }
    }
}

impl Transfer for RegistryTransfer {
    fn transfer(
        &self,
        src: &Locator,
        dest: &Locator,
        src_ctx: &RegistryContext,
        dest_ctx: &RegistryContext,
        policy: &PolicyContext,
    ) -> Result<Vec<u8>, RegistryError> {
        let source = self.open(src, src_ctx)?;
        let destination = self.open(dest, dest_ctx)?;
        copy_image(
            source.as_ref(),
            src,
            destination.as_ref(),
            dest,
            src_ctx.accept_legacy_manifests,
            policy,
        )
    }
}

/// Copy one image: manifest, index children, and every referenced blob.
///
/// Returns the manifest bytes as written to the destination.
pub fn copy_image(
    source: &dyn ImageRepository,
    src: &Locator,
    destination: &dyn ImageRepository,
    dest: &Locator,
    accept_legacy: bool,
    policy: &PolicyContext,
) -> Result<Vec<u8>, RegistryError> {
    let src_repo = src.repository_path();
    let dest_repo = dest.repository_path();
    let reference = src.reference_or_default();

    let manifest = source.get_manifest(&src_repo, reference.as_str())?;
    if let Reference::Digest(expected) = &reference {
        verify(&manifest.data, expected, "manifest")?;
    }
    policy.evaluate(src)?;

    copy_contents(source, &src_repo, destination, &dest_repo, &manifest, accept_legacy)?;

    let target = match dest.reference() {
        Some(r) => r.as_str().to_owned(),
        None => manifest.digest(),
    };
    destination.put_manifest(&dest_repo, &target, &manifest)?;
    if manifest.is_index() {
        info!("copied index {src} -> {dest}");
    } else {
        info!("copied {src} -> {dest}");
    }
    Ok(manifest.data)
}

fn copy_contents(
    source: &dyn ImageRepository,
    src_repo: &str,
    destination: &dyn ImageRepository,
    dest_repo: &str,
    manifest: &RawManifest,
    accept_legacy: bool,
) -> Result<(), RegistryError> {
    let refs = manifest.references()?;
    if refs.legacy && !accept_legacy {
        return Err(RegistryError::Manifest(format!(
            "legacy schema 1 manifest ({}) is not accepted",
            manifest.media_type
        )));
    }

    for child in &refs.manifests {
        let child_manifest = source.get_manifest(src_repo, child)?;
        verify(&child_manifest.data, child, "manifest")?;
        copy_contents(
            source,
            src_repo,
            destination,
            dest_repo,
            &child_manifest,
            accept_legacy,
        )?;
        destination.put_manifest(dest_repo, child, &child_manifest)?;
        debug!("copied child manifest {child}");
    }

    for blob in &refs.blobs {
        if destination.has_blob(dest_repo, blob)? {
            debug!("blob {blob} already present in {dest_repo}");
            continue;
        }
        let data = source.get_blob(src_repo, blob)?;
        verify(&data, blob, "blob")?;
        destination.put_blob(dest_repo, blob, &data)?;
        debug!("copied blob {blob} ({} bytes)", data.len());
    }
    Ok(())
}

/// Check sha256 content against its digest. Other algorithms pass through.
fn verify(data: &[u8], expected: &str, what: &str) -> Result<(), RegistryError> {
    if !expected.starts_with("sha256:") {
        return Ok(());
    }
    let actual = sha256_digest(data);
    if actual == expected {
        Ok(())
    } else {
        Err(RegistryError::IntegrityFailure {
            key: what.to_owned(),
            expected: expected.to_owned(),
            actual,
        })
    }
}
