use crate::manifest::is_signed_legacy;
use crate::RegistryError;
use imgshift_schema::{ImageDigest, PullSpec};
use sha2::{Digest, Sha256};

/// `sha256:<hex>` of arbitrary bytes.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Canonical digest of a manifest as a registry would address it.
///
/// Signed schema 1 manifests are digested over their payload with the
/// signatures stripped, which this crate does not reproduce, so they are
/// refused rather than given a digest no registry would agree with.
pub fn manifest_digest(manifest: &[u8]) -> Result<ImageDigest, RegistryError> {
    if manifest.is_empty() {
        return Err(RegistryError::Digest("manifest is empty".to_owned()));
    }
    if is_signed_legacy(manifest) {
        return Err(RegistryError::Digest(
            "signed schema 1 manifest has no canonical digest".to_owned(),
        ));
    }
    Ok(ImageDigest::new(sha256_digest(manifest)))
}

/// Bookkeeping for a version record after a copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub digest: ImageDigest,
    pub locator: PullSpec,
    pub changed: bool,
}

/// Recompute the manifest digest and rewrite the locator's `@digest` suffix
/// when it moved.
///
/// `changed` holds only when the digest differs *and* the prior locator is
/// digest-addressed; a tag-addressed locator is returned as is.
pub fn reconcile(
    manifest: &[u8],
    prior_digest: &ImageDigest,
    prior_locator: &PullSpec,
) -> Result<Reconciled, RegistryError> {
    let digest = manifest_digest(manifest)?;
    match prior_locator.digest_suffix() {
        Some(old) if digest != *prior_digest => {
            let name = &prior_locator[..prior_locator.len() - old.len() - 1];
            let locator = PullSpec::new(format!("{name}@{digest}"));
            Ok(Reconciled {
                digest,
                locator,
                changed: true,
            })
        }
        _ => Ok(Reconciled {
            digest,
            locator: prior_locator.clone(),
            changed: false,
        }),
    }
}
