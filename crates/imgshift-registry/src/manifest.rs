use crate::digest::sha256_digest;
use crate::RegistryError;
use serde::Deserialize;

pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_MANIFEST_V1: &str = "application/vnd.docker.distribution.manifest.v1+json";
pub const DOCKER_MANIFEST_V1_SIGNED: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";

const MODERN_TYPES: [&str; 4] = [OCI_MANIFEST, OCI_INDEX, DOCKER_MANIFEST_V2, DOCKER_MANIFEST_LIST];
const LEGACY_TYPES: [&str; 2] = [DOCKER_MANIFEST_V1_SIGNED, DOCKER_MANIFEST_V1];

/// Value for the `Accept` header of a manifest request.
pub fn accept_header(accept_legacy: bool) -> String {
    if accept_legacy {
        MODERN_TYPES
            .iter()
            .chain(LEGACY_TYPES.iter())
            .copied()
            .collect::<Vec<_>>()
            .join(", ")
    } else {
        MODERN_TYPES.join(", ")
    }
}

/// Manifest bytes exactly as served, plus their media type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawManifest {
    pub media_type: String,
    pub data: Vec<u8>,
}

/// Blobs and child manifests a manifest points at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestReferences {
    /// Config and layer digests, in manifest order, without duplicates.
    pub blobs: Vec<String>,
    /// Child manifest digests of an index or manifest list.
    pub manifests: Vec<String>,
    /// Schema 1 manifest.
    pub legacy: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestDoc {
    schema_version: Option<u32>,
    media_type: Option<String>,
    config: Option<Descriptor>,
    #[serde(default)]
    layers: Vec<Descriptor>,
    #[serde(default)]
    manifests: Vec<Descriptor>,
    #[serde(default)]
    fs_layers: Vec<FsLayer>,
    #[serde(default)]
    signatures: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    digest: String,
}

#[derive(Debug, Deserialize)]
struct FsLayer {
    #[serde(rename = "blobSum")]
    blob_sum: String,
}

fn parse_doc(data: &[u8]) -> Result<ManifestDoc, RegistryError> {
    serde_json::from_slice(data).map_err(|e| RegistryError::Manifest(e.to_string()))
}

/// Guess the media type of manifest bytes served without a usable
/// `Content-Type`.
pub fn sniff_media_type(data: &[u8]) -> String {
    let Ok(doc) = parse_doc(data) else {
        return OCI_MANIFEST.to_owned();
    };
    if let Some(media_type) = doc.media_type {
        return media_type;
    }
    if doc.schema_version == Some(1) {
        return if doc.signatures.is_empty() {
            DOCKER_MANIFEST_V1.to_owned()
        } else {
            DOCKER_MANIFEST_V1_SIGNED.to_owned()
        };
    }
    if doc.manifests.is_empty() {
        OCI_MANIFEST.to_owned()
    } else {
        OCI_INDEX.to_owned()
    }
}

/// True for schema 1 manifests carrying JWS signatures.
pub fn is_signed_legacy(data: &[u8]) -> bool {
    parse_doc(data).is_ok_and(|doc| doc.schema_version == Some(1) && !doc.signatures.is_empty())
}

impl RawManifest {
    pub fn new(media_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            media_type: media_type.into(),
            data,
        }
    }

    /// Build from bytes, sniffing the media type when `media_type` is blank or
    /// a generic JSON type.
    pub fn from_served(media_type: Option<&str>, data: Vec<u8>) -> Self {
        let media_type = match media_type.map(|m| m.split(';').next().unwrap_or(m).trim()) {
            Some(m) if !m.is_empty() && m != "application/json" && m != "text/plain" => {
                m.to_owned()
            }
            _ => sniff_media_type(&data),
        };
        Self { media_type, data }
    }

    /// `sha256:<hex>` of the raw bytes.
    pub fn digest(&self) -> String {
        sha256_digest(&self.data)
    }

    pub fn is_index(&self) -> bool {
        self.media_type == OCI_INDEX || self.media_type == DOCKER_MANIFEST_LIST
    }

    pub fn is_legacy(&self) -> bool {
        LEGACY_TYPES.contains(&self.media_type.as_str())
    }

    pub fn references(&self) -> Result<ManifestReferences, RegistryError> {
        let doc = parse_doc(&self.data)?;
        let legacy = self.is_legacy() || doc.schema_version == Some(1);

        let mut blobs: Vec<String> = Vec::new();
        let mut push = |digest: String| {
            if !blobs.contains(&digest) {
                blobs.push(digest);
            }
        };
        if let Some(config) = doc.config {
            push(config.digest);
        }
        for layer in doc.layers {
            push(layer.digest);
        }
        for layer in doc.fs_layers {
            push(layer.blob_sum);
        }

        let manifests = doc.manifests.into_iter().map(|m| m.digest).collect();
        Ok(ManifestReferences {
            blobs,
            manifests,
            legacy,
        })
    }
}
