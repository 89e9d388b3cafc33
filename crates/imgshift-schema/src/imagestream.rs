use crate::types::{ImageDigest, PullSpec};
use crate::SchemaError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Wire kind of a tag reference pointing at another tag of an image stream.
pub const KIND_IMAGE_STREAM_TAG: &str = "ImageStreamTag";
/// Wire kind of a tag reference pointing at a specific image digest.
pub const KIND_IMAGE_STREAM_IMAGE: &str = "ImageStreamImage";
/// Wire kind of a tag reference pointing at an arbitrary external image.
pub const KIND_DOCKER_IMAGE: &str = "DockerImage";

/// An image-stream-like resource: a set of named tags, each with the history
/// of image versions that have been pushed to it.
///
/// Only the fields the relocation engine reads are modeled. Everything else
/// (apiVersion, kind, unrelated metadata, per-record timestamps, conditions)
/// is kept in the flattened `extra` maps so the resource round-trips intact.
/// Optional fields and collections keep their absent/empty distinction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageVersionSet {
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<ImageVersionSetSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ImageVersionSetStatus>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageVersionSetSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<TagSpec>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageVersionSetStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<TagHistory>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Desired state of one tag: where it is fed from, if anywhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<ObjectReference>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectReference {
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Classified "from" reference of a [`TagSpec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagSource<'a> {
    /// Another tag of this or another image stream (`ImageStreamTag`).
    VersionTag {
        name: &'a str,
        namespace: Option<&'a str>,
    },
    /// A specific image by digest (`ImageStreamImage`).
    ByDigest {
        name: &'a str,
        namespace: Option<&'a str>,
    },
    /// Anything else, typically an external `DockerImage` pull spec.
    External { kind: &'a str, name: &'a str },
}

impl ObjectReference {
    pub fn source(&self) -> TagSource<'_> {
        let namespace = self.namespace.as_deref().filter(|ns| !ns.is_empty());
        match self.kind.as_str() {
            KIND_IMAGE_STREAM_TAG => TagSource::VersionTag {
                name: &self.name,
                namespace,
            },
            KIND_IMAGE_STREAM_IMAGE => TagSource::ByDigest {
                name: &self.name,
                namespace,
            },
            kind => TagSource::External {
                kind,
                name: &self.name,
            },
        }
    }
}

impl TagSpec {
    /// Whether relocating this tag's images should also move the tag pointer
    /// in the destination registry.
    ///
    /// Tags without a `from` reference, or fed from a tag in the same
    /// namespace, move the pointer. Cross-namespace tag references, digest
    /// references and external images only get their content relocated.
    pub fn moves_tag_pointer(&self, set_namespace: &str) -> bool {
        match self.from.as_ref().map(ObjectReference::source) {
            None => true,
            Some(TagSource::VersionTag { namespace, .. }) => {
                namespace.map_or(true, |ns| ns == set_namespace)
            }
            Some(TagSource::ByDigest { .. } | TagSource::External { .. }) => false,
        }
    }
}

/// One tag's history, most recently appended record last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagHistory {
    pub tag: String,
    #[serde(default)]
    pub items: Vec<VersionRecord>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// One pushed image within a tag history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    #[serde(rename = "dockerImageReference")]
    pub source_locator: PullSpec,
    #[serde(rename = "image")]
    pub content_digest: ImageDigest,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl VersionRecord {
    /// Copy of this record pointing at a new digest. Locator and digest are
    /// always replaced together.
    #[must_use]
    pub fn with_digest(&self, digest: ImageDigest, locator: PullSpec) -> Self {
        Self {
            source_locator: locator,
            content_digest: digest,
            extra: self.extra.clone(),
        }
    }
}

impl ImageVersionSet {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Namespace of the resource; empty when the resource names none.
    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }

    pub fn annotations(&self) -> &BTreeMap<String, String> {
        static NONE: BTreeMap<String, String> = BTreeMap::new();
        self.metadata.annotations.as_ref().unwrap_or(&NONE)
    }

    pub fn spec_tag(&self, name: &str) -> Option<&TagSpec> {
        self.spec
            .as_ref()
            .and_then(|spec| spec.tags.as_deref())
            .and_then(|tags| tags.iter().find(|t| t.name == name))
    }

    pub fn tag_histories(&self) -> &[TagHistory] {
        self.status
            .as_ref()
            .and_then(|s| s.tags.as_deref())
            .unwrap_or_default()
    }

    /// Copy of this resource with its tag histories replaced.
    #[must_use]
    pub fn with_tag_histories(&self, tags: Vec<TagHistory>) -> Self {
        let mut next = self.clone();
        next.status.get_or_insert_with(Default::default).tags = Some(tags);
        next
    }

    pub fn from_json(input: &str) -> Result<Self, SchemaError> {
        let set: Self = serde_json::from_str(input)?;
        if set.metadata.name.is_empty() {
            return Err(SchemaError::InvalidResource(
                "metadata.name must not be empty".to_owned(),
            ));
        }
        Ok(set)
    }

    pub fn to_json_pretty(&self) -> Result<String, SchemaError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: &Path) -> Result<Self, SchemaError> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }
}
