//! # Source Objects
//!
//! Read-only view of the Flux source a Terraform object points at.

use crate::crd::{ObjectKey, SourceKind};
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde::Deserialize;

/// Downloadable snapshot of the source content
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Artifact {
    pub url: String,
    pub revision: String,
    /// Lowercase hex checksum, or an `<algorithm>:<hex>` digest
    ///
    /// A bare 40 character checksum is SHA-1, any other bare checksum SHA-256.
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceObject {
    pub kind: SourceKind,
    pub key: ObjectKey,
    /// `None` until the source controller has produced an artifact
    pub artifact: Option<Artifact>,
}

#[derive(Debug, Default, Deserialize)]
struct RawArtifact {
    #[serde(default)]
    url: String,
    #[serde(default)]
    revision: String,
    #[serde(default)]
    checksum: String,
    /// `<algorithm>:<hex>`
    #[serde(default)]
    digest: String,
}

impl SourceObject {
    pub fn from_dynamic(kind: SourceKind, object: &DynamicObject) -> Self {
        let artifact = object
            .data
            .pointer("/status/artifact")
            .filter(|a| !a.is_null())
            .and_then(|a| serde_json::from_value::<RawArtifact>(a.clone()).ok())
            .filter(|a| !a.url.is_empty())
            .map(|raw| {
                let checksum = if raw.checksum.is_empty() {
                    raw.digest
                } else {
                    raw.checksum
                };
                Artifact {
                    url: raw.url,
                    revision: raw.revision,
                    checksum,
                }
            });

        Self {
            kind,
            key: ObjectKey::new(object.namespace().unwrap_or_default(), object.name_any()),
            artifact,
        }
    }

    /// Current artifact revision, empty without an artifact
    pub fn revision(&self) -> &str {
        self.artifact.as_ref().map_or("", |a| a.revision.as_str())
    }
}
