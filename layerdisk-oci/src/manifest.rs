//! Manifest documents served by the `/v2/<repo>/manifests/<ref>` endpoint.
//!
//! Only the fields the disk converter reads are modelled; everything else in
//! the JSON (annotations, the image config descriptor) is ignored.

use serde::{Deserialize, Serialize};

use crate::{ContentHash, OciError, Result};

pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Nydus images carry their bootstrap (filesystem metadata) as a plain gzip
/// OCI layer.
pub const MEDIA_TYPE_NYDUS_BOOTSTRAP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
/// Nydus data blobs.
pub const MEDIA_TYPE_NYDUS_BLOB: &str = "application/vnd.oci.image.layer.nydus.blob.v1";

/// Media types sent in `Accept` when resolving a tag.
pub const ACCEPT_ANY: [&str; 4] = [
    MEDIA_TYPE_OCI_INDEX,
    MEDIA_TYPE_DOCKER_MANIFEST_LIST,
    MEDIA_TYPE_OCI_MANIFEST,
    MEDIA_TYPE_DOCKER_MANIFEST,
];

/// Media types sent in `Accept` when fetching a platform manifest.
pub const ACCEPT_IMAGE: [&str; 2] = [MEDIA_TYPE_OCI_MANIFEST, MEDIA_TYPE_DOCKER_MANIFEST];

/// Content descriptor shared by manifests and indexes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

/// A single-platform image manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: String,
    pub layers: Vec<Descriptor>,
}

impl ImageManifest {
    /// Layer descriptors with parsed digests, in manifest order.
    pub fn layer_descriptors(&self) -> Result<Vec<(ContentHash, &Descriptor)>> {
        let mut out = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            out.push((ContentHash::parse(&layer.digest)?, layer));
        }
        Ok(out)
    }
}

/// A multi-platform index (manifest list).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    pub manifests: Vec<Descriptor>,
}

impl ImageIndex {
    /// Descriptor of the manifest built for `target`.
    pub fn select(&self, target: &Platform) -> Result<&Descriptor> {
        self.manifests
            .iter()
            .find(|d| d.platform.as_ref().is_some_and(|p| target.accepts(p)))
            .ok_or_else(|| OciError::Manifest(format!("index has no manifest for {}", target)))
    }
}

/// OS/architecture pair used to pick an entry out of an [`ImageIndex`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    /// Linux on the architecture this binary was built for.
    pub fn host() -> Self {
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "powerpc64" => "ppc64le",
            other => other,
        };
        Self {
            architecture: architecture.to_string(),
            os: "linux".to_string(),
            variant: None,
        }
    }

    /// An unset variant on `self` matches any variant of `candidate`.
    fn accepts(&self, candidate: &Platform) -> bool {
        self.os == candidate.os
            && self.architecture == candidate.architecture
            && (self.variant.is_none() || self.variant == candidate.variant)
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

/// Either kind of document a manifest endpoint can return.
#[derive(Debug, Clone)]
pub enum ManifestDocument {
    Image(ImageManifest),
    Index(ImageIndex),
}

impl ManifestDocument {
    /// Decode a manifest body. Documents without a `mediaType` are told
    /// apart by the presence of a `manifests` array.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(body)?;
        let media_type = value
            .get("mediaType")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        let is_index = matches!(
            media_type,
            MEDIA_TYPE_OCI_INDEX | MEDIA_TYPE_DOCKER_MANIFEST_LIST
        ) || (media_type.is_empty() && value.get("manifests").is_some());

        if is_index {
            Ok(Self::Index(serde_json::from_value(value)?))
        } else if media_type.is_empty()
            || media_type == MEDIA_TYPE_OCI_MANIFEST
            || media_type == MEDIA_TYPE_DOCKER_MANIFEST
        {
            Ok(Self::Image(serde_json::from_value(value)?))
        } else {
            Err(OciError::Manifest(format!(
                "unsupported manifest media type {}",
                media_type
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(c: char) -> String {
        format!("sha256:{}", c.to_string().repeat(64))
    }

    fn nydus_manifest(bootstrap_digest: &str) -> String {
        serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_OCI_MANIFEST,
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": digest('c'),
                "size": 1234
            },
            "layers": [
                { "mediaType": MEDIA_TYPE_NYDUS_BLOB, "digest": digest('1'), "size": 5678 },
                { "mediaType": MEDIA_TYPE_NYDUS_BLOB, "digest": digest('2'), "size": 91011 },
                { "mediaType": MEDIA_TYPE_NYDUS_BOOTSTRAP, "digest": bootstrap_digest, "size": 4096 }
            ]
        })
        .to_string()
    }

    fn index() -> String {
        serde_json::json!({
            "schemaVersion": 2,
            "manifests": [
                {
                    "mediaType": MEDIA_TYPE_OCI_MANIFEST,
                    "digest": digest('a'),
                    "size": 100,
                    "platform": { "architecture": "amd64", "os": "linux" }
                },
                {
                    "mediaType": MEDIA_TYPE_OCI_MANIFEST,
                    "digest": digest('b'),
                    "size": 200,
                    "platform": { "architecture": "arm64", "os": "linux", "variant": "v8" }
                }
            ]
        })
        .to_string()
    }

    fn linux(arch: &str) -> Platform {
        Platform {
            architecture: arch.to_string(),
            os: "linux".to_string(),
            variant: None,
        }
    }

    #[test]
    fn decodes_nydus_manifest_in_order() {
        let doc = ManifestDocument::from_slice(nydus_manifest(&digest('3')).as_bytes()).unwrap();
        let ManifestDocument::Image(m) = doc else {
            panic!("expected an image manifest");
        };
        let layers = m.layer_descriptors().unwrap();
        let kinds: Vec<&str> = layers.iter().map(|(_, d)| d.media_type.as_str()).collect();
        assert_eq!(
            kinds,
            vec![MEDIA_TYPE_NYDUS_BLOB, MEDIA_TYPE_NYDUS_BLOB, MEDIA_TYPE_NYDUS_BOOTSTRAP]
        );
        assert_eq!(layers[2].0.to_string(), digest('3'));
        assert_eq!(layers[1].1.size, 91011);
    }

    #[test]
    fn malformed_layer_digest_is_rejected() {
        let doc = ManifestDocument::from_slice(nydus_manifest("sha256:bbbb").as_bytes()).unwrap();
        let ManifestDocument::Image(m) = doc else {
            panic!("expected an image manifest");
        };
        assert!(matches!(
            m.layer_descriptors(),
            Err(OciError::InvalidDigest(_))
        ));
    }

    #[test]
    fn index_without_media_type_is_detected() {
        let doc = ManifestDocument::from_slice(index().as_bytes()).unwrap();
        assert!(matches!(doc, ManifestDocument::Index(_)));
    }

    #[test]
    fn unknown_document_type_is_an_error() {
        let body = br#"{"schemaVersion": 2, "mediaType": "text/plain", "layers": []}"#;
        assert!(matches!(
            ManifestDocument::from_slice(body),
            Err(OciError::Manifest(_))
        ));
    }

    #[test]
    fn selects_platform_entry() {
        let idx: ImageIndex = serde_json::from_str(&index()).unwrap();
        assert_eq!(idx.select(&linux("amd64")).unwrap().digest, digest('a'));
        // No variant requested: any arm64 variant will do.
        assert_eq!(idx.select(&linux("arm64")).unwrap().digest, digest('b'));

        let mut v7 = linux("arm64");
        v7.variant = Some("v7".into());
        assert!(idx.select(&v7).is_err());
        assert!(idx.select(&linux("s390x")).is_err());
    }

    #[test]
    fn platform_display() {
        let mut p = linux("arm64");
        assert_eq!(p.to_string(), "linux/arm64");
        p.variant = Some("v8".into());
        assert_eq!(p.to_string(), "linux/arm64/v8");
    }
}
