//! Layer classification.
//!
//! A Nydus image manifest lists one bootstrap layer (filesystem metadata)
//! and any number of data blob layers, in no particular order. The disk
//! layout needs the bootstrap in the first partition, so classification
//! splits the manifest into the two groups and concatenates them.

use layerdisk_oci::manifest::{MEDIA_TYPE_NYDUS_BLOB, MEDIA_TYPE_NYDUS_BOOTSTRAP};
use layerdisk_oci::ContentHash;
use serde::Serialize;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Role of a layer in the disk image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    Bootstrap,
    Blob,
    Other,
}

impl LayerKind {
    pub fn from_media_type(media_type: &str) -> Self {
        match media_type {
            MEDIA_TYPE_NYDUS_BOOTSTRAP => LayerKind::Bootstrap,
            MEDIA_TYPE_NYDUS_BLOB => LayerKind::Blob,
            _ => LayerKind::Other,
        }
    }
}

/// One layer as listed by the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerDescriptor {
    pub digest: ContentHash,
    pub size: u64,
    pub media_type: String,
}

impl LayerDescriptor {
    pub fn new(digest: ContentHash, size: u64, media_type: impl Into<String>) -> Self {
        Self {
            digest,
            size,
            media_type: media_type.into(),
        }
    }

    pub fn kind(&self) -> LayerKind {
        LayerKind::from_media_type(&self.media_type)
    }
}

/// A classified image: bootstrap first, then blobs in manifest order.
#[derive(Debug, Clone, Serialize)]
pub struct ImageInfo {
    /// Reference the image was resolved from.
    pub source_ref: String,
    /// Digest of the manifest the layers came from.
    pub manifest_digest: ContentHash,
    pub layers: Vec<LayerDescriptor>,
    /// Sum of `layers[..].size`.
    pub total_size: u64,
}

impl ImageInfo {
    /// The bootstrap layer; `None` only for an `ImageInfo` not built by
    /// [`classify`].
    pub fn bootstrap(&self) -> Option<&LayerDescriptor> {
        self.layers.first()
    }

    pub fn blobs(&self) -> &[LayerDescriptor] {
        self.layers.get(1..).unwrap_or_default()
    }

    /// Number of leading layers covered by `limit` (all layers when `None`).
    pub fn included(&self, limit: Option<usize>) -> usize {
        limit.map_or(self.layers.len(), |n| n.min(self.layers.len()))
    }
}

/// Order `raw` into an [`ImageInfo`].
///
/// Layers whose media type is neither bootstrap nor blob are dropped and do
/// not count toward `total_size`.
pub fn classify(
    source_ref: &str,
    manifest_digest: ContentHash,
    raw: Vec<LayerDescriptor>,
) -> Result<ImageInfo> {
    let raw_count = raw.len();
    let mut bootstrap: Option<LayerDescriptor> = None;
    let mut blobs = Vec::with_capacity(raw_count);

    for layer in raw {
        match layer.kind() {
            LayerKind::Bootstrap => {
                if let Some(first) = &bootstrap {
                    return Err(Error::DuplicateBootstrap {
                        reference: source_ref.to_string(),
                        first: first.digest.to_string(),
                        second: layer.digest.to_string(),
                    });
                }
                bootstrap = Some(layer);
            }
            LayerKind::Blob => blobs.push(layer),
            LayerKind::Other => {
                warn!(
                    digest = %layer.digest,
                    media_type = %layer.media_type,
                    "skipping layer with unrecognized media type"
                );
            }
        }
    }

    let bootstrap = bootstrap.ok_or_else(|| Error::MissingBootstrap {
        reference: source_ref.to_string(),
    })?;

    let mut layers = Vec::with_capacity(blobs.len() + 1);
    layers.push(bootstrap);
    layers.extend(blobs);

    let total_size = layers.iter().map(|l| l.size).sum();
    debug!(
        raw = raw_count,
        kept = layers.len(),
        total_size,
        "classified image layers"
    );

    Ok(ImageInfo {
        source_ref: source_ref.to_string(),
        manifest_digest,
        layers,
        total_size,
    })
}
