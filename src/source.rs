//! Where image manifests and layer bytes come from.
//!
//! The conversion pipeline only talks to an [`ImageSource`]. The production
//! implementation, [`RegistrySource`], speaks the OCI distribution protocol
//! through `layerdisk-oci`; tests plug in in-memory sources.

use layerdisk_oci::{BlobStream, ContentHash, ImageRef, OciClient, OciError};

use crate::image::LayerDescriptor;

/// A manifest reduced to what the pipeline needs.
#[derive(Debug, Clone)]
pub struct SourceManifest {
    pub digest: ContentHash,
    /// Layers in manifest order, unclassified.
    pub layers: Vec<LayerDescriptor>,
}

/// Resolves manifests and streams layer blobs.
///
/// Implementations are shared by every concurrent fetch task.
#[async_trait::async_trait]
pub trait ImageSource: Send + Sync {
    /// Resolve `image_ref` to its layer list.
    async fn resolve_manifest(&self, image_ref: &ImageRef)
        -> Result<SourceManifest, OciError>;

    /// Open the blob `digest`. `expected_size` is advisory; the caller checks
    /// the byte count it actually receives.
    async fn fetch_blob(
        &self,
        image_ref: &ImageRef,
        digest: &ContentHash,
        expected_size: u64,
    ) -> Result<BlobStream, OciError>;
}

/// [`ImageSource`] backed by a remote OCI registry.
pub struct RegistrySource {
    client: OciClient,
}

impl RegistrySource {
    pub fn new() -> Result<Self, OciError> {
        Ok(Self {
            client: OciClient::new()?,
        })
    }

    pub fn with_client(client: OciClient) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl ImageSource for RegistrySource {
    async fn resolve_manifest(
        &self,
        image_ref: &ImageRef,
    ) -> Result<SourceManifest, OciError> {
        let resolved = self.client.resolve(image_ref).await?;
        let layers = resolved
            .manifest
            .layer_descriptors()?
            .into_iter()
            .map(|(digest, desc)| LayerDescriptor::new(digest, desc.size, desc.media_type.clone()))
            .collect();

        Ok(SourceManifest {
            digest: resolved.digest,
            layers,
        })
    }

    async fn fetch_blob(
        &self,
        image_ref: &ImageRef,
        digest: &ContentHash,
        _expected_size: u64,
    ) -> Result<BlobStream, OciError> {
        self.client.blob(image_ref, digest).await
    }
}
