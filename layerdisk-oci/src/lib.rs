//! Minimal OCI distribution client: reference parsing, manifest and image
//! index resolution, and streaming blob downloads.

pub mod digest;
pub mod error;
pub mod manifest;
pub mod registry;

pub use digest::ContentHash;
pub use error::{OciError, Result};
pub use registry::{BlobStream, ImageRef, ResolvedManifest};

use tracing::info;

/// OCI image client -- resolves manifests and opens blob streams for the
/// host platform.
pub struct OciClient {
    registry: registry::RegistryClient,
    platform: manifest::Platform,
}

impl OciClient {
    pub fn new() -> Result<Self> {
        Ok(Self {
            registry: registry::RegistryClient::new()?,
            platform: manifest::Platform::host(),
        })
    }

    /// Override the platform used to pick a manifest out of an image index.
    pub fn with_platform(mut self, platform: manifest::Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Resolve `image_ref` to a single image manifest.
    pub async fn resolve(&self, image_ref: &ImageRef) -> Result<ResolvedManifest> {
        info!(
            registry = %image_ref.registry,
            repository = %image_ref.repository,
            reference = %image_ref.reference,
            "resolving image manifest",
        );
        self.registry
            .resolve_manifest(image_ref, &self.platform)
            .await
    }

    /// Open a streaming download of the blob `digest`.
    pub async fn blob(&self, image_ref: &ImageRef, digest: &ContentHash) -> Result<BlobStream> {
        self.registry.fetch_blob(image_ref, digest).await
    }
}
