//! The conversion driver.
//!
//! Runs the phases in order and returns the first error; nothing below this
//! level decides how the process exits. Blocking disk work runs on the
//! blocking pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use layerdisk_oci::{ImageRef, OciError};
use tracing::info;

use crate::config::ConvertConfig;
use crate::fetch::{FetchedBlob, Fetcher};
use crate::image::{classify, ImageInfo};
use crate::layout::{self, plan_disk};
use crate::source::{ImageSource, RegistrySource};
use crate::validate::ValidationResult;
use crate::{builder, validate, Error, Result};

/// What a completed conversion produced.
#[derive(Debug)]
pub struct ConvertReport {
    pub image: ImageInfo,
    pub blobs: Vec<FetchedBlob>,
    /// `output.img` (a symlink to the last part in incremental mode).
    pub output: PathBuf,
    /// Part files in incremental mode, empty otherwise.
    pub parts: Vec<PathBuf>,
    /// One result per disk image validated.
    pub validations: Vec<ValidationResult>,
}

/// Converts one image into a GPT disk image.
pub struct Converter {
    config: ConvertConfig,
    source: Arc<dyn ImageSource>,
}

impl Converter {
    pub fn new(config: ConvertConfig, source: Arc<dyn ImageSource>) -> Self {
        Self { config, source }
    }

    /// Converter talking to the registry named in the image reference.
    pub fn from_registry(config: ConvertConfig) -> Result<Self> {
        let source = RegistrySource::new().map_err(|source| Error::ManifestFetch {
            reference: config.source.clone(),
            source,
        })?;
        Ok(Self::new(config, Arc::new(source)))
    }

    pub fn config(&self) -> &ConvertConfig {
        &self.config
    }

    fn image_ref(&self) -> Result<ImageRef> {
        ImageRef::parse(&self.config.source).map_err(Error::ReferenceResolution)
    }

    /// Resolve and classify the source image.
    pub async fn inspect(&self) -> Result<ImageInfo> {
        self.config.validate()?;
        let image_ref = self.image_ref()?;
        self.resolve(&image_ref).await
    }

    async fn resolve(&self, image_ref: &ImageRef) -> Result<ImageInfo> {
        let manifest = self
            .source
            .resolve_manifest(image_ref)
            .await
            .map_err(|source| match source {
                OciError::InvalidReference(_) => Error::ReferenceResolution(source),
                source => Error::ManifestFetch {
                    reference: self.config.source.clone(),
                    source,
                },
            })?;
        let image = classify(&self.config.source, manifest.digest, manifest.layers)?;
        info!(
            image = %self.config.source,
            layers = image.layers.len(),
            total_size = image.total_size,
            "resolved image"
        );
        Ok(image)
    }

    /// Reset the target directory and download the image layers into it.
    pub async fn download(&self) -> Result<(ImageInfo, Vec<FetchedBlob>)> {
        self.config.validate()?;
        let image_ref = self.image_ref()?;
        let image = self.resolve(&image_ref).await?;
        // Fail before downloading anything the disk could never hold.
        layout::check_partition_count(image.included(self.config.layer_limit))?;
        let blobs = self.fetch(&image_ref, &image).await?;
        Ok((image, blobs))
    }

    async fn fetch(&self, image_ref: &ImageRef, image: &ImageInfo) -> Result<Vec<FetchedBlob>> {
        Fetcher::new(self.source.clone(), self.config.concurrency)
            .fetch_all(
                image_ref,
                image,
                &self.config.target_dir,
                self.config.layer_limit,
            )
            .await
    }

    /// Run the whole pipeline: resolve, classify, fetch, build, validate.
    pub async fn convert(&self) -> Result<ConvertReport> {
        let started = Instant::now();
        info!(image = %self.config.source, "starting conversion");

        let (image, blobs) = self.download().await?;
        let report = if self.config.incremental {
            self.convert_incremental(image, blobs).await?
        } else {
            self.convert_single(image, blobs).await?
        };

        info!(
            image = %self.config.source,
            output = %report.output.display(),
            elapsed = %crate::elapsed(started),
            "converted image"
        );
        Ok(report)
    }

    async fn convert_single(
        &self,
        image: ImageInfo,
        blobs: Vec<FetchedBlob>,
    ) -> Result<ConvertReport> {
        let output = self.config.output_path();
        let limit = self.config.layer_limit;
        let (blobs, validation) = build_and_validate(&image, blobs, &output, limit).await?;

        Ok(ConvertReport {
            image,
            blobs,
            output,
            parts: Vec::new(),
            validations: vec![validation],
        })
    }

    /// Part `k` holds the bootstrap and the first `k` blobs. An image
    /// without blobs gets a single part holding the bootstrap.
    async fn convert_incremental(
        &self,
        image: ImageInfo,
        mut blobs: Vec<FetchedBlob>,
    ) -> Result<ConvertReport> {
        let layer_count = image.layers.len();
        let first = layer_count.min(2);
        let mut parts = Vec::new();
        let mut validations = Vec::new();

        for (n, limit) in (first..=layer_count).enumerate() {
            let part = self.config.part_path(n + 1);
            let (returned, validation) =
                build_and_validate(&image, blobs, &part, Some(limit)).await?;
            blobs = returned;
            validations.push(validation);
            parts.push(part);
        }

        let output = self.config.output_path();
        let last = parts
            .last()
            .ok_or_else(|| Error::InternalConsistency("no part files built".into()))?;
        link_output(&output, last).await?;

        Ok(ConvertReport {
            image,
            blobs,
            output,
            parts,
            validations,
        })
    }
}

/// Plan, build and validate one disk image on the blocking pool. The blob
/// list is handed back for the next part.
async fn build_and_validate(
    image: &ImageInfo,
    blobs: Vec<FetchedBlob>,
    output: &Path,
    limit: Option<usize>,
) -> Result<(Vec<FetchedBlob>, ValidationResult)> {
    let plan = plan_disk(image, limit)?;
    let output = output.to_path_buf();

    tokio::task::spawn_blocking(move || {
        builder::build_disk(&plan, &output, &blobs)?;
        let validation = validate::validate_disk(&output, Some(plan.partitions.len()), &blobs)?;
        Ok((blobs, validation))
    })
    .await
    .map_err(|e| Error::InternalConsistency(format!("disk task panicked: {}", e)))?
}

/// Point `output` at `target` with a relative symlink, replacing any
/// existing link.
async fn link_output(output: &Path, target: &Path) -> Result<()> {
    match tokio::fs::symlink_metadata(output).await {
        Ok(_) => tokio::fs::remove_file(output).await?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    let name = target
        .file_name()
        .ok_or_else(|| Error::InternalConsistency(format!("bad part path {}", target.display())))?;
    tokio::fs::symlink(name, output).await?;
    info!(link = %output.display(), target = %target.display(), "linked final image");
    Ok(())
}
