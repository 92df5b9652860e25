//! Configuration for a conversion run

use std::path::PathBuf;

use crate::{Error, Result};

/// Default number of layers downloaded at once.
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Name of the final disk image inside the target directory.
pub const OUTPUT_IMAGE_NAME: &str = "output.img";

/// Configuration for converting one image
#[derive(Debug, Clone)]
pub struct ConvertConfig {
    /// Source image reference (e.g. `localhost:5000/ubuntu-nydus:latest`)
    pub source: String,
    /// Directory receiving the fetched blobs and the disk image. It is
    /// emptied at the start of every run.
    pub target_dir: PathBuf,
    /// Maximum concurrent layer downloads (default: 8)
    pub concurrency: usize,
    /// Only use the first N layers (bootstrap included)
    pub layer_limit: Option<usize>,
    /// Build `output.img.partN` files, one per additional layer, and link
    /// `output.img` to the last one
    pub incremental: bool,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            source: String::new(),
            target_dir: PathBuf::from("./workdir"),
            concurrency: DEFAULT_CONCURRENCY,
            layer_limit: None,
            incremental: false,
        }
    }
}

impl ConvertConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the source image reference
    pub fn source<S: Into<String>>(mut self, source: S) -> Self {
        self.source = source.into();
        self
    }

    /// Set the target directory
    pub fn target_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.target_dir = path.into();
        self
    }

    /// Set the download concurrency
    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }

    /// Limit the conversion to the first `n` layers
    pub fn layer_limit(mut self, n: usize) -> Self {
        self.layer_limit = Some(n);
        self
    }

    /// Enable or disable incremental part files
    pub fn incremental(mut self, enable: bool) -> Self {
        self.incremental = enable;
        self
    }

    /// Path of the final disk image (or of the symlink to it)
    pub fn output_path(&self) -> PathBuf {
        self.target_dir.join(OUTPUT_IMAGE_NAME)
    }

    /// Path of incremental part `n` (1-based)
    pub fn part_path(&self, n: usize) -> PathBuf {
        self.target_dir
            .join(format!("{}.part{}", OUTPUT_IMAGE_NAME, n))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.source.trim().is_empty() {
            return Err(Error::Config("source image reference is required".into()));
        }
        if self.target_dir.as_os_str().is_empty() {
            return Err(Error::Config("target directory is required".into()));
        }
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".into()));
        }
        if self.layer_limit == Some(0) {
            return Err(Error::Config("layer limit must be at least 1".into()));
        }
        if self.incremental && self.layer_limit.is_some() {
            return Err(Error::Config(
                "layer limit cannot be combined with incremental output".into(),
            ));
        }
        Ok(())
    }
}
