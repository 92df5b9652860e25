//! Error types for layerdisk

use std::fmt;
use std::path::PathBuf;

use layerdisk_oci::OciError;
use thiserror::Error;

/// Result type alias using layerdisk Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while converting an image into a disk
#[derive(Error, Debug)]
pub enum Error {
    /// The image reference could not be parsed
    #[error("Invalid image reference: {0}")]
    ReferenceResolution(#[source] OciError),

    /// The manifest could not be fetched or decoded
    #[error("Failed to fetch manifest for {reference}: {source}")]
    ManifestFetch {
        reference: String,
        #[source]
        source: OciError,
    },

    /// One or more layer downloads failed
    #[error("Blob download failed: {0}")]
    BlobDownload(BlobDownloadFailures),

    /// The manifest has no bootstrap layer
    #[error("Image {reference} has no bootstrap layer")]
    MissingBootstrap { reference: String },

    /// The manifest has more than one bootstrap layer
    #[error("Image {reference} has more than one bootstrap layer: {first} and {second}")]
    DuplicateBootstrap {
        reference: String,
        first: String,
        second: String,
    },

    /// A layout or bookkeeping invariant did not hold
    #[error("Internal consistency error: {0}")]
    InternalConsistency(String),

    /// The raw disk file could not be created or sized
    #[error("Failed to allocate disk image {}: {source}", path.display())]
    DiskAllocation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The partition table could not be encoded onto the disk
    #[error("Partition table error: {0}")]
    PartitionEncoding(String),

    /// A layer could not be copied into its partition
    #[error("Failed to write partition {index}: {reason}")]
    PartitionWrite { index: usize, reason: String },

    /// The download directory could not be reset
    #[error("Failed to prepare target directory {}: {source}", path.display())]
    TargetDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The built disk could not be opened for read-back
    #[error("Failed to read disk image {}: {source}", path.display())]
    DiskRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A partition or its local blob could not be read during validation
    #[error("Failed to validate partition {index} against {}: {source}", path.display())]
    Validation {
        index: usize,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Read-back validation found corrupted partitions
    #[error(
        "Disk image is corrupted in {error_count} partition(s) {corrupted:?}, please try convert again"
    )]
    IntegrityMismatch {
        corrupted: Vec<usize>,
        error_count: usize,
    },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Pipeline phase the error belongs to, for the top-level log line.
    pub fn phase(&self) -> &'static str {
        match self {
            Error::ReferenceResolution(_) | Error::ManifestFetch { .. } => "resolve",
            Error::MissingBootstrap { .. } | Error::DuplicateBootstrap { .. } => "classify",
            Error::BlobDownload(_) | Error::TargetDir { .. } => "fetch",
            Error::InternalConsistency(_) => "layout",
            Error::DiskAllocation { .. }
            | Error::PartitionEncoding(_)
            | Error::PartitionWrite { .. } => "build",
            Error::DiskRead { .. }
            | Error::Validation { .. }
            | Error::IntegrityMismatch { .. } => "validate",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
        }
    }
}

/// A single layer that could not be downloaded.
#[derive(Debug)]
pub struct BlobFailure {
    pub layer_index: usize,
    pub digest: String,
    pub error: OciError,
}

/// Every download failure observed before the fetch phase was torn down.
#[derive(Debug)]
pub struct BlobDownloadFailures(pub Vec<BlobFailure>);

impl BlobDownloadFailures {
    pub fn layer_indices(&self) -> Vec<usize> {
        self.0.iter().map(|f| f.layer_index).collect()
    }
}

impl fmt::Display for BlobDownloadFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} layer(s) failed", self.0.len())?;
        for failure in &self.0 {
            write!(
                f,
                "; layer {} ({}): {}",
                failure.layer_index, failure.digest, failure.error
            )?;
        }
        Ok(())
    }
}
