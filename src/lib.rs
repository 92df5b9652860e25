//! layerdisk: turn a Nydus OCI image into a GPT disk image
//!
//! Every layer of the image (the bootstrap first, then the data blobs in
//! manifest order) becomes one partition of a raw disk file, so a guest can
//! mount the image straight from block devices.
//!
//! # Pipeline
//!
//! 1. resolve the manifest from the registry
//! 2. classify layers into bootstrap and blobs
//! 3. fetch blobs concurrently into the target directory
//! 4. plan partition extents and the disk size
//! 5. build the disk image (GPT plus partition contents)
//! 6. validate every partition against its local file
//!
//! # Example
//!
//! ```no_run
//! use layerdisk::{ConvertConfig, Converter};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConvertConfig::new()
//!         .source("localhost:5000/ubuntu-nydus:latest")
//!         .target_dir("./workdir")
//!         .concurrency(8);
//!
//!     let report = Converter::from_registry(config)?.convert().await?;
//!     println!("wrote {}", report.output.display());
//!     Ok(())
//! }
//! ```

use std::time::{Duration, Instant};

pub mod builder;
pub mod config;
pub mod convert;
pub mod error;
pub mod fetch;
pub mod gpt_table;
pub mod image;
pub mod layout;
pub mod source;
pub mod validate;

pub use config::ConvertConfig;
pub use convert::{ConvertReport, Converter};
pub use error::{BlobDownloadFailures, BlobFailure, Error, Result};
pub use fetch::{FetchedBlob, Fetcher};
pub use image::{ImageInfo, LayerDescriptor, LayerKind};
pub use layout::{DiskPlan, PartitionPlan};
pub use source::{ImageSource, RegistrySource, SourceManifest};
pub use validate::{validate_disk, ValidationResult};

/// Time since `started`, rounded to milliseconds for log output.
pub(crate) fn elapsed(started: Instant) -> humantime::FormattedDuration {
    let millis = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    humantime::format_duration(Duration::from_millis(millis))
}
