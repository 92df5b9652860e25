//! Read-back validation of a built disk image.
//!
//! Each partition is hashed straight from the disk file, using the extents
//! recorded in the on-disk GPT rather than the plan, and compared with a
//! hash of the local file it was copied from.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::time::Instant;

use layerdisk_oci::digest::hex_encode;
use sha2::{Digest, Sha256};
use tracing::{error, info};

use crate::fetch::{FetchedBlob, IO_BUFFER_SIZE};
use crate::gpt_table;
use crate::{Error, Result};

/// Outcome of validating every requested partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub per_partition_ok: Vec<bool>,
    pub error_count: usize,
}

impl ValidationResult {
    pub fn is_ok(&self) -> bool {
        self.error_count == 0
    }

    /// Indices of partitions whose content did not match.
    pub fn corrupted(&self) -> Vec<usize> {
        self.per_partition_ok
            .iter()
            .enumerate()
            .filter(|(_, ok)| !**ok)
            .map(|(i, _)| i)
            .collect()
    }

    /// Turn any mismatch into [`Error::IntegrityMismatch`].
    pub fn into_result(self) -> Result<Self> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(Error::IntegrityMismatch {
                corrupted: self.corrupted(),
                error_count: self.error_count,
            })
        }
    }
}

/// Check the first `layer_limit` partitions of `disk_path` (all fetched
/// blobs when `None`) against the local files in `blobs`.
pub fn validate_disk(
    disk_path: &Path,
    layer_limit: Option<usize>,
    blobs: &[FetchedBlob],
) -> Result<ValidationResult> {
    let started = Instant::now();
    let count = layer_limit.map_or(blobs.len(), |n| n.min(blobs.len()));
    info!(path = %disk_path.display(), partitions = count, "validating disk image");

    let mut disk = File::open(disk_path).map_err(|source| Error::DiskRead {
        path: disk_path.to_path_buf(),
        source,
    })?;
    let extents = gpt_table::read_partitions(disk_path)?;
    if extents.len() < count {
        return Err(Error::InternalConsistency(format!(
            "disk has {} partitions, expected at least {}",
            extents.len(),
            count
        )));
    }

    let mut per_partition_ok = Vec::with_capacity(count);

    for (index, (extent, blob)) in extents.iter().zip(blobs).take(count).enumerate() {
        let mut target = Sha256::new();
        let read = gpt_table::read_partition_bytes(&mut disk, extent, &mut target).map_err(
            |source| Error::Validation {
                index,
                path: disk_path.to_path_buf(),
                source,
            },
        )?;
        if read != extent.len_bytes {
            return Err(Error::InternalConsistency(format!(
                "read {} bytes of partition {} instead of {}",
                read, index, extent.len_bytes
            )));
        }
        let target_hex = hex_encode(&target.finalize());
        let source_hex = hash_file(&blob.local_path).map_err(|source| Error::Validation {
            index,
            path: blob.local_path.clone(),
            source,
        })?;

        if target_hex == source_hex {
            info!(index, sha256 = %target_hex, "partition content is correct");
            per_partition_ok.push(true);
        } else {
            error!(
                index,
                disk_sha256 = %target_hex,
                blob_sha256 = %source_hex,
                "data corrupted in partition"
            );
            per_partition_ok.push(false);
        }
    }

    let error_count = per_partition_ok.iter().filter(|ok| !**ok).count();
    let result = ValidationResult {
        per_partition_ok,
        error_count,
    };
    if result.is_ok() {
        info!(elapsed = %crate::elapsed(started), "disk image validated");
    }
    result.into_result()
}

fn hash_file(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::with_capacity(IO_BUFFER_SIZE, file);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(hex_encode(&hasher.finalize()))
}
