//! Disk image assembly.
//!
//! Runs on a blocking thread: allocate the raw file, write the partition
//! table, then copy each fetched layer into its partition in index order.

use std::fs::{File, OpenOptions};
use std::io::BufReader;
use std::path::Path;
use std::time::Instant;

use tracing::info;

use crate::fetch::{FetchedBlob, IO_BUFFER_SIZE};
use crate::gpt_table;
use crate::layout::{DiskPlan, PartitionPlan};
use crate::{Error, Result};

/// Build the disk image `output` from `plan`, filling partition `i` with
/// `blobs[i]`.
///
/// Each blob file is resized to its partition's length first, so the tail
/// of every partition is zero padding and the local copy stays byte-equal to
/// what ends up on disk.
pub fn build_disk(plan: &DiskPlan, output: &Path, blobs: &[FetchedBlob]) -> Result<()> {
    let started = Instant::now();
    if blobs.len() < plan.partitions.len() {
        return Err(Error::InternalConsistency(format!(
            "{} partitions planned but only {} blobs fetched",
            plan.partitions.len(),
            blobs.len()
        )));
    }

    info!(
        path = %output.display(),
        size = plan.total_disk_size,
        "preparing disk image"
    );
    let disk = allocate(output, plan.total_disk_size)?;
    let mut disk = gpt_table::apply_partition_table(disk, plan)?;

    for (part, blob) in plan.partitions.iter().zip(blobs) {
        if blob.layer_index != part.index {
            return Err(Error::InternalConsistency(format!(
                "partition {} paired with blob of layer {}",
                part.index, blob.layer_index
            )));
        }
        write_partition(&mut disk, part, blob)?;
    }

    disk.sync_all()?;
    info!(
        path = %output.display(),
        elapsed = %crate::elapsed(started),
        "disk image written"
    );
    Ok(())
}

/// Create `path` (truncating any previous file) and size it to `size` bytes.
fn allocate(path: &Path, size: u64) -> Result<File> {
    let alloc_err = |source| Error::DiskAllocation {
        path: path.to_path_buf(),
        source,
    };
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(alloc_err)?;
    file.set_len(size).map_err(alloc_err)?;
    Ok(file)
}

fn write_partition(disk: &mut File, part: &PartitionPlan, blob: &FetchedBlob) -> Result<()> {
    let write_err = |reason: String| Error::PartitionWrite {
        index: part.index,
        reason,
    };
    let expected = part.len_bytes();

    let source = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&blob.local_path)
        .map_err(|e| write_err(format!("open {}: {}", blob.local_path.display(), e)))?;
    source
        .set_len(expected)
        .map_err(|e| write_err(format!("resize {}: {}", blob.local_path.display(), e)))?;

    let reader = BufReader::with_capacity(IO_BUFFER_SIZE, source);
    let written = gpt_table::write_partition_bytes(disk, part, reader)
        .map_err(|e| write_err(e.to_string()))?;
    if written != expected {
        return Err(write_err(format!(
            "wrote {} bytes instead of {}",
            written, expected
        )));
    }

    info!(
        index = part.index,
        digest = %blob.digest,
        bytes = written,
        "partition written"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::SECTOR_SIZE;
    use layerdisk_oci::ContentHash;
    use std::io::{Read, Seek, SeekFrom};
    use std::path::PathBuf;

    fn one_partition_plan(len_sectors: u64) -> DiskPlan {
        DiskPlan {
            total_disk_size: (2048 + len_sectors + 2048) * SECTOR_SIZE,
            disk_guid_seed: "00112233445566778899aabbccddeeff".into(),
            partitions: vec![PartitionPlan {
                index: 0,
                start_sector: 2048,
                end_sector: 2048 + len_sectors - 1,
                name: "bootstrap".into(),
                guid_seed: "ffeeddccbbaa99887766554433221100".into(),
            }],
        }
    }

    fn blob_at(path: PathBuf, data: &[u8]) -> FetchedBlob {
        std::fs::write(&path, data).unwrap();
        FetchedBlob {
            layer_index: 0,
            digest: ContentHash::of_bytes(data),
            local_path: path,
        }
    }

    #[test]
    fn pads_blob_and_copies_to_partition() {
        let tmp = tempfile::tempdir().unwrap();
        let plan = one_partition_plan(4);
        let data: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
        let blob = blob_at(tmp.path().join("bootstrap"), &data);
        let out = tmp.path().join("output.img");

        build_disk(&plan, &out, std::slice::from_ref(&blob)).unwrap();

        assert_eq!(std::fs::metadata(&out).unwrap().len(), plan.total_disk_size);
        assert_eq!(std::fs::metadata(&blob.local_path).unwrap().len(), 4 * SECTOR_SIZE);

        let mut disk = File::open(&out).unwrap();
        disk.seek(SeekFrom::Start(2048 * SECTOR_SIZE)).unwrap();
        let mut part = vec![0u8; (4 * SECTOR_SIZE) as usize];
        disk.read_exact(&mut part).unwrap();
        assert_eq!(&part[..data.len()], &data[..]);
        assert!(part[data.len()..].iter().all(|&b| b == 0));
    }

    #[test]
    fn missing_blob_file_is_a_partition_write_error() {
        let tmp = tempfile::tempdir().unwrap();
        let plan = one_partition_plan(1);
        let blob = FetchedBlob {
            layer_index: 0,
            digest: ContentHash::of_bytes(b""),
            local_path: tmp.path().join("absent"),
        };

        let err = build_disk(&plan, &tmp.path().join("out.img"), &[blob]).unwrap_err();
        assert!(matches!(err, Error::PartitionWrite { index: 0, .. }));
    }

    #[test]
    fn unwritable_output_is_an_allocation_error() {
        let tmp = tempfile::tempdir().unwrap();
        let plan = one_partition_plan(1);
        let blob = blob_at(tmp.path().join("b"), b"x");

        let out = tmp.path().join("no-such-dir").join("out.img");
        let err = build_disk(&plan, &out, &[blob]).unwrap_err();
        assert!(matches!(err, Error::DiskAllocation { .. }));
    }

    #[test]
    fn too_few_blobs_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let err = build_disk(&one_partition_plan(1), &tmp.path().join("o.img"), &[]).unwrap_err();
        assert!(matches!(err, Error::InternalConsistency(_)));
    }
}
