//! GPT encoding and partition byte access.
//!
//! The binary format is handled by the `gpt` crate; this module maps a
//! [`DiskPlan`] onto it and moves bytes in and out of partition ranges.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use gpt::disk::LogicalBlockSize;
use gpt::mbr::ProtectiveMBR;
use gpt::partition::Partition;
use gpt::partition_types;
use gpt::GptConfig;
use tracing::{debug, info};

use crate::layout::{DiskPlan, PartitionPlan, SECTOR_SIZE};
use crate::{Error, Result};

/// Byte range of a partition read back from an on-disk table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionExtent {
    /// 1-based GPT partition id.
    pub id: u32,
    pub name: String,
    pub offset_bytes: u64,
    pub len_bytes: u64,
}

fn encoding_err(what: &str, e: impl std::fmt::Display) -> Error {
    Error::PartitionEncoding(format!("{}: {}", what, e))
}

/// Write a protective MBR and a GPT describing `plan` onto `disk`, which
/// must already be `plan.total_disk_size` bytes long. Returns the file for
/// further writes.
pub fn apply_partition_table(mut disk: File, plan: &DiskPlan) -> Result<File> {
    let last_lba = plan.total_sectors().saturating_sub(1);
    let mbr = ProtectiveMBR::with_lb_size(u32::try_from(last_lba).unwrap_or(u32::MAX));
    mbr.overwrite_lba0(&mut disk)
        .map_err(|e| encoding_err("protective MBR", e))?;

    let mut gdisk = GptConfig::new()
        .writable(true)
        .logical_block_size(LogicalBlockSize::Lb512)
        .create_from_device(disk, Some(plan.disk_guid()?))
        .map_err(|e| encoding_err("create GPT", e))?;

    // Initialize headers with an empty table before filling it.
    gdisk
        .update_partitions(BTreeMap::<u32, Partition>::new())
        .map_err(|e| encoding_err("initialize GPT", e))?;

    let mut entries = BTreeMap::new();
    for part in &plan.partitions {
        let id = u32::try_from(part.index + 1)
            .map_err(|_| Error::InternalConsistency(format!("too many partitions: {}", part.index)))?;
        entries.insert(
            id,
            Partition {
                part_type_guid: partition_types::LINUX_FS,
                part_guid: part.guid()?,
                first_lba: part.start_sector,
                last_lba: part.end_sector,
                flags: 0,
                name: part.name.clone(),
            },
        );
    }
    gdisk
        .update_partitions(entries)
        .map_err(|e| encoding_err("update GPT partitions", e))?;

    let disk = gdisk.write().map_err(|e| encoding_err("write GPT", e))?;
    info!(partitions = plan.partitions.len(), "wrote GPT table");
    Ok(disk)
}

/// Copy exactly `part.len_bytes()` bytes from `reader` into the partition.
/// Returns the number of bytes written; a short reader yields a short count.
pub fn write_partition_bytes<R: Read>(
    disk: &mut File,
    part: &PartitionPlan,
    reader: R,
) -> io::Result<u64> {
    disk.seek(SeekFrom::Start(part.offset_bytes()))?;
    let mut limited = reader.take(part.len_bytes());
    let written = io::copy(&mut limited, disk)?;
    disk.flush()?;
    debug!(
        index = part.index,
        offset = part.offset_bytes(),
        written,
        "wrote partition bytes"
    );
    Ok(written)
}

/// Read the partition table of the disk image at `path`, ordered by id.
pub fn read_partitions(path: &Path) -> Result<Vec<PartitionExtent>> {
    let gdisk = GptConfig::new()
        .writable(false)
        .logical_block_size(LogicalBlockSize::Lb512)
        .open(path)
        .map_err(|e| encoding_err(&format!("open GPT on {}", path.display()), e))?;

    // BTreeMap iteration is ordered by partition id.
    let extents = gdisk
        .partitions()
        .iter()
        .map(|(id, p)| PartitionExtent {
            id: *id,
            name: p.name.clone(),
            offset_bytes: p.first_lba * SECTOR_SIZE,
            len_bytes: (p.last_lba - p.first_lba + 1) * SECTOR_SIZE,
        })
        .collect();
    Ok(extents)
}

/// Feed the partition's bytes into `sink`. Returns the number of bytes read.
pub fn read_partition_bytes<W: Write>(
    disk: &mut File,
    extent: &PartitionExtent,
    sink: &mut W,
) -> io::Result<u64> {
    disk.seek(SeekFrom::Start(extent.offset_bytes))?;
    let mut limited = (&*disk).take(extent.len_bytes);
    io::copy(&mut limited, sink)
}
