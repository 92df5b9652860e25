//! Disk layout planning.
//!
//! One GPT partition per layer, in layer order. Every partition starts on a
//! 1 MiB boundary; the first one at LBA 2048, leaving room for the
//! protective MBR and the primary GPT. The disk is sized to the layer bytes
//! plus 1 MiB per layer plus 1 MiB, which covers the alignment gaps and the
//! backup GPT at the end of the disk.
//!
//! Planning is pure: the same layer sizes and digests always give the same
//! plan.

use uuid::Uuid;

use crate::image::ImageInfo;
use crate::{Error, Result};

/// Logical sector size of the produced disk.
pub const SECTOR_SIZE: u64 = 512;
/// Partition start alignment in sectors (1 MiB).
pub const ALIGNMENT_SECTORS: u64 = 2048;
/// LBA of the first partition.
pub const FIRST_PARTITION_SECTOR: u64 = 2048;

/// Entries in the GPT partition array, and so the most layers one disk holds.
pub const MAX_PARTITIONS: usize = 128;

const MIB: u64 = 1024 * 1024;
/// Backup GPT header plus a 128-entry partition array.
const GPT_BACKUP_SECTORS: u64 = 33;

/// Placement of one layer on the disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    /// Layer index, also the partition's position in the table.
    pub index: usize,
    pub start_sector: u64,
    /// Last LBA of the partition, inclusive.
    pub end_sector: u64,
    /// GPT partition name: first half of the layer digest.
    pub name: String,
    /// Source of the partition GUID: second half of the layer digest.
    pub guid_seed: String,
}

impl PartitionPlan {
    pub fn sectors(&self) -> u64 {
        self.end_sector - self.start_sector + 1
    }

    pub fn offset_bytes(&self) -> u64 {
        self.start_sector * SECTOR_SIZE
    }

    pub fn len_bytes(&self) -> u64 {
        self.sectors() * SECTOR_SIZE
    }

    pub fn guid(&self) -> Result<Uuid> {
        parse_guid(&self.guid_seed)
    }
}

/// The full disk: size, identity and partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskPlan {
    /// Disk size in bytes, a multiple of [`SECTOR_SIZE`].
    pub total_disk_size: u64,
    /// Source of the disk GUID: first half of the manifest digest.
    pub disk_guid_seed: String,
    pub partitions: Vec<PartitionPlan>,
}

impl DiskPlan {
    pub fn total_sectors(&self) -> u64 {
        self.total_disk_size / SECTOR_SIZE
    }

    pub fn disk_guid(&self) -> Result<Uuid> {
        parse_guid(&self.disk_guid_seed)
    }
}

fn parse_guid(seed: &str) -> Result<Uuid> {
    Uuid::parse_str(seed)
        .map_err(|e| Error::InternalConsistency(format!("invalid GUID seed {seed:?}: {e}")))
}

/// Round `x` up to a multiple of `a` by ceiling division.
pub fn align_up_div(x: u64, a: u64) -> u64 {
    x.div_ceil(a) * a
}

/// Round `x` up to a multiple of `a` by masking. `a` must be a power of two.
pub fn align_up_mask(x: u64, a: u64) -> u64 {
    debug_assert!(a.is_power_of_two());
    (x + a - 1) & !(a - 1)
}

/// Round `input_size` up to whole sectors, cross-checking both rounding
/// methods.
pub fn aligned_disk_size(input_size: u64) -> Result<u64> {
    let by_div = align_up_div(input_size, SECTOR_SIZE);
    let by_mask = align_up_mask(input_size, SECTOR_SIZE);
    if by_div != by_mask {
        return Err(Error::InternalConsistency(format!(
            "disk size {} not equal {}",
            by_div, by_mask
        )));
    }
    Ok(by_div)
}

/// First partition start after a partition ending (inclusively) at `end`:
/// the next 2048-sector boundary strictly above it.
fn next_partition_start(end: u64) -> u64 {
    (end + ALIGNMENT_SECTORS) / ALIGNMENT_SECTORS * ALIGNMENT_SECTORS
}

/// Plan a disk holding the first `layer_limit` layers of `image` (all when
/// `None`; limits above the layer count are clamped).
pub fn plan_disk(image: &ImageInfo, layer_limit: Option<usize>) -> Result<DiskPlan> {
    if layer_limit == Some(0) {
        return Err(Error::Config("layer limit must be at least 1".to_string()));
    }
    let count = image.included(layer_limit);
    if count == 0 {
        return Err(Error::Config(format!(
            "image {} has no layers to partition",
            image.source_ref
        )));
    }
    check_partition_count(count)?;

    let mut partitions = Vec::with_capacity(count);
    let mut start = FIRST_PARTITION_SECTOR;
    let mut included_size: u64 = 0;

    for (index, layer) in image.layers.iter().take(count).enumerate() {
        let sectors = layer.size.div_ceil(SECTOR_SIZE);
        let end = start
            .checked_add(sectors)
            .ok_or_else(|| Error::InternalConsistency(format!("layer {index} overflows the disk")))?;
        let (name, guid_seed) = layer.digest.halves();

        partitions.push(PartitionPlan {
            index,
            start_sector: start,
            end_sector: end,
            name: name.to_string(),
            guid_seed: guid_seed.to_string(),
        });

        included_size = included_size
            .checked_add(layer.size)
            .ok_or_else(|| Error::InternalConsistency("layer sizes overflow".to_string()))?;
        start = next_partition_start(end);
    }

    let overhead = (count as u64 + 1) * MIB;
    let input_size = included_size
        .checked_add(overhead)
        .ok_or_else(|| Error::InternalConsistency("disk size overflows".to_string()))?;
    let total_disk_size = aligned_disk_size(input_size)?;

    let plan = DiskPlan {
        total_disk_size,
        disk_guid_seed: image.manifest_digest.halves().0.to_string(),
        partitions,
    };
    check_fits(&plan)?;

    tracing::info!(
        input_size,
        disk_size = total_disk_size,
        partitions = count,
        "aligned disk size to {} byte sectors",
        SECTOR_SIZE
    );
    Ok(plan)
}

/// Reject layer counts the partition array cannot hold.
pub fn check_partition_count(count: usize) -> Result<()> {
    if count > MAX_PARTITIONS {
        return Err(Error::InternalConsistency(format!(
            "{} layers exceed the {} entry GPT partition table",
            count, MAX_PARTITIONS
        )));
    }
    Ok(())
}

/// The last partition must end before the backup GPT.
fn check_fits(plan: &DiskPlan) -> Result<()> {
    let last_usable = plan
        .total_sectors()
        .saturating_sub(GPT_BACKUP_SECTORS + 1);
    match plan.partitions.last() {
        Some(last) if last.end_sector > last_usable => Err(Error::InternalConsistency(format!(
            "partition {} ends at LBA {} beyond last usable LBA {}",
            last.index, last.end_sector, last_usable
        ))),
        _ => Ok(()),
    }
}
