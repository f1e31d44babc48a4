//! Shrinks the last filesystem and partition of a disk before capture.
//!
//! The filesystem is asked for its minimum size, the configured free space is
//! added, and if that is smaller than the filesystem the filesystem is
//! resized first and its partition entry second. The partition's new end is
//! where a capture can stop.
use crate::copy;
use crate::device;
use crate::filesystem::{ExtSuperblock, FsTool};
use crate::partition::{Partition, PartitionTable};
use crate::platform;
use anyhow::{Context, Result, anyhow};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

/// Free space left in the filesystem when none is configured.
pub const DEFAULT_FREE_SPACE: u64 = 500 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShrinkOutcome {
    /// The filesystem and partition were resized from `from` to `to` bytes.
    Shrunk { from: u64, to: u64 },
    /// The filesystem already fits within its minimum size plus free space.
    AlreadyMinimal,
    /// The last partition cannot be shrunk; the reason is user-facing.
    Skipped(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShrinkReport {
    /// Node of the partition that was considered.
    pub partition: PathBuf,
    /// Exclusive end of the last partition after the operation, in bytes.
    pub end_byte: u64,
    pub outcome: ShrinkOutcome,
}

/// The superblock of the last partition if it can be resized, otherwise the
/// user-facing reason it cannot.
fn resizable(
    part: &Partition,
    superblock: Option<ExtSuperblock>,
    partition: &Path,
) -> Result<ExtSuperblock, String> {
    let Some(sb) = superblock else {
        return Err(format!(
            "filesystem on {} is not ext2/3/4 and is not supported for resize",
            partition.display()
        ));
    };
    if !part.is_primary() {
        return Err(format!(
            "{} is a logical partition and cannot be resized",
            partition.display()
        ));
    }
    Ok(sb)
}

fn ensure_unmounted(partition: &Path, mount_point: Option<PathBuf>) -> Result<()> {
    match mount_point {
        Some(mount_point) => Err(anyhow!(
            "{} is mounted at {}; unmount it before capturing",
            partition.display(),
            mount_point.display()
        )),
        None => Ok(()),
    }
}

fn overflow(what: &str) -> anyhow::Error {
    anyhow!("{what} does not fit in 64 bits")
}

/// Shrinks the filesystem on the last partition of `disk` down to its
/// minimum size plus `free_space` bytes, then the partition to match.
///
/// `running` is checked before each step that modifies the disk. A tool that
/// is already running is allowed to finish; the next step then fails with
/// [`Cancelled`](crate::copy::Cancelled). Cancelling after the filesystem
/// resize leaves a filesystem smaller than its partition, which is valid.
pub fn shrink_last_partition(
    disk: &Path,
    free_space: u64,
    tool: &dyn FsTool,
    running: &AtomicBool,
) -> Result<ShrinkReport> {
    let mut file = File::options()
        .read(true)
        .write(true)
        .open(disk)
        .with_context(|| format!("cannot open {}", disk.display()))?;

    let sector_size = device::sector_size_of(&file)?;
    let mut table = PartitionTable::read(&mut file, sector_size)?;
    let part = table
        .last_partition()
        .ok_or_else(|| anyhow!("{} has no partitions", disk.display()))?;
    let partition = platform::partition_path(disk, part.number);
    let current_end = part.end_bytes();

    tracing::debug!(
        "last partition {}: start {} sectors, {} sectors of {} bytes",
        partition.display(),
        part.start_lba,
        part.sectors,
        part.sector_size
    );

    let superblock = ExtSuperblock::read_at(&mut file, part.offset_bytes())?;
    let sb = match resizable(&part, superblock, &partition) {
        Ok(sb) => sb,
        Err(reason) => {
            tracing::info!("{reason}; skipping resize");
            return Ok(ShrinkReport {
                partition,
                end_byte: current_end,
                outcome: ShrinkOutcome::Skipped(reason),
            });
        }
    };

    ensure_unmounted(&partition, platform::mount_point_of(&partition))?;

    tracing::info!("Determining if {} filesystem needs to shrink...", sb.kind);
    let current_size = sb.size_bytes().ok_or_else(|| overflow("filesystem size"))?;
    let minimum_size = tool
        .minimum_blocks(&partition)?
        .checked_mul(sb.block_size)
        .ok_or_else(|| overflow("minimum filesystem size"))?;
    let target_size = minimum_size
        .checked_add(free_space)
        .ok_or_else(|| overflow("minimum size plus free space"))?;
    tracing::debug!(
        "filesystem: {} blocks of {} bytes, minimum {minimum_size} bytes, target {target_size} bytes",
        sb.block_count,
        sb.block_size
    );

    if current_size <= target_size {
        tracing::info!(
            "{} does not need resize; current size is at or below the target size",
            partition.display()
        );
        return Ok(ShrinkReport {
            partition,
            end_byte: current_end,
            outcome: ShrinkOutcome::AlreadyMinimal,
        });
    }

    // current_size > target_size, so this product cannot overflow.
    let target_blocks = target_size.div_ceil(sb.block_size);
    let new_size = target_blocks * sb.block_size;
    tracing::info!("Partition needs resize. Resizing to {target_size} bytes...");

    copy::ensure_running(running)?;
    tracing::info!("Checking {}...", partition.display());
    tool.check(&partition)?;

    copy::ensure_running(running)?;
    tracing::info!("Shrinking {} to {target_blocks} blocks...", partition.display());
    tool.resize(&partition, target_blocks)?;

    copy::ensure_running(running)?;
    tracing::info!("Resizing partition...");
    let resized = table.shrink(part.number, new_size)?;
    table.write(&mut file)?;
    file.sync_all()?;
    device::reread_partition_table(&file)?;

    Ok(ShrinkReport {
        partition,
        end_byte: resized.end_bytes(),
        outcome: ShrinkOutcome::Shrunk {
            from: current_size,
            to: new_size,
        },
    })
}
