//! Contains the logic for capturing a device to an image file.
use crate::copy::{self, DEFAULT_BUFFER_SIZE};
use crate::device;
use crate::filesystem::FsTool;
use crate::partition::PartitionTable;
use crate::shrink::{self, DEFAULT_FREE_SPACE, ShrinkReport};
use anyhow::{Context, Result, anyhow};
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

/// What a capture does besides reading the device.
#[derive(Clone, Debug)]
pub struct CaptureOptions {
    /// Transfer buffer size in bytes.
    pub buffer_size: usize,
    /// Free space to leave when shrinking; `None` skips the shrink.
    pub free_space: Option<u64>,
    /// Whether to copy at all. Without it only the shrink runs.
    pub copy: bool,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            free_space: Some(DEFAULT_FREE_SPACE),
            copy: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CaptureReport {
    /// Bytes that make up the image, from the start of the device.
    pub length: u64,
    pub shrink: Option<ShrinkReport>,
    pub copied: bool,
}

/// Bytes to capture when no shrink runs: up to the end of the furthest
/// partition, or the whole device if it carries no partition table.
fn unshrunk_length(device_file: &mut File) -> Result<u64> {
    let sector_size = device::sector_size_of(device_file)?;
    match PartitionTable::read(device_file, sector_size) {
        Ok(table) => match table.extent_bytes() {
            Some(extent) => Ok(extent),
            None => device::size_of(device_file),
        },
        Err(err) => {
            tracing::warn!("{err:#}; capturing the whole device");
            device::size_of(device_file)
        }
    }
}

/// Captures `device_path` into `image_path`, shrinking the last partition
/// first unless disabled.
///
/// # Arguments
///
/// * `options` - Buffer size, shrink margin and whether to copy.
/// * `tool` - The filesystem utilities used by the shrink step.
/// * `running` - Cleared to cancel the copy. A cancelled or failed copy
///   removes the partial image.
/// * `on_copy_start` - Called once with the number of bytes to copy.
/// * `on_progress` - Called with the running total of bytes copied.
pub fn run<F>(
    device_path: &Path,
    image_path: &Path,
    options: &CaptureOptions,
    tool: &dyn FsTool,
    running: Arc<AtomicBool>,
    on_copy_start: impl FnOnce(u64),
    on_progress: F,
) -> Result<CaptureReport>
where
    F: FnMut(u64),
{
    let shrink = match options.free_space {
        Some(free_space) => Some(shrink::shrink_last_partition(
            device_path,
            free_space,
            tool,
            &running,
        )?),
        None => None,
    };

    tracing::debug!("opening {}", device_path.display());
    let mut device_file = File::open(device_path)
        .with_context(|| format!("cannot open {}", device_path.display()))?;
    if shrink.is_some() {
        device::flush_buffers(&device_file)?;
    }

    let length = match &shrink {
        Some(report) => report.end_byte,
        None => unshrunk_length(&mut device_file)?,
    };
    let device_size = device::size_of(&device_file)?;
    if length > device_size {
        return Err(anyhow!(
            "partition table ends at byte {length}, past the end of {} ({device_size} bytes)",
            device_path.display()
        ));
    }
    tracing::debug!("Total Size: {length}");

    if !options.copy {
        return Ok(CaptureReport {
            length,
            shrink,
            copied: false,
        });
    }

    tracing::debug!("opening {}", image_path.display());
    let mut image_file = File::create(image_path)
        .with_context(|| format!("cannot create {}", image_path.display()))?;
    device_file.seek(SeekFrom::Start(0))?;

    on_copy_start(length);
    let copied = copy::copy_exact(
        &mut device_file,
        &mut image_file,
        length,
        options.buffer_size,
        &running,
        on_progress,
    )
    .and_then(|()| Ok(image_file.sync_all()?));

    if let Err(err) = copied {
        drop(image_file);
        std::fs::remove_file(image_path).ok();
        return Err(err);
    }

    tracing::debug!("closing {}", image_path.display());
    Ok(CaptureReport {
        length,
        shrink,
        copied: true,
    })
}
