//! Contains the logic for deploying an image file to a device.
//!
//! Deploying is a straight copy of the image onto the start of the device,
//! optionally followed by a verification pass that hashes both sides.
use crate::copy;
use crate::device;
use anyhow::{Context, Result, anyhow};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

/// Opens the deploy target for writing.
///
/// Block devices get `O_EXCL`, which the kernel rejects with `EBUSY` while
/// any partition of the device is mounted.
fn open_target(device_path: &Path) -> Result<File> {
    let mut options = File::options();
    options.write(true);
    if device::is_block_device(device_path)? {
        options.custom_flags(libc::O_EXCL);
    }
    options
        .open(device_path)
        .with_context(|| format!("cannot open {} for writing; is it mounted?", device_path.display()))
}

/// Hashes the first `len` bytes of `reader`.
fn hash_prefix<R: Read, F: FnMut(u64)>(
    reader: &mut R,
    len: u64,
    buffer_size: usize,
    running: &AtomicBool,
    mut on_progress: F,
) -> Result<[u8; 32]> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; buffer_size];
    let mut remaining = len;

    while remaining > 0 {
        copy::ensure_running(running)?;

        let chunk = std::cmp::min(buffer_size as u64, remaining) as usize;
        reader.read_exact(&mut buffer[..chunk])?;
        hasher.update(&buffer[..chunk]);

        remaining -= chunk as u64;
        on_progress(len - remaining);
    }

    Ok(hasher.finalize().into())
}

/// Writes the image at `image_path` to the start of `device_path`.
///
/// # Arguments
///
/// * `buffer_size` - Transfer buffer size in bytes.
/// * `verify` - If `true`, both sides are hashed after writing and compared.
/// * `running` - Cleared to cancel the operation.
/// * `on_write_start` - Called once with the image size.
/// * `on_write_progress` - Called with the number of bytes written.
/// * `on_verify_start` - Called once when verification begins.
/// * `on_verify_progress` - Called with the number of bytes verified so far
///   (both sides together count once).
///
/// # Errors
///
/// Fails if the image is empty or larger than the device, if the device is
/// in use, on any I/O error, on a hash mismatch, or when cancelled.
#[allow(clippy::too_many_arguments)]
pub fn run<F1, F2>(
    image_path: &Path,
    device_path: &Path,
    buffer_size: usize,
    verify: bool,
    running: Arc<AtomicBool>,
    on_write_start: impl FnOnce(u64),
    on_write_progress: F1,
    on_verify_start: impl FnOnce(u64),
    mut on_verify_progress: F2,
) -> Result<()>
where
    F1: FnMut(u64),
    F2: FnMut(u64),
{
    tracing::debug!("opening {}", image_path.display());
    let mut image_file = File::open(image_path)
        .with_context(|| format!("cannot open {}", image_path.display()))?;
    let image_len = image_file.metadata()?.len();
    if image_len == 0 {
        return Err(anyhow!("{} is empty", image_path.display()));
    }
    tracing::debug!("Total Size: {image_len}");

    tracing::debug!("opening {}", device_path.display());
    let mut device_file = open_target(device_path)?;
    let device_size = device::size_of(&device_file)?;
    if image_len > device_size {
        return Err(anyhow!(
            "{} ({image_len} bytes) does not fit on {} ({device_size} bytes)",
            image_path.display(),
            device_path.display()
        ));
    }

    on_write_start(image_len);
    copy::copy_exact(
        &mut image_file,
        &mut device_file,
        image_len,
        buffer_size,
        &running,
        on_write_progress,
    )?;
    device_file.sync_all()?;
    drop(device_file);

    if verify {
        let mut image_file = File::open(image_path)?;
        let mut device_file = File::open(device_path)?;

        on_verify_start(image_len);

        // Each side reports half of the total.
        let image_hash = hash_prefix(&mut image_file, image_len, buffer_size, &running, |n| {
            on_verify_progress(n / 2)
        })?;
        let device_hash = hash_prefix(&mut device_file, image_len, buffer_size, &running, |n| {
            on_verify_progress(image_len / 2 + n / 2)
        })?;

        if image_hash != device_hash {
            return Err(anyhow!("Verification failed: hash mismatch."));
        }
        on_verify_progress(image_len);
        tracing::debug!("verified {image_len} bytes");
    }

    Ok(())
}
