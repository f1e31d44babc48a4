use anyhow::{Context, Result, anyhow};
use nix::{ioctl_none, ioctl_read, ioctl_read_bad, request_code_none};
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Sector size assumed for anything that is not a block device.
pub const DEFAULT_SECTOR_SIZE: u32 = 512;

ioctl_read!(blkgetsize64, 0x12, 114, u64);
ioctl_read_bad!(blksszget, request_code_none!(0x12, 104), libc::c_int);
ioctl_none!(blkrrpart, 0x12, 95);
ioctl_none!(blkflsbuf, 0x12, 97);

/// Represents a disk discovered on the system.
///
/// Populated by [`crate::platform::get_block_devices`].
#[derive(Clone, Debug)]
pub struct Device {
    /// The system path to the device (e.g., `/dev/mmcblk0`).
    pub path: PathBuf,
    /// The kernel-provided name of the device (e.g., "mmcblk0").
    pub name: String,
    /// Total size in bytes.
    pub size_bytes: u64,
    /// Mount points of any of the device's partitions.
    pub mount_points: Vec<PathBuf>,
    /// Whether the kernel reports the media as removable.
    pub removable: bool,
}

impl Device {
    pub fn size_gb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mount_info = if self.mount_points.is_empty() {
            "[Not mounted]".to_string()
        } else {
            let points: Vec<String> = self
                .mount_points
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            format!("[Mounted at {}]", points.join(", "))
        };

        write!(
            f,
            "{:<15} {:.1} GB {}",
            self.path.display(),
            self.size_gb(),
            mount_info
        )?;
        if !self.removable {
            write!(f, " [Fixed]")?;
        }
        Ok(())
    }
}

pub fn is_block_device(path: &Path) -> io::Result<bool> {
    Ok(fs::metadata(path)?.file_type().is_block_device())
}

/// Fails unless `path` exists and is a block device.
pub fn require_block_device(path: &Path) -> Result<()> {
    let is_block = is_block_device(path).with_context(|| format!("cannot stat {}", path.display()))?;
    if !is_block {
        return Err(anyhow!("{} is not a block device", path.display()));
    }
    Ok(())
}

fn file_is_block_device(file: &File) -> io::Result<bool> {
    Ok(file.metadata()?.file_type().is_block_device())
}

/// Size in bytes of an opened disk or image.
///
/// Block devices are asked through `BLKGETSIZE64`; regular files report
/// their length.
pub fn size_of(file: &File) -> Result<u64> {
    if !file_is_block_device(file)? {
        return Ok(file.metadata()?.len());
    }

    let mut size_bytes: u64 = 0;
    unsafe {
        blkgetsize64(file.as_raw_fd(), &mut size_bytes).context("BLKGETSIZE64 failed")?;
    }

    if size_bytes == 0 {
        return Err(anyhow!("Device size is reported as zero"));
    }
    Ok(size_bytes)
}

/// Logical sector size of an opened disk, used to interpret partition LBAs.
pub fn sector_size_of(file: &File) -> Result<u32> {
    if !file_is_block_device(file)? {
        return Ok(DEFAULT_SECTOR_SIZE);
    }

    let mut sector_size: libc::c_int = 0;
    unsafe {
        blksszget(file.as_raw_fd(), &mut sector_size).context("BLKSSZGET failed")?;
    }

    u32::try_from(sector_size)
        .ok()
        .filter(|size| *size > 0)
        .ok_or_else(|| anyhow!("invalid logical sector size {sector_size}"))
}

/// Asks the kernel to reload the partition table of `file`.
///
/// Regular files are ignored. The kernel refuses while a partition on the
/// disk is busy; that case is logged rather than treated as fatal, since the
/// table on disk has already been written.
pub fn reread_partition_table(file: &File) -> Result<()> {
    if !file_is_block_device(file)? {
        return Ok(());
    }

    match unsafe { blkrrpart(file.as_raw_fd()) } {
        Ok(_) => tracing::debug!("kernel partition table reloaded"),
        Err(err) => tracing::warn!("kernel did not reload the partition table: {err}"),
    }
    Ok(())
}

/// Drops the kernel's cached pages for `file` so the next read comes from
/// the media. Regular files are ignored.
///
/// The shrink step writes through the partition node, whose page cache is
/// separate from the whole-disk node's; without this a capture could copy
/// stale blocks.
pub fn flush_buffers(file: &File) -> Result<()> {
    if !file_is_block_device(file)? {
        return Ok(());
    }

    unsafe {
        blkflsbuf(file.as_raw_fd()).context("BLKFLSBUF failed")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn regular_file_is_not_a_block_device() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(!is_block_device(file.path()).unwrap());

        let err = require_block_device(file.path()).unwrap_err();
        assert!(err.to_string().contains("is not a block device"));
    }

    #[test]
    fn missing_path_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = require_block_device(&dir.path().join("nope")).unwrap_err();
        assert!(err.to_string().contains("cannot stat"));
    }

    #[test]
    fn regular_file_size_and_sector_size() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[7u8; 4096]).unwrap();

        assert_eq!(size_of(&file).unwrap(), 4096);
        assert_eq!(sector_size_of(&file).unwrap(), DEFAULT_SECTOR_SIZE);
        reread_partition_table(&file).unwrap();
        flush_buffers(&file).unwrap();
    }

    #[test]
    fn display_lists_mount_points() {
        let device = Device {
            path: PathBuf::from("/dev/sdb"),
            name: "sdb".into(),
            size_bytes: 32 * 1024 * 1024 * 1024,
            mount_points: vec![PathBuf::from("/media/boot"), PathBuf::from("/media/rootfs")],
            removable: true,
        };
        let shown = device.to_string();
        assert!(shown.contains("32.0 GB"));
        assert!(shown.ends_with("[Mounted at /media/boot, /media/rootfs]"));
    }

    #[test]
    fn display_marks_fixed_disks() {
        let device = Device {
            path: PathBuf::from("/dev/sda"),
            name: "sda".into(),
            size_bytes: 256 * 1024 * 1024 * 1024,
            mount_points: Vec::new(),
            removable: false,
        };
        assert!(device.to_string().ends_with("[Not mounted] [Fixed]"));
    }
}
