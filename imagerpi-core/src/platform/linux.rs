use crate::device::Device;
use anyhow::{Result, anyhow};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Helper to read a specific file from the /sys/block filesystem.
fn read_sys_file(device_name: &str, file: &str) -> io::Result<String> {
    let path = PathBuf::from("/sys/block").join(device_name).join(file);
    fs::read_to_string(path).map(|s| s.trim().to_string())
}

/// Path of a mounted source as reported by the mount table, resolved to its
/// `/dev` node.
fn mounted_source(disk: &sysinfo::Disk) -> PathBuf {
    let source = PathBuf::from("/dev/").join(disk.name());
    fs::canonicalize(&source).unwrap_or(source)
}

/// Finds the whole-disk node of a partition node.
///
/// `/dev/sda1` -> `/dev/sda`, `/dev/mmcblk0p2` -> `/dev/mmcblk0`.
fn parent_device_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    let trimmed = path_str.trim_end_matches(|c: char| c.is_ascii_digit());

    if trimmed.len() == path_str.len() {
        return path.to_path_buf();
    }

    // Disks whose names end in a digit separate the partition number with 'p'.
    if let Some(disk) = trimmed.strip_suffix('p') {
        if disk.ends_with(|c: char| c.is_ascii_digit()) {
            return PathBuf::from(disk);
        }
    }

    // mmcblk0, nvme0n1: the trailing digits belong to the disk itself.
    let name = trimmed.rsplit('/').next().unwrap_or(trimmed);
    if name.starts_with("mmcblk") || name.chars().any(|c| c.is_ascii_digit()) {
        return path.to_path_buf();
    }

    PathBuf::from(trimmed)
}

/// Builds the node path of partition `number` on `disk`.
///
/// `/dev/sda` + 2 -> `/dev/sda2`; `/dev/mmcblk0` + 2 -> `/dev/mmcblk0p2`.
pub fn partition_path(disk: &Path, number: usize) -> PathBuf {
    let disk_str = disk.to_string_lossy();
    if disk_str.ends_with(|c: char| c.is_ascii_digit()) {
        PathBuf::from(format!("{disk_str}p{number}"))
    } else {
        PathBuf::from(format!("{disk_str}{number}"))
    }
}

/// Returns where `partition` is mounted, if anywhere.
pub fn mount_point_of(partition: &Path) -> Option<PathBuf> {
    let target = fs::canonicalize(partition).unwrap_or_else(|_| partition.to_path_buf());
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .find(|disk| mounted_source(disk) == target)
        .map(|disk| disk.mount_point().to_path_buf())
}

/// Scans for removable block devices, such as SD card readers.
///
/// Fixed disks are left out; see [`get_block_devices`] for the rest.
pub fn get_removable_devices() -> Result<Vec<Device>> {
    let mut devices = get_block_devices()?;
    devices.retain(|device| device.removable);
    Ok(devices)
}

/// Scans `/sys/block` for disks an image could be captured from or deployed
/// to. Loop devices and the disk holding `/` are skipped, as are devices that
/// report a size of zero (empty card readers).
pub fn get_block_devices() -> Result<Vec<Device>> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let system_disk_parent = disks
        .iter()
        .find(|disk| disk.mount_point() == Path::new("/"))
        .map(|disk| parent_device_path(&mounted_source(disk)))
        .ok_or_else(|| anyhow!("Could not determine system drive."))?;

    let mut devices = Vec::new();

    for entry in fs::read_dir("/sys/block")?.filter_map(Result::ok) {
        let device_name = entry.file_name().to_string_lossy().to_string();
        let device_path = PathBuf::from("/dev/").join(&device_name);

        if device_name.starts_with("loop") || device_path == system_disk_parent {
            continue;
        }

        // /sys/block reports size in 512-byte units regardless of the
        // logical sector size.
        let size_sectors = read_sys_file(&device_name, "size")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        if size_sectors == 0 {
            continue;
        }

        let removable = read_sys_file(&device_name, "removable")
            .map(|s| s == "1")
            .unwrap_or(false);

        let mount_points = disks
            .iter()
            .filter(|disk| parent_device_path(&mounted_source(disk)) == device_path)
            .map(|disk| disk.mount_point().to_path_buf())
            .collect();

        devices.push(Device {
            path: device_path,
            name: device_name,
            size_bytes: size_sectors * 512,
            mount_points,
            removable,
        });
    }

    devices.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_paths_follow_kernel_naming() {
        assert_eq!(partition_path(Path::new("/dev/sda"), 2), PathBuf::from("/dev/sda2"));
        assert_eq!(
            partition_path(Path::new("/dev/mmcblk0"), 2),
            PathBuf::from("/dev/mmcblk0p2")
        );
        assert_eq!(
            partition_path(Path::new("/dev/nvme0n1"), 1),
            PathBuf::from("/dev/nvme0n1p1")
        );
        assert_eq!(partition_path(Path::new("/dev/loop3"), 1), PathBuf::from("/dev/loop3p1"));
    }

    #[test]
    fn parent_of_partition_nodes() {
        assert_eq!(parent_device_path(Path::new("/dev/sdb1")), PathBuf::from("/dev/sdb"));
        assert_eq!(parent_device_path(Path::new("/dev/sdb")), PathBuf::from("/dev/sdb"));
        assert_eq!(
            parent_device_path(Path::new("/dev/mmcblk0p2")),
            PathBuf::from("/dev/mmcblk0")
        );
        assert_eq!(
            parent_device_path(Path::new("/dev/nvme0n1p3")),
            PathBuf::from("/dev/nvme0n1")
        );
        assert_eq!(
            parent_device_path(Path::new("/dev/mmcblk0")),
            PathBuf::from("/dev/mmcblk0")
        );
        assert_eq!(
            parent_device_path(Path::new("/dev/nvme0n1")),
            PathBuf::from("/dev/nvme0n1")
        );
    }

    #[test]
    fn unmounted_path_has_no_mount_point() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(mount_point_of(file.path()), None);
    }
}
