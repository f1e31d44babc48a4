//! ext2/3/4 detection and the e2fsprogs utilities that resize them.
use anyhow::{Context, Result, anyhow};
use std::fmt;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Output};

const SUPERBLOCK_OFFSET: u64 = 1024;
const SUPERBLOCK_LEN: usize = 1024;
const EXT_MAGIC: u16 = 0xEF53;

const COMPAT_HAS_JOURNAL: u32 = 0x0004;
const INCOMPAT_EXTENTS: u32 = 0x0040;
const INCOMPAT_64BIT: u32 = 0x0080;
const INCOMPAT_FLEX_BG: u32 = 0x0200;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsKind {
    Ext2,
    Ext3,
    Ext4,
}

impl fmt::Display for FsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FsKind::Ext2 => "ext2",
            FsKind::Ext3 => "ext3",
            FsKind::Ext4 => "ext4",
        };
        f.write_str(name)
    }
}

/// The fields of an ext superblock needed to size a shrink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExtSuperblock {
    pub kind: FsKind,
    pub block_size: u64,
    pub block_count: u64,
}

fn le_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn le_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

impl ExtSuperblock {
    /// Parses a raw superblock. Returns `None` if it is not an ext filesystem.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < SUPERBLOCK_LEN || le_u16(buf, 0x38) != EXT_MAGIC {
            return None;
        }

        let log_block_size = le_u32(buf, 0x18);
        if log_block_size > 6 {
            return None;
        }
        let block_size = 1024u64 << log_block_size;

        let compat = le_u32(buf, 0x5C);
        let incompat = le_u32(buf, 0x60);

        let mut block_count = u64::from(le_u32(buf, 0x04));
        if incompat & INCOMPAT_64BIT != 0 {
            block_count |= u64::from(le_u32(buf, 0x150)) << 32;
        }

        let kind = if incompat & (INCOMPAT_EXTENTS | INCOMPAT_64BIT | INCOMPAT_FLEX_BG) != 0 {
            FsKind::Ext4
        } else if compat & COMPAT_HAS_JOURNAL != 0 {
            FsKind::Ext3
        } else {
            FsKind::Ext2
        };

        Some(Self {
            kind,
            block_size,
            block_count,
        })
    }

    /// Reads the superblock of a filesystem starting at `offset` in `reader`.
    pub fn read_at<R: Read + Seek>(reader: &mut R, offset: u64) -> Result<Option<Self>> {
        let mut buf = vec![0u8; SUPERBLOCK_LEN];
        reader.seek(SeekFrom::Start(offset + SUPERBLOCK_OFFSET))?;
        match reader.read_exact(&mut buf) {
            Ok(()) => Ok(Self::parse(&buf)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Filesystem size in bytes, or `None` for a corrupt block count.
    pub fn size_bytes(&self) -> Option<u64> {
        self.block_count.checked_mul(self.block_size)
    }
}

/// The external operations a shrink needs from the filesystem utilities.
pub trait FsTool {
    /// Smallest size the filesystem on `partition` can be shrunk to, in
    /// filesystem blocks.
    fn minimum_blocks(&self, partition: &Path) -> Result<u64>;

    /// Forces a consistency check, which a resize requires first.
    fn check(&self, partition: &Path) -> Result<()>;

    /// Resizes the filesystem on `partition` to `blocks` filesystem blocks.
    fn resize(&self, partition: &Path, blocks: u64) -> Result<()>;
}

/// Drives `resize2fs` and `e2fsck` from e2fsprogs.
#[derive(Clone, Copy, Debug, Default)]
pub struct E2fsprogs;

/// Runs `program` to completion in its own process group, so a Ctrl+C on the
/// terminal cannot interrupt a resize halfway through. Cancellation is left
/// to the caller once the tool has exited.
fn run_tool(program: &str, args: &[&str]) -> Result<Output> {
    tracing::debug!("running `{} {}`", program, args.join(" "));
    let output = Command::new(program)
        .args(args)
        .process_group(0)
        .output()
        .with_context(|| format!("failed to run {program}; is e2fsprogs installed?"))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stdout.trim().is_empty() {
        tracing::debug!("{program} stdout:\n{}", stdout.trim_end());
    }
    if !stderr.trim().is_empty() {
        tracing::debug!("{program} stderr:\n{}", stderr.trim_end());
    }
    Ok(output)
}

fn failure(program: &str, code: Option<i32>, stderr: &str) -> anyhow::Error {
    let code = code.map_or_else(|| "a signal".to_string(), |c| format!("code {c}"));
    anyhow!("{program} exited with {code}: {}", stderr.trim())
}

fn output_failure(program: &str, output: &Output) -> anyhow::Error {
    failure(program, output.status.code(), &String::from_utf8_lossy(&output.stderr))
}

/// Interprets an `e2fsck` exit code. Returns whether errors were corrected.
///
/// 0 is clean, 1 to 3 mean errors were corrected; 4 and above, or death by
/// signal (`None`), are failures.
pub fn fsck_result(code: Option<i32>, stderr: &str) -> Result<bool> {
    match code {
        Some(0) => Ok(false),
        Some(1..=3) => Ok(true),
        _ => Err(failure("e2fsck", code, stderr)),
    }
}

/// Extracts the block count from `resize2fs -P` output.
pub fn parse_minimum_size(output: &str) -> Result<u64> {
    let line = output
        .lines()
        .find(|line| line.contains("minimum size"))
        .ok_or_else(|| anyhow!("resize2fs did not report a minimum size"))?;
    let token = line
        .split_whitespace()
        .last()
        .ok_or_else(|| anyhow!("resize2fs did not report a minimum size"))?;
    token
        .parse()
        .with_context(|| format!("unexpected resize2fs minimum size '{token}'"))
}

impl FsTool for E2fsprogs {
    fn minimum_blocks(&self, partition: &Path) -> Result<u64> {
        let path = partition.to_string_lossy();
        let output = run_tool("resize2fs", &["-P", &path])?;
        if !output.status.success() {
            return Err(output_failure("resize2fs", &output));
        }
        parse_minimum_size(&String::from_utf8_lossy(&output.stdout))
    }

    fn check(&self, partition: &Path) -> Result<()> {
        let path = partition.to_string_lossy();
        let output = run_tool("e2fsck", &["-f", "-p", &path])?;
        let code = output.status.code();
        if fsck_result(code, &String::from_utf8_lossy(&output.stderr))? {
            tracing::warn!("e2fsck corrected errors on {path} (exit code {code:?})");
        }
        Ok(())
    }

    fn resize(&self, partition: &Path, blocks: u64) -> Result<()> {
        let path = partition.to_string_lossy();
        let output = run_tool("resize2fs", &[&path, &blocks.to_string()])?;
        if !output.status.success() {
            return Err(output_failure("resize2fs", &output));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    /// Builds an ext4 superblock with 4 KiB blocks.
    pub(crate) fn ext4_superblock(block_count: u32) -> Vec<u8> {
        let mut sb = vec![0u8; SUPERBLOCK_LEN];
        sb[0x04..0x08].copy_from_slice(&block_count.to_le_bytes());
        sb[0x18..0x1C].copy_from_slice(&2u32.to_le_bytes());
        sb[0x38..0x3A].copy_from_slice(&EXT_MAGIC.to_le_bytes());
        sb[0x5C..0x60].copy_from_slice(&COMPAT_HAS_JOURNAL.to_le_bytes());
        sb[0x60..0x64].copy_from_slice(&(INCOMPAT_EXTENTS | INCOMPAT_FLEX_BG).to_le_bytes());
        sb
    }

    #[test]
    fn parses_ext4() {
        let sb = ExtSuperblock::parse(&ext4_superblock(25_000)).unwrap();
        assert_eq!(sb.kind, FsKind::Ext4);
        assert_eq!(sb.block_size, 4096);
        assert_eq!(sb.block_count, 25_000);
        assert_eq!(sb.size_bytes(), Some(102_400_000));
    }

    #[test]
    fn distinguishes_ext2_and_ext3() {
        let mut sb = ext4_superblock(100);
        sb[0x60..0x64].copy_from_slice(&0u32.to_le_bytes());
        assert_eq!(ExtSuperblock::parse(&sb).unwrap().kind, FsKind::Ext3);

        sb[0x5C..0x60].copy_from_slice(&0u32.to_le_bytes());
        assert_eq!(ExtSuperblock::parse(&sb).unwrap().kind, FsKind::Ext2);
    }

    #[test]
    fn high_block_count_needs_64bit() {
        let mut sb = ext4_superblock(5);
        sb[0x150..0x154].copy_from_slice(&1u32.to_le_bytes());
        assert_eq!(ExtSuperblock::parse(&sb).unwrap().block_count, 5);

        sb[0x60..0x64].copy_from_slice(&(INCOMPAT_EXTENTS | INCOMPAT_64BIT).to_le_bytes());
        assert_eq!(ExtSuperblock::parse(&sb).unwrap().block_count, (1 << 32) + 5);
    }

    #[test]
    fn rejects_other_filesystems() {
        assert_eq!(ExtSuperblock::parse(&[0u8; SUPERBLOCK_LEN]), None);
        assert_eq!(ExtSuperblock::parse(&[0u8; 16]), None);
    }

    #[test]
    fn reads_at_partition_offset() {
        let offset = 8192 * 512;
        let mut disk = vec![0u8; offset as usize + 4096];
        let start = (offset + SUPERBLOCK_OFFSET) as usize;
        disk[start..start + SUPERBLOCK_LEN].copy_from_slice(&ext4_superblock(42));

        let mut cursor = Cursor::new(disk);
        let sb = ExtSuperblock::read_at(&mut cursor, offset).unwrap().unwrap();
        assert_eq!(sb.block_count, 42);

        // Past the end of the data: no superblock to read.
        assert_eq!(ExtSuperblock::read_at(&mut cursor, offset * 2).unwrap(), None);
    }

    #[test]
    fn parses_resize2fs_estimate() {
        let output = "resize2fs 1.47.0 (5-Feb-2023)\nEstimated minimum size of the filesystem: 812345\n";
        assert_eq!(parse_minimum_size(output).unwrap(), 812_345);
    }

    #[test]
    fn resize2fs_estimate_missing() {
        assert!(parse_minimum_size("resize2fs 1.47.0 (5-Feb-2023)\n").is_err());
        assert!(parse_minimum_size("Estimated minimum size of the filesystem: lots\n").is_err());
    }

    #[test]
    fn fsck_exit_codes() {
        assert!(!fsck_result(Some(0), "").unwrap());
        assert!(fsck_result(Some(1), "").unwrap());
        assert!(fsck_result(Some(3), "").unwrap());

        let err = fsck_result(Some(4), "rootfs: UNEXPECTED INCONSISTENCY\n").unwrap_err();
        assert_eq!(
            err.to_string(),
            "e2fsck exited with code 4: rootfs: UNEXPECTED INCONSISTENCY"
        );
        let err = fsck_result(Some(8), "operational error").unwrap_err();
        assert!(err.to_string().contains("code 8"));
        let err = fsck_result(None, "").unwrap_err();
        assert!(err.to_string().contains("exited with a signal"));
    }

    #[test]
    fn tools_run_outside_the_terminal_process_group() {
        let output = run_tool("sh", &["-c", "cut -d ' ' -f 5 /proc/$$/stat"]).unwrap();
        assert!(output.status.success());
        let child_pgid: i32 = String::from_utf8_lossy(&output.stdout).trim().parse().unwrap();
        let parent_pgid = unsafe { libc::getpgrp() };
        assert_ne!(child_pgid, parent_pgid);
    }

    #[test]
    fn missing_tool_is_reported() {
        let err = run_tool("imagerpi-no-such-tool", &[]).unwrap_err();
        assert!(err.to_string().contains("failed to run imagerpi-no-such-tool"));
    }

    #[test]
    fn fs_kind_names() {
        assert_eq!(FsKind::Ext4.to_string(), "ext4");
        assert_eq!(FsKind::Ext2.to_string(), "ext2");
    }
}
