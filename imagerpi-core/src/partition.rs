//! MBR partition table inspection and editing.
//!
//! Raspberry Pi boot media use a DOS partition table: a FAT boot partition
//! followed by the root filesystem. Only the last partition is ever edited,
//! and only its length changes.
use anyhow::{Context, Result, anyhow};
use mbrman::MBR;
use std::io::{Read, Seek, SeekFrom, Write};

/// Partition ends are rounded up to this boundary.
pub const ALIGNMENT_BYTES: u64 = 1024 * 1024;

/// A used entry of the partition table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Partition {
    /// 1-based partition number; 1 to 4 are primary, 5 and up are logical.
    pub number: usize,
    /// The MBR system id (e.g. `0x0c` for FAT32, `0x83` for Linux).
    pub kind: u8,
    pub start_lba: u64,
    pub sectors: u64,
    pub sector_size: u64,
}

impl Partition {
    pub fn is_primary(&self) -> bool {
        self.number <= 4
    }

    pub fn is_extended(&self) -> bool {
        matches!(self.kind, 0x05 | 0x0f | 0x85)
    }

    pub fn offset_bytes(&self) -> u64 {
        self.start_lba * self.sector_size
    }

    pub fn size_bytes(&self) -> u64 {
        self.sectors * self.sector_size
    }

    /// Exclusive end of the partition in bytes.
    pub fn end_bytes(&self) -> u64 {
        (self.start_lba + self.sectors) * self.sector_size
    }
}

/// Number of sectors a partition starting at `start_lba` needs to hold
/// `min_sectors`, with its end rounded up to [`ALIGNMENT_BYTES`] and never
/// past `max_sectors`.
pub fn aligned_length(start_lba: u64, min_sectors: u64, max_sectors: u64, sector_size: u64) -> u64 {
    let grain = (ALIGNMENT_BYTES / sector_size).max(1);
    let end = start_lba + min_sectors;
    let aligned_end = end.div_ceil(grain) * grain;
    (aligned_end - start_lba).min(max_sectors)
}

pub struct PartitionTable {
    mbr: MBR,
}

impl PartitionTable {
    /// Reads the table from the start of `reader`, interpreting LBAs with
    /// `sector_size`.
    pub fn read<R: Read + Seek>(reader: &mut R, sector_size: u32) -> Result<Self> {
        reader.seek(SeekFrom::Start(0))?;
        let mbr = MBR::read_from(reader, sector_size)
            .map_err(|e| anyhow!("failed to read the partition table: {e}"))?;
        Ok(Self { mbr })
    }

    /// Writes the table back to the start of `writer`.
    pub fn write<W: Write + Seek>(&mut self, writer: &mut W) -> Result<()> {
        writer.seek(SeekFrom::Start(0))?;
        self.mbr
            .write_into(writer)
            .map_err(|e| anyhow!("failed to write the partition table: {e}"))?;
        writer.flush()?;
        Ok(())
    }

    pub fn sector_size(&self) -> u64 {
        u64::from(self.mbr.sector_size)
    }

    /// All used entries, in table order.
    pub fn partitions(&self) -> Vec<Partition> {
        let sector_size = self.sector_size();
        self.mbr
            .iter()
            .filter(|(_, entry)| entry.is_used())
            .map(|(number, entry)| Partition {
                number,
                kind: entry.sys,
                start_lba: u64::from(entry.starting_lba),
                sectors: u64::from(entry.sectors),
                sector_size,
            })
            .collect()
    }

    /// The data partition that ends furthest into the disk.
    pub fn last_partition(&self) -> Option<Partition> {
        self.partitions()
            .into_iter()
            .filter(|p| !p.is_extended())
            .max_by_key(|p| p.end_bytes())
    }

    /// Bytes from the start of the disk to the end of the furthest entry.
    pub fn extent_bytes(&self) -> Option<u64> {
        self.partitions().iter().map(Partition::end_bytes).max()
    }

    /// Shrinks primary partition `number` so it still covers `new_size_bytes`.
    ///
    /// Returns the updated entry. A request that would not make the
    /// partition smaller leaves it unchanged.
    pub fn shrink(&mut self, number: usize, new_size_bytes: u64) -> Result<Partition> {
        let sector_size = self.sector_size();
        let current = self
            .partitions()
            .into_iter()
            .find(|p| p.number == number)
            .ok_or_else(|| anyhow!("partition {number} does not exist"))?;

        if !current.is_primary() || current.is_extended() {
            return Err(anyhow!(
                "partition {number} is not a primary data partition and cannot be resized"
            ));
        }

        let min_sectors = new_size_bytes.div_ceil(sector_size);
        let sectors = aligned_length(current.start_lba, min_sectors, current.sectors, sector_size);
        if sectors == current.sectors {
            return Ok(current);
        }

        let entry = self
            .mbr
            .get_mut(number)
            .ok_or_else(|| anyhow!("partition {number} does not exist"))?;
        entry.sectors = u32::try_from(sectors)
            .context("partition length does not fit in an MBR entry")?;

        tracing::debug!(
            "partition {number}: {} -> {sectors} sectors of {sector_size} bytes",
            current.sectors
        );

        Ok(Partition { sectors, ..current })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs::File;

    /// Creates a sparse disk image with the given `(sys, start, sectors)`
    /// primary partitions.
    pub(crate) fn disk_with_partitions(len: u64, parts: &[(u8, u32, u32)]) -> tempfile::NamedTempFile {
        let disk = tempfile::NamedTempFile::new().unwrap();
        let mut file = disk.reopen().unwrap();
        file.set_len(len).unwrap();

        let mut mbr = MBR::new_from(&mut file, 512, [0x12, 0x34, 0x56, 0x78]).unwrap();
        for (index, (sys, start, sectors)) in parts.iter().enumerate() {
            let entry = &mut mbr[index + 1];
            entry.sys = *sys;
            entry.starting_lba = *start;
            entry.sectors = *sectors;
        }
        mbr.write_into(&mut file).unwrap();
        disk
    }

    fn open(disk: &tempfile::NamedTempFile) -> File {
        File::options().read(true).write(true).open(disk.path()).unwrap()
    }

    #[test]
    fn finds_last_partition_and_extent() {
        let disk = disk_with_partitions(64 << 20, &[(0x0c, 8192, 8192), (0x83, 16384, 65536)]);
        let table = PartitionTable::read(&mut open(&disk), 512).unwrap();

        let parts = table.partitions();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].kind, 0x0c);

        let last = table.last_partition().unwrap();
        assert_eq!(last.number, 2);
        assert_eq!(last.offset_bytes(), 16384 * 512);
        assert_eq!(last.size_bytes(), 65536 * 512);
        assert_eq!(table.extent_bytes(), Some((16384 + 65536) * 512));
    }

    #[test]
    fn last_partition_is_by_position_not_number() {
        let disk = disk_with_partitions(64 << 20, &[(0x83, 40960, 8192), (0x0c, 8192, 8192)]);
        let table = PartitionTable::read(&mut open(&disk), 512).unwrap();
        assert_eq!(table.last_partition().unwrap().number, 1);
    }

    #[test]
    fn empty_table_has_no_partitions() {
        let disk = disk_with_partitions(8 << 20, &[]);
        let table = PartitionTable::read(&mut open(&disk), 512).unwrap();
        assert!(table.last_partition().is_none());
        assert_eq!(table.extent_bytes(), None);
    }

    #[test]
    fn missing_signature_is_an_error() {
        let mut blank = tempfile::tempfile().unwrap();
        blank.set_len(1 << 20).unwrap();
        assert!(PartitionTable::read(&mut blank, 512).is_err());
    }

    #[test]
    fn alignment_rounds_up_and_caps() {
        assert_eq!(aligned_length(2048, 100, 10_000, 512), 2048);
        assert_eq!(aligned_length(2048, 2048, 10_000, 512), 2048);
        assert_eq!(aligned_length(2048, 1000, 1500, 512), 1500);
        assert_eq!(aligned_length(256, 10, 10_000, 4096), 256);
        assert_eq!(aligned_length(8192, 48_192, 200_000, 512), 49_152);
    }

    #[test]
    fn shrink_rewrites_the_entry() {
        let disk = disk_with_partitions(128 << 20, &[(0x0c, 8192, 8192), (0x83, 16384, 200_000)]);
        let mut file = open(&disk);

        let mut table = PartitionTable::read(&mut file, 512).unwrap();
        let shrunk = table.shrink(2, 10 * 1024 * 1024 + 1).unwrap();
        // 20481 sectors, end rounded up to the next 2048-sector boundary.
        assert_eq!(shrunk.sectors, 22528);
        assert_eq!(shrunk.end_bytes() % ALIGNMENT_BYTES, 0);
        table.write(&mut file).unwrap();

        let reread = PartitionTable::read(&mut file, 512).unwrap();
        let last = reread.last_partition().unwrap();
        assert_eq!(last.start_lba, 16384);
        assert_eq!(last.sectors, 22528);
        assert_eq!(reread.partitions()[0].sectors, 8192);
    }

    #[test]
    fn shrink_never_grows() {
        let disk = disk_with_partitions(64 << 20, &[(0x83, 2048, 4096)]);
        let mut table = PartitionTable::read(&mut open(&disk), 512).unwrap();
        let unchanged = table.shrink(1, 64 << 20).unwrap();
        assert_eq!(unchanged.sectors, 4096);
    }

    #[test]
    fn shrink_unknown_partition_fails() {
        let disk = disk_with_partitions(64 << 20, &[(0x83, 2048, 4096)]);
        let mut table = PartitionTable::read(&mut open(&disk), 512).unwrap();
        assert!(table.shrink(3, 1024).is_err());
    }
}
