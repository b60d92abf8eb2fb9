//! Sizing a read from the MBR partition table.
//!
//! Only the four primary entries of a classic MBR are looked at. GPT disks
//! and extended/logical partitions are not understood; for those the used
//! extent is whatever the protective or primary entries claim.
use crate::transfer::{SectorChunk, SectorIo};
use std::io;
use tracing::{debug, warn};

pub const MBR_SIZE: usize = 512;
const PARTITION_TABLE_OFFSET: usize = 0x1BE;
const PARTITION_ENTRY_SIZE: usize = 16;
const PRIMARY_PARTITIONS: usize = 4;
const START_SECTOR_OFFSET: usize = 8;
const SECTOR_COUNT_OFFSET: usize = 12;
const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];

/// Start and length of one primary partition entry, in sectors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PartitionEntry {
    pub start_sector: u32,
    pub sector_count: u32,
}

impl PartitionEntry {
    pub fn end_sector(&self) -> u64 {
        self.start_sector as u64 + self.sector_count as u64
    }
}

fn read_u32_le(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Parses the four primary entries of an MBR sector.
pub fn primary_entries(mbr: &[u8; MBR_SIZE]) -> [PartitionEntry; PRIMARY_PARTITIONS] {
    let mut entries = [PartitionEntry::default(); PRIMARY_PARTITIONS];
    for (i, entry) in entries.iter_mut().enumerate() {
        let base = PARTITION_TABLE_OFFSET + i * PARTITION_ENTRY_SIZE;
        entry.start_sector = read_u32_le(mbr, base + START_SECTOR_OFFSET);
        entry.sector_count = read_u32_le(mbr, base + SECTOR_COUNT_OFFSET);
    }
    entries
}

/// Highest sector used by any primary partition, never less than 1 (the
/// MBR itself).
pub fn used_extent(mbr: &[u8; MBR_SIZE]) -> u64 {
    primary_entries(mbr)
        .iter()
        .map(PartitionEntry::end_sector)
        .fold(1, u64::max)
}

/// Reads sector 0 of `volume` and returns its used extent in sectors.
pub fn scan_used_extent<V: SectorIo + ?Sized>(volume: &mut V) -> io::Result<u64> {
    let sector_size = volume.sector_size();
    if (sector_size as usize) < MBR_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("sector size {sector_size} is smaller than an MBR"),
        ));
    }
    let mut chunk = SectorChunk::new(1, sector_size);
    volume.read_sectors(0, chunk.as_mut_slice())?;

    let mut mbr = [0u8; MBR_SIZE];
    mbr.copy_from_slice(&chunk.as_slice()[..MBR_SIZE]);
    if mbr[MBR_SIZE - 2..] != BOOT_SIGNATURE {
        warn!("sector 0 carries no MBR boot signature; sizing from raw entries");
    }

    let extent = used_extent(&mbr);
    debug!(extent, "partition table scanned");
    Ok(extent)
}
