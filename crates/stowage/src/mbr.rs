//! MBR initialization for whole-device formatting.
//!
//! Writes a classic MBR with a single active FAT32 (LBA) partition
//! starting at sector 2048 and filling the rest of the device. Sector
//! size is fixed at 512 bytes.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use stowage_common::{StowageError, StowageResult};

/// Logical sector size assumed by the partition layout.
pub const SECTOR_SIZE: u64 = 512;
/// First usable LBA of the single data partition.
pub const SKIP_LBA: u64 = 2048;

const MBR_SIZE: usize = 512;
const PART_TABLE_OFFSET: usize = 0x1be;
const BOOT_SIGNATURE_OFFSET: usize = 0x1fe;
const STATUS_ACTIVE: u8 = 0x80;
const TYPE_FAT32_LBA: u8 = 0x0c;

/// Encode the MBR sector for a device of `total_sectors` sectors.
///
/// # Errors
///
/// Fails when the device is too small to hold the 2048-sector gap plus
/// any data.
pub fn encode_mbr(total_sectors: u64) -> StowageResult<[u8; MBR_SIZE]> {
    if total_sectors <= SKIP_LBA {
        return Err(StowageError::InvalidArgument {
            message: format!("device too small for partitioning ({total_sectors} sectors)"),
        });
    }
    let part_sectors = u32::try_from(total_sectors - SKIP_LBA).unwrap_or(u32::MAX);

    let mut sector = [0u8; MBR_SIZE];
    let entry = &mut sector[PART_TABLE_OFFSET..PART_TABLE_OFFSET + 16];
    entry[0] = STATUS_ACTIVE;
    // CHS fields are fiction on LBA media; fill with the conventional
    // out-of-range marker.
    entry[1] = 0xff;
    entry[2] = 0xff;
    entry[3] = 0xff;
    entry[4] = TYPE_FAT32_LBA;
    entry[5] = 0xff;
    entry[6] = 0xff;
    entry[7] = 0xff;
    entry[8..12].copy_from_slice(&(SKIP_LBA as u32).to_le_bytes());
    entry[12..16].copy_from_slice(&part_sectors.to_le_bytes());

    sector[BOOT_SIGNATURE_OFFSET] = 0x55;
    sector[BOOT_SIGNATURE_OFFSET + 1] = 0xaa;
    Ok(sector)
}

/// Write a fresh single-partition MBR to `device`.
pub fn initialize_mbr(device: &Path) -> StowageResult<()> {
    let mut f = OpenOptions::new().read(true).write(true).open(device)?;
    let size_bytes = f.seek(SeekFrom::End(0))?;
    let sector = encode_mbr(size_bytes / SECTOR_SIZE)?;

    f.seek(SeekFrom::Start(0))?;
    f.write_all(&sector)?;
    f.sync_all()?;

    tracing::info!(device = %device.display(),
        sectors = size_bytes / SECTOR_SIZE, "initialized MBR");
    Ok(())
}
