// Partition table creation
// Builds an MBR or GPT holding a single partition that spans the disk

use bootforge_core::{BootforgeError, DeviceError, FilesystemKind, PartitionTableKind};
use log::info;
use std::io::{Seek, SeekFrom, Write};
use uuid::Uuid;

#[cfg(test)]
mod mbr_tests;

const MBR_DISK_SIGNATURE: usize = 440;
const MBR_PARTITION_TABLE: usize = 446;
const MBR_ENTRY_SIZE: usize = 16;
const PARTITION_ALIGNMENT_BYTES: u64 = 1024 * 1024;

const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
const GPT_REVISION: u32 = 0x0001_0000;
const GPT_HEADER_SIZE: u32 = 92;
const GPT_ENTRY_COUNT: u32 = 128;
const GPT_ENTRY_SIZE: u32 = 128;
const GPT_BASIC_DATA: Uuid = Uuid::from_u128(0xEBD0A0A2_B9E5_4433_87C0_68B6B72699C7);
const GPT_ATTR_LEGACY_BIOS_BOOTABLE: u64 = 1 << 2;

/// MBR partition type bytes
pub const MBR_TYPE_FAT16_LBA: u8 = 0x0E;
pub const MBR_TYPE_FAT32_LBA: u8 = 0x0C;
pub const MBR_TYPE_NTFS: u8 = 0x07;
const MBR_TYPE_GPT_PROTECTIVE: u8 = 0xEE;

/// FAT32 takes over from this partition size on, matching the planner.
const FAT32_PARTITION_THRESHOLD: u64 = 512 * 1024 * 1024;

/// One primary partition entry of an MBR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MbrEntry {
    pub bootable: bool,
    pub partition_type: u8,
    pub start_lba: u32,
    pub sector_count: u32,
}

impl MbrEntry {
    /// First partition of an MBR sector, if the sector is an MBR at all.
    pub fn parse_first(sector: &[u8]) -> Option<Self> {
        if sector.len() < 512 || sector[510] != 0x55 || sector[511] != 0xAA {
            return None;
        }
        let e = &sector[MBR_PARTITION_TABLE..MBR_PARTITION_TABLE + MBR_ENTRY_SIZE];
        if e[4] == 0 {
            return None;
        }
        Some(Self {
            bootable: e[0] == 0x80,
            partition_type: e[4],
            start_lba: u32::from_le_bytes([e[8], e[9], e[10], e[11]]),
            sector_count: u32::from_le_bytes([e[12], e[13], e[14], e[15]]),
        })
    }
}

/// A ready-to-write table plus where its single partition lives.
#[derive(Debug, Clone)]
pub struct PartitionTable {
    pub kind: PartitionTableKind,
    pub sector_size: u32,
    pub start_lba: u64,
    pub sector_count: u64,
    pub bootable: bool,
    /// Byte offset and contents of every region to write.
    pub regions: Vec<(u64, Vec<u8>)>,
}

impl PartitionTable {
    pub fn partition_offset(&self) -> u64 {
        self.start_lba * self.sector_size as u64
    }

    pub fn partition_bytes(&self) -> u64 {
        self.sector_count * self.sector_size as u64
    }
}

pub fn mbr_partition_type(fs: FilesystemKind, partition_bytes: u64) -> u8 {
    match fs {
        FilesystemKind::Ntfs => MBR_TYPE_NTFS,
        FilesystemKind::Fat if partition_bytes >= FAT32_PARTITION_THRESHOLD => MBR_TYPE_FAT32_LBA,
        FilesystemKind::Fat => MBR_TYPE_FAT16_LBA,
    }
}

/// Lay out a table with one partition starting at 1 MiB and covering the
/// rest of the usable disk. The partition is marked bootable.
pub fn build_partition_table(
    disk_bytes: u64,
    sector_size: u32,
    kind: PartitionTableKind,
    fs: FilesystemKind,
) -> Result<PartitionTable, BootforgeError> {
    let ss = sector_size as u64;
    let total = disk_bytes / ss;
    let start_lba = PARTITION_ALIGNMENT_BYTES / ss;

    let table = match kind {
        PartitionTableKind::Mbr => {
            let end = total.min(u32::MAX as u64);
            if end <= start_lba {
                return Err(too_small(disk_bytes));
            }
            let sector_count = end - start_lba;
            let partition_type = mbr_partition_type(fs, sector_count * ss);
            let mbr = build_mbr(ss, start_lba as u32, sector_count as u32, partition_type, true);
            info!(
                "MBR: partition type 0x{:02X} at LBA {}, {} sectors",
                partition_type, start_lba, sector_count
            );
            PartitionTable {
                kind,
                sector_size,
                start_lba,
                sector_count,
                bootable: true,
                regions: vec![(0, mbr)],
            }
        }
        PartitionTableKind::Gpt => build_gpt(total, ss, start_lba, fs, disk_bytes)?,
    };
    Ok(table)
}

fn too_small(disk_bytes: u64) -> BootforgeError {
    DeviceError::Unusable(format!("{} bytes is too small for a partition table", disk_bytes)).into()
}

/// CHS triple for an LBA with 255 heads and 63 sectors per track, or the
/// "use LBA" marker past cylinder 1023.
fn chs(lba: u64) -> [u8; 3] {
    const HEADS: u64 = 255;
    const SPT: u64 = 63;
    let cylinder = lba / (HEADS * SPT);
    if cylinder > 1023 {
        return [0xFE, 0xFF, 0xFF];
    }
    let head = (lba / SPT) % HEADS;
    let sector = lba % SPT + 1;
    [
        head as u8,
        ((sector & 0x3F) | ((cylinder >> 2) & 0xC0)) as u8,
        (cylinder & 0xFF) as u8,
    ]
}

fn build_mbr(ss: u64, start_lba: u32, sector_count: u32, partition_type: u8, bootable: bool) -> Vec<u8> {
    let mut mbr = vec![0u8; ss as usize];

    // Windows ignores MBRs without a disk signature
    let signature = match rand::random::<u32>() {
        0 => 0x4246_5247,
        s => s,
    };
    mbr[MBR_DISK_SIGNATURE..MBR_DISK_SIGNATURE + 4].copy_from_slice(&signature.to_le_bytes());

    let e = &mut mbr[MBR_PARTITION_TABLE..MBR_PARTITION_TABLE + MBR_ENTRY_SIZE];
    e[0] = if bootable { 0x80 } else { 0x00 };
    e[1..4].copy_from_slice(&chs(start_lba as u64));
    e[4] = partition_type;
    e[5..8].copy_from_slice(&chs(start_lba as u64 + sector_count as u64 - 1));
    e[8..12].copy_from_slice(&start_lba.to_le_bytes());
    e[12..16].copy_from_slice(&sector_count.to_le_bytes());

    mbr[510] = 0x55;
    mbr[511] = 0xAA;
    mbr
}

#[allow(clippy::too_many_arguments)]
fn gpt_header(
    ss: u64,
    my_lba: u64,
    alternate_lba: u64,
    first_usable: u64,
    last_usable: u64,
    disk_guid: &Uuid,
    entries_lba: u64,
    entries_crc: u32,
) -> Vec<u8> {
    let mut h = vec![0u8; ss as usize];
    h[0..8].copy_from_slice(GPT_SIGNATURE);
    h[8..12].copy_from_slice(&GPT_REVISION.to_le_bytes());
    h[12..16].copy_from_slice(&GPT_HEADER_SIZE.to_le_bytes());
    h[24..32].copy_from_slice(&my_lba.to_le_bytes());
    h[32..40].copy_from_slice(&alternate_lba.to_le_bytes());
    h[40..48].copy_from_slice(&first_usable.to_le_bytes());
    h[48..56].copy_from_slice(&last_usable.to_le_bytes());
    h[56..72].copy_from_slice(&disk_guid.to_bytes_le());
    h[72..80].copy_from_slice(&entries_lba.to_le_bytes());
    h[80..84].copy_from_slice(&GPT_ENTRY_COUNT.to_le_bytes());
    h[84..88].copy_from_slice(&GPT_ENTRY_SIZE.to_le_bytes());
    h[88..92].copy_from_slice(&entries_crc.to_le_bytes());
    let crc = crc32fast::hash(&h[..GPT_HEADER_SIZE as usize]);
    h[16..20].copy_from_slice(&crc.to_le_bytes());
    h
}

fn build_gpt(
    total: u64,
    ss: u64,
    start_lba: u64,
    fs: FilesystemKind,
    disk_bytes: u64,
) -> Result<PartitionTable, BootforgeError> {
    let entries_bytes = (GPT_ENTRY_COUNT * GPT_ENTRY_SIZE) as u64;
    let entries_sectors = entries_bytes.div_ceil(ss);
    let first_usable = 2 + entries_sectors;
    let last_lba = total.saturating_sub(1);
    let last_usable = last_lba.saturating_sub(entries_sectors + 1);
    if total < first_usable * 2 || last_usable <= start_lba.max(first_usable) {
        return Err(too_small(disk_bytes));
    }
    let start_lba = start_lba.max(first_usable);
    let sector_count = last_usable - start_lba + 1;

    let mut entries = vec![0u8; entries_bytes as usize];
    entries[0..16].copy_from_slice(&GPT_BASIC_DATA.to_bytes_le());
    entries[16..32].copy_from_slice(&Uuid::new_v4().to_bytes_le());
    entries[32..40].copy_from_slice(&start_lba.to_le_bytes());
    entries[40..48].copy_from_slice(&last_usable.to_le_bytes());
    entries[48..56].copy_from_slice(&GPT_ATTR_LEGACY_BIOS_BOOTABLE.to_le_bytes());
    let name = match fs {
        FilesystemKind::Fat => "FAT Volume",
        FilesystemKind::Ntfs => "NTFS Volume",
    };
    for (i, unit) in name.encode_utf16().take(36).enumerate() {
        entries[56 + i * 2..58 + i * 2].copy_from_slice(&unit.to_le_bytes());
    }
    let entries_crc = crc32fast::hash(&entries);

    let disk_guid = Uuid::new_v4();
    let backup_entries_lba = last_lba - entries_sectors;
    let primary = gpt_header(ss, 1, last_lba, first_usable, last_usable, &disk_guid, 2, entries_crc);
    let backup = gpt_header(
        ss,
        last_lba,
        1,
        first_usable,
        last_usable,
        &disk_guid,
        backup_entries_lba,
        entries_crc,
    );

    let mut pmbr = vec![0u8; ss as usize];
    {
        let e = &mut pmbr[MBR_PARTITION_TABLE..MBR_PARTITION_TABLE + MBR_ENTRY_SIZE];
        e[1..4].copy_from_slice(&[0x00, 0x02, 0x00]);
        e[4] = MBR_TYPE_GPT_PROTECTIVE;
        e[5..8].copy_from_slice(&chs(last_lba));
        e[8..12].copy_from_slice(&1u32.to_le_bytes());
        e[12..16].copy_from_slice(&(last_lba.min(u32::MAX as u64) as u32).to_le_bytes());
    }
    pmbr[510] = 0x55;
    pmbr[511] = 0xAA;

    let mut front = pmbr;
    front.extend_from_slice(&primary);
    front.extend_from_slice(&entries);
    let mut back = entries;
    back.resize((entries_sectors * ss) as usize, 0);
    back.extend_from_slice(&backup);

    info!(
        "GPT: basic data partition at LBA {}..={}, disk {}",
        start_lba, last_usable, disk_guid
    );
    Ok(PartitionTable {
        kind: PartitionTableKind::Gpt,
        sector_size: ss as u32,
        start_lba,
        sector_count,
        bootable: true,
        regions: vec![(0, front), (backup_entries_lba * ss, back)],
    })
}

/// Write every region of `table` and flush.
pub fn write_partition_table<W: Write + Seek + ?Sized>(
    writer: &mut W,
    table: &PartitionTable,
) -> Result<(), BootforgeError> {
    for (offset, bytes) in &table.regions {
        writer
            .seek(SeekFrom::Start(*offset))
            .map_err(|e| DeviceError::io(format!("seek to partition table at {}", offset), e))?;
        writer
            .write_all(bytes)
            .map_err(|e| DeviceError::io("write partition table", e))?;
    }
    writer
        .flush()
        .map_err(|e| DeviceError::io("flush partition table", e))?;
    Ok(())
}
