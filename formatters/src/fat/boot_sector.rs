// Boot sector, FSInfo sector and the initial metadata image of a FAT volume

use super::constants::*;
use super::fat_table::FatTable;
use super::layout::{FatLayout, FatType};
use super::root_dir::build_root_dir;
use bootforge_core::{FatOptions, SerializeError};
use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Local, NaiveDateTime, Utc};
use log::{debug, warn};

const JUMP_LEGACY: [u8; 3] = [0xEB, 0x3C, 0x90];
const JUMP_FAT32: [u8; 3] = [0xEB, 0x58, 0x90];
const JUMP_ATARI: [u8; 3] = [0x60, 0x1C, b'm'];
const ATARI_OEM_PREFIX: &[u8; 5] = b"kdosf";
const DEFAULT_OEM_NAME: &[u8; 8] = b"mkfs.fat";

const BOOT_CODE_LEGACY_LEN: usize = BOOT_SIGNATURE_OFFSET - BS16_BOOT_CODE;
const BOOT_CODE_FAT32_LEN: usize = BOOT_SIGNATURE_OFFSET - BS32_BOOT_CODE;

// x86 stub: print the message at MESSAGE_OFFSET, wait for a key, int 19h
const BOOT_STUB: [u8; 29] = [
    0x0E, // push cs
    0x1F, // pop ds
    0xBE, 0x5B, 0x7C, // mov si, message
    0xAC, // lodsb
    0x22, 0xC0, // and al, al
    0x74, 0x0B, // jz key_press
    0x56, // push si
    0xB4, 0x0E, // mov ah, 0eh
    0xBB, 0x07, 0x00, // mov bx, 0007h
    0xCD, 0x10, // int 10h
    0x5E, // pop si
    0xEB, 0xF0, // jmp lodsb
    0x32, 0xE4, // xor ah, ah
    0xCD, 0x16, // int 16h
    0xCD, 0x19, // int 19h
    0xEB, 0xFE, // jmp $
];
const MESSAGE_OFFSET: usize = BOOT_STUB.len();
const MESSAGE_POINTER: usize = 3;
const BOOT_LOAD_ADDRESS: usize = 0x7C00;

pub const DEFAULT_BOOT_MESSAGE: &str =
    "This is not a bootable disk.  Please insert a bootable floppy and\r\npress any key to try again ... \r\n";

const INVARIANT_VOLUME_ID: u32 = 0x1234_ABCD;
const INVARIANT_TIMESTAMP: i64 = 1_426_325_213;

/// Caller-supplied identity of the new volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMetadata {
    pub label: [u8; 11],
    pub volume_id: u32,
    pub creation_time: NaiveDateTime,
    pub is_atari_variant: bool,
    pub oem_name: [u8; 8],
    pub boot_message: Option<String>,
}

impl VolumeMetadata {
    pub fn new(volume_id: u32, creation_time: NaiveDateTime) -> Self {
        Self {
            label: *NO_NAME_LABEL,
            volume_id,
            creation_time,
            is_atari_variant: false,
            oem_name: *DEFAULT_OEM_NAME,
            boot_message: None,
        }
    }

    /// Set the label, upper-cased and space padded. An empty label means
    /// "NO NAME".
    pub fn with_label(mut self, label: &str) -> Result<Self, SerializeError> {
        self.label = encode_label(label)?;
        Ok(self)
    }

    /// Build the metadata for a format run. Invariant mode pins both the
    /// volume id and the timestamp so repeated runs give identical images.
    pub fn from_options(options: &FatOptions) -> Result<Self, SerializeError> {
        let (generated_id, created) = if options.invariant {
            let created = DateTime::from_timestamp(INVARIANT_TIMESTAMP, 0)
                .map(|t| t.naive_utc())
                .unwrap_or_default();
            (INVARIANT_VOLUME_ID, created)
        } else {
            let now = Utc::now();
            let id = ((now.timestamp() as u64) << 20 | now.timestamp_subsec_micros() as u64) as u32;
            (id, Local::now().naive_local())
        };

        let mut meta = Self::new(options.volume_id.unwrap_or(generated_id), created);
        meta.is_atari_variant = options.atari;
        meta.boot_message = options.boot_message.clone();
        match options.label.as_deref() {
            Some(label) => meta.with_label(label),
            None => Ok(meta),
        }
    }
}

pub fn encode_label(label: &str) -> Result<[u8; 11], SerializeError> {
    let upper = label.to_uppercase();
    let bytes = upper.as_bytes();
    if bytes.len() > 11 {
        return Err(SerializeError::LabelTooLong(bytes.len()));
    }
    if bytes.is_empty() {
        return Ok(*NO_NAME_LABEL);
    }
    let mut out = [b' '; 11];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

/// Volume serial, label and type string. Same shape in both extended blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub drive_number: u8,
    /// False on the Atari variant, which has no serial or label here.
    pub extended_signature: bool,
    pub volume_id: u32,
    pub label: [u8; 11],
    pub fs_type: [u8; 8],
}

impl VolumeInfo {
    fn write(&self, block: &mut [u8]) {
        block[VI_DRV_NUM] = self.drive_number;
        if self.extended_signature {
            block[VI_BOOT_SIG] = EXTENDED_BOOT_SIGNATURE;
            LittleEndian::write_u32(&mut block[VI_VOL_ID..], self.volume_id);
            block[VI_VOL_LAB..VI_VOL_LAB + 11].copy_from_slice(&self.label);
        }
        block[VI_FIL_SYS_TYPE..VI_FIL_SYS_TYPE + 8].copy_from_slice(&self.fs_type);
    }

    fn read(block: &[u8]) -> Self {
        let extended_signature = block[VI_BOOT_SIG] == EXTENDED_BOOT_SIGNATURE;
        let mut label = *NO_NAME_LABEL;
        let mut volume_id = 0;
        if extended_signature {
            label.copy_from_slice(&block[VI_VOL_LAB..VI_VOL_LAB + 11]);
            volume_id = LittleEndian::read_u32(&block[VI_VOL_ID..]);
        }
        let mut fs_type = [0u8; 8];
        fs_type.copy_from_slice(&block[VI_FIL_SYS_TYPE..VI_FIL_SYS_TYPE + 8]);
        Self {
            drive_number: block[VI_DRV_NUM],
            extended_signature,
            volume_id,
            label,
            fs_type,
        }
    }
}

/// The part of the boot sector after the common BPB. FAT12/16 and FAT32
/// place different fields at the same offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtendedBlock {
    Legacy {
        volume: VolumeInfo,
    },
    Fat32 {
        fat_length: u32,
        flags: u16,
        version: u16,
        root_cluster: u32,
        info_sector: u16,
        backup_boot: u16,
        volume: VolumeInfo,
    },
}

impl ExtendedBlock {
    pub fn volume(&self) -> &VolumeInfo {
        match self {
            ExtendedBlock::Legacy { volume } | ExtendedBlock::Fat32 { volume, .. } => volume,
        }
    }

    fn boot_code_offset(&self) -> usize {
        match self {
            ExtendedBlock::Legacy { .. } => BS16_BOOT_CODE,
            ExtendedBlock::Fat32 { .. } => BS32_BOOT_CODE,
        }
    }
}

/// Field-level view of a FAT boot sector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootSector {
    pub jump: [u8; 3],
    pub oem_name: [u8; 8],
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    pub root_dir_entries: u16,
    pub total_sectors_16: u16,
    pub media_descriptor: u8,
    pub fat_length_16: u16,
    pub sectors_per_track: u16,
    pub heads: u16,
    pub hidden_sectors: u32,
    pub total_sectors_32: u32,
    pub extended: ExtendedBlock,
    /// Empty on the Atari variant.
    pub boot_code: Vec<u8>,
    pub atari: bool,
}

impl BootSector {
    /// Fill in every field from a layout. Returns the warnings raised while
    /// fitting the boot message.
    pub fn from_layout(layout: &FatLayout, meta: &VolumeMetadata) -> (Self, Vec<SerializeError>) {
        let atari = meta.is_atari_variant;
        let mut warnings = Vec::new();

        let volume = VolumeInfo {
            drive_number: layout.drive_number,
            extended_signature: !atari,
            volume_id: if atari { 0 } else { meta.volume_id },
            label: if atari { *NO_NAME_LABEL } else { meta.label },
            fs_type: *layout.fat_type.label(),
        };
        let (extended, fat_length_16) = match layout.fat_type {
            FatType::Fat32 => (
                ExtendedBlock::Fat32 {
                    fat_length: layout.fat_length_sectors,
                    flags: 0,
                    version: 0,
                    root_cluster: FAT32_ROOT_CLUSTER,
                    info_sector: FAT32_FS_INFO_SECTOR,
                    backup_boot: layout.backup_boot_sector,
                    volume,
                },
                0,
            ),
            _ => (ExtendedBlock::Legacy { volume }, layout.fat_length_sectors as u16),
        };

        let mut oem_name = meta.oem_name;
        let (jump, boot_code) = if atari {
            oem_name[..5].copy_from_slice(ATARI_OEM_PREFIX);
            oem_name[5..].copy_from_slice(&meta.volume_id.to_le_bytes()[..3]);
            (JUMP_ATARI, Vec::new())
        } else {
            let (jump, slot) = match extended {
                ExtendedBlock::Fat32 { .. } => (JUMP_FAT32, BOOT_CODE_FAT32_LEN),
                ExtendedBlock::Legacy { .. } => (JUMP_LEGACY, BOOT_CODE_LEGACY_LEN),
            };
            let message = meta.boot_message.as_deref().unwrap_or(DEFAULT_BOOT_MESSAGE);
            let code = boot_code(extended.boot_code_offset(), slot, message.as_bytes(), &mut warnings);
            (jump, code)
        };

        let (total_sectors_16, total_sectors_32) = if layout.total_sectors >= 65536 {
            (0, layout.total_sectors)
        } else {
            (layout.total_sectors as u16, 0)
        };

        let sector = Self {
            jump,
            oem_name,
            bytes_per_sector: layout.sector_size,
            sectors_per_cluster: layout.sectors_per_cluster,
            reserved_sectors: layout.reserved_sectors,
            num_fats: layout.num_fats,
            root_dir_entries: layout.root_dir_entries,
            total_sectors_16,
            media_descriptor: layout.media_descriptor,
            fat_length_16,
            sectors_per_track: layout.sectors_per_track,
            heads: layout.heads,
            hidden_sectors: layout.hidden_sectors,
            total_sectors_32,
            extended,
            boot_code,
            atari,
        };
        (sector, warnings)
    }

    pub fn to_bytes(&self) -> [u8; BOOT_SECTOR_SIZE] {
        let mut bs = [0u8; BOOT_SECTOR_SIZE];
        bs[BS_JMP_BOOT..BS_JMP_BOOT + 3].copy_from_slice(&self.jump);
        bs[BS_OEM_NAME..BS_OEM_NAME + 8].copy_from_slice(&self.oem_name);
        LittleEndian::write_u16(&mut bs[BPB_BYTES_PER_SEC..], self.bytes_per_sector);
        bs[BPB_SEC_PER_CLUS] = self.sectors_per_cluster;
        LittleEndian::write_u16(&mut bs[BPB_RSVD_SEC_CNT..], self.reserved_sectors);
        bs[BPB_NUM_FATS] = self.num_fats;
        LittleEndian::write_u16(&mut bs[BPB_ROOT_ENT_CNT..], self.root_dir_entries);
        LittleEndian::write_u16(&mut bs[BPB_TOT_SEC16..], self.total_sectors_16);
        bs[BPB_MEDIA] = self.media_descriptor;
        LittleEndian::write_u16(&mut bs[BPB_FAT_SZ16..], self.fat_length_16);
        LittleEndian::write_u16(&mut bs[BPB_SEC_PER_TRK..], self.sectors_per_track);
        LittleEndian::write_u16(&mut bs[BPB_NUM_HEADS..], self.heads);
        if self.atari && matches!(self.extended, ExtendedBlock::Legacy { .. }) {
            // GEMDOS only knows a 16-bit hidden sector count
            LittleEndian::write_u16(&mut bs[BPB_HIDD_SEC..], self.hidden_sectors as u16);
        } else {
            LittleEndian::write_u32(&mut bs[BPB_HIDD_SEC..], self.hidden_sectors);
        }
        LittleEndian::write_u32(&mut bs[BPB_TOT_SEC32..], self.total_sectors_32);

        let volume_at = match &self.extended {
            ExtendedBlock::Legacy { .. } => BS16_VOLUME_INFO,
            ExtendedBlock::Fat32 {
                fat_length,
                flags,
                version,
                root_cluster,
                info_sector,
                backup_boot,
                ..
            } => {
                LittleEndian::write_u32(&mut bs[BPB_FAT_SZ32..], *fat_length);
                LittleEndian::write_u16(&mut bs[BPB_EXT_FLAGS..], *flags);
                LittleEndian::write_u16(&mut bs[BPB_FS_VER..], *version);
                LittleEndian::write_u32(&mut bs[BPB_ROOT_CLUS..], *root_cluster);
                LittleEndian::write_u16(&mut bs[BPB_FS_INFO..], *info_sector);
                LittleEndian::write_u16(&mut bs[BPB_BK_BOOT_SEC..], *backup_boot);
                BS32_VOLUME_INFO
            }
        };
        self.extended
            .volume()
            .write(&mut bs[volume_at..volume_at + VOLUME_INFO_LEN]);

        if !self.atari {
            let code_at = self.extended.boot_code_offset();
            let len = self.boot_code.len().min(BOOT_SIGNATURE_OFFSET - code_at);
            bs[code_at..code_at + len].copy_from_slice(&self.boot_code[..len]);
            bs[BOOT_SIGNATURE_OFFSET..].copy_from_slice(&BOOT_SIGNATURE);
        }
        bs
    }

    /// Decode a boot sector written by this crate or any other FAT tool.
    pub fn parse(bytes: &[u8]) -> Result<Self, SerializeError> {
        if bytes.len() < BOOT_SECTOR_SIZE {
            return Err(SerializeError::InvalidBootSector(format!(
                "{} bytes, a boot sector has {}",
                bytes.len(),
                BOOT_SECTOR_SIZE
            )));
        }
        let atari = bytes[0] == JUMP_ATARI[0] && bytes[1] == JUMP_ATARI[1];
        if !atari && bytes[BOOT_SIGNATURE_OFFSET..BOOT_SECTOR_SIZE] != BOOT_SIGNATURE {
            return Err(SerializeError::InvalidBootSector("missing 0x55AA signature".into()));
        }

        let bytes_per_sector = LittleEndian::read_u16(&bytes[BPB_BYTES_PER_SEC..]);
        if !bytes_per_sector.is_power_of_two() || bytes_per_sector < 512 {
            return Err(SerializeError::InvalidBootSector(format!(
                "{} bytes per sector",
                bytes_per_sector
            )));
        }
        let sectors_per_cluster = bytes[BPB_SEC_PER_CLUS];
        if !sectors_per_cluster.is_power_of_two() {
            return Err(SerializeError::InvalidBootSector(format!(
                "{} sectors per cluster",
                sectors_per_cluster
            )));
        }
        let reserved_sectors = LittleEndian::read_u16(&bytes[BPB_RSVD_SEC_CNT..]);
        let num_fats = bytes[BPB_NUM_FATS];
        if reserved_sectors == 0 || num_fats == 0 {
            return Err(SerializeError::InvalidBootSector(format!(
                "{} reserved sectors and {} FATs",
                reserved_sectors, num_fats
            )));
        }

        let root_dir_entries = LittleEndian::read_u16(&bytes[BPB_ROOT_ENT_CNT..]);
        let fat_length_16 = LittleEndian::read_u16(&bytes[BPB_FAT_SZ16..]);
        let extended = if root_dir_entries == 0 && fat_length_16 == 0 {
            ExtendedBlock::Fat32 {
                fat_length: LittleEndian::read_u32(&bytes[BPB_FAT_SZ32..]),
                flags: LittleEndian::read_u16(&bytes[BPB_EXT_FLAGS..]),
                version: LittleEndian::read_u16(&bytes[BPB_FS_VER..]),
                root_cluster: LittleEndian::read_u32(&bytes[BPB_ROOT_CLUS..]),
                info_sector: LittleEndian::read_u16(&bytes[BPB_FS_INFO..]),
                backup_boot: LittleEndian::read_u16(&bytes[BPB_BK_BOOT_SEC..]),
                volume: VolumeInfo::read(&bytes[BS32_VOLUME_INFO..BS32_VOLUME_INFO + VOLUME_INFO_LEN]),
            }
        } else {
            ExtendedBlock::Legacy {
                volume: VolumeInfo::read(&bytes[BS16_VOLUME_INFO..BS16_VOLUME_INFO + VOLUME_INFO_LEN]),
            }
        };

        let hidden_sectors = if atari && matches!(extended, ExtendedBlock::Legacy { .. }) {
            LittleEndian::read_u16(&bytes[BPB_HIDD_SEC..]) as u32
        } else {
            LittleEndian::read_u32(&bytes[BPB_HIDD_SEC..])
        };
        let boot_code = if atari {
            Vec::new()
        } else {
            bytes[extended.boot_code_offset()..BOOT_SIGNATURE_OFFSET].to_vec()
        };

        let mut jump = [0u8; 3];
        jump.copy_from_slice(&bytes[BS_JMP_BOOT..BS_JMP_BOOT + 3]);
        let mut oem_name = [0u8; 8];
        oem_name.copy_from_slice(&bytes[BS_OEM_NAME..BS_OEM_NAME + 8]);

        Ok(Self {
            jump,
            oem_name,
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            num_fats,
            root_dir_entries,
            total_sectors_16: LittleEndian::read_u16(&bytes[BPB_TOT_SEC16..]),
            media_descriptor: bytes[BPB_MEDIA],
            fat_length_16,
            sectors_per_track: LittleEndian::read_u16(&bytes[BPB_SEC_PER_TRK..]),
            heads: LittleEndian::read_u16(&bytes[BPB_NUM_HEADS..]),
            hidden_sectors,
            total_sectors_32: LittleEndian::read_u32(&bytes[BPB_TOT_SEC32..]),
            extended,
            boot_code,
            atari,
        })
    }

    pub fn total_sectors(&self) -> u32 {
        if self.total_sectors_16 != 0 {
            self.total_sectors_16 as u32
        } else {
            self.total_sectors_32
        }
    }

    pub fn fat_length(&self) -> u32 {
        match &self.extended {
            ExtendedBlock::Fat32 { fat_length, .. } => *fat_length,
            ExtendedBlock::Legacy { .. } => self.fat_length_16 as u32,
        }
    }

    /// Recover the volume geometry described by this boot sector.
    pub fn layout(&self) -> Result<FatLayout, SerializeError> {
        let total = self.total_sectors();
        let sector_size = self.bytes_per_sector as u32;
        let spc = self.sectors_per_cluster as u32;
        let root_dir_sectors = (self.root_dir_entries as u32 * DIR_ENTRY_SIZE as u32).div_ceil(sector_size);
        let data_start = self.reserved_sectors as u64
            + self.num_fats as u64 * self.fat_length() as u64
            + root_dir_sectors as u64;
        if data_start >= total as u64 {
            return Err(SerializeError::InvalidBootSector(format!(
                "metadata ends at sector {} of {}",
                data_start, total
            )));
        }
        let cluster_count = ((total as u64 - data_start) / spc as u64) as u32;

        let (fat_type, backup_boot_sector) = match &self.extended {
            ExtendedBlock::Fat32 { backup_boot, .. } => (FatType::Fat32, *backup_boot),
            ExtendedBlock::Legacy { .. } => {
                let by_count = FatType::for_cluster_count(cluster_count);
                let fat_type = if by_count == FatType::Fat32 { FatType::Fat16 } else { by_count };
                (fat_type, 0)
            }
        };

        Ok(FatLayout {
            fat_type,
            sector_size: self.bytes_per_sector,
            sectors_per_cluster: self.sectors_per_cluster,
            reserved_sectors: self.reserved_sectors,
            num_fats: self.num_fats,
            root_dir_entries: self.root_dir_entries,
            fat_length_sectors: self.fat_length(),
            cluster_count,
            total_sectors: total,
            backup_boot_sector,
            alignment_enabled: spc > 1 && data_start % spc as u64 == 0,
            media_descriptor: self.media_descriptor,
            sectors_per_track: self.sectors_per_track,
            heads: self.heads,
            hidden_sectors: self.hidden_sectors,
            drive_number: self.extended.volume().drive_number,
        })
    }
}

impl FatLayout {
    /// Parse the geometry back out of an on-disk boot sector.
    pub fn from_boot_sector(bytes: &[u8]) -> Result<FatLayout, SerializeError> {
        BootSector::parse(bytes)?.layout()
    }
}

/// Stub plus message, padded to `slot` bytes. The message pointer in the
/// stub is patched for where the code block sits in the sector.
fn boot_code(code_offset: usize, slot: usize, message: &[u8], warnings: &mut Vec<SerializeError>) -> Vec<u8> {
    let mut code = vec![0u8; slot];
    code[..MESSAGE_OFFSET].copy_from_slice(&BOOT_STUB);
    let pointer = (BOOT_LOAD_ADDRESS + code_offset + MESSAGE_OFFSET) as u16;
    LittleEndian::write_u16(&mut code[MESSAGE_POINTER..], pointer);

    // Keep one byte for the terminating NUL
    let room = slot - MESSAGE_OFFSET - 1;
    let len = if message.len() > room {
        warn!("Boot message of {} bytes truncated to {}", message.len(), room);
        warnings.push(SerializeError::MessageTooLong {
            length: message.len(),
            slot: room,
        });
        room
    } else {
        message.len()
    };
    code[MESSAGE_OFFSET..MESSAGE_OFFSET + len].copy_from_slice(&message[..len]);
    code
}

fn fsinfo_sector(layout: &FatLayout) -> Vec<u8> {
    let mut info = vec![0u8; layout.sector_size as usize];
    info[..4].copy_from_slice(FSINFO_LEAD_SIG);
    LittleEndian::write_u32(&mut info[FSINFO_STRUCT_OFFSET + 4..], FSINFO_STRUC_SIG);
    // Cluster 2 already belongs to the root directory
    LittleEndian::write_u32(&mut info[FSINFO_FREE_COUNT..], layout.cluster_count - 1);
    LittleEndian::write_u32(&mut info[FSINFO_NEXT_FREE..], FAT32_ROOT_CLUSTER);
    info[BOOT_SIGNATURE_OFFSET..BOOT_SECTOR_SIZE].copy_from_slice(&BOOT_SIGNATURE);
    info
}

/// Everything that goes on disk before the data area.
#[derive(Debug, Clone)]
pub struct BootImage {
    pub boot_sector: [u8; BOOT_SECTOR_SIZE],
    pub fsinfo_sector: Option<Vec<u8>>,
    pub initial_fat: FatTable,
    pub root_dir_bytes: Vec<u8>,
    /// Non-fatal problems, currently only a truncated boot message.
    pub warnings: Vec<SerializeError>,
}

impl BootImage {
    pub fn initial_fat_bytes(&self) -> &[u8] {
        self.initial_fat.bytes()
    }
}

/// Serialize a layout with a first-sector-only FAT.
pub fn serialize(layout: &FatLayout, meta: &VolumeMetadata) -> Result<BootImage, SerializeError> {
    serialize_with(layout, meta, false)
}

/// Serialize a layout. `whole_fat` keeps the entire FAT in memory so the
/// bad-sector scan can mark any cluster.
pub fn serialize_with(
    layout: &FatLayout,
    meta: &VolumeMetadata,
    whole_fat: bool,
) -> Result<BootImage, SerializeError> {
    let (sector, warnings) = BootSector::from_layout(layout, meta);
    let boot_sector = sector.to_bytes();
    let fsinfo_sector = match layout.fat_type {
        FatType::Fat32 => Some(fsinfo_sector(layout)),
        _ => None,
    };
    let initial_fat = FatTable::new(layout, whole_fat, meta.is_atari_variant)?;
    let root_dir_bytes = build_root_dir(layout, &meta.label, &meta.creation_time);

    debug!(
        "Serialized {:?} boot image: {} FAT bytes, {} root directory bytes",
        layout.fat_type,
        initial_fat.bytes().len(),
        root_dir_bytes.len()
    );
    Ok(BootImage {
        boot_sector,
        fsinfo_sector,
        initial_fat,
        root_dir_bytes,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fat::geometry::{plan, PlanRequest};
    use chrono::NaiveDate;

    fn meta() -> VolumeMetadata {
        let created = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(3, 4, 6)
            .unwrap();
        VolumeMetadata::new(0xDEAD_BEEF, created).with_label("boot").unwrap()
    }

    fn default_plan(size: u64) -> FatLayout {
        plan(size, 512, None, None, 2, None, true).unwrap()
    }

    #[test]
    fn layouts_survive_a_boot_sector_round_trip() {
        for size in [1u64 << 20, 16 << 20, 200 << 20, 2 << 30, 32 << 30, 1 << 40] {
            let layout = default_plan(size);
            let image = serialize(&layout, &meta()).unwrap();
            let parsed = FatLayout::from_boot_sector(&image.boot_sector).unwrap();

            assert_eq!(parsed.fat_type, layout.fat_type, "size {}", size);
            assert_eq!(parsed.sectors_per_cluster, layout.sectors_per_cluster);
            assert_eq!(parsed.reserved_sectors, layout.reserved_sectors);
            assert_eq!(parsed.fat_length_sectors, layout.fat_length_sectors);
            assert_eq!(parsed.cluster_count, layout.cluster_count, "size {}", size);
        }
    }

    #[test]
    fn floppy_boot_sector_matches_reference_bytes() {
        let layout = default_plan(1_474_560);
        let image = serialize(&layout, &meta()).unwrap();
        let bs = &image.boot_sector;

        assert_eq!(&bs[0..3], &JUMP_LEGACY);
        assert_eq!(&bs[3..11], b"mkfs.fat");
        assert_eq!(&bs[11..13], &[0x00, 0x02]);
        assert_eq!(bs[13], 1);
        assert_eq!(&bs[14..16], &[1, 0]);
        assert_eq!(bs[16], 2);
        assert_eq!(&bs[17..19], &[224, 0]);
        assert_eq!(&bs[19..21], &2880u16.to_le_bytes());
        assert_eq!(bs[21], 0xF0);
        assert_eq!(&bs[22..24], &[9, 0]);
        assert_eq!(&bs[24..26], &[18, 0]);
        assert_eq!(&bs[26..28], &[2, 0]);
        assert_eq!(&bs[32..36], &[0, 0, 0, 0]);
        assert_eq!(bs[36], 0x00);
        assert_eq!(bs[38], 0x29);
        assert_eq!(&bs[39..43], &0xDEAD_BEEFu32.to_le_bytes());
        assert_eq!(&bs[43..54], b"BOOT       ");
        assert_eq!(&bs[54..62], b"FAT12   ");
        assert_eq!(&bs[62..65], &[0x0E, 0x1F, 0xBE]);
        assert_eq!(&bs[65..67], &[0x5B, 0x7C]);
        assert_eq!(&bs[62 + 29..62 + 33], b"This");
        assert_eq!(&bs[510..512], &[0x55, 0xAA]);
        assert!(image.fsinfo_sector.is_none());
        assert!(image.warnings.is_empty());
    }

    #[test]
    fn fat32_boot_sector_carries_the_extended_block() {
        let layout = plan(8_000_000_000, 512, Some(32), None, 2, None, true).unwrap();
        let image = serialize(&layout, &meta()).unwrap();
        let bs = &image.boot_sector;

        assert_eq!(&bs[0..3], &JUMP_FAT32);
        assert_eq!(&bs[17..19], &[0, 0]);
        assert_eq!(&bs[19..21], &[0, 0]);
        assert_eq!(&bs[22..24], &[0, 0]);
        assert_eq!(LittleEndian::read_u32(&bs[32..]), layout.total_sectors);
        assert_eq!(LittleEndian::read_u32(&bs[36..]), layout.fat_length_sectors);
        assert_eq!(LittleEndian::read_u32(&bs[44..]), 2);
        assert_eq!(LittleEndian::read_u16(&bs[48..]), 1);
        assert_eq!(LittleEndian::read_u16(&bs[50..]), 6);
        assert_eq!(bs[0x40], 0x80);
        assert_eq!(bs[0x42], 0x29);
        assert_eq!(&bs[0x52..0x5A], b"FAT32   ");
        // Message pointer moved with the code block
        assert_eq!(&bs[0x5A + 3..0x5A + 5], &[0x77, 0x7C]);
        assert_eq!(&bs[510..512], &[0x55, 0xAA]);

        let info = image.fsinfo_sector.unwrap();
        assert_eq!(&info[..4], b"RRaA");
        assert_eq!(LittleEndian::read_u32(&info[0x1E4..]), 0x6141_7272);
        assert_eq!(LittleEndian::read_u32(&info[0x1E8..]), layout.cluster_count - 1);
        assert_eq!(LittleEndian::read_u32(&info[0x1EC..]), 2);
        assert_eq!(&info[0x1FE..0x200], &[0x55, 0xAA]);

        assert_eq!(image.root_dir_bytes.len(), layout.bytes_per_cluster() as usize);
        assert_eq!(image.initial_fat.get(2).unwrap(), FAT_EOF);
    }

    #[test]
    fn small_and_large_total_sector_fields_are_exclusive() {
        let small = serialize(&default_plan(16 << 20), &meta()).unwrap();
        assert_eq!(LittleEndian::read_u16(&small.boot_sector[19..]), 32768);
        assert_eq!(LittleEndian::read_u32(&small.boot_sector[32..]), 0);

        let large = serialize(&default_plan(200 << 20), &meta()).unwrap();
        assert_eq!(LittleEndian::read_u16(&large.boot_sector[19..]), 0);
        assert_eq!(LittleEndian::read_u32(&large.boot_sector[32..]), 409600);
    }

    #[test]
    fn labels_are_upper_cased_and_bounded() {
        assert_eq!(encode_label("usb").unwrap(), *b"USB        ");
        assert_eq!(encode_label("").unwrap(), *NO_NAME_LABEL);
        assert_eq!(encode_label("twelve chars"), Err(SerializeError::LabelTooLong(12)));
    }

    #[test]
    fn oversized_boot_message_is_truncated_with_a_warning() {
        let layout = plan(2 << 30, 512, Some(32), None, 2, None, true).unwrap();
        let mut meta = meta();
        meta.boot_message = Some("x".repeat(500));

        let image = serialize(&layout, &meta).unwrap();
        let room = BOOT_CODE_FAT32_LEN - MESSAGE_OFFSET - 1;
        assert_eq!(
            image.warnings,
            vec![SerializeError::MessageTooLong { length: 500, slot: room }]
        );
        assert_eq!(image.boot_sector[0x5A + MESSAGE_OFFSET + room - 1], b'x');
        assert_eq!(image.boot_sector[0x5A + MESSAGE_OFFSET + room], 0);
        assert_eq!(&image.boot_sector[510..512], &[0x55, 0xAA]);
    }

    #[test]
    fn atari_variant_drops_pc_specific_fields() {
        let mut request = PlanRequest::new(1_474_560, 512);
        request.atari = true;
        request.hidden_sectors = 0x1234;
        let layout = request.plan().unwrap();
        let mut meta = meta();
        meta.is_atari_variant = true;

        let image = serialize(&layout, &meta).unwrap();
        let bs = &image.boot_sector;
        assert_eq!(&bs[0..3], &[0x60, 0x1C, b'm']);
        assert_eq!(&bs[3..8], b"kdosf");
        assert_eq!(&bs[8..11], &[0xEF, 0xBE, 0xAD]);
        assert_eq!(&bs[0x1C..0x20], &[0x34, 0x12, 0, 0]);
        assert_eq!(bs[38], 0);
        assert_eq!(&bs[39..54], &[0u8; 15]);
        assert_eq!(&bs[54..62], b"FAT12   ");
        assert!(bs[62..].iter().all(|b| *b == 0));

        let parsed = BootSector::parse(bs).unwrap();
        assert!(parsed.atari);
        assert_eq!(parsed.hidden_sectors, 0x1234);
        assert_eq!(parsed.layout().unwrap().cluster_count, layout.cluster_count);
    }

    #[test]
    fn invariant_mode_is_reproducible() {
        let options = FatOptions {
            invariant: true,
            label: Some("same".into()),
            ..FatOptions::default()
        };
        let first = VolumeMetadata::from_options(&options).unwrap();
        let second = VolumeMetadata::from_options(&options).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.volume_id, 0x1234_ABCD);
        assert_eq!(first.creation_time.and_utc().timestamp(), 1_426_325_213);

        let layout = default_plan(16 << 20);
        assert_eq!(
            serialize(&layout, &first).unwrap().boot_sector,
            serialize(&layout, &second).unwrap().boot_sector
        );
    }

    #[test]
    fn garbage_is_not_a_boot_sector() {
        assert!(matches!(
            BootSector::parse(&[0u8; 512]),
            Err(SerializeError::InvalidBootSector(_))
        ));
        assert!(BootSector::parse(&[0u8; 100]).is_err());

        let mut bs = serialize(&default_plan(16 << 20), &meta()).unwrap().boot_sector;
        bs[BPB_SEC_PER_CLUS] = 3;
        assert!(BootSector::parse(&bs).is_err());
    }
}
