// On-disk constants shared by the FAT planner, serializer and writer

// Boot sector offsets
pub const BS_JMP_BOOT: usize = 0x00;
pub const BS_OEM_NAME: usize = 0x03;
pub const BPB_BYTES_PER_SEC: usize = 0x0B;
pub const BPB_SEC_PER_CLUS: usize = 0x0D;
pub const BPB_RSVD_SEC_CNT: usize = 0x0E;
pub const BPB_NUM_FATS: usize = 0x10;
pub const BPB_ROOT_ENT_CNT: usize = 0x11;
pub const BPB_TOT_SEC16: usize = 0x13;
pub const BPB_MEDIA: usize = 0x15;
pub const BPB_FAT_SZ16: usize = 0x16;
pub const BPB_SEC_PER_TRK: usize = 0x18;
pub const BPB_NUM_HEADS: usize = 0x1A;
pub const BPB_HIDD_SEC: usize = 0x1C;
pub const BPB_TOT_SEC32: usize = 0x20;

// FAT12/16 extended block (starts at 36)
pub const BS16_VOLUME_INFO: usize = 0x24;
pub const BS16_BOOT_CODE: usize = 0x3E;

// FAT32 extended block (starts at 36)
pub const BPB_FAT_SZ32: usize = 0x24;
pub const BPB_EXT_FLAGS: usize = 0x28;
pub const BPB_FS_VER: usize = 0x2A;
pub const BPB_ROOT_CLUS: usize = 0x2C;
pub const BPB_FS_INFO: usize = 0x30;
pub const BPB_BK_BOOT_SEC: usize = 0x32;
pub const BS32_VOLUME_INFO: usize = 0x40;
pub const BS32_BOOT_CODE: usize = 0x5A;

// Offsets inside the volume info block, relative to its start
pub const VI_DRV_NUM: usize = 0x00;
pub const VI_BOOT_SIG: usize = 0x02;
pub const VI_VOL_ID: usize = 0x03;
pub const VI_VOL_LAB: usize = 0x07;
pub const VI_FIL_SYS_TYPE: usize = 0x12;
pub const VOLUME_INFO_LEN: usize = 0x1A;

pub const BOOT_SECTOR_SIZE: usize = 512;
pub const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];
pub const BOOT_SIGNATURE_OFFSET: usize = 0x1FE;
pub const EXTENDED_BOOT_SIGNATURE: u8 = 0x29;

// FSInfo sector
pub const FSINFO_LEAD_SIG: &[u8; 4] = b"RRaA";
pub const FSINFO_STRUCT_OFFSET: usize = 0x1E0;
pub const FSINFO_STRUC_SIG: u32 = 0x6141_7272;
pub const FSINFO_FREE_COUNT: usize = 0x1E8;
pub const FSINFO_NEXT_FREE: usize = 0x1EC;

// FAT entry values, truncated to the entry width when written
pub const FAT_EOF: u32 = 0x0FFF_FFF8;
pub const FAT_EOF_ATARI: u32 = 0x0FFF_FFFF;
pub const FAT_BAD: u32 = 0x0FFF_FFF7;
pub const FAT32_ENTRY_MASK: u32 = 0x0FFF_FFFF;

// Cluster count thresholds
pub const FAT12_MAX_CLUSTERS: u32 = 4084;
pub const FAT16_MIN_CLUSTERS: u32 = 4085;
pub const FAT16_MAX_CLUSTERS: u32 = 65524;
pub const FAT32_MIN_CLUSTERS: u32 = 65525;
pub const FAT32_MAX_CLUSTERS: u32 = 0x0FFF_FFF5;

// Planner defaults
pub const DEFAULT_SECTORS_PER_CLUSTER: u32 = 4;
pub const MAX_SECTORS_PER_CLUSTER: u32 = 128;
pub const DEFAULT_ROOT_ENTRIES: u16 = 512;
pub const DEFAULT_SECTORS_PER_TRACK: u16 = 63;
pub const DEFAULT_HEADS: u16 = 255;
pub const FAT32_RESERVED_SECTORS: u16 = 32;
pub const FAT32_ROOT_CLUSTER: u32 = 2;
pub const FAT32_FS_INFO_SECTOR: u16 = 1;
pub const FAT32_BACKUP_BOOT_SECTOR: u16 = 6;
pub const AUTO_FAT32_THRESHOLD: u64 = 512 * 1024 * 1024;
pub const ALIGNMENT_MIN_SECTORS: u64 = 8192;
pub const MIN_DATA_BYTES: u64 = 32 * 1024;
pub const MAX_CLUSTER_BYTES: u64 = 64 * 1024;

// GEMDOS limits for the Atari variant
pub const ATARI_FLOPPY_SECTORS: [u64; 4] = [1440, 2400, 2880, 5760];
pub const ATARI_SECTORS_PER_CLUSTER: u32 = 2;
pub const GEMDOS_MAX_SECTORS: u64 = 65531;
pub const OLD_GEMDOS_MAX_SECTORS: u64 = 32765;
pub const GEMDOS_MAX_SECTOR_SIZE: u64 = 16 * 1024;

// Media descriptors
pub const MEDIA_FIXED: u8 = 0xF8;
pub const DRIVE_NUMBER_FIXED: u8 = 0x80;
pub const DRIVE_NUMBER_FLOPPY: u8 = 0x00;

// Directory entries
pub const DIR_ENTRY_SIZE: usize = 32;
pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const NO_NAME_LABEL: &[u8; 11] = b"NO NAME    ";
