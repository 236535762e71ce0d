// Native FAT12/16/32 support: planner, serializer, scanner and writer

pub mod badblocks;
pub mod boot_sector;
pub mod constants;
pub mod fat_table;
pub mod formatter;
pub mod geometry;
pub mod layout;
pub mod root_dir;
pub mod writer;

pub use badblocks::{scan_bad_sectors, ScanReport};
pub use boot_sector::{
    encode_label, serialize, serialize_with, BootImage, BootSector, ExtendedBlock, VolumeInfo,
    VolumeMetadata,
};
pub use fat_table::FatTable;
pub use formatter::FatFormatter;
pub use geometry::{plan, PlanRequest};
pub use layout::{FatLayout, FatType};
pub use writer::write_tables;
