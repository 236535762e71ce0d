// The validated geometry of one FAT volume

use super::constants::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

impl FatType {
    pub fn bits(&self) -> u8 {
        match self {
            FatType::Fat12 => 12,
            FatType::Fat16 => 16,
            FatType::Fat32 => 32,
        }
    }

    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            12 => Some(FatType::Fat12),
            16 => Some(FatType::Fat16),
            32 => Some(FatType::Fat32),
            _ => None,
        }
    }

    /// Width implied by a cluster count, the way every FAT driver decides it.
    pub fn for_cluster_count(clusters: u32) -> Self {
        if clusters < FAT16_MIN_CLUSTERS {
            FatType::Fat12
        } else if clusters < FAT32_MIN_CLUSTERS {
            FatType::Fat16
        } else {
            FatType::Fat32
        }
    }

    /// Filesystem type string stored in the boot sector.
    pub fn label(&self) -> &'static [u8; 8] {
        match self {
            FatType::Fat12 => b"FAT12   ",
            FatType::Fat16 => b"FAT16   ",
            FatType::Fat32 => b"FAT32   ",
        }
    }
}

/// Planner output. Every instance returned by the planner satisfies
/// [`FatLayout::check_invariants`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FatLayout {
    pub fat_type: FatType,
    pub sector_size: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    pub root_dir_entries: u16,
    pub fat_length_sectors: u32,
    pub cluster_count: u32,
    pub total_sectors: u32,
    pub backup_boot_sector: u16,
    pub alignment_enabled: bool,
    pub media_descriptor: u8,
    pub sectors_per_track: u16,
    pub heads: u16,
    pub hidden_sectors: u32,
    pub drive_number: u8,
}

impl FatLayout {
    pub fn fat_bits(&self) -> u8 {
        self.fat_type.bits()
    }

    pub fn root_dir_sectors(&self) -> u32 {
        let bytes = self.root_dir_entries as u32 * DIR_ENTRY_SIZE as u32;
        bytes.div_ceil(self.sector_size as u32)
    }

    pub fn fat_start_sector(&self) -> u32 {
        self.reserved_sectors as u32
    }

    pub fn root_dir_start_sector(&self) -> u32 {
        self.fat_start_sector() + self.num_fats as u32 * self.fat_length_sectors
    }

    pub fn data_start_sector(&self) -> u32 {
        self.root_dir_start_sector() + self.root_dir_sectors()
    }

    pub fn bytes_per_cluster(&self) -> u32 {
        self.sectors_per_cluster as u32 * self.sector_size as u32
    }

    /// Number of FAT entries in use, including the two reserved ones.
    pub fn fat_entries(&self) -> u32 {
        self.cluster_count + 2
    }

    pub fn fat_bytes(&self) -> u64 {
        self.fat_length_sectors as u64 * self.sector_size as u64
    }

    /// Bytes occupied by the fixed root directory, or one cluster on FAT32.
    pub fn root_dir_bytes(&self) -> usize {
        match self.fat_type {
            FatType::Fat32 => self.bytes_per_cluster() as usize,
            _ => self.root_dir_entries as usize * DIR_ENTRY_SIZE,
        }
    }

    pub fn check_invariants(&self) -> Result<(), String> {
        let clusters = self.cluster_count;
        match self.fat_type {
            FatType::Fat12 if clusters > FAT12_MAX_CLUSTERS => {
                return Err(format!("{} clusters is too many for FAT12", clusters));
            }
            FatType::Fat16 if !(FAT16_MIN_CLUSTERS..=FAT16_MAX_CLUSTERS).contains(&clusters) => {
                return Err(format!("{} clusters is outside the FAT16 range", clusters));
            }
            FatType::Fat32 if !(FAT32_MIN_CLUSTERS..=FAT32_MAX_CLUSTERS).contains(&clusters) => {
                return Err(format!("{} clusters is outside the FAT32 range", clusters));
            }
            _ => {}
        }

        let addressable =
            self.fat_bytes() * 8 / self.fat_bits() as u64;
        if addressable < self.fat_entries() as u64 {
            return Err(format!(
                "FAT of {} sectors addresses {} entries, {} needed",
                self.fat_length_sectors,
                addressable,
                self.fat_entries()
            ));
        }

        let min_reserved = if self.fat_type == FatType::Fat32 {
            FAT32_RESERVED_SECTORS
        } else {
            1
        };
        if self.reserved_sectors < min_reserved {
            return Err(format!("{} reserved sectors, need {}", self.reserved_sectors, min_reserved));
        }

        if (self.root_dir_entries == 0) != (self.fat_type == FatType::Fat32) {
            return Err(format!(
                "{} root directory entries on {:?}",
                self.root_dir_entries, self.fat_type
            ));
        }

        let occupied = self.data_start_sector() as u64
            + clusters as u64 * self.sectors_per_cluster as u64;
        if occupied > self.total_sectors as u64 {
            return Err(format!(
                "layout occupies {} sectors of {}",
                occupied, self.total_sectors
            ));
        }
        Ok(())
    }
}
