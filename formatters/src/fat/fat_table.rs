// In-memory FAT with width-aware entry packing

use super::constants::*;
use super::layout::{FatLayout, FatType};
use bootforge_core::SerializeError;

/// The first FAT, as written to every FAT copy. Holds either the first
/// sector only or, when bad sectors have to be marked, the whole table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatTable {
    fat_type: FatType,
    entries: u32,
    bytes: Vec<u8>,
}

impl FatTable {
    /// Seed a table with the reserved entries. `whole` allocates the full
    /// FAT so any cluster can be marked later.
    pub fn new(layout: &FatLayout, whole: bool, atari: bool) -> Result<Self, SerializeError> {
        let len = if whole {
            layout.fat_bytes() as usize
        } else {
            (layout.sector_size as usize).min(layout.fat_bytes() as usize)
        };
        let mut table = Self {
            fat_type: layout.fat_type,
            entries: layout.fat_entries(),
            bytes: vec![0u8; len],
        };

        table.set(0, 0xFFFF_FFFF)?;
        table.set(1, 0xFFFF_FFFF)?;
        table.bytes[0] = layout.media_descriptor;
        if layout.fat_type == FatType::Fat32 {
            // Cluster 2 holds the root directory
            table.set(FAT32_ROOT_CLUSTER, if atari { FAT_EOF_ATARI } else { FAT_EOF })?;
        }
        Ok(table)
    }

    pub fn fat_type(&self) -> FatType {
        self.fat_type
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn check(&self, cluster: u32) -> Result<usize, SerializeError> {
        let offset = match self.fat_type {
            FatType::Fat12 => cluster as usize * 3 / 2,
            FatType::Fat16 => cluster as usize * 2,
            FatType::Fat32 => cluster as usize * 4,
        };
        let width = if self.fat_type == FatType::Fat32 { 4 } else { 2 };
        if cluster >= self.entries || offset + width > self.bytes.len() {
            return Err(SerializeError::ClusterOutOfRange {
                cluster,
                limit: self.entries,
            });
        }
        Ok(offset)
    }

    /// Store `value` (truncated to the entry width) for `cluster`.
    pub fn set(&mut self, cluster: u32, value: u32) -> Result<(), SerializeError> {
        let offset = self.check(cluster)?;
        let b = &mut self.bytes;
        match self.fat_type {
            FatType::Fat12 => {
                let value = value & 0xFFF;
                if cluster & 1 == 0 {
                    b[offset] = (value & 0xFF) as u8;
                    b[offset + 1] = (b[offset + 1] & 0xF0) | ((value >> 8) & 0x0F) as u8;
                } else {
                    b[offset] = (b[offset] & 0x0F) | ((value & 0x0F) << 4) as u8;
                    b[offset + 1] = ((value >> 4) & 0xFF) as u8;
                }
            }
            FatType::Fat16 => {
                b[offset..offset + 2].copy_from_slice(&(value as u16).to_le_bytes());
            }
            FatType::Fat32 => {
                // Top four bits are reserved and keep whatever is there
                let old = u32::from_le_bytes([b[offset], b[offset + 1], b[offset + 2], b[offset + 3]]);
                let new = (old & !FAT32_ENTRY_MASK) | (value & FAT32_ENTRY_MASK);
                b[offset..offset + 4].copy_from_slice(&new.to_le_bytes());
            }
        }
        Ok(())
    }

    pub fn get(&self, cluster: u32) -> Result<u32, SerializeError> {
        let offset = self.check(cluster)?;
        let b = &self.bytes;
        Ok(match self.fat_type {
            FatType::Fat12 => {
                let pair = u16::from_le_bytes([b[offset], b[offset + 1]]) as u32;
                if cluster & 1 == 0 {
                    pair & 0xFFF
                } else {
                    pair >> 4
                }
            }
            FatType::Fat16 => u16::from_le_bytes([b[offset], b[offset + 1]]) as u32,
            FatType::Fat32 => {
                u32::from_le_bytes([b[offset], b[offset + 1], b[offset + 2], b[offset + 3]])
                    & FAT32_ENTRY_MASK
            }
        })
    }

    pub fn mark_bad(&mut self, cluster: u32) -> Result<(), SerializeError> {
        self.set(cluster, FAT_BAD)
    }

    pub fn is_bad(&self, cluster: u32) -> Result<bool, SerializeError> {
        let mask = match self.fat_type {
            FatType::Fat12 => 0xFFF,
            FatType::Fat16 => 0xFFFF,
            FatType::Fat32 => FAT32_ENTRY_MASK,
        };
        Ok(self.get(cluster)? == FAT_BAD & mask)
    }
}
