use crate::BootforgeError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemKind {
    Fat,
    Ntfs,
}

impl FilesystemKind {
    /// Filesystem type string passed to mount(2).
    pub fn mount_type(&self) -> &'static str {
        match self {
            FilesystemKind::Fat => "vfat",
            FilesystemKind::Ntfs => "ntfs",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PartitionTableKind {
    Mbr,
    Gpt,
}

impl PartitionTableKind {
    pub fn supports_boot_flag(&self) -> bool {
        match self {
            PartitionTableKind::Mbr => true,
            // Legacy BIOS bootable attribute, bit 2 of the entry attributes.
            PartitionTableKind::Gpt => true,
        }
    }
}

/// Overrides for the FAT planner and serializer. `None` means "derive it".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FatOptions {
    pub fat_bits: Option<u8>,
    pub sectors_per_cluster: Option<u8>,
    pub num_fats: u8,
    pub root_dir_entries: Option<u16>,
    pub reserved_sectors: Option<u16>,
    pub backup_boot_sector: Option<u16>,
    pub hidden_sectors: Option<u32>,
    pub media_descriptor: Option<u8>,
    pub drive_number: Option<u8>,
    pub sector_size: Option<u32>,
    pub align: bool,
    pub label: Option<String>,
    pub volume_id: Option<u32>,
    pub atari: bool,
    /// Constant volume id and timestamp for reproducible images.
    pub invariant: bool,
    pub check_bad_sectors: bool,
    pub verify_after_format: bool,
    pub boot_message: Option<String>,
}

impl Default for FatOptions {
    fn default() -> Self {
        Self {
            fat_bits: None,
            sectors_per_cluster: None,
            num_fats: 2,
            root_dir_entries: None,
            reserved_sectors: None,
            backup_boot_sector: None,
            hidden_sectors: None,
            media_descriptor: None,
            drive_number: None,
            sector_size: None,
            align: true,
            label: None,
            volume_id: None,
            atari: false,
            invariant: false,
            check_bad_sectors: false,
            verify_after_format: false,
            boot_message: None,
        }
    }
}

impl FatOptions {
    pub fn validate(&self) -> Result<(), BootforgeError> {
        if let Some(bits) = self.fat_bits {
            if !matches!(bits, 12 | 16 | 32) {
                return Err(BootforgeError::InvalidInput(format!(
                    "FAT width must be 12, 16 or 32, got {}",
                    bits
                )));
            }
        }
        if let Some(spc) = self.sectors_per_cluster {
            if !spc.is_power_of_two() {
                return Err(BootforgeError::InvalidInput(format!(
                    "sectors per cluster must be a power of two, got {}",
                    spc
                )));
            }
        }
        if self.num_fats == 0 || self.num_fats > 4 {
            return Err(BootforgeError::InvalidInput(format!(
                "number of FATs must be 1 to 4, got {}",
                self.num_fats
            )));
        }
        Ok(())
    }
}

/// Scratch locations used while provisioning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkPaths {
    pub mount_dir: PathBuf,
    pub image_dir: PathBuf,
    pub device_node: PathBuf,
    pub partition_node: PathBuf,
    pub lock_file: PathBuf,
}

impl Default for WorkPaths {
    fn default() -> Self {
        Self {
            mount_dir: PathBuf::from("/tmp/bootforge_rootfs"),
            image_dir: PathBuf::from("/tmp/bootforge_image"),
            device_node: PathBuf::from("/dev/bootforge_device"),
            partition_node: PathBuf::from("/dev/bootforge_partition"),
            lock_file: PathBuf::from("/tmp/bootforge.lock"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProvisionOptions {
    pub filesystem: FilesystemKind,
    pub partition_table: PartitionTableKind,
    pub quick_format: bool,
    pub source_image: PathBuf,
    /// Filesystem of the source image, as passed to mount(2).
    pub source_fs_type: String,
    pub paths: WorkPaths,
    pub fat: FatOptions,
}

impl Default for ProvisionOptions {
    fn default() -> Self {
        Self {
            filesystem: FilesystemKind::Fat,
            partition_table: PartitionTableKind::Mbr,
            quick_format: true,
            source_image: PathBuf::new(),
            source_fs_type: "iso9660".to_string(),
            paths: WorkPaths::default(),
            fat: FatOptions::default(),
        }
    }
}

impl ProvisionOptions {
    pub fn from_json_file(path: &Path) -> Result<Self, BootforgeError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let options: ProvisionOptions = serde_json::from_str(
            r#"{ "partition_table": "gpt", "fat": { "label": "BOOT", "fat_bits": 32 } }"#,
        )
        .unwrap();

        assert_eq!(options.partition_table, PartitionTableKind::Gpt);
        assert_eq!(options.filesystem, FilesystemKind::Fat);
        assert!(options.quick_format);
        assert_eq!(options.fat.num_fats, 2);
        assert!(options.fat.align);
        assert_eq!(options.fat.fat_bits, Some(32));
        assert_eq!(options.paths, WorkPaths::default());
    }

    #[test]
    fn rejects_bogus_fat_width() {
        let options = FatOptions {
            fat_bits: Some(24),
            ..FatOptions::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn reads_options_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.json");
        std::fs::write(&path, r#"{ "quick_format": false, "source_image": "/tmp/live.iso" }"#)
            .unwrap();

        let options = ProvisionOptions::from_json_file(&path).unwrap();
        assert!(!options.quick_format);
        assert_eq!(options.source_image, PathBuf::from("/tmp/live.iso"));
    }
}
