use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Cursor, Read, Seek, Write};
use std::path::{Path, PathBuf};

/// A disk as shown by device enumeration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub device_type: DeviceType,
    pub mount_points: Vec<PathBuf>,
    pub is_removable: bool,
    pub is_system: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceType {
    HardDisk,
    SSD,
    USB,
    SDCard,
    Virtual,
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceKind {
    File,
    BlockDevice,
    Unusable,
}

/// What the inspector learned about a path. Produced once per run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceInfo {
    pub kind: DeviceKind,
    pub size_bytes: u64,
    /// Logical sector size, 0 when the device does not report one.
    pub sector_size: u32,
    pub geometry_heads: Option<u32>,
    pub geometry_sectors: Option<u32>,
    pub partition_start_sector: Option<u32>,
}

impl DeviceInfo {
    pub fn file(size_bytes: u64) -> Self {
        Self {
            kind: DeviceKind::File,
            size_bytes,
            sector_size: 0,
            geometry_heads: None,
            geometry_sectors: None,
            partition_start_sector: None,
        }
    }

    pub fn unusable() -> Self {
        Self {
            kind: DeviceKind::Unusable,
            size_bytes: 0,
            sector_size: 0,
            geometry_heads: None,
            geometry_sectors: None,
            partition_start_sector: None,
        }
    }

    pub fn is_usable(&self) -> bool {
        self.kind != DeviceKind::Unusable && self.size_bytes > 0
    }
}

pub trait DeviceInspector: Send + Sync {
    fn inspect_device(&self, path: &Path) -> Result<DeviceInfo, crate::BootforgeError>;
}

/// Random-access handle to a device or image.
pub trait BlockIo: Read + Write + Seek + Send {
    /// Flush written data all the way to the medium.
    fn sync_device(&mut self) -> std::io::Result<()>;
}

impl BlockIo for File {
    fn sync_device(&mut self) -> std::io::Result<()> {
        self.flush()?;
        self.sync_all()
    }
}

impl BlockIo for Cursor<Vec<u8>> {
    fn sync_device(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[async_trait::async_trait]
pub trait DeviceManager: Send + Sync {
    async fn enumerate_devices(&self) -> Result<Vec<Device>, crate::BootforgeError>;
    async fn get_device_by_id(&self, device_id: &str) -> Result<Option<Device>, crate::BootforgeError>;
    async fn is_safe_to_format(&self, device: &Device) -> Result<bool, crate::BootforgeError>;
}
