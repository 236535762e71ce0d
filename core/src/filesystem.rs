use crate::{BlockIo, BootforgeError, DeviceInfo, FatOptions, FilesystemKind, ProgressSink};
use serde::{Deserialize, Serialize};

/// What a formatter put on the partition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FormatSummary {
    pub filesystem: FilesystemKind,
    pub fat_bits: u8,
    pub total_sectors: u32,
    pub cluster_count: u32,
    pub bytes_per_cluster: u32,
    pub bad_sectors: u32,
    pub volume_id: u32,
    pub warnings: Vec<String>,
}

pub trait PartitionFormatter: Send + Sync {
    fn name(&self) -> &'static str;
    fn filesystem(&self) -> FilesystemKind;

    /// Lay a fresh filesystem onto `device`, whose size and sector size
    /// come from `info`.
    fn format(
        &self,
        device: &mut dyn BlockIo,
        info: &DeviceInfo,
        options: &FatOptions,
        sink: &dyn ProgressSink,
    ) -> Result<FormatSummary, BootforgeError>;
}
