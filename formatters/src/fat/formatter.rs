use super::badblocks::scan_bad_sectors;
use super::boot_sector::{serialize_with, VolumeMetadata};
use super::constants::BOOT_SECTOR_SIZE;
use super::geometry::PlanRequest;
use super::layout::FatLayout;
use super::writer::write_tables;
use bootforge_core::{
    BlockIo, BootforgeError, DeviceError, DeviceInfo, FatOptions, FilesystemKind, FormatSummary,
    PartitionFormatter, PercentTracker, ProgressSink, SerializeError,
};
use log::{info, warn};
use std::io::SeekFrom;

/// Native FAT12/16/32 formatter. Works on anything that implements
/// [`BlockIo`], a partition node as much as an image file.
#[derive(Debug, Default, Clone, Copy)]
pub struct FatFormatter;

impl FatFormatter {
    pub fn new() -> Self {
        Self
    }

    /// The layout `format` would produce for this device and options.
    pub fn plan_for(info: &DeviceInfo, options: &FatOptions) -> Result<FatLayout, BootforgeError> {
        if !info.is_usable() {
            return Err(DeviceError::Unusable(format!("{:?} with {} bytes", info.kind, info.size_bytes)).into());
        }
        options.validate()?;
        Ok(PlanRequest::from_device(info, options).plan()?)
    }

    fn verify(device: &mut dyn BlockIo, expected: &FatLayout) -> Result<(), BootforgeError> {
        let mut sector = [0u8; BOOT_SECTOR_SIZE];
        device
            .seek(SeekFrom::Start(0))
            .and_then(|_| device.read_exact(&mut sector))
            .map_err(|e| DeviceError::io("read back boot sector", e))?;

        let found = FatLayout::from_boot_sector(&sector)?;
        if found.fat_type != expected.fat_type
            || found.cluster_count != expected.cluster_count
            || found.fat_length_sectors != expected.fat_length_sectors
            || found.sectors_per_cluster != expected.sectors_per_cluster
        {
            return Err(SerializeError::InvalidBootSector(format!(
                "read back {:?} with {} clusters, wrote {:?} with {}",
                found.fat_type, found.cluster_count, expected.fat_type, expected.cluster_count
            ))
            .into());
        }
        Ok(())
    }
}

impl PartitionFormatter for FatFormatter {
    fn name(&self) -> &'static str {
        "fat"
    }

    fn filesystem(&self) -> FilesystemKind {
        FilesystemKind::Fat
    }

    fn format(
        &self,
        device: &mut dyn BlockIo,
        info: &DeviceInfo,
        options: &FatOptions,
        sink: &dyn ProgressSink,
    ) -> Result<FormatSummary, BootforgeError> {
        let layout = Self::plan_for(info, options)?;
        let line = format!(
            "FAT{}: {} sectors of {} bytes, {} clusters of {} sectors",
            layout.fat_bits(),
            layout.total_sectors,
            layout.sector_size,
            layout.cluster_count,
            layout.sectors_per_cluster
        );
        info!("{}", line);
        sink.log_line(&line);

        let meta = VolumeMetadata::from_options(options)?;
        let mut image = serialize_with(&layout, &meta, options.check_bad_sectors)?;
        let mut warnings: Vec<String> = image.warnings.iter().map(|w| w.to_string()).collect();
        for warning in &warnings {
            sink.log_line(warning);
        }

        let mut bad_sectors = 0;
        if options.check_bad_sectors {
            sink.report_status("Checking for bad sectors");
            let mut tracker = PercentTracker::new();
            let report = scan_bad_sectors(device, &layout, &mut image.initial_fat, &mut |done, total| {
                tracker.update(sink, done, total)
            })?;
            bad_sectors = report.bad_sectors;
            if report.bad_sectors > 0 {
                let msg = format!("{} bad sectors, {} clusters marked", report.bad_sectors, report.bad_clusters);
                warn!("{}", msg);
                sink.log_line(&msg);
                warnings.push(msg);
            }
        }

        write_tables(device, &layout, &image)?;
        device
            .sync_device()
            .map_err(|e| DeviceError::io("sync after writing tables", e))?;

        if options.verify_after_format {
            Self::verify(device, &layout)?;
            sink.log_line("Boot sector verified");
        }

        Ok(FormatSummary {
            filesystem: FilesystemKind::Fat,
            fat_bits: layout.fat_bits(),
            total_sectors: layout.total_sectors,
            cluster_count: layout.cluster_count,
            bytes_per_cluster: layout.bytes_per_cluster(),
            bad_sectors,
            volume_id: meta.volume_id,
            warnings,
        })
    }
}
