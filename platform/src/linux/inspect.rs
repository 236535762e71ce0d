use bootforge_core::{BootforgeError, DeviceError, DeviceInfo, DeviceInspector, DeviceKind};
use log::{debug, warn};
use nix::libc::{c_int, c_ulong};
use std::fs::{self, File};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

#[repr(C)]
#[derive(Debug, Default)]
pub struct HdGeometry {
    pub heads: u8,
    pub sectors: u8,
    pub cylinders: u16,
    pub start: c_ulong,
}

nix::ioctl_read!(blk_getsize64, 0x12, 114, u64);
nix::ioctl_read_bad!(blk_ssz_get, nix::request_code_none!(0x12, 104), c_int);
nix::ioctl_read_bad!(hdio_getgeo, 0x0301, HdGeometry);

/// Classifies a path and reads its size and geometry from the kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxInspector;

impl LinuxInspector {
    pub fn new() -> Self {
        Self
    }

    fn block_device(path: &Path) -> Result<DeviceInfo, BootforgeError> {
        let file = File::open(path).map_err(|e| DeviceError::io(format!("open {}", path.display()), e))?;
        let fd = file.as_raw_fd();

        let mut size = 0u64;
        // SAFETY: fd is open for the lifetime of `file` and size is a valid u64
        unsafe { blk_getsize64(fd, &mut size) }
            .map_err(|_| DeviceError::SizeUnknown(path.display().to_string()))?;
        if size == 0 {
            // Card readers without a card report zero
            return Err(DeviceError::SizeUnknown(path.display().to_string()).into());
        }

        let mut sector_size: c_int = 0;
        // SAFETY: as above, the kernel writes one int
        let sector_size = match unsafe { blk_ssz_get(fd, &mut sector_size) } {
            Ok(_) if sector_size > 0 => sector_size as u32,
            _ => {
                warn!("{} does not report a logical sector size", path.display());
                0
            }
        };

        let mut geometry = HdGeometry::default();
        // SAFETY: HdGeometry mirrors struct hd_geometry
        let geometry = match unsafe { hdio_getgeo(fd, &mut geometry) } {
            Ok(_) if geometry.heads > 0 && geometry.sectors > 0 => Some(geometry),
            Ok(_) => None,
            Err(e) => {
                debug!("No CHS geometry for {}: {}", path.display(), e);
                None
            }
        };

        Ok(DeviceInfo {
            kind: DeviceKind::BlockDevice,
            size_bytes: size,
            sector_size,
            geometry_heads: geometry.as_ref().map(|g| g.heads as u32),
            geometry_sectors: geometry.as_ref().map(|g| g.sectors as u32),
            partition_start_sector: geometry
                .as_ref()
                .and_then(|g| u32::try_from(g.start).ok()),
        })
    }
}

impl DeviceInspector for LinuxInspector {
    fn inspect_device(&self, path: &Path) -> Result<DeviceInfo, BootforgeError> {
        let meta = fs::metadata(path).map_err(|e| DeviceError::io(format!("stat {}", path.display()), e))?;
        let file_type = meta.file_type();

        if file_type.is_file() {
            if meta.len() == 0 {
                return Err(DeviceError::SizeUnknown(path.display().to_string()).into());
            }
            return Ok(DeviceInfo::file(meta.len()));
        }
        if file_type.is_block_device() {
            return Self::block_device(path);
        }
        debug!("{} is neither a regular file nor a block device", path.display());
        Ok(DeviceInfo::unusable())
    }
}
