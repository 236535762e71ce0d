// Read test for bad sectors, marking the clusters they fall into

use super::fat_table::FatTable;
use super::layout::FatLayout;
use bootforge_core::{BootforgeError, DeviceError};
use log::{debug, info, warn};
use std::io::{ErrorKind, Read, Seek, SeekFrom};

const CHUNK_BYTES: u64 = 16 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub sectors_checked: u64,
    pub bad_sectors: u32,
    /// Bad sectors that landed in a cluster and were marked in the FAT.
    pub bad_clusters: u32,
}

/// Read the volume front to back. Bulk reads drop to single sectors after
/// the first failure and go back to bulk once a full chunk reads again.
/// A failure inside the metadata area is fatal; data-area failures are
/// marked in `fat` and counted.
pub fn scan_bad_sectors<D: Read + Seek + ?Sized>(
    device: &mut D,
    layout: &FatLayout,
    fat: &mut FatTable,
    progress: &mut dyn FnMut(u64, u64),
) -> Result<ScanReport, BootforgeError> {
    let sector_size = layout.sector_size as u64;
    let total = layout.total_sectors as u64;
    let data_start = layout.data_start_sector() as u64;
    let chunk = (CHUNK_BYTES / sector_size).max(1);
    let mut buf = vec![0u8; (chunk * sector_size) as usize];

    let mut report = ScanReport::default();
    let mut current = 0u64;
    let mut attempt = chunk;
    info!("Checking {} sectors for bad blocks", total);

    while current < total {
        let want = attempt.min(total - current);
        let got = read_sectors(device, current, &mut buf[..(want * sector_size) as usize], sector_size)?;
        current += got;
        if got == want {
            attempt = chunk;
            progress(current, total);
            continue;
        }
        attempt = 1;

        if current < data_start {
            return Err(DeviceError::UnformattableMedia(current).into());
        }
        report.bad_sectors += 1;
        let cluster = (current - data_start) / layout.sectors_per_cluster as u64 + 2;
        if cluster < layout.fat_entries() as u64 {
            let cluster = cluster as u32;
            if !fat.is_bad(cluster)? {
                report.bad_clusters += 1;
            }
            fat.mark_bad(cluster)?;
        } else {
            debug!("Bad sector {} lies past the last cluster", current);
        }
        current += 1;
        progress(current, total);
    }

    report.sectors_checked = total;
    if report.bad_sectors > 0 {
        warn!(
            "{} bad sector{} found, {} cluster{} marked",
            report.bad_sectors,
            if report.bad_sectors > 1 { "s" } else { "" },
            report.bad_clusters,
            if report.bad_clusters == 1 { "" } else { "s" }
        );
    }
    Ok(report)
}

/// Whole sectors read into `buf` starting at `sector`, stopping at the first
/// error or short read.
fn read_sectors<D: Read + Seek + ?Sized>(
    device: &mut D,
    sector: u64,
    buf: &mut [u8],
    sector_size: u64,
) -> Result<u64, BootforgeError> {
    device
        .seek(SeekFrom::Start(sector * sector_size))
        .map_err(|e| DeviceError::io(format!("seek to sector {}", sector), e))?;

    let mut filled = 0;
    while filled < buf.len() {
        match device.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    Ok(filled as u64 / sector_size)
}
