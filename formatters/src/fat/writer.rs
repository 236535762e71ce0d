// Writes a serialized boot image to the start of a volume

use super::boot_sector::BootImage;
use super::constants::BOOT_SECTOR_SIZE;
use super::layout::FatLayout;
use bootforge_core::{BootforgeError, DeviceError};
use log::debug;
use std::io::{Seek, SeekFrom, Write};

const ZERO_CHUNK: usize = 64 * 1024;

fn seek_to<W: Seek + ?Sized>(dev: &mut W, offset: u64, what: &str) -> Result<(), BootforgeError> {
    dev.seek(SeekFrom::Start(offset))
        .map_err(|e| DeviceError::io(format!("seek to {}", what), e))?;
    Ok(())
}

fn write_buf<W: Write + ?Sized>(dev: &mut W, buf: &[u8], what: &str) -> Result<(), BootforgeError> {
    dev.write_all(buf)
        .map_err(|e| DeviceError::io(format!("write {}", what), e))?;
    Ok(())
}

fn write_zeros<W: Write + ?Sized>(dev: &mut W, mut len: u64, what: &str) -> Result<(), BootforgeError> {
    let zeros = vec![0u8; ZERO_CHUNK];
    while len > 0 {
        let n = len.min(ZERO_CHUNK as u64) as usize;
        write_buf(dev, &zeros[..n], what)?;
        len -= n as u64;
    }
    Ok(())
}

/// Lay the metadata down in on-disk order: zeroed reserved area, boot
/// sector, FSInfo and backup boot sector (FAT32), every FAT copy, then
/// the root directory. Each FAT copy is the in-memory table padded with
/// zeros to the full FAT length.
pub fn write_tables<W: Write + Seek + ?Sized>(
    dev: &mut W,
    layout: &FatLayout,
    image: &BootImage,
) -> Result<(), BootforgeError> {
    let sector_size = layout.sector_size as u64;

    seek_to(dev, 0, "start of volume")?;
    write_zeros(dev, layout.reserved_sectors as u64 * sector_size, "reserved sectors")?;

    seek_to(dev, 0, "boot sector")?;
    write_buf(dev, &image.boot_sector, "boot sector")?;

    if let Some(info) = &image.fsinfo_sector {
        seek_to(dev, sector_size, "info sector")?;
        write_buf(dev, &info[..BOOT_SECTOR_SIZE], "info sector")?;
        if layout.backup_boot_sector > 0 {
            seek_to(dev, layout.backup_boot_sector as u64 * sector_size, "backup boot sector")?;
            write_buf(dev, &image.boot_sector, "backup boot sector")?;
        }
    }

    let fat = image.initial_fat_bytes();
    let fat_bytes = layout.fat_bytes();
    seek_to(dev, layout.fat_start_sector() as u64 * sector_size, "first FAT")?;
    for copy in 0..layout.num_fats {
        debug!("Writing FAT copy {}", copy + 1);
        write_buf(dev, fat, "FAT")?;
        write_zeros(dev, fat_bytes - fat.len() as u64, "FAT")?;
    }

    seek_to(dev, layout.root_dir_start_sector() as u64 * sector_size, "root directory")?;
    write_buf(dev, &image.root_dir_bytes, "root directory")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fat::boot_sector::{serialize, VolumeMetadata};
    use crate::fat::geometry::plan;
    use chrono::NaiveDate;
    use std::io::Cursor;

    fn meta() -> VolumeMetadata {
        let created = NaiveDate::from_ymd_opt(2023, 9, 9).unwrap().and_hms_opt(9, 9, 9).unwrap();
        VolumeMetadata::new(7, created).with_label("disk").unwrap()
    }

    #[test]
    fn fat32_regions_land_where_the_layout_says() {
        let size = 600u64 << 20;
        let layout = plan(size, 512, None, None, 2, None, true).unwrap();
        let image = serialize(&layout, &meta()).unwrap();
        // Only the metadata and one data cluster need backing
        let span = (layout.data_start_sector() + 2 * layout.sectors_per_cluster as u32) as usize * 512;
        let mut dev = Cursor::new(vec![0xEEu8; span]);

        write_tables(&mut dev, &layout, &image).unwrap();
        let disk = dev.into_inner();

        assert_eq!(&disk[..512], &image.boot_sector[..]);
        assert_eq!(&disk[512..516], b"RRaA");
        assert_eq!(&disk[6 * 512..7 * 512], &image.boot_sector[..]);
        // Reserved sectors without content are zeroed
        assert!(disk[2 * 512..6 * 512].iter().all(|b| *b == 0));

        let fat_len = layout.fat_bytes() as usize;
        for copy in 0..2 {
            let start = (layout.reserved_sectors as usize) * 512 + copy * fat_len;
            assert_eq!(&disk[start..start + 12], &image.initial_fat_bytes()[..12]);
            assert!(disk[start + 512..start + fat_len].iter().all(|b| *b == 0));
        }

        let root = layout.root_dir_start_sector() as usize * 512;
        assert_eq!(&disk[root..root + 11], b"DISK       ");
        // Data area past the root cluster is untouched
        let after = root + layout.bytes_per_cluster() as usize;
        assert_eq!(disk[after], 0xEE);
    }

    #[test]
    fn fat12_image_has_no_info_sector() {
        let layout = plan(1_474_560, 512, None, None, 2, None, true).unwrap();
        let image = serialize(&layout, &meta()).unwrap();
        let mut dev = Cursor::new(vec![0xEEu8; 1_474_560]);

        write_tables(&mut dev, &layout, &image).unwrap();
        let disk = dev.into_inner();

        assert_eq!(&disk[512..515], &[0xF0, 0xFF, 0xFF]);
        assert_eq!(&disk[512 + 9 * 512..512 + 9 * 512 + 3], &[0xF0, 0xFF, 0xFF]);
        let root = 19 * 512;
        assert_eq!(&disk[root..root + 4], b"DISK");
        assert!(disk[root + 32..root + 224 * 32].iter().all(|b| *b == 0));
        assert_eq!(disk[root + 224 * 32], 0xEE);
    }
}
