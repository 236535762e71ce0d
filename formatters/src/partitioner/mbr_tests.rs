// Partition table layout tests
use super::*;
use std::io::Cursor;

const DISK: u64 = 64 * 1024 * 1024;

fn written(table: &PartitionTable, size: u64) -> Vec<u8> {
    let mut disk = Cursor::new(vec![0u8; size as usize]);
    write_partition_table(&mut disk, table).unwrap();
    disk.into_inner()
}

#[test]
fn test_mbr_single_bootable_partition() {
    let table = build_partition_table(DISK, 512, PartitionTableKind::Mbr, FilesystemKind::Fat).unwrap();
    assert_eq!(table.start_lba, 2048);
    assert_eq!(table.sector_count, DISK / 512 - 2048);
    assert_eq!(table.partition_offset(), 1024 * 1024);

    let disk = written(&table, DISK);
    let entry = MbrEntry::parse_first(&disk[..512]).unwrap();
    assert!(entry.bootable);
    assert_eq!(entry.partition_type, MBR_TYPE_FAT16_LBA);
    assert_eq!(entry.start_lba, 2048);
    assert_eq!(entry.sector_count as u64, table.sector_count);
    assert_ne!(&disk[440..444], &[0, 0, 0, 0]);
}

#[test]
fn test_mbr_chs_of_aligned_start() {
    // LBA 2048 = cylinder 0, head 32, sector 33
    assert_eq!(chs(2048), [32, 33, 0]);
    assert_eq!(chs(0), [0, 1, 0]);
    assert_eq!(chs(1024 * 255 * 63), [0xFE, 0xFF, 0xFF]);
}

#[test]
fn test_partition_type_follows_size_and_filesystem() {
    assert_eq!(mbr_partition_type(FilesystemKind::Fat, 256 << 20), MBR_TYPE_FAT16_LBA);
    assert_eq!(mbr_partition_type(FilesystemKind::Fat, 8 << 30), MBR_TYPE_FAT32_LBA);
    assert_eq!(mbr_partition_type(FilesystemKind::Ntfs, 8 << 30), MBR_TYPE_NTFS);
}

#[test]
fn test_gpt_headers_and_checksums() {
    let table = build_partition_table(DISK, 512, PartitionTableKind::Gpt, FilesystemKind::Fat).unwrap();
    let disk = written(&table, DISK);
    let last = DISK / 512 - 1;

    // Protective MBR
    let pmbr = MbrEntry::parse_first(&disk[..512]).unwrap();
    assert_eq!(pmbr.partition_type, 0xEE);
    assert!(!pmbr.bootable);
    assert_eq!(pmbr.start_lba, 1);

    let primary = &disk[512..1024];
    assert_eq!(&primary[0..8], b"EFI PART");
    let mut check = primary[..92].to_vec();
    check[16..20].fill(0);
    assert_eq!(
        crc32fast::hash(&check),
        u32::from_le_bytes(primary[16..20].try_into().unwrap())
    );
    assert_eq!(u64::from_le_bytes(primary[32..40].try_into().unwrap()), last);

    let entries = &disk[1024..1024 + 128 * 128];
    assert_eq!(
        crc32fast::hash(entries),
        u32::from_le_bytes(primary[88..92].try_into().unwrap())
    );
    assert_eq!(&entries[0..16], &GPT_BASIC_DATA.to_bytes_le());
    assert_eq!(u64::from_le_bytes(entries[32..40].try_into().unwrap()), 2048);
    assert_eq!(u64::from_le_bytes(entries[48..56].try_into().unwrap()), 1 << 2);

    let backup = &disk[(last * 512) as usize..];
    assert_eq!(&backup[0..8], b"EFI PART");
    assert_eq!(u64::from_le_bytes(backup[24..32].try_into().unwrap()), last);
    assert_eq!(u64::from_le_bytes(backup[32..40].try_into().unwrap()), 1);
    let backup_entries = (last - 32) * 512;
    assert_eq!(u64::from_le_bytes(backup[72..80].try_into().unwrap()), last - 32);
    assert_eq!(&disk[backup_entries as usize..backup_entries as usize + 128 * 128], entries);
}

#[test]
fn test_gpt_partition_stops_before_backup_entries() {
    let table = build_partition_table(DISK, 512, PartitionTableKind::Gpt, FilesystemKind::Ntfs).unwrap();
    let last = DISK / 512 - 1;
    assert_eq!(table.start_lba + table.sector_count - 1, last - 33);
}

#[test]
fn test_tiny_disks_are_rejected() {
    for kind in [PartitionTableKind::Mbr, PartitionTableKind::Gpt] {
        let err = build_partition_table(512 * 1024, 512, kind, FilesystemKind::Fat).unwrap_err();
        assert!(matches!(err, BootforgeError::Device(DeviceError::Unusable(_))));
    }
}

#[test]
fn test_not_an_mbr() {
    assert_eq!(MbrEntry::parse_first(&[0u8; 512]), None);
}
