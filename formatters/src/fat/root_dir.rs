// Root directory region and the volume label entry

use super::constants::*;
use super::layout::FatLayout;
use chrono::{Datelike, NaiveDateTime, Timelike};

/// Encode a timestamp as MS-DOS (date, time).
/// Date: bits 15-9 year since 1980, 8-5 month, 4-0 day.
/// Time: bits 15-11 hours, 10-5 minutes, 4-0 seconds/2.
pub fn dos_datetime(ts: &NaiveDateTime) -> (u16, u16) {
    let year = ts.year().clamp(1980, 2107) - 1980;
    let date = ((year as u16) << 9) | ((ts.month() as u16) << 5) | ts.day() as u16;
    let time = ((ts.hour() as u16) << 11) | ((ts.minute() as u16) << 5) | (ts.second() / 2) as u16;
    (date, time)
}

/// Zeroed root directory, with the volume label as entry 0 when `label` is
/// an actual name.
pub fn build_root_dir(layout: &FatLayout, label: &[u8; 11], created: &NaiveDateTime) -> Vec<u8> {
    let mut root = vec![0u8; layout.root_dir_bytes()];
    if label == NO_NAME_LABEL || label.iter().all(|b| *b == b' ') {
        return root;
    }

    let (date, time) = dos_datetime(created);
    let entry = &mut root[..DIR_ENTRY_SIZE];
    entry[0..11].copy_from_slice(label);
    entry[11] = ATTR_VOLUME_ID;
    entry[14..16].copy_from_slice(&time.to_le_bytes()); // creation time
    entry[16..18].copy_from_slice(&date.to_le_bytes()); // creation date
    entry[18..20].copy_from_slice(&date.to_le_bytes()); // last access
    entry[22..24].copy_from_slice(&time.to_le_bytes());
    entry[24..26].copy_from_slice(&date.to_le_bytes());
    root
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fat::geometry::plan;
    use chrono::NaiveDate;

    fn created() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 17)
            .unwrap()
            .and_hms_opt(13, 45, 31)
            .unwrap()
    }

    #[test]
    fn encodes_dos_timestamps() {
        let (date, time) = dos_datetime(&created());
        assert_eq!(date, (44 << 9) | (5 << 5) | 17);
        assert_eq!(time, (13 << 11) | (45 << 5) | 15);
    }

    #[test]
    fn label_entry_is_written_for_named_volumes() {
        let layout = plan(64 << 20, 512, Some(16), None, 2, None, true).unwrap();
        let root = build_root_dir(&layout, b"BOOTSTICK  ", &created());

        assert_eq!(root.len(), layout.root_dir_entries as usize * 32);
        assert_eq!(&root[..11], b"BOOTSTICK  ");
        assert_eq!(root[11], ATTR_VOLUME_ID);
        assert_eq!(root[14..16], root[22..24]);
        assert_eq!(root[16..18], root[24..26]);
        assert_eq!(root[18..20], root[24..26]);
        assert!(root[32..].iter().all(|b| *b == 0));
    }

    #[test]
    fn unnamed_volumes_get_an_empty_root() {
        let layout = plan(2 << 30, 512, Some(32), None, 2, None, true).unwrap();
        let root = build_root_dir(&layout, NO_NAME_LABEL, &created());
        assert_eq!(root.len(), layout.bytes_per_cluster() as usize);
        assert!(root.iter().all(|b| *b == 0));
    }
}
