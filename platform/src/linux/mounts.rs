// Kernel mount table lookups

use procfs::FromRead;
use std::io;
use std::path::{Path, PathBuf};

pub use procfs::MountEntry;

pub const PROC_MOUNTS: &str = "/proc/mounts";

/// The live mount table, or a saved copy in the same format.
pub fn read_mounts(path: &Path) -> io::Result<Vec<MountEntry>> {
    let entries = if path == Path::new(PROC_MOUNTS) {
        procfs::mounts()
    } else {
        Vec::<MountEntry>::from_file(path)
    };
    entries.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
}

/// Mount points of a disk and of every partition on it.
pub fn mount_points_of(entries: &[MountEntry], device: &str) -> Vec<PathBuf> {
    entries
        .iter()
        .filter(|e| is_same_disk(&e.fs_spec, device))
        .map(|e| PathBuf::from(&e.fs_file))
        .collect()
}

/// `/dev/sdb1` and `/dev/mmcblk0p2` belong to `/dev/sdb` and `/dev/mmcblk0`.
pub fn is_same_disk(source: &str, device: &str) -> bool {
    match source.strip_prefix(device) {
        Some("") => true,
        Some(rest) => {
            let rest = rest.strip_prefix('p').unwrap_or(rest);
            !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}
