//! Recursive tree copy with progress measured in entries copied out of
//! entries counted up front.

use bootforge_core::{BootforgeError, DeviceError};
use log::{debug, warn};
use std::fs;
use std::path::Path;

/// Counters for one copy operation. Each copy owns its context, so two
/// copies never share progress.
#[derive(Debug, Default)]
pub struct CopyContext {
    pub files_total: u64,
    pub files_copied: u64,
    pub bytes_copied: u64,
    pub skipped: Vec<String>,
}

impl CopyContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy everything below `source` into `dest`, which must exist.
    /// `on_progress` is called with (copied, total) after every entry.
    pub fn copy_tree(
        &mut self,
        source: &Path,
        dest: &Path,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> Result<(), BootforgeError> {
        self.files_total = count_entries(source)?;
        self.files_copied = 0;
        self.bytes_copied = 0;
        self.skipped.clear();
        debug!("{} entries to copy from {}", self.files_total, source.display());

        on_progress(0, self.files_total);
        self.copy_dir(source, dest, on_progress)
    }

    fn copy_dir(
        &mut self,
        source: &Path,
        dest: &Path,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> Result<(), BootforgeError> {
        let mut entries = fs::read_dir(source)
            .map_err(|e| DeviceError::io(format!("read {}", source.display()), e))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| DeviceError::io(format!("read {}", source.display()), e))?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let from = entry.path();
            let to = dest.join(entry.file_name());
            let file_type = entry
                .file_type()
                .map_err(|e| DeviceError::io(format!("stat {}", from.display()), e))?;

            if file_type.is_dir() {
                match fs::create_dir(&to) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                    Err(e) => return Err(DeviceError::io(format!("create {}", to.display()), e).into()),
                }
                self.advance(on_progress);
                self.copy_dir(&from, &to, on_progress)?;
            } else if file_type.is_file() {
                debug!("Extracting {}", to.display());
                let bytes = fs::copy(&from, &to)
                    .map_err(|e| DeviceError::io(format!("copy {}", from.display()), e))?;
                self.bytes_copied += bytes;
                self.advance(on_progress);
            } else {
                // FAT cannot hold symlinks or device nodes
                warn!("Skipping {}: not a regular file or directory", from.display());
                self.skipped.push(from.display().to_string());
                self.advance(on_progress);
            }
        }
        Ok(())
    }

    fn advance(&mut self, on_progress: &mut dyn FnMut(u64, u64)) {
        self.files_copied += 1;
        on_progress(self.files_copied, self.files_total);
    }
}

/// Number of entries below `root`, directories included, `root` excluded.
pub fn count_entries(root: &Path) -> Result<u64, BootforgeError> {
    let mut count = 0;
    for entry in fs::read_dir(root).map_err(|e| DeviceError::io(format!("read {}", root.display()), e))? {
        let entry = entry.map_err(|e| DeviceError::io(format!("read {}", root.display()), e))?;
        count += 1;
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            count += count_entries(&entry.path())?;
        }
    }
    Ok(count)
}
