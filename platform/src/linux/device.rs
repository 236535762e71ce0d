use super::mounts::{mount_points_of, read_mounts, MountEntry, PROC_MOUNTS};
use bootforge_core::{BootforgeError, Device, DeviceManager, DeviceType};
use log::{debug, warn};
use std::fs;
use std::path::{Path, PathBuf};

const SYSTEM_MOUNTS: [&str; 5] = ["/", "/boot", "/boot/efi", "/usr", "/home"];

/// Disk enumeration from sysfs. The roots are configurable so tests can
/// point it at a fake tree.
pub struct LinuxDeviceManager {
    sys_block: PathBuf,
    mounts: PathBuf,
    cmdline: PathBuf,
}

impl Default for LinuxDeviceManager {
    fn default() -> Self {
        Self {
            sys_block: PathBuf::from("/sys/block"),
            mounts: PathBuf::from(PROC_MOUNTS),
            cmdline: PathBuf::from("/proc/cmdline"),
        }
    }
}

impl LinuxDeviceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_roots(sys_block: &Path, mounts: &Path, cmdline: &Path) -> Self {
        Self {
            sys_block: sys_block.to_path_buf(),
            mounts: mounts.to_path_buf(),
            cmdline: cmdline.to_path_buf(),
        }
    }

    fn read_attr(&self, name: &str, attr: &str) -> Option<String> {
        fs::read_to_string(self.sys_block.join(name).join(attr))
            .ok()
            .map(|s| s.trim().to_string())
    }

    fn is_removable(&self, name: &str) -> bool {
        self.read_attr(name, "removable").as_deref() == Some("1")
    }

    fn device_type(&self, name: &str) -> DeviceType {
        if name.starts_with("loop") || name.starts_with("zram") {
            return DeviceType::Virtual;
        }
        if self.is_removable(name) {
            if name.starts_with("mmcblk") {
                return DeviceType::SDCard;
            }
            return DeviceType::USB;
        }
        // USB disks that do not report themselves removable
        if let Ok(link) = fs::read_link(self.sys_block.join(name)) {
            if link.to_string_lossy().contains("/usb") {
                return DeviceType::USB;
            }
        }
        match self.read_attr(name, "queue/rotational").as_deref() {
            Some("0") => DeviceType::SSD,
            Some(_) => DeviceType::HardDisk,
            None => DeviceType::Unknown,
        }
    }

    fn model(&self, name: &str) -> String {
        let vendor = self.read_attr(name, "device/vendor").unwrap_or_default();
        let model = self.read_attr(name, "device/model").unwrap_or_default();
        let joined = format!("{} {}", vendor, model).trim().to_string();
        if joined.is_empty() {
            name.to_uppercase()
        } else {
            joined
        }
    }

    fn is_system_disk(&self, device_path: &str, mount_points: &[PathBuf]) -> bool {
        if mount_points
            .iter()
            .any(|m| SYSTEM_MOUNTS.iter().any(|s| m == Path::new(s)))
        {
            return true;
        }
        // root=/dev/sda2 on the kernel command line
        fs::read_to_string(&self.cmdline)
            .map(|cmdline| {
                cmdline.split_whitespace().any(|arg| {
                    arg.strip_prefix("root=")
                        .map(|root| super::mounts::is_same_disk(root, device_path))
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    }

    fn device(&self, name: &str, mounts: &[MountEntry]) -> Option<Device> {
        // sysfs sizes are always in 512-byte units
        let size = self.read_attr(name, "size")?.parse::<u64>().ok()? * 512;
        if size == 0 {
            return None;
        }
        let id = format!("/dev/{}", name);
        let mount_points = mount_points_of(mounts, &id);
        let is_system = self.is_system_disk(&id, &mount_points);
        Some(Device {
            name: format!("{} ({})", self.model(name), name),
            size,
            device_type: self.device_type(name),
            is_removable: self.is_removable(name),
            is_system,
            mount_points,
            id,
        })
    }

    fn scan(&self) -> Result<Vec<Device>, BootforgeError> {
        let mounts = read_mounts(&self.mounts).unwrap_or_else(|e| {
            warn!("Cannot read {}: {}", self.mounts.display(), e);
            Vec::new()
        });
        let entries = fs::read_dir(&self.sys_block).map_err(|e| {
            BootforgeError::NotSupported(format!("cannot read {}: {}", self.sys_block.display(), e))
        })?;

        let mut devices = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("loop") || name.starts_with("ram") || name.starts_with("zram") {
                continue;
            }
            match self.device(&name, &mounts) {
                Some(device) => devices.push(device),
                None => debug!("Skipping {} without a size", name),
            }
        }

        // Removable first, then by name
        devices.sort_by(|a, b| b.is_removable.cmp(&a.is_removable).then_with(|| a.id.cmp(&b.id)));
        Ok(devices)
    }
}

#[async_trait::async_trait]
impl DeviceManager for LinuxDeviceManager {
    async fn enumerate_devices(&self) -> Result<Vec<Device>, BootforgeError> {
        self.scan()
    }

    async fn get_device_by_id(&self, device_id: &str) -> Result<Option<Device>, BootforgeError> {
        Ok(self.scan()?.into_iter().find(|d| d.id == device_id))
    }

    async fn is_safe_to_format(&self, device: &Device) -> Result<bool, BootforgeError> {
        if device.is_system || !device.mount_points.is_empty() {
            return Ok(false);
        }
        // Holders mean LVM, RAID or dm-crypt sit on top of the disk
        let name = device.id.trim_start_matches("/dev/");
        if let Ok(holders) = fs::read_dir(self.sys_block.join(name).join("holders")) {
            if holders.count() > 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
