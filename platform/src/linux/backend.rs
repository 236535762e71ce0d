use super::inspect::LinuxInspector;
use super::loopdev;
use super::mounts::{read_mounts, PROC_MOUNTS};
use crate::copy::CopyContext;
use bootforge_core::{
    BlockIo, BootforgeError, DeviceError, DeviceInfo, DeviceInspector, DeviceKind,
    FilesystemKind, LoopHandle, PartitionTableKind, PipelineError, ProvisioningBackend, WorkPaths,
};
use bootforge_formatters::{build_partition_table, write_partition_table};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::stat::{major, makedev, minor, mknod, Mode, SFlag};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

const SYS_DEV_BLOCK: &str = "/sys/dev/block";
const PARTITION_LOOKUP_ATTEMPTS: u32 = 10;
const UNMOUNT_ATTEMPTS: u32 = 3;
const SETTLE_DELAY: Duration = Duration::from_millis(200);

nix::ioctl_none!(blk_rrpart, 0x12, 95);

fn errno_io(context: String, err: Errno) -> BootforgeError {
    DeviceError::io(context, io::Error::from(err)).into()
}

/// The real operating system behind the provisioning pipeline.
#[derive(Default)]
pub struct LinuxBackend {
    inspector: LinuxInspector,
    lock: Option<File>,
}

impl LinuxBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn block_rdev(path: &Path) -> Result<u64, BootforgeError> {
        let meta = fs::metadata(path).map_err(|e| DeviceError::io(format!("stat {}", path.display()), e))?;
        if !meta.file_type().is_block_device() {
            return Err(DeviceError::Unusable(format!("{} is not a block device", path.display())).into());
        }
        Ok(meta.rdev())
    }

    fn create_node(node: &Path, dev: u64) -> Result<(), BootforgeError> {
        match fs::remove_file(node) {
            Ok(()) => debug!("Replaced stale node {}", node.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(DeviceError::io(format!("remove {}", node.display()), e).into()),
        }
        mknod(node, SFlag::S_IFBLK, Mode::from_bits_truncate(0o660), dev)
            .map_err(|e| errno_io(format!("mknod {}", node.display()), e))?;
        debug!("Created {} ({}:{})", node.display(), major(dev), minor(dev));
        Ok(())
    }

    /// Device number of partition 1 of the disk `dev`, from sysfs.
    fn first_partition(dev: u64) -> Option<u64> {
        let disk = PathBuf::from(SYS_DEV_BLOCK)
            .join(format!("{}:{}", major(dev), minor(dev)));
        let entries = fs::read_dir(disk).ok()?;
        for entry in entries.flatten() {
            let path = entry.path();
            let number = fs::read_to_string(path.join("partition")).ok();
            if number.as_deref().map(str::trim) != Some("1") {
                continue;
            }
            let numbers = fs::read_to_string(path.join("dev")).ok()?;
            let (maj, min) = numbers.trim().split_once(':')?;
            return Some(makedev(maj.parse().ok()?, min.parse().ok()?));
        }
        None
    }

    fn reread_partitions(file: &File, node: &Path) {
        // SAFETY: the fd belongs to `file` for the duration of the call
        match unsafe { blk_rrpart(file.as_raw_fd()) } {
            Ok(_) => debug!("Kernel re-read the partition table of {}", node.display()),
            Err(e) => warn!("Kernel did not re-read the partition table of {}: {}", node.display(), e),
        }
    }
}

impl ProvisioningBackend for LinuxBackend {
    fn claim(&mut self, target: &Path, paths: &WorkPaths) -> Result<(), BootforgeError> {
        if !nix::unistd::geteuid().is_root() {
            warn!("Not running as root, device access will likely fail");
        }

        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&paths.lock_file)
            .map_err(|e| DeviceError::io(format!("open {}", paths.lock_file.display()), e))?;
        match flock(lock.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => {}
            Err(Errno::EWOULDBLOCK) => {
                return Err(PipelineError::DeviceBusy(format!(
                    "{} is held by another job",
                    paths.lock_file.display()
                ))
                .into())
            }
            Err(e) => return Err(errno_io(format!("lock {}", paths.lock_file.display()), e)),
        }

        let mounts = read_mounts(Path::new(PROC_MOUNTS))?;
        let target_str = target.to_string_lossy();
        for entry in &mounts {
            if super::mounts::is_same_disk(&entry.fs_spec, &target_str) {
                return Err(PipelineError::DeviceBusy(format!(
                    "{} is mounted at {}",
                    entry.fs_spec, entry.fs_file
                ))
                .into());
            }
            let mount_point = Path::new(&entry.fs_file);
            if mount_point == paths.mount_dir || mount_point == paths.image_dir {
                return Err(PipelineError::DeviceBusy(format!(
                    "{} is already a mount point",
                    entry.fs_file
                ))
                .into());
            }
        }

        info!("Claimed {}", target.display());
        self.lock = Some(lock);
        Ok(())
    }

    fn release_claim(&mut self, target: &Path) -> Result<(), BootforgeError> {
        // Closing the file drops the flock
        if self.lock.take().is_some() {
            debug!("Released claim on {}", target.display());
        }
        Ok(())
    }

    fn prepare_dir(&mut self, dir: &Path) -> Result<(), BootforgeError> {
        fs::create_dir_all(dir).map_err(|e| DeviceError::io(format!("create {}", dir.display()), e))?;
        let occupied = fs::read_dir(dir)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);
        if occupied {
            warn!("{} is not empty", dir.display());
        }
        Ok(())
    }

    fn remove_dir(&mut self, dir: &Path) -> Result<(), BootforgeError> {
        match fs::remove_dir(dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DeviceError::io(format!("remove {}", dir.display()), e).into()),
        }
    }

    fn bind_loop(&mut self, image: &Path) -> Result<LoopHandle, BootforgeError> {
        loopdev::attach(image)
    }

    fn unbind_loop(&mut self, handle: &LoopHandle) -> Result<(), BootforgeError> {
        loopdev::detach(handle)
    }

    fn make_device_node(&mut self, target: &Path, node: &Path) -> Result<(), BootforgeError> {
        let dev = Self::block_rdev(target)?;
        Self::create_node(node, dev)
    }

    fn make_partition_node(&mut self, device_node: &Path, node: &Path) -> Result<(), BootforgeError> {
        let dev = Self::block_rdev(device_node)?;
        let mut partition = None;
        // udev and the kernel need a moment after BLKRRPART
        for attempt in 0..PARTITION_LOOKUP_ATTEMPTS {
            partition = Self::first_partition(dev);
            if partition.is_some() {
                break;
            }
            debug!("Partition 1 not visible yet (attempt {})", attempt + 1);
            thread::sleep(SETTLE_DELAY);
        }
        let partition = partition.unwrap_or_else(|| {
            warn!("No partition found in sysfs, assuming the next minor number");
            makedev(major(dev), minor(dev) + 1)
        });
        Self::create_node(node, partition)
    }

    fn remove_node(&mut self, node: &Path) -> Result<(), BootforgeError> {
        match fs::remove_file(node) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DeviceError::io(format!("remove {}", node.display()), e).into()),
        }
    }

    fn inspect_device(&self, path: &Path) -> Result<DeviceInfo, BootforgeError> {
        self.inspector.inspect_device(path)
    }

    fn open_block(&mut self, path: &Path) -> Result<Box<dyn BlockIo>, BootforgeError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| DeviceError::io(format!("open {}", path.display()), e))?;
        Ok(Box::new(file))
    }

    fn create_partition_table(
        &mut self,
        device_node: &Path,
        table: PartitionTableKind,
        filesystem: FilesystemKind,
    ) -> Result<bool, BootforgeError> {
        let info = self.inspect_device(device_node)?;
        if info.kind != DeviceKind::BlockDevice {
            return Err(DeviceError::Unusable(device_node.display().to_string()).into());
        }
        let sector_size = if info.sector_size == 0 { 512 } else { info.sector_size };
        let layout = build_partition_table(info.size_bytes, sector_size, table, filesystem)?;
        info!(
            "{:?} table on {}: partition at sector {} spanning {} sectors",
            table,
            device_node.display(),
            layout.start_lba,
            layout.sector_count
        );

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device_node)
            .map_err(|e| DeviceError::io(format!("open {}", device_node.display()), e))?;
        write_partition_table(&mut file, &layout)?;
        file.sync_all()
            .map_err(|e| DeviceError::io("sync partition table", e))?;
        Self::reread_partitions(&file, device_node);
        Ok(layout.bootable)
    }

    fn mount(
        &mut self,
        source: &Path,
        target: &Path,
        fs_type: &str,
        read_only: bool,
    ) -> Result<(), BootforgeError> {
        let flags = if read_only { MsFlags::MS_RDONLY } else { MsFlags::empty() };
        mount(Some(source), target, Some(fs_type), flags, None::<&str>).map_err(|e| {
            errno_io(
                format!("mount {} ({}) on {}", source.display(), fs_type, target.display()),
                e,
            )
        })?;
        info!("Mounted {} on {}", source.display(), target.display());
        Ok(())
    }

    fn unmount(&mut self, target: &Path) -> Result<(), BootforgeError> {
        for attempt in 0..UNMOUNT_ATTEMPTS {
            match umount2(target, MntFlags::empty()) {
                Ok(()) => return Ok(()),
                // Not mounted any more
                Err(Errno::EINVAL) | Err(Errno::ENOENT) => return Ok(()),
                Err(Errno::EBUSY) => {
                    debug!("{} busy (attempt {})", target.display(), attempt + 1);
                    nix::unistd::sync();
                    thread::sleep(SETTLE_DELAY);
                }
                Err(e) => return Err(errno_io(format!("unmount {}", target.display()), e)),
            }
        }
        warn!("{} still busy, detaching lazily", target.display());
        umount2(target, MntFlags::MNT_DETACH)
            .map_err(|e| errno_io(format!("unmount {}", target.display()), e))
    }

    fn copy_tree(
        &mut self,
        source: &Path,
        dest: &Path,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> Result<(), BootforgeError> {
        let mut ctx = CopyContext::new();
        ctx.copy_tree(source, dest, on_progress)?;
        info!(
            "Copied {} entries ({} bytes), skipped {}",
            ctx.files_copied,
            ctx.bytes_copied,
            ctx.skipped.len()
        );
        Ok(())
    }

    fn sync(&mut self) {
        nix::unistd::sync();
    }
}
