// Loop device attach/detach through /dev/loop-control

use bootforge_core::{BootforgeError, DeviceError, LoopHandle};
use log::{debug, info};
use nix::errno::Errno;
use nix::libc::c_int;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

const LOOP_CONTROL: &str = "/dev/loop-control";
const NAME_SIZE: usize = 64;
const ATTACH_ATTEMPTS: u32 = 5;

#[repr(C)]
pub struct LoopInfo64 {
    pub lo_device: u64,
    pub lo_inode: u64,
    pub lo_rdevice: u64,
    pub lo_offset: u64,
    pub lo_sizelimit: u64,
    pub lo_number: u32,
    pub lo_encrypt_type: u32,
    pub lo_encrypt_key_size: u32,
    pub lo_flags: u32,
    pub lo_file_name: [u8; NAME_SIZE],
    pub lo_crypt_name: [u8; NAME_SIZE],
    pub lo_encrypt_key: [u8; 32],
    pub lo_init: [u64; 2],
}

impl LoopInfo64 {
    fn for_image(image: &Path) -> Self {
        let mut info = Self {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: 0,
            lo_sizelimit: 0,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags: 0,
            lo_file_name: [0; NAME_SIZE],
            lo_crypt_name: [0; NAME_SIZE],
            lo_encrypt_key: [0; 32],
            lo_init: [0; 2],
        };
        let name = image.as_os_str().as_bytes();
        let n = name.len().min(NAME_SIZE - 1);
        info.lo_file_name[..n].copy_from_slice(&name[..n]);
        info
    }
}

nix::ioctl_none_bad!(loop_ctl_get_free, 0x4C82);
nix::ioctl_write_int_bad!(loop_set_fd, 0x4C00);
nix::ioctl_none_bad!(loop_clr_fd, 0x4C01);
nix::ioctl_write_ptr_bad!(loop_set_status64, 0x4C04, LoopInfo64);

fn errno_io(context: String, err: Errno) -> BootforgeError {
    DeviceError::io(context, io::Error::from(err)).into()
}

fn free_loop_device() -> Result<PathBuf, BootforgeError> {
    let control = File::open(LOOP_CONTROL).map_err(|e| DeviceError::io(format!("open {}", LOOP_CONTROL), e))?;
    // SAFETY: the control fd stays open for the call
    let index: c_int = unsafe { loop_ctl_get_free(control.as_raw_fd()) }
        .map_err(|e| errno_io("find a free loop device".to_string(), e))?;
    Ok(PathBuf::from(format!("/dev/loop{}", index)))
}

/// Back a free loop device with `image`, read-only. Another process can
/// grab the device between lookup and attach, so busy devices are retried.
pub fn attach(image: &Path) -> Result<LoopHandle, BootforgeError> {
    let backing = File::open(image).map_err(|e| DeviceError::io(format!("open {}", image.display()), e))?;

    for _ in 0..ATTACH_ATTEMPTS {
        let device = free_loop_device()?;
        let loop_file = OpenOptions::new()
            .read(true)
            .open(&device)
            .map_err(|e| DeviceError::io(format!("open {}", device.display()), e))?;
        let fd = loop_file.as_raw_fd();

        // SAFETY: both fds are open for the duration of the calls
        match unsafe { loop_set_fd(fd, backing.as_raw_fd()) } {
            Ok(_) => {}
            Err(Errno::EBUSY) => {
                debug!("{} was taken before attach, retrying", device.display());
                continue;
            }
            Err(e) => return Err(errno_io(format!("attach {}", device.display()), e)),
        }

        let status = LoopInfo64::for_image(image);
        // SAFETY: LoopInfo64 mirrors struct loop_info64
        if let Err(e) = unsafe { loop_set_status64(fd, &status) } {
            // SAFETY: fd is still open
            let _ = unsafe { loop_clr_fd(fd) };
            return Err(errno_io(format!("configure {}", device.display()), e));
        }

        info!("Attached {} to {}", image.display(), device.display());
        return Ok(LoopHandle { device });
    }
    Err(errno_io(format!("attach {}", image.display()), Errno::EBUSY))
}

/// Release a loop device. A device with nothing attached counts as released.
pub fn detach(handle: &LoopHandle) -> Result<(), BootforgeError> {
    let loop_file = File::open(&handle.device)
        .map_err(|e| DeviceError::io(format!("open {}", handle.device.display()), e))?;
    // SAFETY: fd is open for the call
    match unsafe { loop_clr_fd(loop_file.as_raw_fd()) } {
        Ok(_) | Err(Errno::ENXIO) => Ok(()),
        Err(e) => Err(errno_io(format!("detach {}", handle.device.display()), e)),
    }
}
