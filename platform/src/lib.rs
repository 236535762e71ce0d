//! Linux implementations of the collaborator traits: device inspection
//! and enumeration, loop devices, device nodes, mounts and tree copy.

#[cfg(not(target_os = "linux"))]
compile_error!("bootforge-platform only supports Linux");

pub mod copy;

#[cfg(target_os = "linux")]
pub mod linux;

pub use copy::CopyContext;

#[cfg(target_os = "linux")]
pub use linux::{LinuxBackend, LinuxInspector};

#[cfg(target_os = "linux")]
pub use linux::LinuxDeviceManager as PlatformDeviceManager;
