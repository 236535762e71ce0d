pub mod backend;
pub mod device;
pub mod inspect;
pub mod loopdev;
pub mod mounts;

pub use backend::LinuxBackend;
pub use device::LinuxDeviceManager;
pub use inspect::LinuxInspector;
