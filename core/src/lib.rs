pub mod device;
pub mod error;
pub mod filesystem;
pub mod options;
pub mod pipeline;
pub mod progress;
pub mod registry;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use device::{BlockIo, Device, DeviceInfo, DeviceInspector, DeviceKind, DeviceManager, DeviceType};
pub use error::{BootforgeError, DeviceError, ErrorKind, PipelineError, PlanError, SerializeError};
pub use filesystem::{FormatSummary, PartitionFormatter};
pub use options::{FatOptions, FilesystemKind, PartitionTableKind, ProvisionOptions, WorkPaths};
pub use pipeline::{
    CancelToken, CleanupReport, JobOutcome, JobReport, LoopHandle, Pipeline, PipelineStep,
    ProvisioningBackend, ProvisioningJob, ResourceHandle,
};
pub use progress::{ChannelSink, LogSink, NullSink, PercentTracker, ProgressEvent, ProgressSink};
pub use registry::FormatterRegistry;
