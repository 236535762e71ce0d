use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Geometry cannot be satisfied for the requested device and overrides.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("Insufficient capacity: {0}")]
    InsufficientCapacity(String),

    #[error("Invalid backup boot sector {requested} (reserved sectors: {reserved})")]
    InvalidBackupSector { requested: u16, reserved: u16 },

    #[error("Sector size {0} is not a power of two between 512 and 32768")]
    SectorSizeUnsupported(u32),

    #[error("Too many hidden sectors for the Atari variant: {0} (max 65535)")]
    TooManyHiddenSectors(u32),

    #[error("Reserved sector count {requested} is below the minimum of {minimum}")]
    ReservedSectorsTooFew { requested: u16, minimum: u16 },

    #[error("Layout violates its invariants: {0}")]
    InconsistentLayout(String),
}

/// Internal mismatch between a layout and the bytes rendered from it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SerializeError {
    #[error("Volume label is {0} bytes long (max 11)")]
    LabelTooLong(usize),

    #[error("Boot message is {length} bytes long, truncated to {slot}")]
    MessageTooLong { length: usize, slot: usize },

    #[error("Cluster {cluster} outside the FAT range [0, {limit})")]
    ClusterOutOfRange { cluster: u32, limit: u32 },

    #[error("Invalid boot sector: {0}")]
    InvalidBootSector(String),
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error while {context}: {source}")]
    IoAt {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unreadable sector {0} before the data area, media cannot be formatted")]
    UnformattableMedia(u64),

    #[error("Device is not usable: {0}")]
    Unusable(String),

    #[error("Cannot determine the size of {0}")]
    SizeUnknown(String),
}

impl DeviceError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        DeviceError::IoAt {
            context: context.into(),
            source,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("Device is busy: {0}")]
    DeviceBusy(String),

    #[error("Operation cancelled by user")]
    Cancelled,

    #[error("{step} failed: {message}")]
    Collaborator { step: String, message: String },

    #[error("No formatter registered for {0}")]
    NoFormatter(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),
}

impl PipelineError {
    pub fn collaborator(step: impl Into<String>, message: impl fmt::Display) -> Self {
        PipelineError::Collaborator {
            step: step.into(),
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BootforgeError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Serialize(#[from] SerializeError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not supported: {0}")]
    NotSupported(String),
}

impl From<std::io::Error> for BootforgeError {
    fn from(err: std::io::Error) -> Self {
        BootforgeError::Device(DeviceError::Io(err))
    }
}

impl BootforgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BootforgeError::Plan(_) => ErrorKind::Plan,
            BootforgeError::Serialize(_) => ErrorKind::Serialize,
            BootforgeError::Device(_) => ErrorKind::Device,
            BootforgeError::Pipeline(_)
            | BootforgeError::Serialization(_)
            | BootforgeError::InvalidInput(_)
            | BootforgeError::NotSupported(_) => ErrorKind::Pipeline,
        }
    }
}

/// Coarse error classification reported at the end of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Plan,
    Serialize,
    Device,
    Pipeline,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Plan => "PlanError",
            ErrorKind::Serialize => "SerializeError",
            ErrorKind::Device => "DeviceError",
            ErrorKind::Pipeline => "PipelineError",
        };
        f.write_str(name)
    }
}
