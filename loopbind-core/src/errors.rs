use loopbind_hal::HalError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for bind operations
pub type BindResult<T> = std::result::Result<T, BindError>;

/// Fatal bind failures. Every variant aborts the bind for the calling
/// process; per-slot probe failures never surface here.
#[derive(Error, Debug)]
pub enum BindError {
    #[error("image {} has no valid open file descriptor", path.display())]
    InvalidHandle { path: PathBuf },

    #[error("could not use loop lock file {}: {source}", path.display())]
    LockFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not retrieve active loop device from {}: record is empty", path.display())]
    EmptyLockRecord { path: PathBuf },

    #[error("could not obtain offset of image {}: {source}", path.display())]
    OffsetResolution {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not create loop device node {device}: {source}")]
    DeviceNodeCreation {
        device: String,
        #[source]
        source: HalError,
    },

    #[error("no free loop device: all {slots} slots busy or unusable ({busy} associated elsewhere)")]
    DeviceExhausted { slots: u32, busy: u32 },

    #[error("failed to set loop flags on {device}: {source}")]
    Configuration {
        device: String,
        #[source]
        source: HalError,
    },

    #[error("could not write {device} to lock file {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        device: String,
        #[source]
        source: io::Error,
    },

    #[error("privilege change failed: {0}")]
    Privilege(#[source] HalError),
}

impl BindError {
    /// Short name of the phase that failed, for user-facing messages.
    pub fn phase(&self) -> &'static str {
        match self {
            BindError::InvalidHandle { .. } => "precondition",
            BindError::LockFile { .. } | BindError::EmptyLockRecord { .. } => "lock",
            BindError::OffsetResolution { .. } => "offset",
            BindError::DeviceNodeCreation { .. } | BindError::DeviceExhausted { .. } => "allocate",
            BindError::Configuration { .. } => "configure",
            BindError::Persistence { .. } => "persist",
            BindError::Privilege(_) => "privilege",
        }
    }
}
