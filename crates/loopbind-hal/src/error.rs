use thiserror::Error;

pub type HalResult<T> = std::result::Result<T, HalError>;

#[derive(Error, Debug)]
pub enum HalError {
    #[error("Device is busy (already associated with a backing file)")]
    DeviceBusy,

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Not a loop device: {0}")]
    NotALoopDevice(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("nix errno: {0}")]
    Nix(#[from] nix::errno::Errno),
}
