//! Loop device operations (raw `/dev/loopN` ioctl interface).

use crate::HalResult;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

/// Block major number the kernel reserves for loop devices.
pub const LOOP_MAJOR: u32 = 7;

/// `LO_FLAGS_AUTOCLEAR` from `<linux/loop.h>`.
pub const LO_FLAGS_AUTOCLEAR: u32 = 4;

/// Size of `lo_file_name` in `struct loop_info64`, including the NUL.
pub const LO_NAME_SIZE: usize = 64;

/// Status applied to a bound loop device (`LOOP_SET_STATUS64`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopInfo {
    /// Byte offset into the backing file where the device starts.
    pub offset: u64,
    /// `lo_flags` bitmask.
    pub flags: u32,
    /// Backing file name reported by the kernel (informational only).
    pub file_name: Option<PathBuf>,
}

impl LoopInfo {
    pub fn new(offset: u64) -> Self {
        Self {
            offset,
            ..Self::default()
        }
    }

    pub fn with_autoclear(mut self, enabled: bool) -> Self {
        if enabled {
            self.flags |= LO_FLAGS_AUTOCLEAR;
        } else {
            self.flags &= !LO_FLAGS_AUTOCLEAR;
        }
        self
    }

    pub fn with_file_name(mut self, name: impl Into<PathBuf>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    pub fn autoclear(&self) -> bool {
        self.flags & LO_FLAGS_AUTOCLEAR != 0
    }
}

pub trait LoopOps {
    /// Open handle on a loop device node. Dropping it closes the node.
    type Device;

    /// Whether `path` exists and is a block device node.
    fn is_block_device(&self, path: &Path) -> HalResult<bool>;

    /// Create a block device node (`mknod`, mode 0644).
    fn create_block_node(&self, path: &Path, major: u32, minor: u32) -> HalResult<()>;

    /// Open a loop device node for read/write.
    fn open_device(&self, path: &Path) -> HalResult<Self::Device>;

    /// Associate `backing_fd` with the device (`LOOP_SET_FD`).
    ///
    /// Must return [`crate::HalError::DeviceBusy`] when the device already
    /// has a backing file.
    fn set_fd(&self, device: &Self::Device, backing_fd: RawFd) -> HalResult<()>;

    /// Apply offset and flags to a bound device (`LOOP_SET_STATUS64`).
    fn set_status(&self, device: &Self::Device, info: &LoopInfo) -> HalResult<()>;

    /// Drop the association made by [`LoopOps::set_fd`] (`LOOP_CLR_FD`).
    fn clear_fd(&self, device: &Self::Device) -> HalResult<()>;
}
