//! Linux HAL implementation using real system calls.

use super::{LoopInfo, LoopOps, PrivilegeOps, LO_NAME_SIZE};
use crate::{HalError, HalResult};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use nix::unistd::{geteuid, getuid, seteuid, Uid};
use std::fs::{self, File, OpenOptions};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

// Request numbers from <linux/loop.h>; the kernel declares them without the
// _IOC encoding, hence the `_bad` ioctl variants.
const LOOP_SET_FD: u32 = 0x4C00;
const LOOP_CLR_FD: u32 = 0x4C01;
const LOOP_SET_STATUS64: u32 = 0x4C04;

const LO_KEY_SIZE: usize = 32;

/// `struct loop_info64`.
#[repr(C)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; LO_NAME_SIZE],
    lo_crypt_name: [u8; LO_NAME_SIZE],
    lo_encrypt_key: [u8; LO_KEY_SIZE],
    lo_init: [u64; 2],
}

impl From<&LoopInfo> for LoopInfo64 {
    fn from(info: &LoopInfo) -> Self {
        let mut lo_file_name = [0u8; LO_NAME_SIZE];
        if let Some(name) = &info.file_name {
            // Keep the trailing NUL.
            let bytes = name.as_os_str().as_bytes();
            let len = bytes.len().min(LO_NAME_SIZE - 1);
            lo_file_name[..len].copy_from_slice(&bytes[..len]);
        }

        Self {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: info.offset,
            lo_sizelimit: 0,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags: info.flags,
            lo_file_name,
            lo_crypt_name: [0u8; LO_NAME_SIZE],
            lo_encrypt_key: [0u8; LO_KEY_SIZE],
            lo_init: [0; 2],
        }
    }
}

nix::ioctl_write_int_bad!(loop_set_fd, LOOP_SET_FD);
nix::ioctl_none_bad!(loop_clr_fd, LOOP_CLR_FD);
nix::ioctl_write_ptr_bad!(loop_set_status64, LOOP_SET_STATUS64, LoopInfo64);

/// Real HAL implementation for Linux systems.
#[derive(Debug, Clone, Default)]
pub struct LinuxHal;

impl LinuxHal {
    pub fn new() -> Self {
        Self
    }
}

fn map_nix_err(err: nix::errno::Errno) -> HalError {
    use nix::errno::Errno;
    match err {
        Errno::EBUSY => HalError::DeviceBusy,
        Errno::EACCES | Errno::EPERM => HalError::PermissionDenied,
        other => HalError::Nix(other),
    }
}

impl LoopOps for LinuxHal {
    type Device = File;

    fn is_block_device(&self, path: &Path) -> HalResult<bool> {
        match fs::metadata(path) {
            Ok(meta) => Ok(meta.file_type().is_block_device()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(HalError::Io(err)),
        }
    }

    fn create_block_node(&self, path: &Path, major: u32, minor: u32) -> HalResult<()> {
        let mode = Mode::from_bits_truncate(0o644);
        let dev = makedev(u64::from(major), u64::from(minor));
        mknod(path, SFlag::S_IFBLK, mode, dev).map_err(map_nix_err)
    }

    fn open_device(&self, path: &Path) -> HalResult<File> {
        Ok(OpenOptions::new().read(true).write(true).open(path)?)
    }

    fn set_fd(&self, device: &File, backing_fd: RawFd) -> HalResult<()> {
        // SAFETY: both descriptors are open for the duration of the call.
        unsafe { loop_set_fd(device.as_raw_fd(), backing_fd) }.map_err(map_nix_err)?;
        Ok(())
    }

    fn set_status(&self, device: &File, info: &LoopInfo) -> HalResult<()> {
        let raw = LoopInfo64::from(info);
        // SAFETY: `raw` is a live `struct loop_info64` the kernel only reads.
        unsafe { loop_set_status64(device.as_raw_fd(), &raw) }.map_err(map_nix_err)?;
        Ok(())
    }

    fn clear_fd(&self, device: &File) -> HalResult<()> {
        // SAFETY: `device` is an open loop device descriptor.
        unsafe { loop_clr_fd(device.as_raw_fd()) }.map_err(map_nix_err)?;
        Ok(())
    }
}

impl PrivilegeOps for LinuxHal {
    fn escalate(&self) -> HalResult<()> {
        if geteuid().is_root() {
            return Ok(());
        }
        seteuid(Uid::from_raw(0)).map_err(map_nix_err)
    }

    fn drop_privileges(&self) -> HalResult<()> {
        let real = getuid();
        if geteuid() == real {
            return Ok(());
        }
        seteuid(real).map_err(map_nix_err)
    }
}
