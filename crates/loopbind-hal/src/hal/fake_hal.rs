//! Fake HAL implementation for testing.
//!
//! This implementation models a loop device namespace in memory and records
//! every operation, allowing for CI-safe testing without root privileges or
//! real loop devices.

use super::{LoopInfo, LoopOps, PrivilegeOps};
use crate::{HalError, HalResult};
use nix::errno::Errno;
use std::collections::{HashMap, HashSet};
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Operation records for testing and verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    CreateNode {
        path: PathBuf,
        major: u32,
        minor: u32,
    },
    Open {
        path: PathBuf,
    },
    SetFd {
        path: PathBuf,
        backing_fd: RawFd,
    },
    SetStatus {
        path: PathBuf,
        info: LoopInfo,
    },
    ClearFd {
        path: PathBuf,
    },
    Escalate,
    DropPrivileges,
}

impl Operation {
    /// Device path the operation targeted, if any.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Operation::CreateNode { path, .. }
            | Operation::Open { path }
            | Operation::SetFd { path, .. }
            | Operation::SetStatus { path, .. }
            | Operation::ClearFd { path } => Some(path),
            Operation::Escalate | Operation::DropPrivileges => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct FakeSlot {
    backing_fd: Option<RawFd>,
    info: Option<LoopInfo>,
}

/// Shared state for FakeHal operations.
#[derive(Debug, Clone, Default)]
struct FakeHalState {
    /// All operations that were recorded
    operations: Vec<Operation>,
    /// Existing device nodes
    nodes: HashMap<PathBuf, FakeSlot>,
    unopenable: HashSet<PathBuf>,
    set_fd_errors: HashMap<PathBuf, Errno>,
    fail_node_creation: bool,
    fail_set_status: bool,
    fail_escalation: bool,
    elevated: bool,
    /// Device operations issued while not elevated
    unprivileged_device_ops: usize,
}

/// Handle returned by [`FakeHal::open_device`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeLoopDevice {
    path: PathBuf,
}

impl FakeLoopDevice {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Fake HAL implementation that records operations without executing them.
///
/// Clones share state, so a single namespace can be handed to several
/// binders running on different threads.
#[derive(Debug, Clone, Default)]
pub struct FakeHal {
    state: Arc<Mutex<FakeHalState>>,
}

impl FakeHal {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeHalState::default())),
        }
    }

    /// A namespace whose first `count` slots already have device nodes.
    pub fn with_nodes(prefix: &str, count: u32) -> Self {
        let hal = Self::new();
        for slot in 0..count {
            hal.add_node(format!("{}{}", prefix, slot));
        }
        hal
    }

    pub fn add_node(&self, path: impl Into<PathBuf>) {
        self.state
            .lock()
            .unwrap()
            .nodes
            .entry(path.into())
            .or_default();
    }

    /// Simulate another process holding the device.
    pub fn prebind(&self, path: impl Into<PathBuf>, backing_fd: RawFd) {
        self.state
            .lock()
            .unwrap()
            .nodes
            .entry(path.into())
            .or_default()
            .backing_fd = Some(backing_fd);
    }

    pub fn mark_unopenable(&self, path: impl Into<PathBuf>) {
        self.state.lock().unwrap().unopenable.insert(path.into());
    }

    /// Make `LOOP_SET_FD` on `path` fail with `errno`.
    pub fn fail_set_fd_with(&self, path: impl Into<PathBuf>, errno: Errno) {
        self.state
            .lock()
            .unwrap()
            .set_fd_errors
            .insert(path.into(), errno);
    }

    pub fn fail_node_creation(&self) {
        self.state.lock().unwrap().fail_node_creation = true;
    }

    pub fn fail_set_status(&self) {
        self.state.lock().unwrap().fail_set_status = true;
    }

    pub fn fail_escalation(&self) {
        self.state.lock().unwrap().fail_escalation = true;
    }

    pub fn has_node(&self, path: &Path) -> bool {
        self.state.lock().unwrap().nodes.contains_key(path)
    }

    pub fn backing_fd(&self, path: &Path) -> Option<RawFd> {
        self.state
            .lock()
            .unwrap()
            .nodes
            .get(path)
            .and_then(|slot| slot.backing_fd)
    }

    pub fn status(&self, path: &Path) -> Option<LoopInfo> {
        self.state
            .lock()
            .unwrap()
            .nodes
            .get(path)
            .and_then(|slot| slot.info.clone())
    }

    /// Devices currently associated with `backing_fd`.
    pub fn devices_bound_to(&self, backing_fd: RawFd) -> Vec<PathBuf> {
        let state = self.state.lock().unwrap();
        let mut devices: Vec<PathBuf> = state
            .nodes
            .iter()
            .filter(|(_, slot)| slot.backing_fd == Some(backing_fd))
            .map(|(path, _)| path.clone())
            .collect();
        devices.sort();
        devices
    }

    pub fn is_elevated(&self) -> bool {
        self.state.lock().unwrap().elevated
    }

    /// Number of node/ioctl operations issued without elevated privileges.
    pub fn unprivileged_device_ops(&self) -> usize {
        self.state.lock().unwrap().unprivileged_device_ops
    }

    /// Get all recorded operations.
    pub fn operations(&self) -> Vec<Operation> {
        self.state.lock().unwrap().operations.clone()
    }

    /// Get the number of operations recorded.
    pub fn operation_count(&self) -> usize {
        self.state.lock().unwrap().operations.len()
    }

    /// Check if a specific operation was recorded.
    pub fn has_operation(&self, check: impl Fn(&Operation) -> bool) -> bool {
        self.state.lock().unwrap().operations.iter().any(check)
    }

    /// Check if any recorded operation targeted `path`.
    pub fn touched(&self, path: &Path) -> bool {
        self.has_operation(|op| op.path() == Some(path))
    }

    fn record_operation(&self, op: Operation) {
        let mut state = self.state.lock().unwrap();
        if op.path().is_some() && !state.elevated {
            state.unprivileged_device_ops += 1;
        }
        state.operations.push(op);
    }
}

impl LoopOps for FakeHal {
    type Device = FakeLoopDevice;

    fn is_block_device(&self, path: &Path) -> HalResult<bool> {
        Ok(self.has_node(path))
    }

    fn create_block_node(&self, path: &Path, major: u32, minor: u32) -> HalResult<()> {
        log::info!("FAKE HAL: mknod {} b {} {}", path.display(), major, minor);
        self.record_operation(Operation::CreateNode {
            path: path.to_path_buf(),
            major,
            minor,
        });

        if self.state.lock().unwrap().fail_node_creation {
            return Err(HalError::PermissionDenied);
        }
        self.add_node(path);
        Ok(())
    }

    fn open_device(&self, path: &Path) -> HalResult<FakeLoopDevice> {
        self.record_operation(Operation::Open {
            path: path.to_path_buf(),
        });

        let state = self.state.lock().unwrap();
        if state.unopenable.contains(path) {
            return Err(HalError::PermissionDenied);
        }
        if !state.nodes.contains_key(path) {
            return Err(HalError::Io(std::io::Error::from(
                std::io::ErrorKind::NotFound,
            )));
        }
        Ok(FakeLoopDevice {
            path: path.to_path_buf(),
        })
    }

    fn set_fd(&self, device: &FakeLoopDevice, backing_fd: RawFd) -> HalResult<()> {
        self.record_operation(Operation::SetFd {
            path: device.path.clone(),
            backing_fd,
        });

        let mut state = self.state.lock().unwrap();
        if let Some(errno) = state.set_fd_errors.get(&device.path) {
            return Err(HalError::Nix(*errno));
        }
        let slot = state
            .nodes
            .get_mut(&device.path)
            .ok_or_else(|| HalError::NotALoopDevice(device.path.display().to_string()))?;
        if slot.backing_fd.is_some() {
            return Err(HalError::DeviceBusy);
        }
        slot.backing_fd = Some(backing_fd);
        log::info!("FAKE HAL: {} -> fd {}", device.path.display(), backing_fd);
        Ok(())
    }

    fn set_status(&self, device: &FakeLoopDevice, info: &LoopInfo) -> HalResult<()> {
        self.record_operation(Operation::SetStatus {
            path: device.path.clone(),
            info: info.clone(),
        });

        let mut state = self.state.lock().unwrap();
        if state.fail_set_status {
            return Err(HalError::Nix(Errno::EINVAL));
        }
        match state.nodes.get_mut(&device.path) {
            Some(slot) if slot.backing_fd.is_some() => {
                slot.info = Some(info.clone());
                Ok(())
            }
            _ => Err(HalError::Nix(Errno::ENXIO)),
        }
    }

    fn clear_fd(&self, device: &FakeLoopDevice) -> HalResult<()> {
        self.record_operation(Operation::ClearFd {
            path: device.path.clone(),
        });

        let mut state = self.state.lock().unwrap();
        match state.nodes.get_mut(&device.path) {
            Some(slot) if slot.backing_fd.is_some() => {
                slot.backing_fd = None;
                slot.info = None;
                Ok(())
            }
            _ => Err(HalError::Nix(Errno::ENXIO)),
        }
    }
}

impl PrivilegeOps for FakeHal {
    fn escalate(&self) -> HalResult<()> {
        self.record_operation(Operation::Escalate);
        let mut state = self.state.lock().unwrap();
        if state.fail_escalation {
            return Err(HalError::PermissionDenied);
        }
        state.elevated = true;
        Ok(())
    }

    fn drop_privileges(&self) -> HalResult<()> {
        self.record_operation(Operation::DropPrivileges);
        self.state.lock().unwrap().elevated = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_fd_reports_busy_for_bound_slot() {
        let hal = FakeHal::with_nodes("/dev/loop", 2);
        hal.prebind("/dev/loop0", 42);

        let dev0 = hal.open_device(Path::new("/dev/loop0")).unwrap();
        assert!(matches!(hal.set_fd(&dev0, 7), Err(HalError::DeviceBusy)));

        let dev1 = hal.open_device(Path::new("/dev/loop1")).unwrap();
        hal.set_fd(&dev1, 7).unwrap();
        assert_eq!(hal.devices_bound_to(7), vec![PathBuf::from("/dev/loop1")]);
    }

    #[test]
    fn open_fails_for_missing_or_unopenable_nodes() {
        let hal = FakeHal::with_nodes("/dev/loop", 1);
        hal.mark_unopenable("/dev/loop0");

        assert!(hal.open_device(Path::new("/dev/loop0")).is_err());
        assert!(hal.open_device(Path::new("/dev/loop1")).is_err());
    }

    #[test]
    fn create_block_node_adds_node() {
        let hal = FakeHal::new();
        let path = Path::new("/dev/loop3");
        assert!(!hal.is_block_device(path).unwrap());

        hal.create_block_node(path, 7, 3).unwrap();

        assert!(hal.is_block_device(path).unwrap());
        assert_eq!(
            hal.operations(),
            vec![Operation::CreateNode {
                path: path.to_path_buf(),
                major: 7,
                minor: 3,
            }]
        );
    }

    #[test]
    fn device_ops_outside_escalation_are_counted() {
        let hal = FakeHal::with_nodes("/dev/loop", 1);
        let _ = hal.open_device(Path::new("/dev/loop0")).unwrap();
        assert_eq!(hal.unprivileged_device_ops(), 1);

        hal.escalate().unwrap();
        let _ = hal.open_device(Path::new("/dev/loop0")).unwrap();
        hal.drop_privileges().unwrap();
        assert_eq!(hal.unprivileged_device_ops(), 1);
    }

    #[test]
    fn clear_fd_requires_association() {
        let hal = FakeHal::with_nodes("/dev/loop", 1);
        let dev = hal.open_device(Path::new("/dev/loop0")).unwrap();
        assert!(hal.clear_fd(&dev).is_err());

        hal.set_fd(&dev, 3).unwrap();
        hal.set_status(&dev, &LoopInfo::new(0)).unwrap();
        hal.clear_fd(&dev).unwrap();
        assert_eq!(hal.backing_fd(dev.path()), None);
        assert_eq!(hal.status(dev.path()), None);
    }
}
