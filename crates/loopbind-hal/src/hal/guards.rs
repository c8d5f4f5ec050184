use crate::{HalResult, LoopOps, PrivilegeOps};

/// RAII guard that holds elevated privileges and drops them when dropped.
///
/// Prefer [`PrivilegeGuard::release`] on the normal path so a failing drop
/// is reported; `Drop` only logs.
#[derive(Debug)]
pub struct PrivilegeGuard<'a, P: PrivilegeOps + ?Sized> {
    ops: &'a P,
    active: bool,
}

impl<'a, P: PrivilegeOps + ?Sized> PrivilegeGuard<'a, P> {
    pub fn escalate(ops: &'a P) -> HalResult<Self> {
        ops.escalate()?;
        log::trace!("privileges escalated");
        Ok(Self { ops, active: true })
    }

    /// Drop privileges now and surface any failure.
    pub fn release(mut self) -> HalResult<()> {
        self.active = false;
        self.ops.drop_privileges()?;
        log::trace!("privileges dropped");
        Ok(())
    }
}

impl<'a, P: PrivilegeOps + ?Sized> Drop for PrivilegeGuard<'a, P> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Err(err) = self.ops.drop_privileges() {
            log::error!("privilege guard failed to drop privileges: {}", err);
        }
    }
}

/// RAII guard that clears a fresh loop association when dropped.
pub struct LoopGuard<'a, H: LoopOps + ?Sized> {
    hal: &'a H,
    device: &'a H::Device,
    loop_device: String,
    active: bool,
}

impl<'a, H: LoopOps + ?Sized> LoopGuard<'a, H> {
    pub fn new(hal: &'a H, device: &'a H::Device, loop_device: impl Into<String>) -> Self {
        Self {
            hal,
            device,
            loop_device: loop_device.into(),
            active: true,
        }
    }

    /// Keep the association and return the loop device path.
    pub fn release(mut self) -> String {
        self.active = false;
        self.loop_device.clone()
    }
}

impl<'a, H: LoopOps + ?Sized> Drop for LoopGuard<'a, H> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        log::debug!("clearing loop association on {}", self.loop_device);
        if let Err(err) = self.hal.clear_fd(self.device) {
            log::warn!("loop guard failed to clear {}: {}", self.loop_device, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FakeHal, Operation};
    use std::path::Path;

    #[test]
    fn privilege_guard_drops_on_scope_exit() {
        let hal = FakeHal::new();
        {
            let _guard = PrivilegeGuard::escalate(&hal).unwrap();
            assert!(hal.is_elevated());
        }
        assert!(!hal.is_elevated());
        assert_eq!(
            hal.operations(),
            vec![Operation::Escalate, Operation::DropPrivileges]
        );
    }

    #[test]
    fn privilege_guard_release_drops_once() {
        let hal = FakeHal::new();
        let guard = PrivilegeGuard::escalate(&hal).unwrap();
        guard.release().unwrap();
        assert!(!hal.is_elevated());
        assert_eq!(hal.operation_count(), 2);
    }

    #[test]
    fn privilege_guard_propagates_escalation_failure() {
        let hal = FakeHal::new();
        hal.fail_escalation();
        assert!(PrivilegeGuard::escalate(&hal).is_err());
        assert!(!hal.has_operation(|op| matches!(op, Operation::DropPrivileges)));
    }

    #[test]
    fn loop_guard_clears_on_drop() {
        let hal = FakeHal::with_nodes("/dev/loop", 1);
        let path = Path::new("/dev/loop0");
        let device = hal.open_device(path).unwrap();
        hal.set_fd(&device, 9).unwrap();

        {
            let _guard = LoopGuard::new(&hal, &device, "/dev/loop0");
        }

        assert_eq!(hal.backing_fd(path), None);
        assert!(hal.has_operation(|op| matches!(op, Operation::ClearFd { .. })));
    }

    #[test]
    fn loop_guard_release_keeps_association() {
        let hal = FakeHal::with_nodes("/dev/loop", 1);
        let path = Path::new("/dev/loop0");
        let device = hal.open_device(path).unwrap();
        hal.set_fd(&device, 9).unwrap();

        let guard = LoopGuard::new(&hal, &device, "/dev/loop0");
        assert_eq!(guard.release(), "/dev/loop0");

        assert_eq!(hal.backing_fd(path), Some(9));
    }
}
