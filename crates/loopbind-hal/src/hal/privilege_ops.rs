//! Privilege elevation operations.

use crate::HalResult;

/// Temporarily raise and lower the effective privileges of the process.
///
/// Callers should not use this directly; wrap the privileged section in a
/// [`crate::PrivilegeGuard`] so the drop happens on every exit path.
pub trait PrivilegeOps {
    fn escalate(&self) -> HalResult<()>;

    fn drop_privileges(&self) -> HalResult<()>;
}
