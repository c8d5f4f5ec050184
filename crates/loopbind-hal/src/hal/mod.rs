//! HAL trait definitions and implementations.
//!
//! This module defines the core traits for loop device and privilege
//! operations and provides both real (LinuxHal) and fake (FakeHal)
//! implementations.

pub mod fake_hal;
pub mod guards;
pub mod linux_hal;
pub mod loop_ops;
pub mod privilege_ops;

pub use fake_hal::{FakeHal, FakeLoopDevice, Operation};
pub use guards::{LoopGuard, PrivilegeGuard};
pub use linux_hal::LinuxHal;
pub use loop_ops::{LoopInfo, LoopOps, LOOP_MAJOR, LO_FLAGS_AUTOCLEAR, LO_NAME_SIZE};
pub use privilege_ops::PrivilegeOps;

/// Complete HAL needed to bind an image: loop ioctls plus privilege control.
pub trait BindHal: LoopOps + PrivilegeOps + Send + Sync {}

/// Automatically implement BindHal for any type implementing all required traits.
impl<T> BindHal for T where T: LoopOps + PrivilegeOps + Send + Sync {}
