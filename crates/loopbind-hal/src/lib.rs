//! loopbind hardware abstraction layer (HAL).
//!
//! Everything that touches the kernel (device nodes, loop ioctls, effective
//! uid) sits behind the traits in [`hal`], so the bind protocol can run
//! against [`FakeHal`] in tests and [`LinuxHal`] in production.

pub mod error;
pub mod hal;
pub mod path;

pub use error::{HalError, HalResult};
pub use hal::*;
