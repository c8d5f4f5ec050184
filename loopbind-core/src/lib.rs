//! loopbind core library.
//!
//! Binds image files to loop devices so that every process of a session
//! preparing the same image ends up on the same device. The first process to
//! lock the image's record in the session directory binds a free slot and
//! publishes it; the others wait and reuse what it published.

pub mod allocator;
pub mod bind;
pub mod cli;
pub mod config;
pub mod errors;
pub mod hold;
pub mod image;
pub mod lock;
pub mod logging;

pub use allocator::{BoundDevice, DeviceAllocator, SlotState, SlotTable};
pub use bind::{BindOutcome, Binder};
pub use config::BindConfig;
pub use errors::{BindError, BindResult};
pub use image::{FixedOffset, ImageHandle, OffsetResolver};
pub use lock::{LeaderLease, LockCoordinator, Role, SessionLease};
