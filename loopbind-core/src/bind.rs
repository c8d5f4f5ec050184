//! Top-level bind entry point.

use crate::allocator::{BoundDevice, DeviceAllocator, SlotTable};
use crate::config::BindConfig;
use crate::errors::{BindError, BindResult};
use crate::image::{ImageHandle, OffsetResolver};
use crate::lock::{LockCoordinator, Role};
use loopbind_hal::{BindHal, LoopInfo, LoopOps, PrivilegeGuard};
use std::os::fd::RawFd;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOutcome {
    /// The image is not a regular file; nothing was bound.
    Skipped,
    /// This process bound the device.
    Leader(String),
    /// Another process of the session bound the device.
    Follower(String),
}

impl BindOutcome {
    pub fn device(&self) -> Option<&str> {
        match self {
            BindOutcome::Skipped => None,
            BindOutcome::Leader(device) | BindOutcome::Follower(device) => Some(device),
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, BindOutcome::Leader(_))
    }
}

/// Binds images to loop devices, coordinating with other processes of the
/// same session.
///
/// Devices bound by this binder stay open until it is dropped; with
/// autoclear set the kernel releases them once nothing else holds them.
pub struct Binder<H: BindHal, R: OffsetResolver> {
    hal: H,
    resolver: R,
    config: BindConfig,
    coordinator: LockCoordinator,
    held: Vec<<H as LoopOps>::Device>,
}

impl<H: BindHal, R: OffsetResolver> Binder<H, R> {
    pub fn new(hal: H, resolver: R, config: BindConfig) -> Self {
        let coordinator = LockCoordinator::new(config.session_dir.clone());
        Self {
            hal,
            resolver,
            config,
            coordinator,
            held: Vec::new(),
        }
    }

    /// Number of device handles this binder keeps open.
    pub fn held_devices(&self) -> usize {
        self.held.len()
    }

    /// Bind `image`, setting its loop device on success.
    pub fn bind(&mut self, image: &mut ImageHandle) -> BindResult<BindOutcome> {
        log::debug!("Entered bind for {}", image.path().display());

        if !image.is_regular_file() {
            log::info!("Skipping bind, image is not a file");
            return Ok(BindOutcome::Skipped);
        }

        let backing_fd = match image.raw_fd() {
            Some(fd) if fd >= 0 => fd,
            _ => {
                log::error!("Called bind with no valid file descriptor");
                return Err(BindError::InvalidHandle {
                    path: image.path().to_path_buf(),
                });
            }
        };

        log::debug!("Calculating image offset");
        let offset = self.resolver.resolve_offset(image).map_err(|source| {
            BindError::OffsetResolution {
                path: image.path().to_path_buf(),
                source,
            }
        })?;

        match self.coordinator.acquire(image.id())? {
            Role::Follower { device, lease } => {
                log::debug!("Active loop lock bind in progress, using {}", device);
                lease.retain_for_process();
                image.set_loop_device(device.clone());
                Ok(BindOutcome::Follower(device))
            }
            Role::Leader(mut lease) => {
                let info = LoopInfo::new(offset)
                    .with_autoclear(self.config.autoclear)
                    .with_file_name(image.path());
                let bound = self.allocate(backing_fd, &info)?;
                log::info!("Using loop device: {}", bound.path);

                lease.publish(&bound.path)?;
                lease.downgrade().retain_for_process();

                image.set_loop_device(bound.path.clone());
                self.held.push(bound.handle);
                Ok(BindOutcome::Leader(bound.path))
            }
        }
    }

    /// Run the slot scan with elevated privileges, dropping them on every
    /// exit path.
    fn allocate(
        &self,
        backing_fd: RawFd,
        info: &LoopInfo,
    ) -> BindResult<BoundDevice<<H as LoopOps>::Device>> {
        let guard = PrivilegeGuard::escalate(&self.hal).map_err(BindError::Privilege)?;
        let mut allocator = DeviceAllocator::new(&self.hal, SlotTable::from_config(&self.config));
        let outcome = allocator.bind_next(backing_fd, info);
        guard.release().map_err(BindError::Privilege)?;
        outcome
    }
}
