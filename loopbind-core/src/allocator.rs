//! Loop slot scanning and binding.
//!
//! The slot namespace is host-global and nobody locks it. Collisions with
//! other processes binding the same slot are absorbed by the probe-and-skip
//! scan: a slot that turns out busy or unusable is marked and passed over.

use crate::config::BindConfig;
use crate::errors::{BindError, BindResult};
use loopbind_hal::path::loop_device_path;
use loopbind_hal::{HalError, LoopGuard, LoopInfo, LoopOps};
use std::os::fd::RawFd;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Not probed yet, or the probe failed for a reason other than "busy".
    Unknown,
    /// Opened successfully and not yet claimed.
    Free,
    /// Associated with a backing file (ours or someone else's).
    Bound,
}

/// What one scan learned about the `N` candidate slots.
#[derive(Debug, Clone)]
pub struct SlotTable {
    prefix: String,
    major: u32,
    states: Vec<SlotState>,
}

impl SlotTable {
    pub fn new(prefix: impl Into<String>, major: u32, slots: u32) -> Self {
        Self {
            prefix: prefix.into(),
            major,
            states: vec![SlotState::Unknown; slots as usize],
        }
    }

    pub fn from_config(config: &BindConfig) -> Self {
        Self::new(
            config.device_prefix.clone(),
            config.loop_major,
            config.max_loop_devices,
        )
    }

    fn len(&self) -> u32 {
        self.states.len() as u32
    }

    pub fn path(&self, slot: u32) -> String {
        loop_device_path(&self.prefix, slot)
    }

    pub fn state(&self, slot: u32) -> Option<SlotState> {
        self.states.get(slot as usize).copied()
    }

    pub fn count(&self, state: SlotState) -> u32 {
        self.states.iter().filter(|s| **s == state).count() as u32
    }

    fn mark(&mut self, slot: u32, state: SlotState) {
        if let Some(entry) = self.states.get_mut(slot as usize) {
            *entry = state;
        }
    }
}

/// A loop device freshly bound to the image. Dropping `handle` closes the
/// node; with autoclear set that releases the binding once nothing else
/// holds the device.
#[derive(Debug)]
pub struct BoundDevice<D> {
    pub slot: u32,
    pub path: String,
    pub handle: D,
}

/// Binds the image to the first usable slot. Must only run with elevated
/// privileges, in the leader.
pub struct DeviceAllocator<'a, H: LoopOps> {
    hal: &'a H,
    table: SlotTable,
}

impl<'a, H: LoopOps> DeviceAllocator<'a, H> {
    pub fn new(hal: &'a H, table: SlotTable) -> Self {
        Self { hal, table }
    }

    pub fn table(&self) -> &SlotTable {
        &self.table
    }

    pub fn bind_next(
        &mut self,
        backing_fd: RawFd,
        info: &LoopInfo,
    ) -> BindResult<BoundDevice<H::Device>> {
        log::debug!("Finding next available loop device...");

        for slot in 0..self.table.len() {
            let path = self.table.path(slot);
            let node = Path::new(&path);

            let present = match self.hal.is_block_device(node) {
                Ok(present) => present,
                Err(err) => {
                    log::debug!("Could not stat {}: {}", path, err);
                    false
                }
            };
            if !present {
                log::debug!("Creating loop device node {}", path);
                self.hal
                    .create_block_node(node, self.table.major, slot)
                    .map_err(|source| BindError::DeviceNodeCreation {
                        device: path.clone(),
                        source,
                    })?;
            }

            let device = match self.hal.open_device(node) {
                Ok(device) => device,
                Err(err) => {
                    log::info!("Could not open loop device {}: {}", path, err);
                    self.table.mark(slot, SlotState::Unknown);
                    continue;
                }
            };
            self.table.mark(slot, SlotState::Free);

            match self.hal.set_fd(&device, backing_fd) {
                Ok(()) => {
                    self.table.mark(slot, SlotState::Bound);
                    log::info!("Found available loop device: {}", path);
                    return match configure(self.hal, &device, &path, info) {
                        Ok(()) => Ok(BoundDevice {
                            slot,
                            path,
                            handle: device,
                        }),
                        Err(err) => {
                            self.table.mark(slot, SlotState::Free);
                            Err(err)
                        }
                    };
                }
                Err(HalError::DeviceBusy) => {
                    log::trace!("{} is already associated, trying next slot", path);
                    self.table.mark(slot, SlotState::Bound);
                }
                Err(err) => {
                    log::warn!("Could not associate image to loop {}: {}", path, err);
                    self.table.mark(slot, SlotState::Unknown);
                }
            }
        }

        let busy = self.table.count(SlotState::Bound);
        log::error!(
            "No loop device available: scanned {} slots, {} busy",
            self.table.len(),
            busy
        );
        Err(BindError::DeviceExhausted {
            slots: self.table.len(),
            busy,
        })
    }
}

/// Apply `info`; on failure the fresh association is cleared before the
/// error is returned.
fn configure<H: LoopOps>(
    hal: &H,
    device: &H::Device,
    path: &str,
    info: &LoopInfo,
) -> BindResult<()> {
    let guard = LoopGuard::new(hal, device, path);
    log::debug!(
        "Setting loop device flags (offset={}, autoclear={})",
        info.offset,
        info.autoclear()
    );
    if let Err(source) = hal.set_status(device, info) {
        log::error!("Failed to set loop flags on loop device {}: {}", path, source);
        drop(guard);
        return Err(BindError::Configuration {
            device: path.to_string(),
            source,
        });
    }
    guard.release();
    Ok(())
}
