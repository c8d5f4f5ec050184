//! Keeping a binding alive after `bind` returns.
//!
//! The lock lease and the device handle only live as long as this process.
//! The binary therefore stays up while the device is in use: for the
//! lifetime of a child command, or until it is asked to shut down.

use anyhow::{Context, Result};
use nix::sys::signal::{SigSet, Signal};
use std::ffi::OsString;
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, ExitStatus};

/// Environment variable carrying the bound device to the child command.
pub const DEVICE_ENV: &str = "LOOPBIND_DEVICE";

/// Signals that end a hold.
pub fn shutdown_signals() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    set.add(Signal::SIGHUP);
    set
}

/// Block the shutdown signals on the calling thread so they queue up for
/// [`wait_for_shutdown`] instead of killing the process.
pub fn block_shutdown_signals() -> Result<SigSet> {
    let set = shutdown_signals();
    set.thread_block()
        .context("Failed to block shutdown signals")?;
    Ok(set)
}

pub fn wait_for_shutdown(set: &SigSet) -> Result<Signal> {
    log::debug!("Holding binding until SIGINT, SIGTERM or SIGHUP");
    set.wait().context("Failed to wait for shutdown signal")
}

/// Run `command` with [`DEVICE_ENV`] set to `device` and wait for it.
///
/// Shutdown signals are blocked here once the child is running, so an
/// interrupt from the terminal reaches the child while the binding stays up
/// until it exits.
pub fn run_with_device(device: &str, command: &[OsString]) -> Result<ExitStatus> {
    let (program, args) = command.split_first().context("No command given")?;
    let name = program.to_string_lossy();

    log::info!("Running {} with {}={}", name, DEVICE_ENV, device);
    let mut child = Command::new(program)
        .args(args)
        .env(DEVICE_ENV, device)
        .spawn()
        .with_context(|| format!("Failed to start {}", name))?;

    block_shutdown_signals()?;
    let status = child
        .wait()
        .with_context(|| format!("Failed to wait for {}", name))?;
    log::debug!("{} exited with {}", name, status);
    Ok(status)
}

/// Exit code for the binary: the child's own code, or 128 + signal number
/// when it was killed.
pub fn exit_code(status: ExitStatus) -> u8 {
    match (status.code(), status.signal()) {
        (Some(code), _) => (code & 0xff) as u8,
        (None, Some(signal)) => (128 + signal).min(255) as u8,
        (None, None) => 1,
    }
}
