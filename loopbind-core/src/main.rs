use anyhow::{Context, Result};
use clap::Parser;
use loopbind_core::cli::{Cli, Command};
use loopbind_core::{hold, logging, BindConfig, Binder, FixedOffset, ImageHandle};
use loopbind_hal::LinuxHal;
use std::ffi::OsString;
use std::path::Path;
use std::process::ExitCode;

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let config = cli.resolve_config()?;

    match &cli.command {
        Command::Bind {
            image,
            offset,
            read_only,
            command,
            ..
        } => run_bind(config, image, *offset, !*read_only, command),
    }
}

fn run_bind(
    config: BindConfig,
    image: &Path,
    offset: u64,
    writable: bool,
    command: &[OsString],
) -> Result<ExitCode> {
    let mut handle = ImageHandle::open(image, writable)
        .with_context(|| format!("Failed to open image {}", image.display()))?;

    // Lives until we return: it owns the device handle, and the lock lease
    // is released when the process exits.
    let mut binder = Binder::new(LinuxHal::new(), FixedOffset(offset), config);
    let outcome = match binder.bind(&mut handle) {
        Ok(outcome) => outcome,
        Err(err) => {
            let phase = err.phase();
            return Err(anyhow::Error::new(err).context(format!("bind failed during {}", phase)));
        }
    };

    let Some(device) = outcome.device() else {
        return Ok(ExitCode::SUCCESS);
    };

    if command.is_empty() {
        let signals = hold::block_shutdown_signals()?;
        println!("{}", device);
        let signal = hold::wait_for_shutdown(&signals)?;
        log::info!("Received {}, releasing {}", signal.as_str(), device);
        Ok(ExitCode::SUCCESS)
    } else {
        println!("{}", device);
        let status = hold::run_with_device(device, command)?;
        Ok(ExitCode::from(hold::exit_code(status)))
    }
}
