//! CLI argument parsing for loopbind

use crate::config::BindConfig;
use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use std::ffi::OsString;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "loopbind")]
#[command(about = "Bind image files to loop devices, once per session")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// TOML config file (session_dir, max_loop_devices, loop_major, device_prefix, autoclear)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Session directory holding the loop lock files
    #[arg(long, env = "LOOPBIND_SESSION_DIR", global = true)]
    pub session_dir: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Bind IMAGE to a loop device, print the device path and hold the
    /// binding until COMMAND exits (or, without COMMAND, until SIGINT/SIGTERM)
    Bind {
        /// Image file to bind
        image: PathBuf,

        /// Byte offset of the filesystem inside the image
        #[arg(long, default_value_t = 0)]
        offset: u64,

        /// Open the image read-only
        #[arg(long)]
        read_only: bool,

        /// Do not set autoclear (needed when the device must outlive loopbind itself)
        #[arg(long)]
        no_autoclear: bool,

        /// Number of loop slots to scan
        #[arg(long)]
        max_loop_devices: Option<u32>,

        /// Command to run with LOOPBIND_DEVICE set; the binding is held until it exits
        #[arg(last = true)]
        command: Vec<OsString>,
    },
}

impl Cli {
    /// Config file (or defaults) with command-line overrides applied.
    pub fn resolve_config(&self) -> Result<BindConfig> {
        let mut config = match &self.config {
            Some(path) => BindConfig::load(path)?,
            None => BindConfig::default(),
        };
        if let Some(dir) = &self.session_dir {
            config.session_dir = dir.clone();
        }
        match &self.command {
            Command::Bind {
                no_autoclear,
                max_loop_devices,
                ..
            } => {
                if *no_autoclear {
                    config.autoclear = false;
                }
                if let Some(slots) = max_loop_devices {
                    config.max_loop_devices = *slots;
                }
            }
        }
        config.validate()?;
        Ok(config)
    }
}
