//! Bind configuration (TOML file + CLI overrides).

use anyhow::{bail, Context, Result};
use loopbind_hal::LOOP_MAJOR;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_MAX_LOOP_DEVICES: u32 = 128;
pub const DEFAULT_DEVICE_PREFIX: &str = "/dev/loop";
pub const DEFAULT_SESSION_DIR: &str = "/var/lib/loopbind/session";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct BindConfig {
    /// Per-run scratch directory; lock files live here.
    pub session_dir: PathBuf,
    /// Size of the loop slot namespace that is scanned.
    pub max_loop_devices: u32,
    /// Block major used when creating missing nodes.
    pub loop_major: u32,
    /// Slot `i` lives at `<device_prefix><i>`.
    pub device_prefix: String,
    /// Apply `LO_FLAGS_AUTOCLEAR` after binding.
    pub autoclear: bool,
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            session_dir: PathBuf::from(DEFAULT_SESSION_DIR),
            max_loop_devices: DEFAULT_MAX_LOOP_DEVICES,
            loop_major: LOOP_MAJOR,
            device_prefix: DEFAULT_DEVICE_PREFIX.to_string(),
            autoclear: true,
        }
    }
}

impl BindConfig {
    pub fn with_session_dir(session_dir: impl Into<PathBuf>) -> Self {
        Self {
            session_dir: session_dir.into(),
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: BindConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.session_dir.as_os_str().is_empty() {
            bail!("session_dir must not be empty");
        }
        if self.max_loop_devices == 0 {
            bail!("max_loop_devices must be at least 1");
        }
        if self.device_prefix.is_empty() {
            bail!("device_prefix must not be empty");
        }
        Ok(())
    }
}
