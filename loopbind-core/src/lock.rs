//! Per-image lock records deciding which process binds the image.
//!
//! All processes of a session that target the same image open the same
//! `<session_dir>/loop_lock.<image_id>` file. Whoever wins a non-blocking
//! exclusive `flock` is the leader and binds the device; everybody else waits
//! for a shared lock and reads the device path the leader wrote into the file.
//!
//! The leader publishes before it downgrades, so a follower that obtains the
//! shared lock always sees a complete record.

use crate::errors::{BindError, BindResult};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use once_cell::sync::Lazy;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const LOCK_FILE_PREFIX: &str = "loop_lock.";

/// Leases handed over by [`SessionLease::retain_for_process`]. Never drained.
static RETAINED_LEASES: Lazy<Mutex<Vec<SessionLease>>> = Lazy::new(|| Mutex::new(Vec::new()));

pub fn lock_file_path(session_dir: &Path, image_id: &str) -> PathBuf {
    session_dir.join(format!("{}{}", LOCK_FILE_PREFIX, image_id))
}

/// Number of leases kept alive for the rest of the process.
pub fn retained_lease_count() -> usize {
    match RETAINED_LEASES.lock() {
        Ok(leases) => leases.len(),
        Err(poisoned) => poisoned.into_inner().len(),
    }
}

/// Outcome of [`LockCoordinator::acquire`].
#[derive(Debug)]
pub enum Role {
    /// This process must bind the device, then publish and downgrade.
    Leader(LeaderLease),
    /// Another process already bound (or is binding) the image.
    Follower { device: String, lease: SessionLease },
}

#[derive(Debug, Clone)]
pub struct LockCoordinator {
    session_dir: PathBuf,
}

impl LockCoordinator {
    pub fn new(session_dir: impl Into<PathBuf>) -> Self {
        Self {
            session_dir: session_dir.into(),
        }
    }

    pub fn lock_path(&self, image_id: &str) -> PathBuf {
        lock_file_path(&self.session_dir, image_id)
    }

    /// Decide whether the caller leads the bind for `image_id`.
    ///
    /// Blocks without a timeout while another process holds the exclusive
    /// lock.
    pub fn acquire(&self, image_id: &str) -> BindResult<Role> {
        let path = self.lock_path(image_id);
        let lock_err = |source: io::Error| BindError::LockFile {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.session_dir).map_err(lock_err)?;

        log::debug!("Opening image loop device lock file: {}", path.display());
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .mode(0o644)
            .open(&path)
            .map_err(lock_err)?;

        log::debug!("Requesting exclusive flock() on loop lock file");
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                // Whatever is in the file was left by a process that is gone.
                lock.set_len(0).map_err(lock_err)?;
                log::debug!("Acquired exclusive lock, leading bind of {}", image_id);
                Ok(Role::Leader(LeaderLease { path, lock }))
            }
            Err((file, errno)) if errno == Errno::EWOULDBLOCK => {
                log::trace!("Did not get exclusive lock on loop lock file, assuming bind is active");
                let (device, lease) = wait_for_leader(path, file)?;
                Ok(Role::Follower { device, lease })
            }
            Err((_, errno)) => Err(lock_err(io::Error::from(errno))),
        }
    }
}

fn wait_for_leader(path: PathBuf, file: File) -> BindResult<(String, SessionLease)> {
    log::debug!("Waiting to obtain shared lock on loop lock file");
    let lock = match Flock::lock(file, FlockArg::LockShared) {
        Ok(lock) => lock,
        Err((_, errno)) => {
            return Err(BindError::LockFile {
                path,
                source: io::Error::from(errno),
            })
        }
    };

    log::debug!("Obtaining cached loop device name");
    let device = match read_record(&lock) {
        Ok(device) => device,
        Err(source) => return Err(BindError::LockFile { path, source }),
    };
    if device.is_empty() {
        return Err(BindError::EmptyLockRecord { path });
    }

    log::debug!("Active loop lock bind found: {}", device);
    Ok((device, SessionLease { path, lock }))
}

fn read_record(file: &File) -> io::Result<String> {
    let mut reader = file;
    reader.seek(SeekFrom::Start(0))?;
    let mut content = String::new();
    reader.read_to_string(&mut content)?;
    Ok(content.trim().to_string())
}

fn write_record(file: &File, device: &str) -> io::Result<()> {
    file.set_len(0)?;
    file.write_all_at(device.as_bytes(), 0)?;
    file.sync_data()
}

/// Exclusive hold on an image's lock record.
pub struct LeaderLease {
    path: PathBuf,
    lock: Flock<File>,
}

impl LeaderLease {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record the bound device for followers. Call only after a successful bind.
    pub fn publish(&mut self, device: &str) -> BindResult<()> {
        log::debug!(
            "Writing active loop device name ({}) to loop file cache: {}",
            device,
            self.path.display()
        );
        write_record(&self.lock, device).map_err(|source| BindError::Persistence {
            path: self.path.clone(),
            device: device.to_string(),
            source,
        })
    }

    /// Turn the exclusive lock into a shared one, releasing waiting followers.
    ///
    /// The device is already bound and published at this point, so a failed
    /// relock is only logged: the lease keeps its exclusive lock and
    /// followers proceed once this process exits.
    pub fn downgrade(self) -> SessionLease {
        log::debug!("Resetting exclusive flock() to shared on lock file");
        let result = self.lock.relock(FlockArg::LockSharedNonblock);
        self.settle_downgrade(result)
    }

    fn settle_downgrade(self, result: nix::Result<()>) -> SessionLease {
        let LeaderLease { path, lock } = self;
        if let Err(errno) = result {
            log::warn!(
                "Could not downgrade loop lock {} to shared, keeping it exclusive: {}",
                path.display(),
                errno
            );
        }
        SessionLease { path, lock }
    }
}

impl fmt::Debug for LeaderLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaderLease")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Shared hold on an image's lock record.
///
/// While any process of the session holds one, later processes see the bind
/// as done and follow. It is therefore never released early: use
/// [`SessionLease::retain_for_process`] rather than dropping it.
pub struct SessionLease {
    path: PathBuf,
    lock: Flock<File>,
}

impl SessionLease {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn retain_for_process(self) {
        log::trace!("Retaining loop lock {} for process lifetime", self.path.display());
        match RETAINED_LEASES.lock() {
            Ok(mut leases) => leases.push(self),
            Err(poisoned) => poisoned.into_inner().push(self),
        }
    }
}

impl fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLease")
            .field("path", &self.path)
            .field("fd", &std::os::fd::AsRawFd::as_raw_fd(&*self.lock))
            .finish()
    }
}
