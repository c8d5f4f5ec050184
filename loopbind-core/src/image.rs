//! Image handles and the offset resolver seam.

use std::fs::{self, File, Metadata, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// An image the caller wants bound to a loop device.
///
/// The bind operation only ever writes [`ImageHandle::loop_device`].
#[derive(Debug)]
pub struct ImageHandle {
    path: PathBuf,
    file: Option<File>,
    id: String,
    loop_device: Option<String>,
}

impl ImageHandle {
    pub fn new(path: impl Into<PathBuf>, id: impl Into<String>, file: Option<File>) -> Self {
        Self {
            path: path.into(),
            file,
            id: id.into(),
            loop_device: None,
        }
    }

    /// Open `path` and derive its identifier from device and inode numbers,
    /// so every process opening the same image agrees on the identifier.
    pub fn open(path: impl Into<PathBuf>, writable: bool) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().read(true).write(writable).open(&path)?;
        let id = image_id(&file.metadata()?);
        Ok(Self::new(path, id, Some(file)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.file.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Loop device the image is bound to, once a bind succeeded.
    pub fn loop_device(&self) -> Option<&str> {
        self.loop_device.as_deref()
    }

    pub(crate) fn set_loop_device(&mut self, device: impl Into<String>) {
        self.loop_device = Some(device.into());
    }

    /// Whether the image path names a regular file (as opposed to e.g. a
    /// block device that needs no loop).
    pub fn is_regular_file(&self) -> bool {
        fs::metadata(&self.path)
            .map(|meta| meta.is_file())
            .unwrap_or(false)
    }
}

/// `"<st_dev>.<st_ino>"`.
pub fn image_id(meta: &Metadata) -> String {
    format!("{}.{}", meta.dev(), meta.ino())
}

/// Computes where the filesystem starts inside an image file.
pub trait OffsetResolver {
    fn resolve_offset(&self, image: &ImageHandle) -> io::Result<u64>;
}

/// Offset known up front (e.g. from the command line).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixedOffset(pub u64);

impl OffsetResolver for FixedOffset {
    fn resolve_offset(&self, _image: &ImageHandle) -> io::Result<u64> {
        Ok(self.0)
    }
}

impl<F> OffsetResolver for F
where
    F: Fn(&ImageHandle) -> io::Result<u64>,
{
    fn resolve_offset(&self, image: &ImageHandle) -> io::Result<u64> {
        self(image)
    }
}
