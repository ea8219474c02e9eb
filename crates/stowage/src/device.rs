//! Block device node management.
//!
//! The daemon publishes every device it has seen as a node under
//! `/dev/block/vold/<major>:<minor>` so mount helpers have a stable path
//! even before udev catches up.

use std::ffi::CString;
use std::fmt;
use std::path::{Path, PathBuf};

use stowage_common::{StowageError, StowageResult};

/// A kernel block device number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Kdev {
    /// Major number.
    pub major: u32,
    /// Minor number.
    pub minor: u32,
}

impl Kdev {
    /// Build from major/minor parts.
    #[must_use]
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for Kdev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// Seam for device-node creation.
pub trait DeviceNodes: Send {
    /// Ensure the node for `dev` exists; returns its path.
    fn ensure_node(&self, dev: Kdev) -> StowageResult<PathBuf>;

    /// Path the node for `dev` lives at (whether or not it exists).
    fn node_path(&self, dev: Kdev) -> PathBuf;

    /// Remove the node for `dev`, ignoring absence.
    fn remove_node(&self, dev: Kdev) -> StowageResult<()>;
}

/// Real implementation creating block special files with `mknod(2)`.
#[derive(Debug)]
pub struct BlockNodes {
    dir: PathBuf,
}

impl BlockNodes {
    /// Nodes are created under `dir`, which is created on demand.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl DeviceNodes for BlockNodes {
    fn ensure_node(&self, dev: Kdev) -> StowageResult<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.node_path(dev);
        let cpath = path_to_cstring(&path)?;
        let rdev = libc::makedev(dev.major, dev.minor);

        // EEXIST is fine; the kernel reuses numbers across re-insertions.
        let rc = unsafe { libc::mknod(cpath.as_ptr(), libc::S_IFBLK | 0o660, rdev) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EEXIST) {
                tracing::error!(node = %path.display(), %err, "mknod failed");
                return Err(err.into());
            }
        }
        Ok(path)
    }

    fn node_path(&self, dev: Kdev) -> PathBuf {
        self.dir.join(dev.to_string())
    }

    fn remove_node(&self, dev: Kdev) -> StowageResult<()> {
        match std::fs::remove_file(self.node_path(dev)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn path_to_cstring(path: &Path) -> StowageResult<CString> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes()).map_err(|_| StowageError::InvalidArgument {
        message: format!("path '{}' contains NUL", path.display()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kdev_display() {
        assert_eq!(Kdev::new(8, 17).to_string(), "8:17");
    }

    #[test]
    fn node_paths() {
        let nodes = BlockNodes::new("/dev/block/vold");
        assert_eq!(
            nodes.node_path(Kdev::new(8, 16)),
            PathBuf::from("/dev/block/vold/8:16")
        );
    }

    #[test]
    fn remove_missing_node_is_ok() {
        let temp = tempfile::tempdir().unwrap();
        let nodes = BlockNodes::new(temp.path());
        assert!(nodes.remove_node(Kdev::new(7, 99)).is_ok());
    }
}
