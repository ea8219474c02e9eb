//! Mount syscall seam.
//!
//! Every mount, bind, move, and unmount the engine performs goes through
//! the [`Mounter`] trait so the state machine can be exercised without
//! privileges. [`SysMounter`] is the real implementation.

use std::ffi::CString;
use std::fs;
use std::path::{Path, PathBuf};

use stowage_common::{StowageError, StowageResult};

/// Options for a plain filesystem mount.
#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    /// Read-only mount.
    pub readonly: bool,
    /// No exec.
    pub noexec: bool,
    /// No suid.
    pub nosuid: bool,
    /// No dev.
    pub nodev: bool,
    /// Synchronous directory updates.
    pub dirsync: bool,
}

impl MountOptions {
    /// Options used when mounting removable media for users.
    #[must_use]
    pub fn media_default() -> Self {
        Self {
            readonly: false,
            noexec: true,
            nosuid: true,
            nodev: true,
            dirsync: true,
        }
    }
}

/// Abstraction over the kernel mount table.
pub trait Mounter: Send {
    /// Mount `device` of type `fstype` at `target` with fs-specific `data`.
    fn mount(
        &self,
        device: &Path,
        target: &Path,
        fstype: &str,
        options: &MountOptions,
        data: &str,
    ) -> StowageResult<()>;

    /// Bind `source` at `target`.
    fn bind(&self, source: &Path, target: &Path) -> StowageResult<()>;

    /// Atomically relocate the mount at `source` to `target` (`MS_MOVE`).
    fn move_mount(&self, source: &Path, target: &Path) -> StowageResult<()>;

    /// Remount `target` read-only in place.
    fn remount_readonly(&self, target: &Path) -> StowageResult<()>;

    /// Unmount `target`.
    fn unmount(&self, target: &Path) -> StowageResult<()>;

    /// Whether `path` appears as a mountpoint in `/proc/mounts`.
    fn is_mountpoint_mounted(&self, path: &Path) -> bool;

    /// The raw `/proc/mounts` lines, for `dump`.
    fn mount_table(&self) -> Vec<String>;
}

/// Real mounter issuing syscalls through rustix.
#[derive(Debug)]
pub struct SysMounter {
    proc_mounts: PathBuf,
}

impl SysMounter {
    /// Create a mounter scanning the given `/proc/mounts` view.
    #[must_use]
    pub fn new(proc_mounts: impl Into<PathBuf>) -> Self {
        Self {
            proc_mounts: proc_mounts.into(),
        }
    }
}

fn map_errno(e: rustix::io::Errno) -> StowageError {
    StowageError::Io(std::io::Error::from_raw_os_error(e.raw_os_error()))
}

impl Mounter for SysMounter {
    fn mount(
        &self,
        device: &Path,
        target: &Path,
        fstype: &str,
        options: &MountOptions,
        data: &str,
    ) -> StowageResult<()> {
        use rustix::mount::{mount, MountFlags};

        tracing::debug!(
            device = %device.display(),
            target = %target.display(),
            fstype,
            ?options,
            "mounting filesystem"
        );

        let mut flags = MountFlags::empty();
        if options.readonly {
            flags |= MountFlags::RDONLY;
        }
        if options.noexec {
            flags |= MountFlags::NOEXEC;
        }
        if options.nosuid {
            flags |= MountFlags::NOSUID;
        }
        if options.nodev {
            flags |= MountFlags::NODEV;
        }
        if options.dirsync {
            flags |= MountFlags::DIRSYNC;
        }

        let fstype_c = CString::new(fstype).map_err(|_| StowageError::InvalidArgument {
            message: format!("fstype '{fstype}' contains NUL"),
        })?;
        let data_c = CString::new(data).map_err(|_| StowageError::InvalidArgument {
            message: "mount data contains NUL".to_string(),
        })?;

        mount(device, target, fstype_c.as_c_str(), flags, data_c.as_c_str()).map_err(map_errno)
    }

    fn bind(&self, source: &Path, target: &Path) -> StowageResult<()> {
        use rustix::mount::mount_bind;

        tracing::debug!(
            source = %source.display(),
            target = %target.display(),
            "creating bind mount"
        );
        mount_bind(source, target).map_err(map_errno)
    }

    fn move_mount(&self, source: &Path, target: &Path) -> StowageResult<()> {
        use rustix::mount::mount_move;

        tracing::debug!(
            source = %source.display(),
            target = %target.display(),
            "moving mount"
        );
        mount_move(source, target).map_err(map_errno)
    }

    fn remount_readonly(&self, target: &Path) -> StowageResult<()> {
        use rustix::mount::{mount_remount, MountFlags};

        tracing::debug!(target = %target.display(), "remounting read-only");
        mount_remount(target, MountFlags::RDONLY, "").map_err(map_errno)
    }

    fn unmount(&self, target: &Path) -> StowageResult<()> {
        use rustix::mount::{unmount, UnmountFlags};

        tracing::debug!(target = %target.display(), "unmounting");
        unmount(target, UnmountFlags::empty()).map_err(map_errno)
    }

    fn is_mountpoint_mounted(&self, path: &Path) -> bool {
        let Ok(table) = fs::read_to_string(&self.proc_mounts) else {
            tracing::error!(proc_mounts = %self.proc_mounts.display(), "cannot read mount table");
            return false;
        };
        let needle = path.to_string_lossy();
        table
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .any(|mountpoint| mountpoint == needle)
    }

    fn mount_table(&self) -> Vec<String> {
        fs::read_to_string(&self.proc_mounts)
            .map(|t| t.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn mount_table_scan() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "/dev/block/vold/8:17 /storage/sdcard1 vfat rw 0 0").unwrap();
        writeln!(file, "proc /proc proc rw 0 0").unwrap();

        let mounter = SysMounter::new(file.path());
        assert!(mounter.is_mountpoint_mounted(Path::new("/storage/sdcard1")));
        assert!(!mounter.is_mountpoint_mounted(Path::new("/storage/sdcard2")));
        assert_eq!(mounter.mount_table().len(), 2);
    }
}
