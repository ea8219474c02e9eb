//! Filesystem trim (`fstrim dotrim`).
//!
//! Issues `FITRIM` over every writable block-backed filesystem in the
//! mount table. Filesystems that do not support trim are skipped.

use std::fs::File;
use std::path::Path;

use stowage_common::StowageResult;

use crate::mounter::Mounter;

#[repr(C)]
struct FstrimRange {
    start: u64,
    len: u64,
    minlen: u64,
}

// _IOWR('X', 121, struct fstrim_range)
const FITRIM: libc::c_ulong = 0xc018_5879;

/// Trim one mounted filesystem. Unsupported filesystems return `Ok`.
pub fn trim_filesystem(mountpoint: &Path) -> StowageResult<()> {
    let dir = File::open(mountpoint)?;
    let mut range = FstrimRange {
        start: 0,
        len: u64::MAX,
        minlen: 0,
    };

    // SAFETY: the fd is open and range outlives the call.
    let rc = unsafe {
        libc::ioctl(
            std::os::fd::AsRawFd::as_raw_fd(&dir),
            FITRIM,
            std::ptr::addr_of_mut!(range),
        )
    };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EOPNOTSUPP) | Some(libc::ENOTTY) => {
                tracing::debug!(mountpoint = %mountpoint.display(), "trim not supported");
                Ok(())
            }
            _ => Err(err.into()),
        }
    } else {
        tracing::info!(mountpoint = %mountpoint.display(), trimmed = range.len, "trimmed");
        Ok(())
    }
}

/// Trim every writable `/dev`-backed filesystem in the mount table.
/// Returns the number of filesystems trimmed.
pub fn trim_all(mounter: &dyn Mounter) -> usize {
    let mut trimmed = 0;
    for line in mounter.mount_table() {
        let mut fields = line.split_whitespace();
        let (Some(device), Some(mountpoint), Some(_fstype), Some(opts)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if !device.starts_with("/dev/") || opts.split(',').any(|o| o == "ro") {
            continue;
        }
        match trim_filesystem(Path::new(mountpoint)) {
            Ok(()) => trimmed += 1,
            Err(err) => {
                tracing::warn!(%err, mountpoint, "trim failed");
            }
        }
    }
    trimmed
}
