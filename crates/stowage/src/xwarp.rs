//! Flash-mirroring (xwarp) control.
//!
//! Some platforms mirror their raw flash onto the secure area of
//! external media through a kernel knob. Enable points the kernel at a
//! backing file; status reports readiness, mirror position, and the
//! maximum mirror size.

use std::fs;
use std::path::PathBuf;

use stowage_common::StowageResult;

/// Status of the mirroring engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XwarpStatus {
    /// Whether the mirror is ready for use.
    pub ready: bool,
    /// Current mirror write position.
    pub mirror_position: u64,
    /// Maximum mirror size.
    pub max_size: u64,
}

/// Handle to the kernel mirroring knobs.
#[derive(Debug)]
pub struct Xwarp {
    sysfs_dir: PathBuf,
    backing_file: PathBuf,
}

impl Xwarp {
    /// A controller over the given sysfs directory, mirroring into
    /// `backing_file`.
    #[must_use]
    pub fn new(sysfs_dir: impl Into<PathBuf>, backing_file: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_dir: sysfs_dir.into(),
            backing_file: backing_file.into(),
        }
    }

    /// Start mirroring into the backing file.
    pub fn enable(&self) -> StowageResult<()> {
        fs::write(
            self.sysfs_dir.join("backing-file"),
            self.backing_file.to_string_lossy().as_bytes(),
        )?;
        fs::write(self.sysfs_dir.join("enable"), b"1")?;
        tracing::info!(backing = %self.backing_file.display(), "xwarp mirroring started");
        Ok(())
    }

    /// Stop mirroring.
    pub fn disable(&self) -> StowageResult<()> {
        fs::write(self.sysfs_dir.join("enable"), b"0")?;
        tracing::info!("xwarp mirroring stopped");
        Ok(())
    }

    /// Read the current status.
    pub fn status(&self) -> StowageResult<XwarpStatus> {
        let read_num = |name: &str| -> StowageResult<u64> {
            let raw = fs::read_to_string(self.sysfs_dir.join(name))?;
            Ok(raw.trim().parse().unwrap_or(0))
        };
        Ok(XwarpStatus {
            ready: read_num("ready")? != 0,
            mirror_position: read_num("mirror-position")?,
            max_size: read_num("max-size")?,
        })
    }
}
