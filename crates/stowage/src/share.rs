//! USB mass-storage sharing.
//!
//! Sharing lends a whole block device to the USB gadget: the kernel's
//! mass-storage function exposes whatever device path is written into
//! its LUN file. Unsharing writes an empty string back.

use std::fs;
use std::path::{Path, PathBuf};

use stowage_common::{StowageError, StowageResult};

/// The sharing method names accepted by the control protocol. Only USB
/// mass storage ("ums") is supported.
pub const METHOD_UMS: &str = "ums";

/// Control over the mass-storage gadget LUN.
pub trait ShareController: Send {
    /// Expose `device` over the gadget.
    fn enable(&self, device: &Path) -> StowageResult<()>;

    /// Stop exposing any device.
    fn disable(&self) -> StowageResult<()>;

    /// The currently exposed device path, if any.
    fn shared_device(&self) -> Option<PathBuf>;

    /// Whether the gadget is available at all.
    fn available(&self) -> bool;
}

/// LUN-file-backed implementation.
#[derive(Debug)]
pub struct UmsShare {
    lun_file: PathBuf,
}

impl UmsShare {
    /// Controller writing to the given LUN backing file.
    #[must_use]
    pub fn new(lun_file: impl Into<PathBuf>) -> Self {
        Self {
            lun_file: lun_file.into(),
        }
    }
}

impl ShareController for UmsShare {
    fn enable(&self, device: &Path) -> StowageResult<()> {
        tracing::info!(device = %device.display(), lun = %self.lun_file.display(),
            "sharing device over mass storage");
        fs::write(&self.lun_file, device.to_string_lossy().as_bytes())
            .map_err(StowageError::from)
    }

    fn disable(&self) -> StowageResult<()> {
        tracing::info!(lun = %self.lun_file.display(), "disabling mass storage share");
        fs::write(&self.lun_file, b"").map_err(StowageError::from)
    }

    fn shared_device(&self) -> Option<PathBuf> {
        let contents = fs::read_to_string(&self.lun_file).ok()?;
        let trimmed = contents.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(PathBuf::from(trimmed))
        }
    }

    fn available(&self) -> bool {
        self.lun_file.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enable_disable_round_trip() {
        let temp = tempfile::tempdir().unwrap();
        let lun = temp.path().join("lun0_file");
        fs::write(&lun, b"").unwrap();

        let share = UmsShare::new(&lun);
        assert!(share.available());
        assert_eq!(share.shared_device(), None);

        share.enable(Path::new("/dev/block/vold/8:16")).unwrap();
        assert_eq!(
            share.shared_device(),
            Some(PathBuf::from("/dev/block/vold/8:16"))
        );

        share.disable().unwrap();
        assert_eq!(share.shared_device(), None);
    }

    #[test]
    fn missing_lun_file_is_unavailable() {
        let share = UmsShare::new("/nonexistent/lun0_file");
        assert!(!share.available());
        assert_eq!(share.shared_device(), None);
    }
}
