//! Filesystem paths owned by the stowage daemon.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default root the daemon operates under. Overridable for tests and
/// sandboxed runs; every managed path hangs off this root.
pub static STOWAGE_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("STOWAGE_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/"))
});

/// The filesystem layout the daemon owns.
///
/// Fixed mountpoints and device-node directories are derived from a
/// single root so test suites can point an entire manager instance at a
/// scratch directory.
#[derive(Debug, Clone)]
pub struct StowagePaths {
    root: PathBuf,
}

impl StowagePaths {
    /// Paths rooted at the platform default (`/`, or `$STOWAGE_ROOT`).
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: STOWAGE_ROOT.clone(),
        }
    }

    /// Paths rooted at a custom directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding created block-device nodes (`<major>:<minor>`).
    #[must_use]
    pub fn device_nodes(&self) -> PathBuf {
        self.root.join("dev/block/vold")
    }

    /// Node path for a specific device.
    #[must_use]
    pub fn device_node(&self, major: u32, minor: u32) -> PathBuf {
        self.device_nodes().join(format!("{major}:{minor}"))
    }

    /// Private staging mountpoint used during probe/mount.
    #[must_use]
    pub fn staging(&self) -> PathBuf {
        self.root.join("mnt/secure/staging")
    }

    /// Bind target for the `.android_secure` subtree.
    #[must_use]
    pub fn secure_asec(&self) -> PathBuf {
        self.root.join("mnt/secure/asec")
    }

    /// Internal ASEC image directory (non-removable storage).
    #[must_use]
    pub fn internal_asec_images(&self) -> PathBuf {
        self.root.join("data/app-asec")
    }

    /// Mountpoint root for secure containers (`/mnt/asec/<id>`).
    #[must_use]
    pub fn asec_mounts(&self) -> PathBuf {
        self.root.join("mnt/asec")
    }

    /// Mountpoint for a specific secure container.
    #[must_use]
    pub fn asec_mount(&self, id: &str) -> PathBuf {
        self.asec_mounts().join(id)
    }

    /// Mountpoint root for OBB containers.
    #[must_use]
    pub fn obb_mounts(&self) -> PathBuf {
        self.root.join("mnt/obb")
    }

    /// Mountpoint root for ISO images.
    #[must_use]
    pub fn iso_mounts(&self) -> PathBuf {
        self.root.join("mnt/iso")
    }

    /// Mountpoint root for Samba shares.
    #[must_use]
    pub fn samba_mounts(&self) -> PathBuf {
        self.root.join("mnt/samba")
    }

    /// User-visible storage root (`/storage/<label>`).
    #[must_use]
    pub fn storage(&self) -> PathBuf {
        self.root.join("storage")
    }

    /// The `/proc/mounts` view to scan for live mountpoints.
    #[must_use]
    pub fn proc_mounts(&self) -> PathBuf {
        self.root.join("proc/mounts")
    }

    /// The `/proc` root used for open-file-holder scans.
    #[must_use]
    pub fn proc(&self) -> PathBuf {
        self.root.join("proc")
    }

    /// Create the directories the daemon expects at startup.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.device_nodes())?;
        std::fs::create_dir_all(self.staging())?;
        std::fs::create_dir_all(self.secure_asec())?;
        std::fs::create_dir_all(self.internal_asec_images())?;
        std::fs::create_dir_all(self.asec_mounts())?;
        std::fs::create_dir_all(self.obb_mounts())?;
        std::fs::create_dir_all(self.iso_mounts())?;
        std::fs::create_dir_all(self.samba_mounts())?;
        std::fs::create_dir_all(self.storage())?;
        Ok(())
    }
}

impl Default for StowagePaths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_under_root() {
        let paths = StowagePaths::with_root("/tmp/stowage-test");
        assert_eq!(
            paths.staging(),
            PathBuf::from("/tmp/stowage-test/mnt/secure/staging")
        );
        assert_eq!(
            paths.device_node(8, 17),
            PathBuf::from("/tmp/stowage-test/dev/block/vold/8:17")
        );
        assert_eq!(
            paths.asec_mount("com.example.app-1"),
            PathBuf::from("/tmp/stowage-test/mnt/asec/com.example.app-1")
        );
    }

    #[test]
    fn create_dirs() {
        let temp = tempfile::tempdir().unwrap();
        let paths = StowagePaths::with_root(temp.path());
        paths.create_dirs().unwrap();
        assert!(paths.staging().is_dir());
        assert!(paths.samba_mounts().is_dir());
    }
}
