//! Device-mapper crypt mappings for keyed containers.
//!
//! Secure containers created with a key get a dm-crypt layer between the
//! loop device and the filesystem. Like the loop pool this is a counted
//! allocator behind a seam; the production implementation drives
//! `dmsetup`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use parking_lot::Mutex;

use stowage_common::{StowageError, StowageResult};

/// Upper bound on simultaneously mapped containers.
pub const DM_MAX: usize = 4096;

/// Seam for dm-crypt mapping management.
pub trait DmAllocator: Send {
    /// Create a crypt mapping named `name` over `device` using `key`;
    /// returns the mapped device path.
    fn create(
        &self,
        name: &str,
        device: &Path,
        key: &str,
        size_sectors: u64,
    ) -> StowageResult<PathBuf>;

    /// Remove the mapping named `name`.
    fn remove(&self, name: &str) -> StowageResult<()>;

    /// The mapped device for `name`, if any.
    fn lookup(&self, name: &str) -> Option<PathBuf>;

    /// Human-readable pool state for `dump`.
    fn dump_state(&self) -> Vec<String>;
}

/// Pool driving the kernel device-mapper through `dmsetup`.
#[derive(Debug, Default)]
pub struct DmPool {
    active: Mutex<HashMap<String, PathBuf>>,
}

impl DmPool {
    /// Empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl DmAllocator for DmPool {
    fn create(
        &self,
        name: &str,
        device: &Path,
        key: &str,
        size_sectors: u64,
    ) -> StowageResult<PathBuf> {
        use std::io::Write;

        let mut active = self.active.lock();
        if active.len() >= DM_MAX {
            return Err(StowageError::busy("device-mapper pool exhausted"));
        }
        if active.contains_key(name) {
            return Err(StowageError::ContainerExists {
                id: name.to_string(),
            });
        }

        // Table is fed on stdin so the key never shows up in argv.
        let table = format!(
            "0 {size_sectors} crypt twofish {key} 0 {} 0",
            device.display()
        );
        let mut child = Command::new("dmsetup")
            .args(["create", name])
            .stdin(Stdio::piped())
            .spawn()?;
        child
            .stdin
            .as_mut()
            .ok_or_else(|| StowageError::internal("dmsetup stdin unavailable"))?
            .write_all(table.as_bytes())?;
        let status = child.wait()?;
        if !status.success() {
            return Err(StowageError::internal(format!(
                "dmsetup create {name} exited with {status}"
            )));
        }

        let mapped = PathBuf::from(format!("/dev/mapper/{name}"));
        tracing::info!(name, device = %device.display(), "created crypt mapping");
        active.insert(name.to_string(), mapped.clone());
        Ok(mapped)
    }

    fn remove(&self, name: &str) -> StowageResult<()> {
        let status = Command::new("dmsetup").args(["remove", name]).status()?;
        if !status.success() {
            return Err(StowageError::internal(format!(
                "dmsetup remove {name} exited with {status}"
            )));
        }
        self.active.lock().remove(name);
        tracing::info!(name, "removed crypt mapping");
        Ok(())
    }

    fn lookup(&self, name: &str) -> Option<PathBuf> {
        self.active.lock().get(name).cloned()
    }

    fn dump_state(&self) -> Vec<String> {
        self.active
            .lock()
            .iter()
            .map(|(name, dev)| format!("{name} -> {}", dev.display()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_miss() {
        let pool = DmPool::new();
        assert_eq!(pool.lookup("com.example.app-1"), None);
        assert!(pool.dump_state().is_empty());
    }
}
