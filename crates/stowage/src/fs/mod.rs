//! Filesystem driver adapters.
//!
//! Each driver knows how to mount, check, and format one filesystem
//! family. Media probing walks [`FsRegistry::probe_order`] (NTFS, then
//! FAT, then EXT, then EXFAT), stopping at the first driver whose
//! mount succeeds; the order is part of the external contract.

use std::path::Path;
use std::process::Command;

use stowage_common::{StowageError, StowageResult};

use crate::mounter::Mounter;

mod cifs;
mod exfat;
mod ext;
mod fat;
mod iso;
mod ntfs;

pub use cifs::{Cifs, CifsCredentials};
pub use exfat::Exfat;
pub use ext::Ext;
pub use fat::Fat;
pub use iso::Iso9660;
pub use ntfs::Ntfs;

/// Ownership and permission policy applied to a media mount.
#[derive(Debug, Clone, Copy)]
pub struct MountCtx {
    /// Mount read-only.
    pub readonly: bool,
    /// Owning uid for filesystems without native ownership.
    pub owner_uid: u32,
    /// Owning gid for filesystems without native ownership.
    pub owner_gid: u32,
    /// Permission bits masked off files (e.g. `0o007` for secure media).
    pub perm_mask: u32,
    /// Allow execution from the mount.
    pub executable: bool,
}

impl MountCtx {
    /// The policy used for user-visible removable media. Volumes that
    /// provide application-secure storage mask group+other access.
    #[must_use]
    pub fn media(owner_uid: u32, owner_gid: u32, provides_asec: bool) -> Self {
        Self {
            readonly: false,
            owner_uid,
            owner_gid,
            perm_mask: if provides_asec { 0o007 } else { 0o002 },
            executable: false,
        }
    }
}

/// A filesystem family the daemon can mount, check, and format.
pub trait FsDriver: Send {
    /// Short name used in logs and the control protocol (`fat`, `ntfs`...).
    fn name(&self) -> &'static str;

    /// Mount `device` at `target`.
    fn mount(
        &self,
        mounter: &dyn Mounter,
        device: &Path,
        target: &Path,
        ctx: &MountCtx,
    ) -> StowageResult<()>;

    /// Run the family's checker over `device`, repairing what it can.
    fn check(&self, device: &Path) -> StowageResult<()>;

    /// Create a fresh filesystem on `device`. `num_sectors == 0` means
    /// "use the whole device"; `wipe` zeroes the header region first.
    fn format(&self, device: &Path, num_sectors: u64, wipe: bool) -> StowageResult<()>;
}

/// The set of drivers the engine knows, in probe order.
pub struct FsRegistry {
    probe: Vec<Box<dyn FsDriver>>,
    extra: Vec<Box<dyn FsDriver>>,
}

impl FsRegistry {
    /// Registry with the production drivers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            probe: vec![
                Box::new(Ntfs),
                Box::new(Fat),
                Box::new(Ext),
                Box::new(Exfat),
            ],
            extra: vec![Box::new(Iso9660)],
        }
    }

    /// Registry with caller-provided probe drivers (tests stub these).
    #[must_use]
    pub fn with_probe_drivers(probe: Vec<Box<dyn FsDriver>>) -> Self {
        Self {
            probe,
            extra: Vec::new(),
        }
    }

    /// Register a non-probe driver (looked up by name only).
    pub fn register(&mut self, driver: Box<dyn FsDriver>) {
        self.extra.push(driver);
    }

    /// Drivers tried against unknown media, in fixed order.
    pub fn probe_order(&self) -> impl Iterator<Item = &dyn FsDriver> {
        self.probe.iter().map(|d| d.as_ref())
    }

    /// Look up any driver by name.
    pub fn get(&self, name: &str) -> Option<&dyn FsDriver> {
        self.probe
            .iter()
            .chain(self.extra.iter())
            .map(|d| d.as_ref())
            .find(|d| d.name() == name)
    }
}

impl Default for FsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Run an external filesystem helper, treating a missing binary as a
/// soft failure so dev machines without the tool keep working.
pub(crate) fn run_helper(program: &str, args: &[&str]) -> StowageResult<()> {
    tracing::debug!(program, ?args, "running filesystem helper");
    let status = match Command::new(program).args(args).status() {
        Ok(status) => status,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(program, "helper not installed, skipping");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };
    if status.success() {
        Ok(())
    } else {
        Err(StowageError::internal(format!(
            "{program} exited with {status}"
        )))
    }
}

/// Zero the first megabyte of `device` before formatting.
pub(crate) fn wipe_header(device: &Path) -> StowageResult<()> {
    use std::io::Write;

    let mut f = std::fs::OpenOptions::new().write(true).open(device)?;
    let zeros = vec![0u8; 1024 * 1024];
    f.write_all(&zeros)?;
    f.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_order_is_fixed() {
        let registry = FsRegistry::new();
        let names: Vec<&str> = registry.probe_order().map(|d| d.name()).collect();
        assert_eq!(names, vec!["ntfs", "fat", "ext", "exfat"]);
    }

    #[test]
    fn lookup_by_name() {
        let registry = FsRegistry::new();
        assert!(registry.get("fat").is_some());
        assert!(registry.get("iso9660").is_some());
        assert!(registry.get("zfs").is_none());
    }
}
