//! Loop/dm-backed containers riding on managed volumes.
//!
//! Secure containers (ASEC), opaque binary blobs (OBB), ISO images, and
//! Samba shares all mount through the registry defined here. A single
//! process-wide lock guards the registry; every control-surface entry
//! point holds it for the operation's full duration, and host-volume
//! teardown holds it while draining dependents.

mod asec;
mod iso;
mod obb;
mod samba;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use stowage_common::{ContainerId, StowageError, StowageResult};

use crate::manager::Services;
use crate::process::KillAction;

pub use samba::SambaConfig;

/// An active (mounted) secure container.
#[derive(Debug, Clone)]
pub struct ActiveAsec {
    /// Container id.
    pub id: ContainerId,
    /// Backing image file.
    pub image: PathBuf,
    /// Attached loop device.
    pub loop_device: PathBuf,
    /// Crypt mapping over the loop device, for keyed containers.
    pub dm_device: Option<PathBuf>,
    /// Where the container is mounted.
    pub mountpoint: PathBuf,
    /// Owning uid.
    pub owner_uid: u32,
}

/// A mounted opaque-binary-blob image.
#[derive(Debug, Clone)]
pub struct MountedObb {
    /// Application-supplied backing file.
    pub source: PathBuf,
    /// Attached loop device.
    pub loop_device: PathBuf,
    /// Crypt mapping, for keyed blobs.
    pub dm_device: Option<PathBuf>,
    /// Where the blob is mounted.
    pub mountpoint: PathBuf,
    /// Owning gid.
    pub owner_gid: u32,
}

/// A mounted ISO-9660 image.
#[derive(Debug, Clone)]
pub struct MountedIso {
    /// Backing image file.
    pub source: PathBuf,
    /// Attached loop device.
    pub loop_device: PathBuf,
    /// Where the image is mounted.
    pub mountpoint: PathBuf,
}

/// A mounted Samba share.
#[derive(Debug, Clone)]
pub struct MountedSamba {
    /// Remote host.
    pub host: String,
    /// Remote share name.
    pub share: String,
    /// Local mountpoint.
    pub mountpoint: PathBuf,
}

/// Registry of every active container, keyed the way each class is
/// addressed on the control surface.
#[derive(Debug, Default)]
pub struct ContainerRegistry {
    asecs: HashMap<ContainerId, ActiveAsec>,
    obbs: HashMap<PathBuf, MountedObb>,
    isos: HashMap<PathBuf, MountedIso>,
    sambas: HashMap<PathBuf, MountedSamba>,
}

impl ContainerRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Unmount every ISO whose backing file lives under
    /// `host_mountpoint`. Failures are logged; drainage is best effort.
    pub fn cleanup_iso(&mut self, svc: &Services, host_mountpoint: &Path, force: bool) {
        let doomed: Vec<PathBuf> = self
            .isos
            .keys()
            .filter(|source| source.starts_with(host_mountpoint))
            .cloned()
            .collect();
        for source in doomed {
            if let Err(err) = self.unmount_iso(svc, &source, force) {
                tracing::warn!(%err, source = %source.display(),
                    "failed to unmount dependent ISO");
            }
        }
    }

    /// Unmount every secure container backed by an external image (the
    /// ones living on removable media). Returns the first failure after
    /// attempting all of them.
    pub fn cleanup_asec(&mut self, svc: &Services, force: bool) -> StowageResult<()> {
        let external_root = svc.paths.secure_asec();
        let doomed: Vec<ContainerId> = self
            .asecs
            .values()
            .filter(|c| c.image.starts_with(&external_root))
            .map(|c| c.id.clone())
            .collect();

        let mut first_err = None;
        for id in doomed {
            if let Err(err) = self.unmount_asec(svc, &id, force) {
                tracing::warn!(%err, container = %id, "failed to unmount dependent container");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Human-readable registry state for `dump`.
    #[must_use]
    pub fn dump_state(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for asec in self.asecs.values() {
            lines.push(format!(
                "asec {} {} -> {}",
                asec.id,
                asec.image.display(),
                asec.mountpoint.display()
            ));
        }
        for obb in self.obbs.values() {
            lines.push(format!(
                "obb {} -> {}",
                obb.source.display(),
                obb.mountpoint.display()
            ));
        }
        for iso in self.isos.values() {
            lines.push(format!(
                "iso {} -> {}",
                iso.source.display(),
                iso.mountpoint.display()
            ));
        }
        for samba in self.sambas.values() {
            lines.push(format!(
                "samba //{}/{} -> {}",
                samba.host,
                samba.share,
                samba.mountpoint.display()
            ));
        }
        lines
    }
}

/// Container-flavored forced unmount: one attempt, then up to ten
/// rounds of holder eviction a second apart when `force` is set.
pub(crate) fn unmount_container_path(
    svc: &Services,
    path: &Path,
    force: bool,
) -> StowageResult<()> {
    let attempt = || -> bool {
        match svc.mounter.unmount(path) {
            Ok(()) => true,
            Err(err) if err.is_errno(libc::EINVAL) || err.is_errno(libc::ENOENT) => true,
            Err(err) => {
                tracing::warn!(%err, path = %path.display(), "container unmount failed");
                false
            }
        }
    };

    if attempt() {
        return Ok(());
    }

    let mut retries = if force { 10 } else { 1 };
    while retries > 0 {
        retries -= 1;
        if force {
            svc.killer.kill_holders(path, KillAction::Hup);
            svc.killer.kill_holders(path, KillAction::Kill);
        }
        std::thread::sleep(Duration::from_secs(1));
        if attempt() {
            return Ok(());
        }
    }

    Err(StowageError::busy(format!("unmount {}", path.display())))
}

/// Detach the dm mapping and loop device behind a container, logging
/// rather than failing; the mount is already gone at this point.
pub(crate) fn release_backing(
    svc: &Services,
    dm_name: Option<&str>,
    loop_device: &Path,
) {
    if let Some(name) = dm_name {
        if let Err(err) = svc.dm.remove(name) {
            tracing::warn!(%err, name, "failed to remove crypt mapping");
        }
    }
    if let Err(err) = svc.loops.detach(loop_device) {
        tracing::warn!(%err, device = %loop_device.display(), "failed to detach loop device");
    }
}
