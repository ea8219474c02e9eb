//! Samba (CIFS) share mounts.

use std::fs;
use std::path::{Path, PathBuf};

use stowage_common::{StowageError, StowageResult, StowagePaths};

use super::{unmount_container_path, ContainerRegistry, MountedSamba};
use crate::fs::{Cifs, CifsCredentials, MountCtx};
use crate::manager::Services;
use crate::volume::MEDIA_RW;

/// Everything needed to mount one share.
#[derive(Debug, Clone)]
pub struct SambaConfig {
    /// Remote host name or address.
    pub host: String,
    /// Share name on the host.
    pub share: String,
    /// Mount directory name under `/mnt/samba`.
    pub mountpoint: String,
    /// Account name; empty for a guest session.
    pub user: String,
    /// Account password.
    pub password: String,
    /// Mount read-only.
    pub readonly: bool,
    /// Allow execution from the share.
    pub executable: bool,
}

impl ContainerRegistry {
    /// Mount a CIFS share under `/mnt/samba`.
    pub fn mount_samba(&mut self, svc: &Services, config: &SambaConfig) -> StowageResult<()> {
        if config.mountpoint.is_empty() || config.mountpoint.contains('/') {
            return Err(StowageError::InvalidArgument {
                message: format!("bad samba mountpoint '{}'", config.mountpoint),
            });
        }
        let mountpoint = svc.paths.samba_mounts().join(&config.mountpoint);
        if self.sambas.contains_key(&mountpoint) {
            return Err(StowageError::busy(format!(
                "samba mountpoint {} in use",
                mountpoint.display()
            )));
        }

        fs::create_dir_all(&mountpoint)?;
        let ctx = MountCtx {
            readonly: config.readonly,
            owner_uid: MEDIA_RW,
            owner_gid: MEDIA_RW,
            perm_mask: 0o002,
            executable: config.executable,
        };
        let creds = CifsCredentials {
            user: config.user.clone(),
            password: config.password.clone(),
        };
        if let Err(err) =
            Cifs.mount_share(svc.mounter.as_ref(), &config.host, &config.share, &mountpoint, &creds, &ctx)
        {
            let _ = fs::remove_dir(&mountpoint);
            return Err(err);
        }

        tracing::info!(host = %config.host, share = %config.share,
            mountpoint = %mountpoint.display(), "mounted samba share");
        self.sambas.insert(
            mountpoint.clone(),
            MountedSamba {
                host: config.host.clone(),
                share: config.share.clone(),
                mountpoint,
            },
        );
        Ok(())
    }

    /// Unmount a share previously mounted at `mountpoint`.
    pub fn unmount_samba(
        &mut self,
        svc: &Services,
        mountpoint: &str,
        force: bool,
    ) -> StowageResult<()> {
        let full = resolve_samba_mountpoint(&svc.paths, mountpoint);
        if !self.sambas.contains_key(&full) {
            return Err(StowageError::ContainerNotFound {
                id: full.display().to_string(),
            });
        }

        unmount_container_path(svc, &full, force)?;

        self.sambas.remove(&full);
        let _ = fs::remove_dir(&full);
        tracing::info!(mountpoint = %full.display(), "unmounted samba share");
        Ok(())
    }
}

/// Accept both the bare directory name and the full path form.
fn resolve_samba_mountpoint(paths: &StowagePaths, mountpoint: &str) -> PathBuf {
    let given = Path::new(mountpoint);
    if given.is_absolute() {
        given.to_path_buf()
    } else {
        paths.samba_mounts().join(mountpoint)
    }
}
