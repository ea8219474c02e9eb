//! Opaque-binary-blob (OBB) mounts.
//!
//! OBBs are read-only asset images supplied by applications from
//! arbitrary paths. The mountpoint is derived from a hash of the source
//! path so unrelated blobs never collide under `/mnt/obb`.

use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use stowage_common::{StowageError, StowageResult};

use super::{release_backing, unmount_container_path, ContainerRegistry, MountedObb};
use crate::fs::MountCtx;
use crate::manager::Services;

impl ContainerRegistry {
    /// Mount an OBB image read-only.
    pub fn mount_obb(
        &mut self,
        svc: &Services,
        source: &Path,
        key: &str,
        owner_gid: u32,
    ) -> StowageResult<()> {
        let source = source.to_path_buf();
        if self.obbs.contains_key(&source) {
            return Err(StowageError::busy(format!(
                "obb {} already mounted",
                source.display()
            )));
        }
        if !source.exists() {
            return Err(StowageError::ContainerNotFound {
                id: source.display().to_string(),
            });
        }

        let loop_device = svc.loops.attach(&source)?;
        let dm_name = obb_id(&source);
        let keyed = !key.is_empty() && key != "none";
        let dm_device = if keyed {
            let sectors = fs::metadata(&source)?.len() / 512;
            match svc.dm.create(&dm_name, &loop_device, key, sectors) {
                Ok(dev) => Some(dev),
                Err(err) => {
                    let _ = svc.loops.detach(&loop_device);
                    return Err(err);
                }
            }
        } else {
            None
        };
        let device = dm_device.as_deref().unwrap_or(&loop_device);

        let mountpoint = svc.paths.obb_mounts().join(&dm_name);
        let result = (|| -> StowageResult<()> {
            fs::create_dir_all(&mountpoint)?;
            let ctx = MountCtx {
                readonly: true,
                owner_uid: 0,
                owner_gid,
                perm_mask: 0o007,
                executable: false,
            };
            let fat = svc
                .fs
                .get("fat")
                .ok_or_else(|| StowageError::internal("fat driver not registered"))?;
            fat.mount(svc.mounter.as_ref(), device, &mountpoint, &ctx)
        })();

        if let Err(err) = result {
            let _ = fs::remove_dir(&mountpoint);
            release_backing(svc, keyed.then_some(dm_name.as_str()), &loop_device);
            return Err(err);
        }

        tracing::info!(source = %source.display(), mountpoint = %mountpoint.display(),
            "mounted obb");
        self.obbs.insert(
            source.clone(),
            MountedObb {
                source,
                loop_device,
                dm_device,
                mountpoint,
                owner_gid,
            },
        );
        Ok(())
    }

    /// Unmount an OBB and release its backing.
    pub fn unmount_obb(&mut self, svc: &Services, source: &Path, force: bool) -> StowageResult<()> {
        let mountpoint = self
            .obbs
            .get(source)
            .map(|obb| obb.mountpoint.clone())
            .ok_or_else(|| StowageError::ContainerNotFound {
                id: source.display().to_string(),
            })?;

        unmount_container_path(svc, &mountpoint, force)?;

        if let Some(obb) = self.obbs.remove(source) {
            let dm_name = obb_id(&obb.source);
            release_backing(
                svc,
                obb.dm_device.as_ref().map(|_| dm_name.as_str()),
                &obb.loop_device,
            );
        }
        let _ = fs::remove_dir(&mountpoint);
        tracing::info!(source = %source.display(), "unmounted obb");
        Ok(())
    }

    /// Mountpoint of a mounted OBB.
    pub fn obb_path(&self, source: &Path) -> StowageResult<PathBuf> {
        self.obbs
            .get(source)
            .map(|obb| obb.mountpoint.clone())
            .ok_or_else(|| StowageError::ContainerNotFound {
                id: source.display().to_string(),
            })
    }

    /// Source paths of every mounted OBB.
    #[must_use]
    pub fn list_obbs(&self) -> Vec<PathBuf> {
        let mut sources: Vec<PathBuf> = self.obbs.keys().cloned().collect();
        sources.sort();
        sources
    }
}

/// Stable mountpoint name for an OBB source path.
fn obb_id(source: &Path) -> String {
    let mut hasher = DefaultHasher::new();
    source.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn obb_ids_are_stable_and_distinct() {
        let a = obb_id(Path::new("/storage/sdcard1/game.obb"));
        let b = obb_id(Path::new("/storage/sdcard1/game2.obb"));
        assert_eq!(a, obb_id(Path::new("/storage/sdcard1/game.obb")));
        assert_ne!(a, b);
        assert_eq!(a.len(), 16);
    }
}
