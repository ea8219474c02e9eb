//! ISO-9660 image mounts.

use std::fs;
use std::path::{Path, PathBuf};

use stowage_common::{StowageError, StowageResult};

use super::{release_backing, unmount_container_path, ContainerRegistry, MountedIso};
use crate::fs::MountCtx;
use crate::manager::Services;
use crate::volume::MEDIA_RW;

impl ContainerRegistry {
    /// Loop-mount an ISO image read-only under `/mnt/iso`.
    pub fn mount_iso(&mut self, svc: &Services, source: &Path) -> StowageResult<()> {
        let source = source.to_path_buf();
        if self.isos.contains_key(&source) {
            return Err(StowageError::busy(format!(
                "iso {} already mounted",
                source.display()
            )));
        }
        if !source.exists() {
            return Err(StowageError::ContainerNotFound {
                id: source.display().to_string(),
            });
        }

        let loop_device = svc.loops.attach(&source)?;
        let mountpoint = svc.paths.iso_mounts().join(iso_mount_name(&source));

        let result = (|| -> StowageResult<()> {
            fs::create_dir_all(&mountpoint)?;
            let ctx = MountCtx {
                readonly: true,
                owner_uid: MEDIA_RW,
                owner_gid: MEDIA_RW,
                perm_mask: 0o002,
                executable: false,
            };
            let iso = svc
                .fs
                .get("iso9660")
                .ok_or_else(|| StowageError::internal("iso9660 driver not registered"))?;
            iso.mount(svc.mounter.as_ref(), &loop_device, &mountpoint, &ctx)
        })();

        if let Err(err) = result {
            let _ = fs::remove_dir(&mountpoint);
            release_backing(svc, None, &loop_device);
            return Err(err);
        }

        tracing::info!(source = %source.display(), mountpoint = %mountpoint.display(),
            "mounted iso");
        self.isos.insert(
            source.clone(),
            MountedIso {
                source,
                loop_device,
                mountpoint,
            },
        );
        Ok(())
    }

    /// Unmount an ISO and detach its loop device.
    pub fn unmount_iso(&mut self, svc: &Services, source: &Path, force: bool) -> StowageResult<()> {
        let mountpoint = self
            .isos
            .get(source)
            .map(|iso| iso.mountpoint.clone())
            .ok_or_else(|| StowageError::ContainerNotFound {
                id: source.display().to_string(),
            })?;

        unmount_container_path(svc, &mountpoint, force)?;

        if let Some(iso) = self.isos.remove(source) {
            release_backing(svc, None, &iso.loop_device);
        }
        let _ = fs::remove_dir(&mountpoint);
        tracing::info!(source = %source.display(), "unmounted iso");
        Ok(())
    }

    /// Mountpoint of a mounted ISO.
    pub fn iso_path(&self, source: &Path) -> StowageResult<PathBuf> {
        self.isos
            .get(source)
            .map(|iso| iso.mountpoint.clone())
            .ok_or_else(|| StowageError::ContainerNotFound {
                id: source.display().to_string(),
            })
    }

    /// Source paths of every mounted ISO.
    #[must_use]
    pub fn list_isos(&self) -> Vec<PathBuf> {
        let mut sources: Vec<PathBuf> = self.isos.keys().cloned().collect();
        sources.sort();
        sources
    }
}

/// Mount directory name for an ISO source: the file stem, qualified by
/// a short hash so same-named images from different folders coexist.
fn iso_mount_name(source: &Path) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let stem = source
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("image");
    let mut hasher = DefaultHasher::new();
    source.hash(&mut hasher);
    format!("{stem}-{:08x}", hasher.finish() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_names_disambiguate_paths() {
        let a = iso_mount_name(Path::new("/storage/sdcard1/film.iso"));
        let b = iso_mount_name(Path::new("/storage/usbdisk/film.iso"));
        assert!(a.starts_with("film-"));
        assert!(b.starts_with("film-"));
        assert_ne!(a, b);
    }
}
