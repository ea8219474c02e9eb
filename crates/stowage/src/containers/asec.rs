//! Secure-container (ASEC) lifecycle.
//!
//! An ASEC is a loop-mounted image holding one application's private
//! payload, optionally wrapped in a dm-crypt mapping. Images live either
//! on the secure area of removable media ("external") or on internal
//! storage, always named `<id>.asec`.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use stowage_common::{ContainerId, StowageError, StowageResult};

use super::{release_backing, unmount_container_path, ActiveAsec, ContainerRegistry};
use crate::fs::MountCtx;
use crate::manager::Services;

/// Key value meaning "no crypt layer".
const KEY_NONE: &str = "none";

impl ContainerRegistry {
    /// Create a secure container and mount it read-write for packaging.
    pub fn create_asec(
        &mut self,
        svc: &Services,
        id: &ContainerId,
        num_sectors: u64,
        fs_type: &str,
        key: &str,
        owner_uid: u32,
        external: bool,
    ) -> StowageResult<()> {
        if num_sectors < 1 {
            return Err(StowageError::InvalidArgument {
                message: format!("invalid container size ({num_sectors} sectors)"),
            });
        }
        if self.asecs.contains_key(id) || self.find_image(svc, id).is_some() {
            return Err(StowageError::ContainerExists { id: id.to_string() });
        }

        let dir = if external {
            svc.paths.secure_asec()
        } else {
            svc.paths.internal_asec_images()
        };
        let image = dir.join(id.image_name());

        let file = fs::File::create(&image)?;
        file.set_len(num_sectors * 512)?;
        drop(file);

        let result = self.attach_and_mount(svc, id, &image, fs_type, key, owner_uid, true);
        if let Err(err) = result {
            // Creation is atomic from the caller's view; leave nothing
            // half-built behind.
            let _ = fs::remove_file(&image);
            return Err(err);
        }
        tracing::info!(container = %id, image = %image.display(), "created secure container");
        Ok(())
    }

    /// Seal a freshly packaged container read-only.
    pub fn finalize_asec(&mut self, svc: &Services, id: &ContainerId) -> StowageResult<()> {
        let asec = self
            .asecs
            .get(id)
            .ok_or_else(|| StowageError::ContainerNotFound { id: id.to_string() })?;
        svc.mounter.remount_readonly(&asec.mountpoint)?;
        tracing::info!(container = %id, "finalized secure container");
        Ok(())
    }

    /// Apply the owning gid and conventional modes to a payload file
    /// and every directory leading to it.
    pub fn fix_asec_perms(
        &mut self,
        id: &ContainerId,
        gid: u32,
        filename: &str,
    ) -> StowageResult<()> {
        let asec = self
            .asecs
            .get(id)
            .ok_or_else(|| StowageError::ContainerNotFound { id: id.to_string() })?;

        let target = asec.mountpoint.join(filename.trim_start_matches('/'));
        if !target.starts_with(&asec.mountpoint) {
            return Err(StowageError::InvalidArgument {
                message: format!("filename '{filename}' escapes the container"),
            });
        }

        fix_tree_perms(&asec.mountpoint, &target, asec.owner_uid, gid)?;
        tracing::info!(container = %id, gid, filename, "fixed container permissions");
        Ok(())
    }

    /// Mount an existing container image.
    pub fn mount_asec(
        &mut self,
        svc: &Services,
        id: &ContainerId,
        key: &str,
        owner_uid: u32,
    ) -> StowageResult<()> {
        if self.asecs.contains_key(id) {
            return Err(StowageError::busy(format!("container {id} already mounted")));
        }
        let image = self
            .find_image(svc, id)
            .ok_or_else(|| StowageError::ContainerNotFound { id: id.to_string() })?;

        self.attach_and_mount(svc, id, &image, "", key, owner_uid, false)?;
        tracing::info!(container = %id, "mounted secure container");
        Ok(())
    }

    /// Unmount a container and release its loop/dm backing.
    pub fn unmount_asec(
        &mut self,
        svc: &Services,
        id: &ContainerId,
        force: bool,
    ) -> StowageResult<()> {
        let mountpoint = self
            .asecs
            .get(id)
            .map(|asec| asec.mountpoint.clone())
            .ok_or_else(|| StowageError::ContainerNotFound { id: id.to_string() })?;

        unmount_container_path(svc, &mountpoint, force)?;

        if let Some(asec) = self.asecs.remove(id) {
            release_backing(
                svc,
                asec.dm_device.as_ref().map(|_| id.as_str()),
                &asec.loop_device,
            );
        }
        let _ = fs::remove_dir(&mountpoint);
        tracing::info!(container = %id, "unmounted secure container");
        Ok(())
    }

    /// Destroy a container: unmount if active, then delete the image.
    pub fn destroy_asec(
        &mut self,
        svc: &Services,
        id: &ContainerId,
        force: bool,
    ) -> StowageResult<()> {
        if self.asecs.contains_key(id) {
            self.unmount_asec(svc, id, force)?;
        }
        let image = self
            .find_image(svc, id)
            .ok_or_else(|| StowageError::ContainerNotFound { id: id.to_string() })?;
        fs::remove_file(&image)?;
        tracing::info!(container = %id, image = %image.display(), "destroyed secure container");
        Ok(())
    }

    /// Rename an unmounted container image, keeping lookups consistent.
    pub fn rename_asec(
        &mut self,
        svc: &Services,
        old_id: &ContainerId,
        new_id: &ContainerId,
    ) -> StowageResult<()> {
        if self.asecs.contains_key(old_id) {
            return Err(StowageError::busy(format!(
                "container {old_id} is mounted"
            )));
        }
        if self.find_image(svc, new_id).is_some() {
            return Err(StowageError::ContainerExists {
                id: new_id.to_string(),
            });
        }
        let old_image = self
            .find_image(svc, old_id)
            .ok_or_else(|| StowageError::ContainerNotFound {
                id: old_id.to_string(),
            })?;
        let new_image = old_image
            .parent()
            .ok_or_else(|| StowageError::internal("container image has no parent directory"))?
            .join(new_id.image_name());
        fs::rename(&old_image, &new_image)?;
        tracing::info!(old = %old_id, new = %new_id, "renamed secure container");
        Ok(())
    }

    /// Mountpoint of an active container.
    pub fn asec_path(&self, svc: &Services, id: &ContainerId) -> StowageResult<PathBuf> {
        match self.asecs.get(id) {
            Some(asec) => Ok(asec.mountpoint.clone()),
            None if self.find_image(svc, id).is_some() => Err(StowageError::NotMounted {
                what: id.to_string(),
            }),
            None => Err(StowageError::ContainerNotFound { id: id.to_string() }),
        }
    }

    /// Image path of a container, mounted or not.
    pub fn asec_fs_path(&self, svc: &Services, id: &ContainerId) -> StowageResult<PathBuf> {
        self.find_image(svc, id)
            .ok_or_else(|| StowageError::ContainerNotFound { id: id.to_string() })
    }

    /// Ids of every container image in the external and internal dirs.
    #[must_use]
    pub fn list_asecs(&self, svc: &Services) -> Vec<ContainerId> {
        let mut ids = Vec::new();
        for dir in [svc.paths.secure_asec(), svc.paths.internal_asec_images()] {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.starts_with('.') {
                    continue;
                }
                if let Some(id) = ContainerId::from_image_name(name) {
                    ids.push(id);
                }
            }
        }
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }

    fn find_image(&self, svc: &Services, id: &ContainerId) -> Option<PathBuf> {
        [svc.paths.secure_asec(), svc.paths.internal_asec_images()]
            .into_iter()
            .map(|dir| dir.join(id.image_name()))
            .find(|path| path.exists())
    }

    /// Attach loop (and crypt) backing for `image` and mount it.
    /// `fs_type` non-empty formats the device first (container creation).
    fn attach_and_mount(
        &mut self,
        svc: &Services,
        id: &ContainerId,
        image: &Path,
        fs_type: &str,
        key: &str,
        owner_uid: u32,
        newly_created: bool,
    ) -> StowageResult<()> {
        let loop_device = svc.loops.attach(image)?;

        let keyed = !key.is_empty() && key != KEY_NONE;
        let dm_device = if keyed {
            let sectors = fs::metadata(image)?.len() / 512;
            match svc.dm.create(id.as_str(), &loop_device, key, sectors) {
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

        let result = (|| -> StowageResult<()> {
            if !fs_type.is_empty() && fs_type != "none" {
                let driver_name = match fs_type {
                    "fat" => "fat",
                    "ext4" => "ext",
                    other => {
                        return Err(StowageError::InvalidArgument {
                            message: format!("unsupported container filesystem '{other}'"),
                        })
                    }
                };
                let driver = svc
                    .fs
                    .get(driver_name)
                    .ok_or_else(|| StowageError::internal("container fs driver missing"))?;
                driver.format(device, 0, false)?;
            }

            let mountpoint = svc.paths.asec_mount(id.as_str());
            fs::create_dir_all(&mountpoint)?;

            let ctx = MountCtx {
                readonly: false,
                owner_uid,
                owner_gid: owner_uid,
                perm_mask: 0o000,
                executable: true,
            };
            // Containers are FAT when packaged here, ext4 when migrated
            // from older devices; probe the two in that order.
            let mut mounted = false;
            for name in ["fat", "ext"] {
                let driver = svc
                    .fs
                    .get(name)
                    .ok_or_else(|| StowageError::internal("container fs driver missing"))?;
                if driver
                    .mount(svc.mounter.as_ref(), device, &mountpoint, &ctx)
                    .is_ok()
                {
                    mounted = true;
                    break;
                }
            }
            if !mounted {
                let _ = fs::remove_dir(&mountpoint);
                return Err(StowageError::UnsupportedFilesystem {
                    device: device.display().to_string(),
                });
            }

            if newly_created {
                let perms = fs::Permissions::from_mode(0o750);
                let _ = fs::set_permissions(&mountpoint, perms);
            }

            self.asecs.insert(
                id.clone(),
                ActiveAsec {
                    id: id.clone(),
                    image: image.to_path_buf(),
                    loop_device: loop_device.clone(),
                    dm_device: dm_device.clone(),
                    mountpoint,
                    owner_uid,
                },
            );
            Ok(())
        })();

        if let Err(err) = result {
            release_backing(svc, keyed.then(|| id.as_str()), &loop_device);
            return Err(err);
        }
        Ok(())
    }
}

/// Walk from `root` down to `target`, applying ownership and the
/// conventional container modes (0750 directories, 0640 files).
fn fix_tree_perms(root: &Path, target: &Path, uid: u32, gid: u32) -> StowageResult<()> {
    fn apply(path: &Path, uid: u32, gid: u32) -> std::io::Result<()> {
        let meta = fs::symlink_metadata(path)?;
        let mode = if meta.is_dir() { 0o750 } else { 0o640 };
        std::os::unix::fs::chown(path, Some(uid), Some(gid))?;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
    }

    let mut current = root.to_path_buf();
    apply(&current, uid, gid)?;
    let relative = target.strip_prefix(root).map_err(|_| {
        StowageError::InvalidArgument {
            message: "target escapes container root".to_string(),
        }
    })?;
    for component in relative.components() {
        current.push(component);
        if current.exists() {
            apply(&current, uid, gid)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fix_tree_perms_walks_to_target() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("asec");
        fs::create_dir_all(root.join("lib")).unwrap();
        fs::write(root.join("lib/code.so"), b"x").unwrap();

        // Same-user chown always succeeds; the interesting part is the
        // mode walk.
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };
        fix_tree_perms(&root, &root.join("lib/code.so"), uid, gid).unwrap();

        let dir_mode = fs::metadata(root.join("lib")).unwrap().permissions().mode();
        let file_mode = fs::metadata(root.join("lib/code.so"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o750);
        assert_eq!(file_mode & 0o777, 0o640);
    }
}
