//! Volume registry and event dispatch.
//!
//! The manager owns every volume, the container registry, and the
//! service seams volume operations run through. It is constructed
//! explicitly by the daemon entry point (and freely by test suites);
//! there is no process-wide instance.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use stowage_common::{ContainerId, StowageError, StowageResult, StowagePaths};

use crate::broadcast::Broadcaster;
use crate::containers::{ContainerRegistry, SambaConfig};
use crate::crypto::CryptoMapper;
use crate::device::{BlockNodes, DeviceNodes};
use crate::event::BlockEvent;
use crate::fs::FsRegistry;
use crate::loopdev::{LoopAllocator, LoopPool};
use crate::devmapper::{DmAllocator, DmPool};
use crate::mounter::{Mounter, SysMounter};
use crate::process::{ProcScanner, ProcessKiller, StorageUser};
use crate::props::{MemoryProps, PropertyStore};
use crate::share::{ShareController, UmsShare, METHOD_UMS};
use crate::volume::{Volume, VolumeConfig, VolumeState};
use crate::xwarp::Xwarp;

/// The service seams volume and container operations run through.
///
/// Production wiring talks to the kernel; tests substitute stubs for
/// any subset.
pub struct Services {
    /// Filesystem layout the daemon owns.
    pub paths: StowagePaths,
    /// Unsolicited-event fan-out.
    pub broadcaster: Broadcaster,
    /// Filesystem drivers.
    pub fs: FsRegistry,
    /// Mount syscalls.
    pub mounter: Box<dyn Mounter>,
    /// Device-node creation.
    pub nodes: Box<dyn DeviceNodes>,
    /// Open-file-holder eviction.
    pub killer: Box<dyn ProcessKiller>,
    /// Encrypted-volume mapping service.
    pub crypto: Box<dyn CryptoMapper>,
    /// Platform property service.
    pub props: Box<dyn PropertyStore>,
    /// USB mass-storage lending.
    pub share: Box<dyn ShareController>,
    /// Loop device pool.
    pub loops: Box<dyn LoopAllocator>,
    /// Device-mapper pool.
    pub dm: Box<dyn DmAllocator>,
    /// Flash mirroring control.
    pub xwarp: Xwarp,
}

impl Services {
    /// Production wiring for the given layout and mass-storage LUN file.
    #[must_use]
    pub fn production(
        paths: StowagePaths,
        lun_file: impl Into<PathBuf>,
        crypto: Box<dyn CryptoMapper>,
        props: Box<dyn PropertyStore>,
    ) -> Self {
        let xwarp_backing = paths.secure_asec().join("xwarp.img");
        Self {
            broadcaster: Broadcaster::new(),
            fs: FsRegistry::new(),
            mounter: Box::new(SysMounter::new(paths.proc_mounts())),
            nodes: Box::new(BlockNodes::new(paths.device_nodes())),
            killer: Box::new(ProcScanner::new(paths.proc())),
            crypto,
            props,
            share: Box::new(UmsShare::new(lun_file)),
            loops: Box::new(LoopPool::new()),
            dm: Box::new(DmPool::new()),
            xwarp: Xwarp::new("/sys/fs/xwarp", xwarp_backing),
            paths,
        }
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("paths", &self.paths)
            .finish_non_exhaustive()
    }
}

/// Registry of managed volumes and active containers.
#[derive(Debug)]
pub struct VolumeManager {
    svc: Services,
    volumes: Vec<Volume>,
    containers: Mutex<ContainerRegistry>,
    debug: bool,
}

impl VolumeManager {
    /// Manager over the given services, with no volumes yet.
    #[must_use]
    pub fn new(svc: Services) -> Self {
        Self {
            svc,
            volumes: Vec::new(),
            containers: Mutex::new(ContainerRegistry::new()),
            debug: false,
        }
    }

    /// A manager backed by in-memory stubs where possible; used by the
    /// daemon before platform services connect, and by tests.
    #[must_use]
    pub fn with_memory_props(paths: StowagePaths, lun_file: impl Into<PathBuf>) -> Self {
        let svc = Services::production(
            paths,
            lun_file,
            Box::new(crate::crypto::UnsupportedCrypto),
            Box::new(MemoryProps::new()),
        );
        Self::new(svc)
    }

    /// The services bundle (tests subscribe to its broadcaster).
    #[must_use]
    pub fn services(&self) -> &Services {
        &self.svc
    }

    /// Register a volume from its declaration.
    pub fn add_volume(&mut self, config: VolumeConfig) -> StowageResult<()> {
        if self.volumes.iter().any(|v| v.label() == config.label) {
            return Err(StowageError::InvalidArgument {
                message: format!("duplicate volume label '{}'", config.label),
            });
        }
        let mut volume = Volume::new_direct(config);
        volume.set_debug(self.debug);
        volume.set_state(&self.svc, VolumeState::NoMedia);
        tracing::info!(volume = %volume.label(),
            mountpoint = %volume.mountpoint().display(), "volume registered");
        self.volumes.push(volume);
        Ok(())
    }

    /// Toggle verbose logging everywhere.
    pub fn set_debug(&mut self, enable: bool) {
        self.debug = enable;
        for volume in &mut self.volumes {
            volume.set_debug(enable);
        }
    }

    /// Iterate registered volumes.
    pub fn volumes(&self) -> impl Iterator<Item = &Volume> {
        self.volumes.iter()
    }

    /// `(label, public mountpoint, state code)` lines for `volume list`.
    #[must_use]
    pub fn list_volumes(&self) -> Vec<String> {
        self.volumes
            .iter()
            .map(|v| {
                format!(
                    "{} {} {}",
                    v.label(),
                    v.public_mountpoint().display(),
                    v.state().code()
                )
            })
            .collect()
    }

    /// Find a volume by label or either mountpoint.
    pub fn lookup_volume(&self, path: &str) -> StowageResult<&Volume> {
        self.volume_index(path).map(|idx| &self.volumes[idx])
    }

    fn volume_index(&self, path: &str) -> StowageResult<usize> {
        let as_path = Path::new(path);
        self.volumes
            .iter()
            .position(|v| {
                v.label() == path || v.mountpoint() == as_path || v.public_mountpoint() == as_path
            })
            .ok_or_else(|| StowageError::VolumeNotFound {
                path: path.to_string(),
            })
    }

    /// Route a kernel block event to the volume claiming its devpath.
    ///
    /// After handling, a mount attempt queued while the volume was
    /// `Pending` fires once the volume reaches `Idle`.
    pub fn dispatch_block_event(&mut self, evt: &BlockEvent) -> StowageResult<()> {
        let Some(idx) = self
            .volumes
            .iter()
            .position(|v| v.claims_devpath(&evt.devpath))
        else {
            return Err(StowageError::KernelEvent {
                message: format!("no volume claims devpath {}", evt.devpath),
            });
        };

        self.volumes[idx].handle_block_event(&self.svc, &self.containers, evt)?;

        let volume = &mut self.volumes[idx];
        if volume.state() == VolumeState::Idle && volume.retry_mount() {
            volume.take_retry_mount();
            tracing::info!(volume = %volume.label(), "running queued mount retry");
            if let Err(err) = volume.mount_vol(&self.svc) {
                tracing::warn!(%err, volume = %volume.label(), "queued mount retry failed");
            }
        }
        Ok(())
    }

    /// Mount a volume by label or mountpoint.
    pub fn mount_volume(&mut self, path: &str) -> StowageResult<()> {
        let idx = self.volume_index(path)?;
        self.volumes[idx].mount_vol(&self.svc)
    }

    /// Unmount a volume, draining dependent containers.
    pub fn unmount_volume(&mut self, path: &str, force: bool, revert: bool) -> StowageResult<()> {
        let idx = self.volume_index(path)?;
        self.volumes[idx].unmount_vol(&self.svc, &self.containers, force, revert)
    }

    /// Format a volume as FAT.
    pub fn format_volume(&mut self, path: &str, wipe: bool) -> StowageResult<()> {
        let idx = self.volume_index(path)?;
        self.volumes[idx].format_vol(&self.svc, wipe)
    }

    /// Lend a volume's block device to an external consumer.
    pub fn share_volume(&mut self, path: &str, method: &str) -> StowageResult<()> {
        if method != METHOD_UMS {
            return Err(StowageError::InvalidArgument {
                message: format!("unsupported share method '{method}'"),
            });
        }
        let idx = self.volume_index(path)?;
        let volume = &mut self.volumes[idx];
        match volume.state() {
            VolumeState::NoMedia => {
                return Err(StowageError::NoDevice {
                    what: volume.label().to_string(),
                });
            }
            VolumeState::Idle => {}
            _ => return Err(StowageError::busy(format!("volume {}", volume.label()))),
        }

        let dev = volume.share_device().ok_or_else(|| StowageError::NoDevice {
            what: volume.label().to_string(),
        })?;
        let node = self.svc.nodes.ensure_node(dev)?;
        self.svc.share.enable(&node)?;
        volume.set_state_shared(&self.svc);
        Ok(())
    }

    /// Reclaim a shared volume's block device.
    pub fn unshare_volume(&mut self, path: &str, method: &str) -> StowageResult<()> {
        if method != METHOD_UMS {
            return Err(StowageError::InvalidArgument {
                message: format!("unsupported share method '{method}'"),
            });
        }
        let idx = self.volume_index(path)?;
        let volume = &mut self.volumes[idx];
        if volume.state() != VolumeState::Shared {
            return Err(StowageError::InvalidArgument {
                message: format!("volume {} is not shared", volume.label()),
            });
        }
        self.svc.share.disable()?;
        volume.set_state_unshared(&self.svc);
        Ok(())
    }

    /// Whether a volume is currently lent out via `method`.
    pub fn share_enabled(&self, path: &str, method: &str) -> StowageResult<bool> {
        if method != METHOD_UMS {
            return Err(StowageError::InvalidArgument {
                message: format!("unsupported share method '{method}'"),
            });
        }
        Ok(self.lookup_volume(path)?.state() == VolumeState::Shared)
    }

    /// Cached filesystem UUID of a volume.
    pub fn volume_uuid(&self, path: &str) -> StowageResult<Option<String>> {
        Ok(self.lookup_volume(path)?.uuid().map(str::to_string))
    }

    /// Cached filesystem label of a volume.
    pub fn volume_user_label(&self, path: &str) -> StowageResult<Option<String>> {
        Ok(self.lookup_volume(path)?.user_label().map(str::to_string))
    }

    /// Create directories beneath a mounted volume.
    pub fn mkdirs(&self, path: &str) -> StowageResult<()> {
        let target = Path::new(path);
        if !target.is_absolute() {
            return Err(StowageError::InvalidArgument {
                message: format!("mkdirs path '{path}' must be absolute"),
            });
        }
        let volume = self
            .volumes
            .iter()
            .find(|v| {
                target.starts_with(v.mountpoint()) || target.starts_with(v.public_mountpoint())
            })
            .ok_or_else(|| StowageError::VolumeNotFound {
                path: path.to_string(),
            })?;
        if volume.state() != VolumeState::Mounted {
            return Err(StowageError::NotMounted {
                what: volume.label().to_string(),
            });
        }
        std::fs::create_dir_all(target)?;
        Ok(())
    }

    /// Processes holding files under `path`.
    #[must_use]
    pub fn storage_users(&self, path: &str) -> Vec<StorageUser> {
        self.svc.killer.list_holders(Path::new(path))
    }

    /// Loop, dm, container, and mount-table state for `dump`.
    #[must_use]
    pub fn dump(&self) -> Vec<String> {
        let mut lines = Vec::new();
        lines.push("Dumping loop status".to_string());
        lines.extend(self.svc.loops.dump_state());
        lines.push("Dumping DM status".to_string());
        lines.extend(self.svc.dm.dump_state());
        lines.push("Dumping mounted containers".to_string());
        lines.extend(self.containers.lock().dump_state());
        lines.push("Dumping mounted filesystems".to_string());
        lines.extend(self.svc.mounter.mount_table());
        lines
    }

    /// Trim every mounted writable filesystem; returns the count.
    #[must_use]
    pub fn fstrim(&self) -> usize {
        crate::fstrim::trim_all(self.svc.mounter.as_ref())
    }

    // Container entry points. Each takes the process-wide container
    // lock for its full duration.

    /// Create a secure container.
    pub fn create_asec(
        &self,
        id: &str,
        num_sectors: u64,
        fs_type: &str,
        key: &str,
        owner_uid: u32,
        external: bool,
    ) -> StowageResult<()> {
        let id = ContainerId::new(id)?;
        self.containers
            .lock()
            .create_asec(&self.svc, &id, num_sectors, fs_type, key, owner_uid, external)
    }

    /// Seal a freshly packaged container read-only.
    pub fn finalize_asec(&self, id: &str) -> StowageResult<()> {
        let id = ContainerId::new(id)?;
        self.containers.lock().finalize_asec(&self.svc, &id)
    }

    /// Fix ownership/modes of a container payload file.
    pub fn fix_asec_perms(&self, id: &str, gid: u32, filename: &str) -> StowageResult<()> {
        let id = ContainerId::new(id)?;
        self.containers.lock().fix_asec_perms(&id, gid, filename)
    }

    /// Mount an existing container.
    pub fn mount_asec(&self, id: &str, key: &str, owner_uid: u32) -> StowageResult<()> {
        let id = ContainerId::new(id)?;
        self.containers.lock().mount_asec(&self.svc, &id, key, owner_uid)
    }

    /// Unmount a container.
    pub fn unmount_asec(&self, id: &str, force: bool) -> StowageResult<()> {
        let id = ContainerId::new(id)?;
        self.containers.lock().unmount_asec(&self.svc, &id, force)
    }

    /// Destroy a container and its image.
    pub fn destroy_asec(&self, id: &str, force: bool) -> StowageResult<()> {
        let id = ContainerId::new(id)?;
        self.containers.lock().destroy_asec(&self.svc, &id, force)
    }

    /// Rename an unmounted container.
    pub fn rename_asec(&self, old_id: &str, new_id: &str) -> StowageResult<()> {
        let old_id = ContainerId::new(old_id)?;
        let new_id = ContainerId::new(new_id)?;
        self.containers.lock().rename_asec(&self.svc, &old_id, &new_id)
    }

    /// Mountpoint of an active container.
    pub fn asec_path(&self, id: &str) -> StowageResult<PathBuf> {
        let id = ContainerId::new(id)?;
        self.containers.lock().asec_path(&self.svc, &id)
    }

    /// Image path of a container.
    pub fn asec_fs_path(&self, id: &str) -> StowageResult<PathBuf> {
        let id = ContainerId::new(id)?;
        self.containers.lock().asec_fs_path(&self.svc, &id)
    }

    /// Ids of every known container image.
    #[must_use]
    pub fn list_asecs(&self) -> Vec<ContainerId> {
        self.containers.lock().list_asecs(&self.svc)
    }

    /// Mount an OBB image.
    pub fn mount_obb(&self, source: &str, key: &str, owner_gid: u32) -> StowageResult<()> {
        self.containers
            .lock()
            .mount_obb(&self.svc, Path::new(source), key, owner_gid)
    }

    /// Unmount an OBB image.
    pub fn unmount_obb(&self, source: &str, force: bool) -> StowageResult<()> {
        self.containers
            .lock()
            .unmount_obb(&self.svc, Path::new(source), force)
    }

    /// Mountpoint of a mounted OBB.
    pub fn obb_path(&self, source: &str) -> StowageResult<PathBuf> {
        self.containers.lock().obb_path(Path::new(source))
    }

    /// Sources of every mounted OBB.
    #[must_use]
    pub fn list_obbs(&self) -> Vec<PathBuf> {
        self.containers.lock().list_obbs()
    }

    /// Mount an ISO image.
    pub fn mount_iso(&self, source: &str) -> StowageResult<()> {
        self.containers.lock().mount_iso(&self.svc, Path::new(source))
    }

    /// Unmount an ISO image.
    pub fn unmount_iso(&self, source: &str, force: bool) -> StowageResult<()> {
        self.containers
            .lock()
            .unmount_iso(&self.svc, Path::new(source), force)
    }

    /// Mountpoint of a mounted ISO.
    pub fn iso_path(&self, source: &str) -> StowageResult<PathBuf> {
        self.containers.lock().iso_path(Path::new(source))
    }

    /// Sources of every mounted ISO.
    #[must_use]
    pub fn list_isos(&self) -> Vec<PathBuf> {
        self.containers.lock().list_isos()
    }

    /// Mount a Samba share.
    pub fn mount_samba(&self, config: &SambaConfig) -> StowageResult<()> {
        self.containers.lock().mount_samba(&self.svc, config)
    }

    /// Unmount a Samba share.
    pub fn unmount_samba(&self, mountpoint: &str, force: bool) -> StowageResult<()> {
        self.containers
            .lock()
            .unmount_samba(&self.svc, mountpoint, force)
    }
}
