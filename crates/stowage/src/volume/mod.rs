//! Per-volume state machine and mount/unmount/format orchestration.
//!
//! A volume moves between states only on the engine thread, driven by
//! kernel events, explicit commands, and the completion of its own
//! blocking operations. Every terminal state change is broadcast.
//!
//! Mounting goes through a private staging tree: the filesystem is
//! probed and mounted at the staging path, the application-secure
//! subtree is bound aside, and the whole tree is then atomically
//! move-mounted to the public mountpoint.

pub mod direct;

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use parking_lot::Mutex;

use stowage_common::{StowageError, StowageResult};

use crate::broadcast::ResponseCode;
use crate::containers::ContainerRegistry;
use crate::device::Kdev;
use crate::event::BlockEvent;
use crate::fs::MountCtx;
use crate::manager::Services;
use crate::process::KillAction;
use crate::props::{self, fuse_service};

pub use direct::DirectData;

/// Uid/gid owning mounted media content.
pub(crate) const MEDIA_RW: u32 = 1023;

/// Name of the application-secure subtree at the root of secure media.
pub(crate) const SECURE_DIR: &str = ".android_secure";
/// Pre-rename name of the secure subtree on legacy cards.
pub(crate) const LEGACY_SECURE_DIR: &str = "android_secure";

/// States a managed volume moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeState {
    /// Object constructed, nothing known yet.
    Init,
    /// No media present.
    NoMedia,
    /// Media present and ready to mount.
    Idle,
    /// Disk announced; waiting for its partitions.
    Pending,
    /// Filesystem probe/mount in flight.
    Checking,
    /// Mounted at the public mountpoint.
    Mounted,
    /// Unmount in flight.
    Unmounting,
    /// Format in flight.
    Formatting,
    /// Block device lent out (USB mass storage), not mounted.
    Shared,
    /// Lent out while the host also has it mounted.
    SharedMounted,
}

impl VolumeState {
    /// Numeric state code; part of the state-change broadcast format.
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::Init => -1,
            Self::NoMedia => 0,
            Self::Idle => 1,
            Self::Pending => 2,
            Self::Checking => 3,
            Self::Mounted => 4,
            Self::Unmounting => 5,
            Self::Formatting => 6,
            Self::Shared => 7,
            Self::SharedMounted => 8,
        }
    }

    /// Human label used in broadcasts and logs.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Init => "Initializing",
            Self::NoMedia => "No-Media",
            Self::Idle => "Idle-Unmounted",
            Self::Pending => "Pending",
            Self::Checking => "Checking",
            Self::Mounted => "Mounted",
            Self::Unmounting => "Unmounting",
            Self::Formatting => "Formatting",
            Self::Shared => "Shared-Unmounted",
            Self::SharedMounted => "Shared-Mounted",
        }
    }
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Behavior flags declared per volume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VolumeFlags {
    /// Volume hosts the application-secure subtree.
    pub provides_asec: bool,
    /// Media cannot be physically removed.
    pub non_removable: bool,
    /// Volume may carry an encrypted filesystem.
    pub encryptable: bool,
}

/// Declarative description of one managed volume.
#[derive(Debug, Clone)]
pub struct VolumeConfig {
    /// Stable identifier, unique across the process.
    pub label: String,
    /// Fixed mountpoint the media is revealed at.
    pub mountpoint: PathBuf,
    /// User-visible mountpoint; defaults to `mountpoint`.
    pub public_mountpoint: Option<PathBuf>,
    /// Behavior flags.
    pub flags: VolumeFlags,
    /// Explicit partition number, or `None` for the whole device.
    pub partition: Option<u32>,
    /// Sysfs path prefixes this volume claims uevents from.
    pub sysfs_paths: Vec<String>,
}

/// Concrete volume backing.
///
/// Only disk-backed volumes exist today, but the discovery handlers and
/// device-node enumeration dispatch through this tag.
#[derive(Debug)]
pub enum VolumeKind {
    /// Physical disk with hotplug-driven partition discovery.
    Direct(DirectData),
}

/// One managed storage volume.
#[derive(Debug)]
pub struct Volume {
    label: String,
    mountpoint: PathBuf,
    public_mountpoint: PathBuf,
    flags: VolumeFlags,
    partition: Option<u32>,
    state: VolumeState,
    uuid: Option<String>,
    user_label: Option<String>,
    current_mounted_kdev: Option<Kdev>,
    retry_mount: bool,
    debug: bool,
    kind: VolumeKind,
}

impl Volume {
    /// Build a disk-backed volume from its declaration.
    #[must_use]
    pub fn new_direct(config: VolumeConfig) -> Self {
        let public_mountpoint = config
            .public_mountpoint
            .unwrap_or_else(|| config.mountpoint.clone());
        Self {
            label: config.label,
            mountpoint: config.mountpoint,
            public_mountpoint,
            flags: config.flags,
            partition: config.partition,
            state: VolumeState::Init,
            uuid: None,
            user_label: None,
            current_mounted_kdev: None,
            retry_mount: false,
            debug: false,
            kind: VolumeKind::Direct(DirectData::new(config.sysfs_paths)),
        }
    }

    /// Stable identifier.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The mountpoint media is revealed at.
    #[must_use]
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// The user-visible mountpoint.
    #[must_use]
    pub fn public_mountpoint(&self) -> &Path {
        &self.public_mountpoint
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> VolumeState {
        self.state
    }

    /// Behavior flags.
    #[must_use]
    pub fn flags(&self) -> VolumeFlags {
        self.flags
    }

    /// Filesystem UUID from the last probe.
    #[must_use]
    pub fn uuid(&self) -> Option<&str> {
        self.uuid.as_deref()
    }

    /// Filesystem label from the last probe.
    #[must_use]
    pub fn user_label(&self) -> Option<&str> {
        self.user_label.as_deref()
    }

    /// The device currently mounted, when state is `Mounted`.
    #[must_use]
    pub fn current_mounted_kdev(&self) -> Option<Kdev> {
        self.current_mounted_kdev
    }

    /// Whether a mount attempt is queued for the next `Pending -> Idle`.
    #[must_use]
    pub fn retry_mount(&self) -> bool {
        self.retry_mount
    }

    /// The one-based pending-partition bitset (bit 0 unused). Zero once
    /// discovery has seen every announced partition.
    #[must_use]
    pub fn pending_partition_mask(&self) -> u64 {
        match &self.kind {
            VolumeKind::Direct(data) => data.pending_part_mask(),
        }
    }

    /// Consume the queued retry flag.
    pub(crate) fn take_retry_mount(&mut self) -> bool {
        std::mem::take(&mut self.retry_mount)
    }

    /// Toggle verbose logging for this volume.
    pub fn set_debug(&mut self, enable: bool) {
        self.debug = enable;
    }

    /// Whether this volume claims events for the given sysfs path.
    #[must_use]
    pub fn claims_devpath(&self, devpath: &str) -> bool {
        match &self.kind {
            VolumeKind::Direct(data) => data.claims_devpath(devpath),
        }
    }

    /// Whether the volume currently runs on a decrypted mapping.
    #[must_use]
    pub fn is_decrypted(&self) -> bool {
        match &self.kind {
            VolumeKind::Direct(data) => data.is_decrypted(),
        }
    }

    pub(crate) fn direct_mut(&mut self) -> &mut DirectData {
        match &mut self.kind {
            VolumeKind::Direct(data) => data,
        }
    }

    pub(crate) fn direct(&self) -> &DirectData {
        match &self.kind {
            VolumeKind::Direct(data) => data,
        }
    }

    /// Candidate block devices for mounting, most preferred first.
    #[must_use]
    pub fn get_device_nodes(&self) -> Vec<Kdev> {
        match &self.kind {
            VolumeKind::Direct(data) => data.device_nodes(self.partition),
        }
    }

    /// The whole-disk device, when known.
    #[must_use]
    pub fn disk_device(&self) -> Option<Kdev> {
        match &self.kind {
            VolumeKind::Direct(data) => data.disk_device(),
        }
    }

    /// The device lent out when sharing.
    #[must_use]
    pub fn share_device(&self) -> Option<Kdev> {
        self.disk_device()
    }

    /// React to a kernel block event already matched to this volume.
    pub fn handle_block_event(
        &mut self,
        svc: &Services,
        containers: &Mutex<ContainerRegistry>,
        evt: &BlockEvent,
    ) -> StowageResult<()> {
        // Disk-backed volumes are the only concrete kind; their
        // discovery handlers drive the shared state machine directly.
        direct::handle_block_event(self, svc, containers, evt)
    }

    /// Transition state, broadcasting the change.
    ///
    /// Duplicate transitions are suppressed. Leaving `Pending` for
    /// anything but `Idle` abandons a queued mount retry.
    pub(crate) fn set_state(&mut self, svc: &Services, state: VolumeState) {
        let old = self.state;
        if old == state {
            tracing::warn!(volume = %self.label, state = %state, "duplicate state transition");
            return;
        }

        if old == VolumeState::Pending && state != VolumeState::Idle {
            self.retry_mount = false;
        }

        self.state = state;
        tracing::debug!(volume = %self.label, from = %old, to = %state, "state change");
        svc.broadcaster.send(
            ResponseCode::VolumeStateChange,
            format!(
                "Volume {} {} state changed from {} ({}) to {} ({})",
                self.label,
                self.public_mountpoint.display(),
                old.code(),
                old.label(),
                state.code(),
                state.label()
            ),
        );
    }

    pub(crate) fn set_state_shared(&mut self, svc: &Services) {
        self.set_state(svc, VolumeState::Shared);
    }

    pub(crate) fn set_state_unshared(&mut self, svc: &Services) {
        self.set_state(svc, VolumeState::Idle);
    }

    /// Mount the volume at its public mountpoint.
    pub fn mount_vol(&mut self, svc: &Services) -> StowageResult<()> {
        let provides_asec = self.flags.provides_asec;

        // Hold off while the platform waits for the disk password or is
        // encrypting in place.
        let decrypt_pending = svc.props.get(props::DECRYPT_STATE).as_deref() == Some("1");
        let encrypting = svc
            .props
            .get(props::ENCRYPT_PROGRESS)
            .is_some_and(|v| !v.is_empty());

        if self.state == VolumeState::NoMedia
            || ((decrypt_pending || encrypting) && provides_asec)
        {
            svc.broadcaster.send(
                ResponseCode::VolumeMountFailedNoMedia,
                format!(
                    "Volume {} {} mount failed - no media",
                    self.label,
                    self.public_mountpoint.display()
                ),
            );
            return Err(StowageError::NoDevice {
                what: self.label.clone(),
            });
        } else if self.state != VolumeState::Idle {
            if self.state == VolumeState::Pending {
                self.retry_mount = true;
            }
            return Err(StowageError::busy(format!("volume {}", self.label)));
        }

        if svc.mounter.is_mountpoint_mounted(&self.mountpoint) {
            tracing::warn!(volume = %self.label, "volume is idle but appears to be mounted - fixing");
            self.set_state(svc, VolumeState::Mounted);
            return Ok(());
        }

        let mut device_nodes = self.get_device_nodes();
        if device_nodes.is_empty() {
            tracing::error!(volume = %self.label, "failed to get device nodes");
            return Err(StowageError::NoDevice {
                what: self.label.clone(),
            });
        }

        // An encrypted, non-removable, secure-storage volume must be
        // mapped through the crypto subsystem before it can be mounted.
        let crypto_state = svc.props.get(props::CRYPTO_STATE);
        if provides_asec
            && self.flags.non_removable
            && self.flags.encryptable
            && crypto_state.as_deref() == Some("encrypted")
            && !self.is_decrypted()
        {
            if device_nodes.len() != 1 {
                tracing::error!(volume = %self.label, count = device_nodes.len(),
                    "too many device nodes returned when mounting encryptable volume");
                return Err(StowageError::internal(
                    "expected exactly one device node for an encryptable volume",
                ));
            }
            let dev = device_nodes[0];
            let decrypted = svc.crypto.setup_volume(&self.label, dev.major, dev.minor)?;
            let new_dev = Kdev::new(decrypted.major, decrypted.minor);
            if let Err(err) = svc.nodes.ensure_node(new_dev) {
                tracing::error!(%err, node = %new_dev, "error making device node");
            }
            self.update_device_info(&decrypted.sysfs_path, new_dev)?;

            device_nodes = self.get_device_nodes();
            if device_nodes.is_empty() {
                tracing::error!(volume = %self.label, "failed to get device nodes after decrypt");
                return Err(StowageError::NoDevice {
                    what: self.label.clone(),
                });
            }
        }

        let staging = svc.paths.staging();
        for dev in device_nodes {
            let device_path = svc.nodes.node_path(dev);
            tracing::info!(device = %device_path.display(), volume = %self.label,
                "device being considered for volume");

            self.set_state(svc, VolumeState::Checking);

            let ctx = MountCtx::media(MEDIA_RW, MEDIA_RW, provides_asec);
            let mut mounted = false;
            for driver in svc.fs.probe_order() {
                match driver.mount(svc.mounter.as_ref(), &device_path, &staging, &ctx) {
                    Ok(()) => {
                        tracing::info!(driver = driver.name(), device = %device_path.display(),
                            "staging mount succeeded");
                        mounted = true;
                        break;
                    }
                    Err(err) => {
                        tracing::error!(driver = driver.name(), %err,
                            device = %device_path.display(), "probe mount failed");
                    }
                }
            }
            if !mounted {
                if self.state == VolumeState::Checking {
                    self.set_state(svc, VolumeState::Idle);
                }
                return Err(StowageError::UnsupportedFilesystem {
                    device: device_path.display().to_string(),
                });
            }

            self.extract_metadata(svc, &device_path);

            if provides_asec {
                if let Err(err) = self.mount_asec_external(svc, &staging) {
                    tracing::error!(%err, "failed to mount secure area");
                    let _ = svc.mounter.unmount(&staging);
                    if self.state == VolumeState::Checking {
                        self.set_state(svc, VolumeState::Idle);
                    }
                    return Err(err);
                }
            }

            // Bindmount trickery done; atomically move the whole subtree
            // to expose it to non-privileged users.
            let mountpoint = self.mountpoint.clone();
            if let Err(err) = self.do_move_mount(svc, &staging, &mountpoint, false) {
                tracing::error!(%err, "failed to move mount");
                if provides_asec {
                    let _ = svc.mounter.unmount(&svc.paths.secure_asec());
                }
                let _ = svc.mounter.unmount(&staging);
                if self.state == VolumeState::Checking {
                    self.set_state(svc, VolumeState::Idle);
                }
                return Err(err);
            }

            svc.props.set(props::CTL_START, &fuse_service(&self.label));

            self.current_mounted_kdev = Some(dev);
            self.set_state(svc, VolumeState::Mounted);
            return Ok(());
        }

        tracing::error!(volume = %self.label, "no suitable devices for mounting");
        if self.state == VolumeState::Checking {
            self.set_state(svc, VolumeState::Idle);
        }
        Err(StowageError::NoDevice {
            what: self.label.clone(),
        })
    }

    /// Unmount the volume, draining dependent containers first.
    pub fn unmount_vol(
        &mut self,
        svc: &Services,
        containers: &Mutex<ContainerRegistry>,
        force: bool,
        revert: bool,
    ) -> StowageResult<()> {
        let provides_asec = self.flags.provides_asec;

        if self.state != VolumeState::Mounted {
            tracing::error!(volume = %self.label, "unmount request when not mounted");
            return Err(StowageError::NotMounted {
                what: self.label.clone(),
            });
        }

        // Announce Idle before any real teardown so consumers release
        // their handles; the actual unmount follows immediately.
        self.set_state(svc, VolumeState::Unmounting);
        self.set_state(svc, VolumeState::Idle);

        {
            let mut registry = containers.lock();
            registry.cleanup_iso(svc, &self.mountpoint, true);
            if provides_asec {
                std::thread::sleep(Duration::from_secs(1));
            }
            if let Err(err) = registry.cleanup_asec(svc, force) {
                tracing::error!(%err, "failed to cleanup containers - unmount will probably fail");
            }
        }

        svc.props.set(props::CTL_STOP, &fuse_service(&self.label));

        if provides_asec {
            // Remove the bindmount keeping a reference to the obscured
            // secure directory.
            if let Err(err) = self.do_unmount(svc, &svc.paths.secure_asec(), force) {
                tracing::error!(%err, "failed to remove secure area bindmount");
                self.set_state(svc, VolumeState::Mounted);
                return Err(err);
            }
        }

        let mountpoint = self.mountpoint.clone();
        if let Err(err) = self.do_unmount(svc, &mountpoint, force) {
            tracing::error!(%err, mountpoint = %mountpoint.display(), "failed to unmount");
            if provides_asec && self.mount_asec_external(svc, &mountpoint).is_err() {
                tracing::error!("failed to remount secure area");
                self.set_state(svc, VolumeState::NoMedia);
            } else {
                self.set_state(svc, VolumeState::Mounted);
            }
            return Err(err);
        }

        tracing::info!(mountpoint = %mountpoint.display(), "unmounted successfully");

        // Undo the crypto mapping when asked, restoring the original
        // device info for a later format-in-the-clear.
        if revert && self.is_decrypted() {
            if let Err(err) = svc.crypto.revert_volume(&self.label) {
                tracing::warn!(%err, volume = %self.label, "crypto revert failed");
            }
            self.revert_device_info();
            tracing::info!(volume = %self.label, "encrypted volume reverted");
        }

        self.current_mounted_kdev = None;
        Ok(())
    }

    /// Format the volume as FAT.
    pub fn format_vol(&mut self, svc: &Services, wipe: bool) -> StowageResult<()> {
        match self.state {
            VolumeState::NoMedia => {
                return Err(StowageError::NoDevice {
                    what: self.label.clone(),
                });
            }
            VolumeState::Idle => {}
            _ => return Err(StowageError::busy(format!("volume {}", self.label))),
        }

        if svc.mounter.is_mountpoint_mounted(&self.mountpoint) {
            tracing::warn!(volume = %self.label, "volume is idle but appears to be mounted - fixing");
            self.set_state(svc, VolumeState::Mounted);
            return Err(StowageError::busy(format!("volume {}", self.label)));
        }

        let disk_node = self.disk_device().ok_or_else(|| StowageError::NoDevice {
            what: self.label.clone(),
        })?;
        // The platform formats the disk node in place even for whole
        // devices, so MBR initialization below never runs here.
        let format_entire_device = false;
        let part_node = disk_node;

        self.set_state(svc, VolumeState::Formatting);

        let result = (|| -> StowageResult<()> {
            if format_entire_device {
                crate::mbr::initialize_mbr(&svc.nodes.node_path(disk_node))?;
            }

            let device_path = svc.nodes.node_path(part_node);
            if self.debug {
                tracing::info!(volume = %self.label, device = %device_path.display(),
                    "formatting volume");
            }

            let fat = svc
                .fs
                .get("fat")
                .ok_or_else(|| StowageError::internal("fat driver not registered"))?;
            fat.format(&device_path, 0, wipe)?;

            self.extract_metadata(svc, &device_path);
            Ok(())
        })();

        match result {
            Ok(()) => {
                if self.state == VolumeState::Formatting {
                    self.set_state(svc, VolumeState::Idle);
                }
                Ok(())
            }
            Err(err) => {
                tracing::error!(%err, volume = %self.label, "format failed");
                self.set_state(svc, VolumeState::NoMedia);
                Err(err)
            }
        }
    }

    /// Move-mount with bounded retries, escalating to signalling holders
    /// of the source tree when `force` is set.
    fn do_move_mount(
        &self,
        svc: &Services,
        src: &Path,
        dst: &Path,
        force: bool,
    ) -> StowageResult<()> {
        match std::fs::create_dir(dst) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(err) => {
                tracing::error!(%err, dst = %dst.display(), "cannot create move target");
                return Err(StowageError::InvalidArgument {
                    message: format!("bad move target {}", dst.display()),
                });
            }
        }

        let mut retries = 5;
        while retries > 0 {
            retries -= 1;
            match svc.mounter.move_mount(src, dst) {
                Ok(()) => {
                    if self.debug {
                        tracing::debug!(src = %src.display(), dst = %dst.display(),
                            "moved mount successfully");
                    }
                    return Ok(());
                }
                Err(err) if !err.is_errno(libc::EBUSY) => {
                    tracing::error!(%err, src = %src.display(), dst = %dst.display(),
                        "failed to move mount");
                    return Err(err);
                }
                Err(err) => {
                    let action = if force && retries == 1 {
                        KillAction::Kill
                    } else if force && retries == 2 {
                        KillAction::Hup
                    } else {
                        KillAction::Warn
                    };
                    tracing::warn!(%err, src = %src.display(), dst = %dst.display(),
                        retries, ?action, "move mount busy");
                    svc.killer.kill_holders(src, action);
                    std::thread::sleep(Duration::from_millis(250));
                }
            }
        }

        tracing::error!(src = %src.display(), dst = %dst.display(), "giving up on move mount");
        Err(StowageError::busy(format!(
            "move {} -> {}",
            src.display(),
            dst.display()
        )))
    }

    /// Unmount with the engine's retry contract: `EINVAL`/`ENOENT` count
    /// as success, one 5-second-spaced retry, then (with `force`) twenty
    /// rounds of signalling open-file holders.
    fn do_unmount(&self, svc: &Services, path: &Path, force: bool) -> StowageResult<()> {
        if self.debug {
            tracing::debug!(path = %path.display(), force, "unmounting");
        }

        let attempt = |last: &mut Option<StowageError>| -> bool {
            match svc.mounter.unmount(path) {
                Ok(()) => true,
                Err(err) if err.is_errno(libc::EINVAL) || err.is_errno(libc::ENOENT) => true,
                Err(err) => {
                    *last = Some(err);
                    false
                }
            }
        };

        let mut last = None;
        if attempt(&mut last) {
            tracing::info!(path = %path.display(), "unmounted");
            return Ok(());
        }

        let mut retries = 1;
        while retries > 0 {
            retries -= 1;
            tracing::warn!(path = %path.display(), ?last, retries, "failed to unmount, retrying");
            std::thread::sleep(Duration::from_secs(5));
            if attempt(&mut last) {
                tracing::info!(path = %path.display(), "unmounted");
                return Ok(());
            }
        }

        if force {
            let mut retries = 20;
            while retries > 0 {
                retries -= 1;
                tracing::warn!(path = %path.display(), retries,
                    "killing processes with open files on busy mount");
                svc.killer.kill_holders(path, KillAction::Hup);
                svc.killer.kill_holders(path, KillAction::Kill);
                std::thread::sleep(Duration::from_secs(2));
                if attempt(&mut last) {
                    tracing::info!(path = %path.display(), "unmounted");
                    return Ok(());
                }
            }
        }

        tracing::error!(path = %path.display(), "giving up on unmount");
        Err(StowageError::busy(format!("unmount {}", path.display())))
    }

    /// Prepare and bind the application-secure subtree under `base` to
    /// the fixed secure bind target.
    fn mount_asec_external(&self, svc: &Services, base: &Path) -> StowageResult<()> {
        let legacy_path = base.join(LEGACY_SECURE_DIR);
        let secure_path = base.join(SECURE_DIR);

        // Recover the legacy secure directory from older cards.
        if legacy_path.exists() && !secure_path.exists() {
            if let Err(err) = std::fs::rename(&legacy_path, &secure_path) {
                tracing::error!(%err, "failed to rename legacy asec dir");
            }
        }

        if secure_path.exists() {
            if !secure_path.is_dir() {
                tracing::error!(path = %secure_path.display(), "secure path is not a directory");
                return Err(StowageError::InvalidArgument {
                    message: format!("{} is not a directory", secure_path.display()),
                });
            }
        } else {
            std::fs::create_dir(&secure_path)?;
        }

        svc.mounter.bind(&secure_path, &svc.paths.secure_asec())
    }

    /// Run blkid over the raw device, parse UUID/label, and broadcast
    /// the refreshed metadata. Extraction failure clears both values.
    pub(crate) fn extract_metadata(&mut self, svc: &Services, device: &Path) {
        let parsed = Command::new("blkid")
            .args(["-c", "/dev/null"])
            .arg(device)
            .output()
            .ok()
            .filter(|output| output.status.success())
            .and_then(|output| {
                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                stdout.lines().next().map(parse_blkid_line)
            });

        match parsed {
            Some((uuid, user_label)) => {
                self.set_uuid(svc, uuid);
                self.set_user_label(svc, user_label);
            }
            None => {
                tracing::warn!(device = %device.display(), "blkid failed to identify device");
                self.set_uuid(svc, None);
                self.set_user_label(svc, None);
            }
        }
    }

    fn set_uuid(&mut self, svc: &Services, uuid: Option<String>) {
        let msg = match &uuid {
            Some(uuid) => format!(
                "{} {} \"{}\"",
                self.label,
                self.public_mountpoint.display(),
                uuid
            ),
            None => format!("{} {}", self.label, self.public_mountpoint.display()),
        };
        self.uuid = uuid;
        svc.broadcaster.send(ResponseCode::VolumeUuidChange, msg);
    }

    fn set_user_label(&mut self, svc: &Services, user_label: Option<String>) {
        let msg = match &user_label {
            Some(user_label) => format!(
                "{} {} \"{}\"",
                self.label,
                self.public_mountpoint.display(),
                user_label
            ),
            None => format!("{} {}", self.label, self.public_mountpoint.display()),
        };
        self.user_label = user_label;
        svc.broadcaster.send(ResponseCode::VolumeUserLabelChange, msg);
    }

    fn update_device_info(&mut self, sysfs_path: &str, dev: Kdev) -> StowageResult<()> {
        let partition = self.partition;
        match &mut self.kind {
            VolumeKind::Direct(data) => {
                let new_partition = data.update_device_info(partition, sysfs_path, dev)?;
                self.partition = Some(new_partition);
                Ok(())
            }
        }
    }

    fn revert_device_info(&mut self) {
        match &mut self.kind {
            VolumeKind::Direct(data) => {
                if let Some(partition) = data.revert_device_info() {
                    self.partition = partition;
                }
            }
        }
    }
}

/// Parse one line of blkid output into `(uuid, label)`.
pub(crate) fn parse_blkid_line(line: &str) -> (Option<String>, Option<String>) {
    fn quoted_value(line: &str, key: &str) -> Option<String> {
        let start = line.find(key)? + key.len();
        let rest = &line[start..];
        let rest = rest.strip_prefix('"')?;
        let end = rest.find('"')?;
        Some(rest[..end].to_string())
    }

    (
        quoted_value(line, "UUID="),
        quoted_value(line, "LABEL="),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_codes_are_stable() {
        assert_eq!(VolumeState::Init.code(), -1);
        assert_eq!(VolumeState::NoMedia.code(), 0);
        assert_eq!(VolumeState::Idle.code(), 1);
        assert_eq!(VolumeState::Pending.code(), 2);
        assert_eq!(VolumeState::Checking.code(), 3);
        assert_eq!(VolumeState::Mounted.code(), 4);
        assert_eq!(VolumeState::Unmounting.code(), 5);
        assert_eq!(VolumeState::Formatting.code(), 6);
        assert_eq!(VolumeState::Shared.code(), 7);
        assert_eq!(VolumeState::SharedMounted.code(), 8);
    }

    #[test]
    fn state_labels() {
        assert_eq!(VolumeState::Idle.label(), "Idle-Unmounted");
        assert_eq!(VolumeState::Shared.label(), "Shared-Unmounted");
        assert_eq!(VolumeState::NoMedia.label(), "No-Media");
    }

    #[test]
    fn blkid_parse_both_fields() {
        let line = r#"/dev/block/vold/8:17: UUID="4A1C-29E8" LABEL="CAMERA" TYPE="vfat""#;
        let (uuid, label) = parse_blkid_line(line);
        assert_eq!(uuid.as_deref(), Some("4A1C-29E8"));
        assert_eq!(label.as_deref(), Some("CAMERA"));
    }

    #[test]
    fn blkid_parse_uuid_only() {
        let line = r#"/dev/block/vold/8:17: UUID="4A1C-29E8" TYPE="vfat""#;
        let (uuid, label) = parse_blkid_line(line);
        assert_eq!(uuid.as_deref(), Some("4A1C-29E8"));
        assert_eq!(label, None);
    }

    #[test]
    fn blkid_parse_garbage() {
        let (uuid, label) = parse_blkid_line("not blkid output");
        assert_eq!(uuid, None);
        assert_eq!(label, None);
    }
}
