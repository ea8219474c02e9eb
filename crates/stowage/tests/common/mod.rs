//! Shared harness for engine integration tests: a manager wired to stub
//! services so the full state machine runs without privileges.

// Each test binary uses a different slice of the harness.
#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use stowage::broadcast::{Broadcast, ResponseCode};
use stowage::crypto::UnsupportedCrypto;
use stowage::device::{DeviceNodes, Kdev};
use stowage::devmapper::DmAllocator;
use stowage::event::{BlockAction, BlockEvent, DevType};
use stowage::fs::{FsDriver, FsRegistry, MountCtx};
use stowage::loopdev::LoopAllocator;
use stowage::manager::Services;
use stowage::mounter::{MountOptions, Mounter};
use stowage::process::{KillAction, ProcessKiller, StorageUser};
use stowage::props::MemoryProps;
use stowage::share::UmsShare;
use stowage::volume::{VolumeConfig, VolumeFlags};
use stowage::xwarp::Xwarp;
use stowage::VolumeManager;
use stowage_common::{StowageError, StowagePaths};

/// Records every mount-table mutation and simulates `EBUSY` on demand.
#[derive(Default, Clone)]
pub struct StubMounter {
    state: Arc<Mutex<MounterState>>,
}

#[derive(Default)]
struct MounterState {
    mounted: BTreeSet<PathBuf>,
    ops: Vec<String>,
    unmount_failures: HashMap<PathBuf, usize>,
}

impl StubMounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` unmounts of `path` fail with `EBUSY`.
    pub fn fail_unmounts(&self, path: &Path, count: usize) {
        self.state
            .lock()
            .unmount_failures
            .insert(path.to_path_buf(), count);
    }

    pub fn ops(&self) -> Vec<String> {
        self.state.lock().ops.clone()
    }

    pub fn move_count(&self) -> usize {
        self.ops().iter().filter(|op| op.starts_with("move ")).count()
    }

    pub fn is_mounted(&self, path: &Path) -> bool {
        self.state.lock().mounted.contains(path)
    }
}

fn ebusy() -> StowageError {
    StowageError::Io(std::io::Error::from_raw_os_error(libc::EBUSY))
}

fn einval() -> StowageError {
    StowageError::Io(std::io::Error::from_raw_os_error(libc::EINVAL))
}

impl Mounter for StubMounter {
    fn mount(
        &self,
        device: &Path,
        target: &Path,
        fstype: &str,
        options: &MountOptions,
        _data: &str,
    ) -> Result<(), StowageError> {
        let mut state = self.state.lock();
        let mut op = format!("mount {fstype} {} {}", device.display(), target.display());
        if options.readonly {
            op.push_str(" ro");
        }
        if options.noexec {
            op.push_str(" noexec");
        }
        state.ops.push(op);
        state.mounted.insert(target.to_path_buf());
        Ok(())
    }

    fn bind(&self, source: &Path, target: &Path) -> Result<(), StowageError> {
        let mut state = self.state.lock();
        state
            .ops
            .push(format!("bind {} {}", source.display(), target.display()));
        state.mounted.insert(target.to_path_buf());
        Ok(())
    }

    fn move_mount(&self, source: &Path, target: &Path) -> Result<(), StowageError> {
        let mut state = self.state.lock();
        if !state.mounted.remove(source) {
            return Err(einval());
        }
        state
            .ops
            .push(format!("move {} {}", source.display(), target.display()));
        state.mounted.insert(target.to_path_buf());
        Ok(())
    }

    fn remount_readonly(&self, target: &Path) -> Result<(), StowageError> {
        self.state
            .lock()
            .ops
            .push(format!("remount-ro {}", target.display()));
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), StowageError> {
        let mut state = self.state.lock();
        if let Some(remaining) = state.unmount_failures.get_mut(target) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ebusy());
            }
        }
        state.ops.push(format!("unmount {}", target.display()));
        if state.mounted.remove(target) {
            Ok(())
        } else {
            // The kernel reports EINVAL for paths that are not mounted.
            Err(einval())
        }
    }

    fn is_mountpoint_mounted(&self, path: &Path) -> bool {
        self.state.lock().mounted.contains(path)
    }

    fn mount_table(&self) -> Vec<String> {
        self.state
            .lock()
            .mounted
            .iter()
            .map(|m| format!("/dev/stub {} vfat rw 0 0", m.display()))
            .collect()
    }
}

/// Probe driver that succeeds or fails on command, recording attempts.
pub struct StubDriver {
    name: &'static str,
    works: bool,
    attempts: Arc<Mutex<Vec<&'static str>>>,
}

impl FsDriver for StubDriver {
    fn name(&self) -> &'static str {
        self.name
    }

    fn mount(
        &self,
        mounter: &dyn Mounter,
        device: &Path,
        target: &Path,
        ctx: &MountCtx,
    ) -> Result<(), StowageError> {
        self.attempts.lock().push(self.name);
        if self.works {
            let mut options = MountOptions::media_default();
            options.readonly = ctx.readonly;
            mounter.mount(device, target, self.name, &options, "")
        } else {
            Err(einval())
        }
    }

    fn check(&self, _device: &Path) -> Result<(), StowageError> {
        Ok(())
    }

    fn format(&self, device: &Path, num_sectors: u64, wipe: bool) -> Result<(), StowageError> {
        self.attempts.lock().push(self.name);
        let _ = (device, num_sectors, wipe);
        Ok(())
    }
}

/// Records holder-eviction requests.
#[derive(Default, Clone)]
pub struct StubKiller {
    pub signals: Arc<Mutex<Vec<(PathBuf, KillAction)>>>,
}

impl ProcessKiller for StubKiller {
    fn kill_holders(&self, path: &Path, action: KillAction) -> usize {
        self.signals.lock().push((path.to_path_buf(), action));
        1
    }

    fn list_holders(&self, _path: &Path) -> Vec<StorageUser> {
        Vec::new()
    }
}

/// Device nodes as plain files so no mknod capability is needed.
pub struct FileNodes {
    dir: PathBuf,
}

impl DeviceNodes for FileNodes {
    fn ensure_node(&self, dev: Kdev) -> Result<PathBuf, StowageError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.node_path(dev);
        std::fs::write(&path, b"")?;
        Ok(path)
    }

    fn node_path(&self, dev: Kdev) -> PathBuf {
        self.dir.join(dev.to_string())
    }

    fn remove_node(&self, dev: Kdev) -> Result<(), StowageError> {
        let _ = std::fs::remove_file(self.node_path(dev));
        Ok(())
    }
}

/// Loop pool handing out fake `/dev/loopN` paths.
#[derive(Default)]
pub struct StubLoops {
    state: Mutex<(u32, HashMap<PathBuf, PathBuf>)>,
}

impl LoopAllocator for StubLoops {
    fn attach(&self, backing: &Path) -> Result<PathBuf, StowageError> {
        let mut state = self.state.lock();
        if let Some(dev) = state.1.get(backing) {
            return Ok(dev.clone());
        }
        let dev = PathBuf::from(format!("/dev/block/loop{}", state.0));
        state.0 += 1;
        state.1.insert(backing.to_path_buf(), dev.clone());
        Ok(dev)
    }

    fn detach(&self, device: &Path) -> Result<(), StowageError> {
        self.state.lock().1.retain(|_, dev| dev != device);
        Ok(())
    }

    fn lookup(&self, backing: &Path) -> Option<PathBuf> {
        self.state.lock().1.get(backing).cloned()
    }

    fn dump_state(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Device-mapper pool handing out fake `/dev/mapper` paths.
#[derive(Default)]
pub struct StubDm {
    active: Mutex<HashMap<String, PathBuf>>,
}

impl DmAllocator for StubDm {
    fn create(
        &self,
        name: &str,
        _device: &Path,
        _key: &str,
        _size_sectors: u64,
    ) -> Result<PathBuf, StowageError> {
        let dev = PathBuf::from(format!("/dev/mapper/{name}"));
        self.active.lock().insert(name.to_string(), dev.clone());
        Ok(dev)
    }

    fn remove(&self, name: &str) -> Result<(), StowageError> {
        self.active.lock().remove(name);
        Ok(())
    }

    fn lookup(&self, name: &str) -> Option<PathBuf> {
        self.active.lock().get(name).cloned()
    }

    fn dump_state(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Everything a test needs to drive the engine and inspect side effects.
pub struct Harness {
    pub temp: tempfile::TempDir,
    pub paths: StowagePaths,
    pub manager: VolumeManager,
    pub mounter: StubMounter,
    pub killer: StubKiller,
    pub probe_attempts: Arc<Mutex<Vec<&'static str>>>,
    pub events: tokio::sync::broadcast::Receiver<Broadcast>,
}

/// Which stub probe drivers succeed.
pub struct ProbePlan {
    pub ntfs: bool,
    pub fat: bool,
    pub ext: bool,
    pub exfat: bool,
}

impl Default for ProbePlan {
    fn default() -> Self {
        Self {
            ntfs: false,
            fat: true,
            ext: false,
            exfat: false,
        }
    }
}

impl Harness {
    pub fn new(plan: ProbePlan) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = StowagePaths::with_root(temp.path());
        paths.create_dirs().expect("layout");

        let lun_file = temp.path().join("lun0_file");
        std::fs::write(&lun_file, b"").unwrap();

        let mounter = StubMounter::new();
        let killer = StubKiller::default();
        let probe_attempts = Arc::new(Mutex::new(Vec::new()));

        let drivers: Vec<Box<dyn FsDriver>> = [
            ("ntfs", plan.ntfs),
            ("fat", plan.fat),
            ("ext", plan.ext),
            ("exfat", plan.exfat),
        ]
        .into_iter()
        .map(|(name, works)| {
            Box::new(StubDriver {
                name,
                works,
                attempts: Arc::clone(&probe_attempts),
            }) as Box<dyn FsDriver>
        })
        .collect();
        let mut fs = FsRegistry::with_probe_drivers(drivers);
        fs.register(Box::new(StubDriver {
            name: "iso9660",
            works: true,
            attempts: Arc::clone(&probe_attempts),
        }));

        let svc = Services {
            broadcaster: stowage::Broadcaster::new(),
            fs,
            mounter: Box::new(mounter.clone()),
            nodes: Box::new(FileNodes {
                dir: paths.device_nodes(),
            }),
            killer: Box::new(killer.clone()),
            crypto: Box::new(UnsupportedCrypto),
            props: Box::new(MemoryProps::new()),
            share: Box::new(UmsShare::new(&lun_file)),
            loops: Box::new(StubLoops::default()),
            dm: Box::new(StubDm::default()),
            xwarp: Xwarp::new(temp.path().join("xwarp"), temp.path().join("xwarp.img")),
            paths: paths.clone(),
        };

        let manager = VolumeManager::new(svc);
        let events = manager.services().broadcaster.subscribe();

        Self {
            temp,
            paths,
            manager,
            mounter,
            killer,
            probe_attempts,
            events,
        }
    }

    /// Register the conventional test volume claiming the USB sysfs
    /// prefix, with its mountpoint under the scratch root.
    pub fn add_sdcard(&mut self, flags: VolumeFlags) -> PathBuf {
        let mountpoint = self.paths.storage().join("sdcard1");
        self.manager
            .add_volume(VolumeConfig {
                label: "sdcard1".to_string(),
                mountpoint: mountpoint.clone(),
                public_mountpoint: None,
                flags,
                partition: Some(1),
                sysfs_paths: vec!["/devices/platform/usb".to_string()],
            })
            .expect("volume registered");
        mountpoint
    }

    pub fn disk_add(&mut self, nparts: u32) {
        let evt = BlockEvent {
            action: BlockAction::Add,
            devtype: DevType::Disk,
            devpath: "/devices/platform/usb/sdb".to_string(),
            devname: Some("sdb".to_string()),
            major: 8,
            minor: 16,
            nparts: Some(nparts),
            partn: None,
        };
        self.manager.dispatch_block_event(&evt).expect("disk add");
    }

    pub fn partition_add(&mut self, partn: u32, minor: u32) {
        let evt = BlockEvent {
            action: BlockAction::Add,
            devtype: DevType::Partition,
            devpath: format!("/devices/platform/usb/sdb/sdb{partn}"),
            devname: Some(format!("sdb{partn}")),
            major: 8,
            minor,
            nparts: None,
            partn: Some(partn),
        };
        self.manager
            .dispatch_block_event(&evt)
            .expect("partition add");
    }

    pub fn partition_remove(&mut self, partn: u32, minor: u32) {
        let evt = BlockEvent {
            action: BlockAction::Remove,
            devtype: DevType::Partition,
            devpath: format!("/devices/platform/usb/sdb/sdb{partn}"),
            devname: Some(format!("sdb{partn}")),
            major: 8,
            minor,
            nparts: None,
            partn: Some(partn),
        };
        self.manager
            .dispatch_block_event(&evt)
            .expect("partition remove");
    }

    pub fn disk_remove(&mut self) {
        let evt = BlockEvent {
            action: BlockAction::Remove,
            devtype: DevType::Disk,
            devpath: "/devices/platform/usb/sdb".to_string(),
            devname: Some("sdb".to_string()),
            major: 8,
            minor: 16,
            nparts: None,
            partn: None,
        };
        self.manager.dispatch_block_event(&evt).expect("disk remove");
    }

    /// Drain every broadcast published so far.
    pub fn drain_events(&mut self) -> Vec<Broadcast> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn count_events(&mut self, code: ResponseCode) -> usize {
        self.drain_events()
            .into_iter()
            .filter(|e| e.code == code)
            .count()
    }
}
