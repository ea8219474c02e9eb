//! Disk-backed volumes: hotplug-driven partition discovery.
//!
//! A disk add announces `NPARTS` partitions; each partition add clears
//! its bit in a one-based pending mask (bit 0 stays unused). The volume
//! leaves `Pending` for `Idle` exactly when the mask drains. Removal
//! reverses the process, force-unmounting first when the mounted
//! partition itself disappears.

use parking_lot::Mutex;

use stowage_common::StowageResult;

use crate::broadcast::ResponseCode;
use crate::containers::ContainerRegistry;
use crate::device::Kdev;
use crate::event::{BlockAction, BlockEvent, DevType};
use crate::manager::Services;
use crate::volume::{Volume, VolumeState};

/// Upper bound on partition numbers the discovery mask tracks.
pub const MAX_PARTITIONS: u32 = 32;

/// Device info saved across a crypto mapping so it can be reverted.
#[derive(Debug, Clone)]
struct SavedDeviceInfo {
    disk_major: Option<u32>,
    disk_minor: Option<u32>,
    partition: Option<u32>,
    part_minors: [Option<u32>; MAX_PARTITIONS as usize],
}

/// Discovery state for a physical disk.
#[derive(Debug)]
pub struct DirectData {
    sysfs_paths: Vec<String>,
    disk_major: Option<u32>,
    disk_minor: Option<u32>,
    num_parts: u32,
    // Only slot zero is ever read back; the platform supports a single
    // partition per volume and later adds overwrite earlier ones.
    part_minors: [Option<u32>; MAX_PARTITIONS as usize],
    pending_part_mask: u64,
    is_decrypted: bool,
    saved: Option<SavedDeviceInfo>,
}

impl DirectData {
    /// Fresh discovery state claiming the given sysfs prefixes.
    #[must_use]
    pub fn new(sysfs_paths: Vec<String>) -> Self {
        Self {
            sysfs_paths,
            disk_major: None,
            disk_minor: None,
            num_parts: 0,
            part_minors: [None; MAX_PARTITIONS as usize],
            pending_part_mask: 0,
            is_decrypted: false,
            saved: None,
        }
    }

    /// Whether one of this volume's sysfs prefixes owns `devpath`.
    #[must_use]
    pub fn claims_devpath(&self, devpath: &str) -> bool {
        self.sysfs_paths
            .iter()
            .any(|prefix| devpath.starts_with(prefix.as_str()))
    }

    /// Whether a crypto mapping is active.
    #[must_use]
    pub fn is_decrypted(&self) -> bool {
        self.is_decrypted
    }

    /// Pending one-based partition bitset; zero means discovery done.
    #[must_use]
    pub fn pending_part_mask(&self) -> u64 {
        self.pending_part_mask
    }

    /// The whole-disk device, once a disk add has been seen.
    #[must_use]
    pub fn disk_device(&self) -> Option<Kdev> {
        Some(Kdev::new(self.disk_major?, self.disk_minor?))
    }

    /// Candidate devices for mounting.
    ///
    /// Whole-device volumes with no partitions yield the disk itself;
    /// everything else yields the single recorded partition minor.
    #[must_use]
    pub fn device_nodes(&self, partition: Option<u32>) -> Vec<Kdev> {
        let Some(major) = self.disk_major else {
            return Vec::new();
        };
        if partition.is_none() && self.num_parts == 0 {
            return match self.disk_minor {
                Some(minor) => vec![Kdev::new(major, minor)],
                None => Vec::new(),
            };
        }
        match self.part_minors[0] {
            Some(minor) => vec![Kdev::new(major, minor)],
            None => Vec::new(),
        }
    }

    /// Point the volume at a decrypted mapping, saving the original
    /// device info. Returns the new partition index.
    pub(crate) fn update_device_info(
        &mut self,
        partition: Option<u32>,
        sysfs_path: &str,
        dev: Kdev,
    ) -> StowageResult<u32> {
        use stowage_common::StowageError;

        if partition.is_none() {
            tracing::error!("can only change device info on a partition");
            return Err(StowageError::internal(
                "device info update requires a partition volume",
            ));
        }
        if self.sysfs_paths.len() != 1 {
            tracing::error!("cannot change path if there is more than one for a volume");
            return Err(StowageError::internal(
                "device info update requires a single sysfs claim",
            ));
        }

        self.sysfs_paths[0] = sysfs_path.to_string();

        // Keep the original info so a factory reset can format the
        // in-the-clear device rather than the mapping.
        self.saved = Some(SavedDeviceInfo {
            disk_major: self.disk_major,
            disk_minor: self.disk_minor,
            partition,
            part_minors: self.part_minors,
        });

        self.disk_major = Some(dev.major);
        self.disk_minor = Some(dev.minor);
        // Virtual block devices have no partitions; the first usable
        // crypt mapping carries minor one, which doubles as its
        // partition index here.
        self.part_minors[0] = Some(dev.minor);
        self.is_decrypted = true;
        Ok(dev.minor)
    }

    /// Undo [`Self::update_device_info`]. Returns the restored partition
    /// index when a mapping was actually active.
    pub(crate) fn revert_device_info(&mut self) -> Option<Option<u32>> {
        if !self.is_decrypted {
            return None;
        }
        self.is_decrypted = false;
        let saved = self.saved.take()?;
        self.disk_major = saved.disk_major;
        self.disk_minor = saved.disk_minor;
        self.part_minors = saved.part_minors;
        Some(saved.partition)
    }
}

/// One-based pending mask for `nparts` announced partitions.
fn pending_mask(nparts: u32) -> u64 {
    (1..=nparts.min(MAX_PARTITIONS)).fold(0u64, |mask, i| mask | (1 << i))
}

/// Dispatch a matched block event into the discovery handlers.
pub(crate) fn handle_block_event(
    vol: &mut Volume,
    svc: &Services,
    containers: &Mutex<ContainerRegistry>,
    evt: &BlockEvent,
) -> StowageResult<()> {
    match (evt.action, evt.devtype) {
        (BlockAction::Add, DevType::Disk) => handle_disk_added(vol, svc, evt),
        (BlockAction::Add, DevType::Partition) => handle_partition_added(vol, svc, evt),
        (BlockAction::Change, DevType::Disk) => handle_disk_changed(vol, svc, evt),
        (BlockAction::Change, DevType::Partition) => handle_partition_changed(vol, evt),
        (BlockAction::Remove, DevType::Disk) => handle_disk_removed(vol, svc, containers, evt),
        (BlockAction::Remove, DevType::Partition) => {
            handle_partition_removed(vol, svc, containers, evt)
        }
    }
}

fn handle_disk_added(vol: &mut Volume, svc: &Services, evt: &BlockEvent) -> StowageResult<()> {
    if vol.state() != VolumeState::NoMedia {
        // Duplicate disk adds while media is known are no-ops.
        return Ok(());
    }

    let dev = Kdev::new(evt.major, evt.minor);
    if let Err(err) = svc.nodes.ensure_node(dev) {
        tracing::error!(%err, node = %dev, "error making device node");
    }

    let nparts = evt.nparts.unwrap_or_else(|| {
        tracing::warn!(devpath = %evt.devpath, "kernel block uevent missing NPARTS");
        1
    });

    {
        let data = vol.direct_mut();
        data.disk_major = Some(evt.major);
        data.disk_minor = Some(evt.minor);
        data.num_parts = nparts;
        data.pending_part_mask = pending_mask(nparts);
    }

    if nparts == 0 {
        vol.set_state(svc, VolumeState::Idle);
        svc.broadcaster.send(
            ResponseCode::VolumeDiskInserted,
            format!(
                "Volume {} {} disk inserted ({}:{})",
                vol.label(),
                vol.public_mountpoint().display(),
                evt.major,
                evt.minor
            ),
        );
    } else {
        tracing::debug!(volume = %vol.label(), nparts,
            mask = format_args!("{:#x}", vol.direct().pending_part_mask()),
            "waiting for partitions");
        vol.set_state(svc, VolumeState::Pending);
    }
    Ok(())
}

fn handle_partition_added(vol: &mut Volume, svc: &Services, evt: &BlockEvent) -> StowageResult<()> {
    let part_num = evt.partn.unwrap_or_else(|| {
        tracing::warn!(devpath = %evt.devpath, "kernel block uevent missing PARTN");
        1
    });
    if !(1..=MAX_PARTITIONS).contains(&part_num) {
        tracing::error!(part_num, devpath = %evt.devpath, "invalid PARTN value");
        return Ok(());
    }

    let dev = Kdev::new(evt.major, evt.minor);
    if let Err(err) = svc.nodes.ensure_node(dev) {
        tracing::error!(%err, node = %dev, "error making device node");
    }

    let (mask_drained, disk) = {
        let data = vol.direct_mut();
        if part_num > data.num_parts {
            data.num_parts = part_num;
        }
        if Some(evt.major) != data.disk_major {
            tracing::error!(devpath = %evt.devpath,
                "partition has a different major than its disk");
            return Ok(());
        }

        data.part_minors[0] = Some(evt.minor);
        data.pending_part_mask &= !(1u64 << part_num);
        (data.pending_part_mask == 0, data.disk_device())
    };

    if mask_drained {
        if vol.state() != VolumeState::Formatting {
            vol.set_state(svc, VolumeState::Idle);
            let disk = disk.unwrap_or(dev);
            svc.broadcaster.send(
                ResponseCode::VolumeDiskInserted,
                format!(
                    "Volume {} {} partition added ({}:{})",
                    vol.label(),
                    vol.public_mountpoint().display(),
                    disk.major,
                    disk.minor
                ),
            );
        }
    } else {
        tracing::debug!(volume = %vol.label(),
            mask = format_args!("{:#x}", vol.direct().pending_part_mask()),
            "pending partition mask updated");
    }
    Ok(())
}

fn handle_disk_changed(vol: &mut Volume, svc: &Services, evt: &BlockEvent) -> StowageResult<()> {
    let nparts = {
        let data = vol.direct_mut();
        if Some(evt.major) != data.disk_major || Some(evt.minor) != data.disk_minor {
            return Ok(());
        }

        let nparts = evt.nparts.unwrap_or_else(|| {
            tracing::warn!(devpath = %evt.devpath, "kernel block uevent missing NPARTS");
            1
        });
        data.num_parts = nparts;
        data.pending_part_mask = pending_mask(nparts);
        nparts
    };

    tracing::info!(volume = %vol.label(), nparts, "disk has changed");

    if vol.state() != VolumeState::Formatting {
        if nparts == 0 {
            vol.set_state(svc, VolumeState::Idle);
        } else {
            vol.set_state(svc, VolumeState::Pending);
        }
    }
    Ok(())
}

fn handle_partition_changed(vol: &mut Volume, evt: &BlockEvent) -> StowageResult<()> {
    tracing::debug!(volume = %vol.label(), major = evt.major, minor = evt.minor,
        "partition changed");
    Ok(())
}

fn handle_disk_removed(
    vol: &mut Volume,
    svc: &Services,
    containers: &Mutex<ContainerRegistry>,
    evt: &BlockEvent,
) -> StowageResult<()> {
    if vol.state() == VolumeState::NoMedia {
        return Ok(());
    }
    tracing::debug!(volume = %vol.label(), major = evt.major, minor = evt.minor,
        "disk removed");

    if vol.state() == VolumeState::Pending {
        vol.set_state(svc, VolumeState::NoMedia);
        Ok(())
    } else {
        // Past Pending the disk removal is really the mounted
        // partition going away.
        handle_partition_removed(vol, svc, containers, evt)
    }
}

fn handle_partition_removed(
    vol: &mut Volume,
    svc: &Services,
    containers: &Mutex<ContainerRegistry>,
    evt: &BlockEvent,
) -> StowageResult<()> {
    if vol.state() == VolumeState::NoMedia {
        return Ok(());
    }
    tracing::debug!(volume = %vol.label(), major = evt.major, minor = evt.minor,
        "partition removed");

    // A probe owns the state while Checking; poll until it reaches a
    // terminal state before deciding how to handle the removal. (The
    // probe runs on the engine thread, so by the time this handler
    // executes the state has already settled; the wait loop is kept for
    // the split-reader deployment where it has not.)
    while vol.state() == VolumeState::Checking {
        std::thread::sleep(std::time::Duration::from_millis(500));
    }
    let state = vol.state();

    let bad_removal = format!(
        "Volume {} {} bad removal ({}:{})",
        vol.label(),
        vol.public_mountpoint().display(),
        evt.major,
        evt.minor
    );

    // Only a mounted or shared volume needs teardown; otherwise the
    // media is simply gone.
    if state != VolumeState::Mounted && state != VolumeState::Shared {
        vol.set_state(svc, VolumeState::NoMedia);
        tracing::error!(volume = %vol.label(), "{bad_removal}");
        svc.broadcaster
            .send(ResponseCode::VolumeDiskRemoved, bad_removal);
        return Ok(());
    }

    if Some(Kdev::new(evt.major, evt.minor)) == vol.current_mounted_kdev() {
        // Our mounted partition is going away.
        match vol.unmount_vol(svc, containers, true, false) {
            Ok(()) => {
                tracing::debug!(volume = %vol.label(), "crisis averted");
                vol.set_state(svc, VolumeState::NoMedia);
            }
            Err(err) => {
                tracing::error!(%err, volume = %vol.label(),
                    "failed to unmount volume on bad removal");
            }
        }
    } else if state == VolumeState::Shared {
        // Removed while lent out over mass storage.
        match svc.share.disable() {
            Ok(()) => {
                tracing::debug!(volume = %vol.label(), "crisis averted");
                vol.set_state_unshared(svc);
            }
            Err(err) => {
                tracing::error!(%err, volume = %vol.label(),
                    "failed to unshare volume on bad removal");
            }
        }
        vol.set_state(svc, VolumeState::NoMedia);
    }

    svc.broadcaster
        .send(ResponseCode::VolumeDiskRemoved, bad_removal);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_mask_is_one_based() {
        assert_eq!(pending_mask(0), 0);
        assert_eq!(pending_mask(1), 0b10);
        assert_eq!(pending_mask(3), 0b1110);
        // Bit zero stays unused.
        assert_eq!(pending_mask(MAX_PARTITIONS) & 1, 0);
    }

    #[test]
    fn device_nodes_whole_disk() {
        let mut data = DirectData::new(vec!["/devices/platform/sdhci.1".into()]);
        assert!(data.device_nodes(None).is_empty());

        data.disk_major = Some(179);
        data.disk_minor = Some(0);
        data.num_parts = 0;
        assert_eq!(data.device_nodes(None), vec![Kdev::new(179, 0)]);
    }

    #[test]
    fn device_nodes_partition() {
        let mut data = DirectData::new(vec!["/devices/platform/sdhci.1".into()]);
        data.disk_major = Some(8);
        data.disk_minor = Some(16);
        data.num_parts = 1;
        // Partition not yet seen.
        assert!(data.device_nodes(Some(1)).is_empty());

        data.part_minors[0] = Some(17);
        assert_eq!(data.device_nodes(Some(1)), vec![Kdev::new(8, 17)]);
        // Whole-device config with partitions present also uses the
        // recorded minor.
        assert_eq!(data.device_nodes(None), vec![Kdev::new(8, 17)]);
    }

    #[test]
    fn claims_by_prefix() {
        let data = DirectData::new(vec!["/devices/platform/usb".into()]);
        assert!(data.claims_devpath("/devices/platform/usb/sdb/sdb1"));
        assert!(!data.claims_devpath("/devices/platform/sdhci.1/mmcblk0"));
    }

    #[test]
    fn update_and_revert_device_info() {
        let mut data = DirectData::new(vec!["/devices/platform/sdhci.1".into()]);
        data.disk_major = Some(179);
        data.disk_minor = Some(0);
        data.part_minors[0] = Some(1);

        let new_part = data
            .update_device_info(Some(1), "/devices/virtual/block/dm-1", Kdev::new(254, 1))
            .unwrap();
        assert_eq!(new_part, 1);
        assert!(data.is_decrypted());
        assert_eq!(data.disk_device(), Some(Kdev::new(254, 1)));

        let restored = data.revert_device_info().unwrap();
        assert_eq!(restored, Some(1));
        assert!(!data.is_decrypted());
        assert_eq!(data.disk_device(), Some(Kdev::new(179, 0)));
        assert_eq!(data.part_minors[0], Some(1));
    }

    #[test]
    fn update_device_info_requires_partition() {
        let mut data = DirectData::new(vec!["/devices/platform/sdhci.1".into()]);
        assert!(data
            .update_device_info(None, "/devices/virtual/block/dm-1", Kdev::new(254, 1))
            .is_err());
    }
}
