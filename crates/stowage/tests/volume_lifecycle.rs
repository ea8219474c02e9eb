//! End-to-end volume lifecycle scenarios driven through the manager
//! with stubbed platform services.

mod common;

use common::{Harness, ProbePlan};

use stowage::broadcast::ResponseCode;
use stowage::device::Kdev;
use stowage::event::{BlockAction, BlockEvent, DevType};
use stowage::props;
use stowage::volume::{VolumeFlags, VolumeState};

fn volume_state(harness: &Harness) -> VolumeState {
    harness
        .manager
        .volumes()
        .next()
        .expect("volume registered")
        .state()
}

#[test]
fn clean_insertion_reaches_idle() {
    let mut harness = Harness::new(ProbePlan::default());
    harness.add_sdcard(VolumeFlags::default());
    harness.drain_events();

    harness.disk_add(1);
    assert_eq!(volume_state(&harness), VolumeState::Pending);

    harness.partition_add(1, 17);
    assert_eq!(volume_state(&harness), VolumeState::Idle);

    let events = harness.drain_events();
    let inserted: Vec<_> = events
        .iter()
        .filter(|e| e.code == ResponseCode::VolumeDiskInserted)
        .collect();
    assert_eq!(inserted.len(), 1, "exactly one disk-inserted broadcast");
    assert!(inserted[0].message.contains("8:16"));

    // State trace NoMedia -> Pending -> Idle.
    let states: Vec<_> = events
        .iter()
        .filter(|e| e.code == ResponseCode::VolumeStateChange)
        .map(|e| e.message.clone())
        .collect();
    assert_eq!(states.len(), 2);
    assert!(states[0].contains("to 2 (Pending)"));
    assert!(states[1].contains("to 1 (Idle-Unmounted)"));

    let volume = harness.manager.volumes().next().unwrap();
    assert_eq!(volume.pending_partition_mask(), 0);
}

#[test]
fn nparts_zero_goes_straight_to_idle() {
    let mut harness = Harness::new(ProbePlan::default());
    harness.add_sdcard(VolumeFlags::default());
    harness.drain_events();

    harness.disk_add(0);
    assert_eq!(volume_state(&harness), VolumeState::Idle);
    assert_eq!(harness.count_events(ResponseCode::VolumeDiskInserted), 1);
}

#[test]
fn multi_partition_discovery_drains_mask_once() {
    let mut harness = Harness::new(ProbePlan::default());
    harness.add_sdcard(VolumeFlags::default());
    harness.drain_events();

    harness.disk_add(3);
    harness.partition_add(1, 17);
    harness.partition_add(2, 18);
    assert_eq!(volume_state(&harness), VolumeState::Pending);
    harness.partition_add(3, 19);
    assert_eq!(volume_state(&harness), VolumeState::Idle);

    assert_eq!(harness.count_events(ResponseCode::VolumeDiskInserted), 1);
    let volume = harness.manager.volumes().next().unwrap();
    assert_eq!(volume.pending_partition_mask(), 0);
}

#[test]
fn duplicate_disk_add_is_noop() {
    let mut harness = Harness::new(ProbePlan::default());
    harness.add_sdcard(VolumeFlags::default());
    harness.disk_add(1);
    harness.partition_add(1, 17);
    harness.drain_events();

    harness.disk_add(1);
    assert_eq!(volume_state(&harness), VolumeState::Idle);
    assert_eq!(harness.count_events(ResponseCode::VolumeStateChange), 0);
}

#[test]
fn disk_remove_from_pending_yields_no_media() {
    let mut harness = Harness::new(ProbePlan::default());
    harness.add_sdcard(VolumeFlags::default());
    harness.disk_add(2);
    assert_eq!(volume_state(&harness), VolumeState::Pending);

    harness.disk_remove();
    assert_eq!(volume_state(&harness), VolumeState::NoMedia);
}

#[test]
fn unmatched_devpath_is_rejected() {
    let mut harness = Harness::new(ProbePlan::default());
    harness.add_sdcard(VolumeFlags::default());

    let evt = BlockEvent {
        action: BlockAction::Add,
        devtype: DevType::Disk,
        devpath: "/devices/platform/sdhci.2/mmcblk1".to_string(),
        devname: None,
        major: 179,
        minor: 32,
        nparts: Some(0),
        partn: None,
    };
    assert!(harness.manager.dispatch_block_event(&evt).is_err());
    assert_eq!(volume_state(&harness), VolumeState::NoMedia);
}

#[test]
fn mount_probes_in_order_and_reveals_media() {
    let mut harness = Harness::new(ProbePlan {
        ntfs: false,
        fat: true,
        ext: false,
        exfat: false,
    });
    let mountpoint = harness.add_sdcard(VolumeFlags::default());
    harness.disk_add(1);
    harness.partition_add(1, 17);
    harness.drain_events();

    harness.manager.mount_volume("sdcard1").expect("mount");

    assert_eq!(volume_state(&harness), VolumeState::Mounted);
    // NTFS fails first, FAT succeeds, EXT/EXFAT never tried.
    assert_eq!(*harness.probe_attempts.lock(), vec!["ntfs", "fat"]);
    // Staging to public move-mount happened exactly once.
    assert_eq!(harness.mounter.move_count(), 1);
    assert!(harness.mounter.is_mounted(&mountpoint));
    // The FUSE projection was started.
    assert_eq!(
        harness.manager.services().props.get(props::CTL_START).as_deref(),
        Some("fuse_sdcard1")
    );

    let events = harness.drain_events();
    let states: Vec<_> = events
        .iter()
        .filter(|e| e.code == ResponseCode::VolumeStateChange)
        .map(|e| e.message.clone())
        .collect();
    assert_eq!(states.len(), 2);
    assert!(states[0].contains("to 3 (Checking)"));
    assert!(states[1].contains("to 4 (Mounted)"));

    let volume = harness.manager.volumes().next().unwrap();
    assert_eq!(volume.current_mounted_kdev(), Some(Kdev::new(8, 17)));
}

#[test]
fn all_probes_failing_returns_to_idle() {
    let mut harness = Harness::new(ProbePlan {
        ntfs: false,
        fat: false,
        ext: false,
        exfat: false,
    });
    harness.add_sdcard(VolumeFlags::default());
    harness.disk_add(1);
    harness.partition_add(1, 17);
    harness.drain_events();

    let err = harness.manager.mount_volume("sdcard1").unwrap_err();
    assert!(err.to_string().contains("No supported filesystem"));
    assert_eq!(volume_state(&harness), VolumeState::Idle);
    assert_eq!(
        *harness.probe_attempts.lock(),
        vec!["ntfs", "fat", "ext", "exfat"],
        "probe order is fixed"
    );
}

#[test]
fn mount_while_no_media_fails_with_broadcast() {
    let mut harness = Harness::new(ProbePlan::default());
    harness.add_sdcard(VolumeFlags::default());
    harness.drain_events();

    assert!(harness.manager.mount_volume("sdcard1").is_err());
    assert_eq!(
        harness.count_events(ResponseCode::VolumeMountFailedNoMedia),
        1
    );
}

#[test]
fn mount_while_pending_queues_retry() {
    let mut harness = Harness::new(ProbePlan::default());
    harness.add_sdcard(VolumeFlags::default());
    harness.disk_add(1);
    assert_eq!(volume_state(&harness), VolumeState::Pending);

    // Busy now, but the attempt is remembered.
    assert!(harness.manager.mount_volume("sdcard1").is_err());
    assert!(harness.manager.volumes().next().unwrap().retry_mount());

    // Completing discovery triggers exactly one automatic attempt.
    harness.partition_add(1, 17);
    assert_eq!(volume_state(&harness), VolumeState::Mounted);
    assert!(!harness.manager.volumes().next().unwrap().retry_mount());
    assert_eq!(*harness.probe_attempts.lock(), vec!["ntfs", "fat"]);
}

#[test]
fn unmount_then_mount_round_trip() {
    let mut harness = Harness::new(ProbePlan::default());
    let mountpoint = harness.add_sdcard(VolumeFlags::default());
    harness.disk_add(1);
    harness.partition_add(1, 17);
    harness.manager.mount_volume("sdcard1").expect("mount");
    harness.drain_events();

    harness
        .manager
        .unmount_volume("sdcard1", false, false)
        .expect("unmount");
    assert_eq!(volume_state(&harness), VolumeState::Idle);
    assert!(!harness.mounter.is_mounted(&mountpoint));
    let volume = harness.manager.volumes().next().unwrap();
    assert_eq!(volume.current_mounted_kdev(), None);

    // Unmounting -> Idle, one broadcast per transition.
    let states = harness.count_events(ResponseCode::VolumeStateChange);
    assert_eq!(states, 2);

    harness.manager.mount_volume("sdcard1").expect("remount");
    assert_eq!(volume_state(&harness), VolumeState::Mounted);
    assert!(harness.mounter.is_mounted(&mountpoint));
    assert!(harness
        .manager
        .volumes()
        .next()
        .unwrap()
        .current_mounted_kdev()
        .is_some());
}

#[test]
fn bad_removal_while_mounted_force_unmounts() {
    let mut harness = Harness::new(ProbePlan::default());
    let mountpoint = harness.add_sdcard(VolumeFlags::default());
    harness.disk_add(1);
    harness.partition_add(1, 17);
    harness.manager.mount_volume("sdcard1").expect("mount");
    harness.drain_events();

    harness.partition_remove(1, 17);

    assert_eq!(volume_state(&harness), VolumeState::NoMedia);
    assert!(!harness.mounter.is_mounted(&mountpoint));
    let events = harness.drain_events();
    let removed = events
        .iter()
        .filter(|e| e.code == ResponseCode::VolumeDiskRemoved)
        .count();
    assert_eq!(removed, 1, "exactly one disk-removed broadcast");
}

#[test]
fn removal_while_idle_reports_gone_media() {
    let mut harness = Harness::new(ProbePlan::default());
    harness.add_sdcard(VolumeFlags::default());
    harness.disk_add(1);
    harness.partition_add(1, 17);
    harness.drain_events();

    harness.partition_remove(1, 17);
    assert_eq!(volume_state(&harness), VolumeState::NoMedia);
    assert_eq!(harness.count_events(ResponseCode::VolumeDiskRemoved), 1);
}

#[test]
fn format_whole_disk_returns_to_idle() {
    let mut harness = Harness::new(ProbePlan::default());
    // Whole-device volume: no explicit partition.
    let mountpoint = harness.paths.storage().join("usbdisk");
    harness
        .manager
        .add_volume(stowage::VolumeConfig {
            label: "usbdisk".to_string(),
            mountpoint,
            public_mountpoint: None,
            flags: VolumeFlags::default(),
            partition: None,
            sysfs_paths: vec!["/devices/platform/usb".to_string()],
        })
        .unwrap();
    harness.disk_add(0);
    assert_eq!(volume_state(&harness), VolumeState::Idle);
    harness.drain_events();

    harness
        .manager
        .format_volume("usbdisk", true)
        .expect("format");

    assert_eq!(volume_state(&harness), VolumeState::Idle);
    // The disk node itself was handed to the FAT formatter.
    assert!(harness.probe_attempts.lock().contains(&"fat"));
    let states: Vec<_> = harness
        .drain_events()
        .into_iter()
        .filter(|e| e.code == ResponseCode::VolumeStateChange)
        .map(|e| e.message)
        .collect();
    assert_eq!(states.len(), 2);
    assert!(states[0].contains("to 6 (Formatting)"));
    assert!(states[1].contains("to 1 (Idle-Unmounted)"));
}

#[test]
fn format_then_mount_succeeds() {
    let mut harness = Harness::new(ProbePlan::default());
    harness.add_sdcard(VolumeFlags::default());
    harness.disk_add(1);
    harness.partition_add(1, 17);
    harness.drain_events();

    harness.manager.format_volume("sdcard1", false).expect("format");
    assert_eq!(volume_state(&harness), VolumeState::Idle);

    harness.manager.mount_volume("sdcard1").expect("mount after format");
    assert_eq!(volume_state(&harness), VolumeState::Mounted);
}

#[test]
fn format_while_mounted_is_rejected() {
    let mut harness = Harness::new(ProbePlan::default());
    harness.add_sdcard(VolumeFlags::default());
    harness.disk_add(1);
    harness.partition_add(1, 17);
    harness.manager.mount_volume("sdcard1").expect("mount");

    assert!(harness.manager.format_volume("sdcard1", false).is_err());
    assert_eq!(volume_state(&harness), VolumeState::Mounted);
}

#[test]
fn share_and_unshare_cycle() {
    let mut harness = Harness::new(ProbePlan::default());
    harness.add_sdcard(VolumeFlags::default());
    harness.disk_add(1);
    harness.partition_add(1, 17);
    harness.drain_events();

    harness.manager.share_volume("sdcard1", "ums").expect("share");
    assert_eq!(volume_state(&harness), VolumeState::Shared);
    assert!(harness.manager.share_enabled("sdcard1", "ums").unwrap());

    // Mounting a shared volume is refused.
    assert!(harness.manager.mount_volume("sdcard1").is_err());

    harness
        .manager
        .unshare_volume("sdcard1", "ums")
        .expect("unshare");
    assert_eq!(volume_state(&harness), VolumeState::Idle);
    assert!(!harness.manager.share_enabled("sdcard1", "ums").unwrap());
}

#[test]
fn bad_removal_while_shared_disables_share() {
    let mut harness = Harness::new(ProbePlan::default());
    harness.add_sdcard(VolumeFlags::default());
    harness.disk_add(1);
    harness.partition_add(1, 17);
    harness.manager.share_volume("sdcard1", "ums").expect("share");
    harness.drain_events();

    harness.partition_remove(1, 17);
    assert_eq!(volume_state(&harness), VolumeState::NoMedia);
    assert_eq!(harness.count_events(ResponseCode::VolumeDiskRemoved), 1);
}

#[test]
fn secure_volume_binds_and_projects() {
    let mut harness = Harness::new(ProbePlan::default());
    let mountpoint = harness.add_sdcard(VolumeFlags {
        provides_asec: true,
        non_removable: false,
        encryptable: false,
    });
    harness.disk_add(1);
    harness.partition_add(1, 17);
    harness.drain_events();

    harness.manager.mount_volume("sdcard1").expect("mount");
    assert_eq!(volume_state(&harness), VolumeState::Mounted);

    // The secure subtree was created in staging and bound aside before
    // the reveal.
    assert!(harness.paths.staging().join(".android_secure").exists());
    let ops = harness.mounter.ops();
    let bind_idx = ops.iter().position(|op| op.starts_with("bind ")).unwrap();
    let move_idx = ops.iter().position(|op| op.starts_with("move ")).unwrap();
    assert!(bind_idx < move_idx, "bind must precede the reveal");
    assert!(harness.mounter.is_mounted(&harness.paths.secure_asec()));
    assert!(harness.mounter.is_mounted(&mountpoint));
}
