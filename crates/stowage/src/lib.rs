//! # stowage
//!
//! Core engine of the stowage volume daemon.
//!
//! The daemon owns the lifecycle of removable and fixed block-storage
//! volumes: it parses kernel block uevents into structured actions, walks
//! each volume through a finite-state machine as partitions appear and
//! disappear, probes filesystems in a fixed order, mounts media through a
//! private staging tree before atomically revealing it, and tears down
//! dependent loop/dm-backed containers before any unmount.
//!
//! ## Structure
//!
//! - [`event`] / [`netlink`]: kernel uevent parsing and the netlink reader
//! - [`volume`]: the per-volume state machine and mount orchestration
//! - [`manager`]: the volume registry and event dispatch
//! - [`containers`]: ASEC/OBB/ISO/Samba containers and the container lock
//! - [`fs`]: filesystem driver adapters with the fixed probe order
//! - [`mounter`], [`device`], [`process`], [`props`], [`crypto`],
//!   [`share`]: the syscall and platform seams, each behind a trait so
//!   test suites can stub them
//!
//! All state mutation happens on a single engine thread; the netlink
//! reader and control connections only enqueue work for it.

#![warn(missing_docs)]

pub mod broadcast;
pub mod containers;
pub mod crypto;
pub mod device;
pub mod devmapper;
pub mod event;
pub mod fs;
pub mod fstrim;
pub mod loopdev;
pub mod manager;
pub mod mbr;
pub mod mounter;
pub mod netlink;
pub mod process;
pub mod props;
pub mod share;
pub mod volume;
pub mod xwarp;

pub use broadcast::{Broadcast, Broadcaster, ResponseCode};
pub use event::{BlockAction, BlockEvent, DevType};
pub use manager::{Services, VolumeManager};
pub use volume::{Volume, VolumeConfig, VolumeFlags, VolumeState};
