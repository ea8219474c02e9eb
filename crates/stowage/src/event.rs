//! Kernel block uevent parsing.
//!
//! The kernel broadcasts hotplug events on a `NETLINK_KOBJECT_UEVENT`
//! socket as a NUL-separated buffer: an `action@devpath` header followed
//! by `KEY=VALUE` properties. Only `SUBSYSTEM=block` events become
//! [`BlockEvent`]s; everything else is reported as unhandled so the
//! reader can skip it without logging noise.

use std::fmt;

use stowage_common::{StowageError, StowageResult};

/// Kernel hotplug action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockAction {
    /// Device appeared.
    Add,
    /// Device disappeared.
    Remove,
    /// Device was rescanned (e.g. partition table rewritten).
    Change,
}

impl BlockAction {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "add" => Some(Self::Add),
            "remove" => Some(Self::Remove),
            "change" => Some(Self::Change),
            _ => None,
        }
    }
}

/// `DEVTYPE` of a block uevent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevType {
    /// A whole disk.
    Disk,
    /// A partition of a disk.
    Partition,
}

impl fmt::Display for DevType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disk => write!(f, "disk"),
            Self::Partition => write!(f, "partition"),
        }
    }
}

/// A parsed kernel block uevent.
#[derive(Debug, Clone)]
pub struct BlockEvent {
    /// Hotplug action.
    pub action: BlockAction,
    /// Device type (disk or partition).
    pub devtype: DevType,
    /// Sysfs path of the device, e.g. `/sys/block/sdb/sdb1`.
    pub devpath: String,
    /// Kernel device name (`DEVNAME`), when present.
    pub devname: Option<String>,
    /// Device major number.
    pub major: u32,
    /// Device minor number.
    pub minor: u32,
    /// Partition count announced with a disk event (`NPARTS`).
    pub nparts: Option<u32>,
    /// One-based partition number of a partition event (`PARTN`).
    pub partn: Option<u32>,
}

/// Parse a raw uevent buffer into a [`BlockEvent`].
///
/// Returns `Ok(None)` for well-formed events of other subsystems, and an
/// error for malformed buffers. Callers log and drop errors; they must
/// never alter volume state.
pub fn parse_uevent(buf: &[u8]) -> StowageResult<Option<BlockEvent>> {
    let mut fields = buf
        .split(|b| *b == 0)
        .filter(|f| !f.is_empty())
        .map(|f| String::from_utf8_lossy(f).into_owned());

    let header = fields.next().ok_or_else(|| StowageError::KernelEvent {
        message: "empty uevent buffer".to_string(),
    })?;
    let (action_str, devpath) = header.split_once('@').ok_or_else(|| {
        StowageError::KernelEvent {
            message: format!("malformed uevent header '{header}'"),
        }
    })?;
    let action = BlockAction::parse(action_str).ok_or_else(|| StowageError::KernelEvent {
        message: format!("unknown uevent action '{action_str}'"),
    })?;

    let mut subsystem = None;
    let mut devtype = None;
    let mut devname = None;
    let mut major = None;
    let mut minor = None;
    let mut nparts = None;
    let mut partn = None;

    for field in fields {
        let Some((key, value)) = field.split_once('=') else {
            continue;
        };
        match key {
            "SUBSYSTEM" => subsystem = Some(value.to_string()),
            "DEVTYPE" => {
                devtype = match value {
                    "disk" => Some(DevType::Disk),
                    "partition" => Some(DevType::Partition),
                    _ => None,
                }
            }
            "DEVNAME" => devname = Some(value.to_string()),
            "MAJOR" => major = parse_num(key, value).map(Some)?,
            "MINOR" => minor = parse_num(key, value).map(Some)?,
            "NPARTS" => nparts = parse_num(key, value).map(Some)?,
            "PARTN" => partn = parse_num(key, value).map(Some)?,
            _ => {}
        }
    }

    if subsystem.as_deref() != Some("block") {
        return Ok(None);
    }

    let devtype = devtype.ok_or_else(|| StowageError::KernelEvent {
        message: format!("block uevent for {devpath} missing DEVTYPE"),
    })?;
    let major = major.ok_or_else(|| StowageError::KernelEvent {
        message: format!("block uevent for {devpath} missing MAJOR"),
    })?;
    let minor = minor.ok_or_else(|| StowageError::KernelEvent {
        message: format!("block uevent for {devpath} missing MINOR"),
    })?;

    Ok(Some(BlockEvent {
        action,
        devtype,
        devpath: devpath.to_string(),
        devname,
        major,
        minor,
        nparts,
        partn,
    }))
}

fn parse_num(key: &str, value: &str) -> StowageResult<u32> {
    value.parse().map_err(|_| StowageError::KernelEvent {
        message: format!("non-numeric {key} '{value}'"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(fields: &[&str]) -> Vec<u8> {
        let mut buf = Vec::new();
        for f in fields {
            buf.extend_from_slice(f.as_bytes());
            buf.push(0);
        }
        buf
    }

    #[test]
    fn parse_disk_add() {
        let buf = raw(&[
            "add@/devices/platform/usb/sdb",
            "ACTION=add",
            "DEVPATH=/devices/platform/usb/sdb",
            "SUBSYSTEM=block",
            "DEVNAME=sdb",
            "DEVTYPE=disk",
            "MAJOR=8",
            "MINOR=16",
            "NPARTS=1",
        ]);
        let evt = parse_uevent(&buf).unwrap().unwrap();
        assert_eq!(evt.action, BlockAction::Add);
        assert_eq!(evt.devtype, DevType::Disk);
        assert_eq!((evt.major, evt.minor), (8, 16));
        assert_eq!(evt.nparts, Some(1));
        assert_eq!(evt.partn, None);
    }

    #[test]
    fn parse_partition_remove() {
        let buf = raw(&[
            "remove@/devices/platform/usb/sdb/sdb1",
            "SUBSYSTEM=block",
            "DEVTYPE=partition",
            "MAJOR=8",
            "MINOR=17",
            "PARTN=1",
        ]);
        let evt = parse_uevent(&buf).unwrap().unwrap();
        assert_eq!(evt.action, BlockAction::Remove);
        assert_eq!(evt.devtype, DevType::Partition);
        assert_eq!(evt.partn, Some(1));
    }

    #[test]
    fn other_subsystems_skipped() {
        let buf = raw(&[
            "add@/devices/platform/usb/1-1",
            "SUBSYSTEM=usb",
            "MAJOR=189",
            "MINOR=4",
        ]);
        assert!(parse_uevent(&buf).unwrap().is_none());
    }

    #[test]
    fn malformed_header_rejected() {
        let buf = raw(&["bogus-header", "SUBSYSTEM=block"]);
        assert!(parse_uevent(&buf).is_err());
    }

    #[test]
    fn missing_major_rejected() {
        let buf = raw(&[
            "add@/devices/platform/usb/sdb",
            "SUBSYSTEM=block",
            "DEVTYPE=disk",
            "MINOR=16",
        ]);
        assert!(parse_uevent(&buf).is_err());
    }
}
