//! Response codes and the unsolicited-broadcast channel.

use tokio::sync::broadcast;

use stowage_common::StowageError;

/// Numeric response codes of the control protocol.
///
/// The assignments are an external contract consumed by the framework on
/// the far side of the control socket; never renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
#[allow(missing_docs)]
pub enum ResponseCode {
    // 100 series: action initiated, expect more replies.
    ActionInitiated = 100,
    VolumeListResult = 110,
    AsecListResult = 111,
    StorageUsersListResult = 112,
    CryptfsGetfieldResult = 113,
    XwarpStatusResult = 114,

    // 200 series: command completed.
    CommandOkay = 200,
    ShareStatusResult = 210,
    AsecPathResult = 211,
    ShareEnabledResult = 212,

    // 400 series: command accepted, action failed.
    OperationFailed = 400,
    OpFailedNoMedia = 401,
    OpFailedMediaBlank = 402,
    OpFailedMediaCorrupt = 403,
    OpFailedVolNotMounted = 404,
    OpFailedStorageBusy = 405,
    OpFailedStorageNotFound = 406,

    // 500 series: command rejected.
    CommandSyntaxError = 500,
    CommandParameterError = 501,
    CommandNoPermission = 502,

    // 600 series: unsolicited broadcasts.
    UnsolicitedInformational = 600,
    VolumeStateChange = 605,
    VolumeMountFailedBlank = 610,
    VolumeMountFailedDamaged = 611,
    VolumeMountFailedNoMedia = 612,
    VolumeUuidChange = 613,
    VolumeUserLabelChange = 614,
    ShareAvailabilityChange = 620,
    VolumeDiskInserted = 630,
    VolumeDiskRemoved = 631,
    VolumeBadRemoval = 632,
}

impl ResponseCode {
    /// The wire value.
    #[must_use]
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Map an engine error to the failure code reported on the wire.
    #[must_use]
    pub fn from_error(err: &StowageError) -> Self {
        match err {
            StowageError::NoDevice { .. } => Self::OpFailedNoMedia,
            StowageError::UnsupportedFilesystem { .. } => Self::OpFailedMediaBlank,
            StowageError::NotMounted { .. } => Self::OpFailedVolNotMounted,
            StowageError::Busy { .. } => Self::OpFailedStorageBusy,
            StowageError::VolumeNotFound { .. } | StowageError::ContainerNotFound { .. } => {
                Self::OpFailedStorageNotFound
            }
            StowageError::InvalidArgument { .. } | StowageError::InvalidContainerId { .. } => {
                Self::CommandParameterError
            }
            StowageError::PermissionDenied { .. } => Self::CommandNoPermission,
            StowageError::Io(io) => match io.raw_os_error() {
                Some(libc::ENODEV) => Self::OpFailedNoMedia,
                Some(libc::ENODATA) => Self::OpFailedMediaBlank,
                Some(libc::EIO) => Self::OpFailedMediaCorrupt,
                Some(libc::EBUSY) => Self::OpFailedStorageBusy,
                Some(libc::ENOENT) => Self::OpFailedStorageNotFound,
                _ => Self::OperationFailed,
            },
            _ => Self::OperationFailed,
        }
    }
}

/// One unsolicited event published to every control-socket subscriber.
#[derive(Debug, Clone)]
pub struct Broadcast {
    /// Response code of the event.
    pub code: ResponseCode,
    /// Human-readable event text.
    pub message: String,
}

/// Fan-out handle for unsolicited broadcasts.
///
/// Cheap to clone; subscribers that fall behind lose the oldest events,
/// which matches the lossy socket semantics of the original protocol.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    sender: broadcast::Sender<Broadcast>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }
}

impl Broadcaster {
    /// Create a new broadcaster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to future broadcasts.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Broadcast> {
        self.sender.subscribe()
    }

    /// Publish an unsolicited event.
    pub fn send(&self, code: ResponseCode, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(code = code.as_i32(), %message, "broadcast");
        // No subscribers is fine; events are advisory.
        let _ = self.sender.send(Broadcast { code, message });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_wire_values() {
        assert_eq!(ResponseCode::CommandOkay.as_i32(), 200);
        assert_eq!(ResponseCode::OperationFailed.as_i32(), 400);
        assert_eq!(ResponseCode::CommandSyntaxError.as_i32(), 500);
        assert_eq!(ResponseCode::VolumeStateChange.as_i32(), 605);
        assert_eq!(ResponseCode::VolumeDiskInserted.as_i32(), 630);
        assert_eq!(ResponseCode::VolumeDiskRemoved.as_i32(), 631);
        assert_eq!(ResponseCode::VolumeUuidChange.as_i32(), 613);
        assert_eq!(ResponseCode::VolumeUserLabelChange.as_i32(), 614);
        assert_eq!(ResponseCode::VolumeMountFailedNoMedia.as_i32(), 612);
        assert_eq!(ResponseCode::AsecListResult.as_i32(), 111);
        assert_eq!(ResponseCode::AsecPathResult.as_i32(), 211);
        assert_eq!(ResponseCode::ShareEnabledResult.as_i32(), 212);
        assert_eq!(ResponseCode::StorageUsersListResult.as_i32(), 112);
        assert_eq!(ResponseCode::XwarpStatusResult.as_i32(), 114);
        assert_eq!(ResponseCode::CryptfsGetfieldResult.as_i32(), 113);
        assert_eq!(ResponseCode::CommandNoPermission.as_i32(), 502);
    }

    #[test]
    fn error_mapping() {
        let err = StowageError::busy("unmount /storage/sdcard1");
        assert_eq!(
            ResponseCode::from_error(&err),
            ResponseCode::OpFailedStorageBusy
        );

        let err = StowageError::NoDevice {
            what: "sdcard1".to_string(),
        };
        assert_eq!(ResponseCode::from_error(&err), ResponseCode::OpFailedNoMedia);
    }

    #[test]
    fn subscribers_see_events() {
        let b = Broadcaster::new();
        let mut rx = b.subscribe();
        b.send(ResponseCode::VolumeDiskInserted, "disk inserted (8:16)");
        let evt = rx.try_recv().unwrap();
        assert_eq!(evt.code, ResponseCode::VolumeDiskInserted);
        assert!(evt.message.contains("8:16"));
    }
}
