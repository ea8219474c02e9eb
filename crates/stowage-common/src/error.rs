//! Common error types for the stowage daemon.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`StowageError`].
pub type StowageResult<T> = Result<T, StowageError>;

/// Errors produced by the volume engine and its collaborators.
///
/// The variants mirror the daemon's external error taxonomy; the control
/// surface translates each of them into a stable numeric response code.
#[derive(Error, Diagnostic, Debug)]
pub enum StowageError {
    /// The target is busy; retrying later (or with `force`) may succeed.
    #[error("Resource busy: {what}")]
    #[diagnostic(code(stowage::busy))]
    Busy {
        /// Description of the contended resource.
        what: String,
    },

    /// An unmount-style operation was requested on an unmounted target.
    #[error("Not mounted: {what}")]
    #[diagnostic(code(stowage::not_mounted))]
    NotMounted {
        /// The volume or path that was not mounted.
        what: String,
    },

    /// No media present, or the backing device is gone.
    #[error("No device: {what}")]
    #[diagnostic(code(stowage::no_device))]
    NoDevice {
        /// The volume or device that has no media.
        what: String,
    },

    /// Malformed request parameter.
    #[error("Invalid argument: {message}")]
    #[diagnostic(code(stowage::invalid_argument))]
    InvalidArgument {
        /// What was wrong with the argument.
        message: String,
    },

    /// Every configured filesystem probe refused the device.
    #[error("No supported filesystem on {device}")]
    #[diagnostic(code(stowage::unsupported_fs))]
    UnsupportedFilesystem {
        /// The probed block device.
        device: String,
    },

    /// Caller is not allowed to perform the operation.
    #[error("Permission denied: {operation}")]
    #[diagnostic(code(stowage::permission_denied))]
    PermissionDenied {
        /// The operation that was denied.
        operation: String,
    },

    /// No managed volume matches the given path or label.
    #[error("Volume not found: {path}")]
    #[diagnostic(code(stowage::volume::not_found))]
    VolumeNotFound {
        /// The path or label that was looked up.
        path: String,
    },

    /// Container lookup failed.
    #[error("Container not found: {id}")]
    #[diagnostic(code(stowage::container::not_found))]
    ContainerNotFound {
        /// The container id that was not found.
        id: String,
    },

    /// A container with this id already exists.
    #[error("Container already exists: {id}")]
    #[diagnostic(code(stowage::container::exists))]
    ContainerExists {
        /// The colliding container id.
        id: String,
    },

    /// Invalid container id format.
    #[error("Invalid container ID: {id}")]
    #[diagnostic(
        code(stowage::container::invalid_id),
        help("Container IDs must be alphanumeric with hyphens and underscores, 1-64 characters")
    )]
    InvalidContainerId {
        /// The invalid container id.
        id: String,
    },

    /// A kernel uevent could not be parsed or matched.
    ///
    /// These never mutate volume state; the dispatcher logs and drops them.
    #[error("Kernel event error: {message}")]
    #[diagnostic(code(stowage::kernel_event))]
    KernelEvent {
        /// Why the event was rejected.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(stowage::io))]
    Io(#[from] std::io::Error),

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(code(stowage::internal))]
    Internal {
        /// The error message.
        message: String,
    },
}

impl StowageError {
    /// Shorthand for a [`StowageError::Busy`] value.
    pub fn busy(what: impl Into<String>) -> Self {
        StowageError::Busy { what: what.into() }
    }

    /// Shorthand for a [`StowageError::Internal`] value.
    pub fn internal(message: impl Into<String>) -> Self {
        StowageError::Internal {
            message: message.into(),
        }
    }

    /// The OS errno carried by this error, when one exists.
    ///
    /// The control surface appends it to responses flagged "include errno".
    pub fn errno(&self) -> Option<i32> {
        match self {
            StowageError::Io(err) => err.raw_os_error(),
            StowageError::Busy { .. } => Some(libc_errno::EBUSY),
            StowageError::NoDevice { .. } => Some(libc_errno::ENODEV),
            StowageError::NotMounted { .. } => Some(libc_errno::EINVAL),
            _ => None,
        }
    }

    /// Whether this error carries the given OS errno.
    pub fn is_errno(&self, errno: i32) -> bool {
        self.errno() == Some(errno)
    }
}

/// The handful of errno values the retry logic branches on, kept here so
/// the common crate does not pull in libc.
mod libc_errno {
    pub const EBUSY: i32 = 16;
    pub const EINVAL: i32 = 22;
    pub const ENODEV: i32 = 19;
}
