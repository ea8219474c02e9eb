//! Platform property service seam.
//!
//! The daemon reads `vold.decrypt`, `vold.encrypt_progress`, and
//! `ro.crypto.state` to gate mounting, and writes `ctl.start`/`ctl.stop`
//! with `fuse_<label>` to drive the FUSE projection service. The real
//! property service belongs to init; here it is only an interface.

use std::collections::HashMap;

use parking_lot::Mutex;

/// Property used to start services (`ctl.start`).
pub const CTL_START: &str = "ctl.start";
/// Property used to stop services (`ctl.stop`).
pub const CTL_STOP: &str = "ctl.stop";
/// Set to `"1"` while the platform waits for the disk password.
pub const DECRYPT_STATE: &str = "vold.decrypt";
/// Non-empty while in-place encryption is running.
pub const ENCRYPT_PROGRESS: &str = "vold.encrypt_progress";
/// `"encrypted"` when the device booted with an encrypted data partition.
pub const CRYPTO_STATE: &str = "ro.crypto.state";

/// Read/write access to platform properties.
pub trait PropertyStore: Send {
    /// Read a property; `None` when unset.
    fn get(&self, key: &str) -> Option<String>;

    /// Write a property.
    fn set(&self, key: &str, value: &str);
}

/// In-memory property store.
///
/// The production daemon is handed one bridged to the platform service;
/// tests preload it to simulate crypto states.
#[derive(Debug, Default)]
pub struct MemoryProps {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryProps {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl PropertyStore for MemoryProps {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        tracing::debug!(key, value, "property set");
        self.values.lock().insert(key.to_string(), value.to_string());
    }
}

/// The FUSE projection service name for a volume label.
#[must_use]
pub fn fuse_service(label: &str) -> String {
    format!("fuse_{label}")
}
