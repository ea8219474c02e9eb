//! Encrypted-filesystem service boundary.
//!
//! Key management and dm-crypt plumbing for encrypted volumes live in a
//! separate subsystem. The engine only needs two things from it: map an
//! encrypted block device to a decrypted one before mounting, and undo
//! that mapping on unmount-with-revert. The password/field commands of
//! the control protocol pass straight through this trait.

use stowage_common::{StowageError, StowageResult};

/// A decrypted block device returned by the crypto subsystem.
#[derive(Debug, Clone)]
pub struct DecryptedDevice {
    /// New device major.
    pub major: u32,
    /// New device minor.
    pub minor: u32,
    /// Sysfs path of the mapped device, claimed by the volume in place
    /// of its original path.
    pub sysfs_path: String,
}

/// Mode for whole-device encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoMode {
    /// Wipe the device and encrypt the empty filesystem.
    Wipe,
    /// Encrypt the existing contents in place.
    InPlace,
}

/// Interface to the encrypted-filesystem subsystem.
///
/// The integer-returning operations relay the subsystem's own status
/// convention (0 success, negative failure); the control surface reports
/// that value verbatim.
pub trait CryptoMapper: Send {
    /// Decrypt the block device backing `label` and return the new
    /// device numbers and sysfs path.
    fn setup_volume(&self, label: &str, major: u32, minor: u32) -> StowageResult<DecryptedDevice>;

    /// Tear down the decrypted mapping for `label`.
    fn revert_volume(&self, label: &str) -> StowageResult<()>;

    /// Check the user's disk password.
    fn check_password(&self, password: &str) -> i32;

    /// Restart the framework on the decrypted filesystem.
    fn restart(&self) -> i32;

    /// Whether the device finished encrypting successfully.
    fn crypto_complete(&self) -> i32;

    /// Begin whole-device encryption.
    fn enable(&self, mode: CryptoMode, password: &str) -> i32;

    /// Change the disk password.
    fn change_password(&self, password: &str) -> i32;

    /// Verify a password against the current key.
    fn verify_password(&self, password: &str) -> i32;

    /// Read a crypto footer field.
    fn get_field(&self, name: &str) -> StowageResult<String>;

    /// Write a crypto footer field.
    fn set_field(&self, name: &str, value: &str) -> i32;
}

/// Fail-closed default used when no crypto subsystem is wired up.
#[derive(Debug, Default)]
pub struct UnsupportedCrypto;

impl CryptoMapper for UnsupportedCrypto {
    fn setup_volume(&self, label: &str, _major: u32, _minor: u32) -> StowageResult<DecryptedDevice> {
        Err(StowageError::internal(format!(
            "no crypto subsystem available to decrypt volume {label}"
        )))
    }

    fn revert_volume(&self, _label: &str) -> StowageResult<()> {
        Ok(())
    }

    fn check_password(&self, _password: &str) -> i32 {
        -1
    }

    fn restart(&self) -> i32 {
        -1
    }

    fn crypto_complete(&self) -> i32 {
        -1
    }

    fn enable(&self, _mode: CryptoMode, _password: &str) -> i32 {
        -1
    }

    fn change_password(&self, _password: &str) -> i32 {
        -1
    }

    fn verify_password(&self, _password: &str) -> i32 {
        -1
    }

    fn get_field(&self, name: &str) -> StowageResult<String> {
        Err(StowageError::InvalidArgument {
            message: format!("unknown crypto field '{name}'"),
        })
    }

    fn set_field(&self, _name: &str, _value: &str) -> i32 {
        -1
    }
}
