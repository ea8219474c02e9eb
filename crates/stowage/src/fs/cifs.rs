//! CIFS driver for Samba shares.

use std::path::Path;

use stowage_common::{StowageError, StowageResult};

use super::{FsDriver, MountCtx};
use crate::mounter::{MountOptions, Mounter};

/// Credentials for a CIFS mount. Empty user means a guest session.
#[derive(Debug, Clone, Default)]
pub struct CifsCredentials {
    /// Account name.
    pub user: String,
    /// Account password.
    pub password: String,
}

/// CIFS network filesystem.
///
/// Unlike the block drivers the "device" here is a UNC source
/// (`//host/share`); the driver is not part of the media probe order.
pub struct Cifs;

impl Cifs {
    /// Mount `//host/share` at `target` with the given credentials.
    pub fn mount_share(
        &self,
        mounter: &dyn Mounter,
        host: &str,
        share: &str,
        target: &Path,
        creds: &CifsCredentials,
        ctx: &MountCtx,
    ) -> StowageResult<()> {
        let source = format!("//{host}/{share}");
        let options = MountOptions {
            readonly: ctx.readonly,
            noexec: !ctx.executable,
            nosuid: true,
            nodev: true,
            dirsync: false,
        };
        let data = if creds.user.is_empty() {
            format!("guest,uid={},gid={}", ctx.owner_uid, ctx.owner_gid)
        } else {
            format!(
                "user={},pass={},uid={},gid={}",
                creds.user, creds.password, ctx.owner_uid, ctx.owner_gid
            )
        };
        mounter.mount(Path::new(&source), target, "cifs", &options, &data)
    }
}

impl FsDriver for Cifs {
    fn name(&self) -> &'static str {
        "cifs"
    }

    fn mount(
        &self,
        mounter: &dyn Mounter,
        device: &Path,
        target: &Path,
        ctx: &MountCtx,
    ) -> StowageResult<()> {
        // Plain trait entry assumes the caller already built the UNC
        // source and wants a guest session.
        let options = MountOptions {
            readonly: ctx.readonly,
            noexec: !ctx.executable,
            nosuid: true,
            nodev: true,
            dirsync: false,
        };
        let data = format!("guest,uid={},gid={}", ctx.owner_uid, ctx.owner_gid);
        mounter.mount(device, target, "cifs", &options, &data)
    }

    fn check(&self, _device: &Path) -> StowageResult<()> {
        Ok(())
    }

    fn format(&self, device: &Path, _num_sectors: u64, _wipe: bool) -> StowageResult<()> {
        Err(StowageError::InvalidArgument {
            message: format!("cannot format network share {}", device.display()),
        })
    }
}
