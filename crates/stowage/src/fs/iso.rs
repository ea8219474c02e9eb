//! ISO-9660 driver (read-only, used for loop-mounted images).

use std::path::Path;

use stowage_common::{StowageError, StowageResult};

use super::{FsDriver, MountCtx};
use crate::mounter::{MountOptions, Mounter};

/// ISO-9660 with Joliet/Rock Ridge via the kernel driver.
pub struct Iso9660;

impl FsDriver for Iso9660 {
    fn name(&self) -> &'static str {
        "iso9660"
    }

    fn mount(
        &self,
        mounter: &dyn Mounter,
        device: &Path,
        target: &Path,
        ctx: &MountCtx,
    ) -> StowageResult<()> {
        let options = MountOptions {
            readonly: true,
            noexec: !ctx.executable,
            nosuid: true,
            nodev: true,
            dirsync: false,
        };
        let data = format!("uid={},gid={}", ctx.owner_uid, ctx.owner_gid);
        mounter.mount(device, target, "iso9660", &options, &data)
    }

    fn check(&self, _device: &Path) -> StowageResult<()> {
        Ok(())
    }

    fn format(&self, device: &Path, _num_sectors: u64, _wipe: bool) -> StowageResult<()> {
        Err(StowageError::InvalidArgument {
            message: format!("cannot format {} as iso9660", device.display()),
        })
    }
}
