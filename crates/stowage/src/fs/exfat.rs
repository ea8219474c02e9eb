//! EXFAT driver.

use std::path::Path;

use stowage_common::StowageResult;

use super::{run_helper, wipe_header, FsDriver, MountCtx};
use crate::mounter::{MountOptions, Mounter};

/// exFAT via the in-kernel `exfat` driver.
pub struct Exfat;

impl FsDriver for Exfat {
    fn name(&self) -> &'static str {
        "exfat"
    }

    fn mount(
        &self,
        mounter: &dyn Mounter,
        device: &Path,
        target: &Path,
        ctx: &MountCtx,
    ) -> StowageResult<()> {
        let mut options = MountOptions::media_default();
        options.readonly = ctx.readonly;
        options.noexec = !ctx.executable;
        options.dirsync = false;

        let data = format!(
            "uid={},gid={},fmask={:o},dmask={:o},iocharset=utf8",
            ctx.owner_uid, ctx.owner_gid, ctx.perm_mask, ctx.perm_mask
        );
        mounter.mount(device, target, "exfat", &options, &data)
    }

    fn check(&self, device: &Path) -> StowageResult<()> {
        let device = device.to_string_lossy();
        run_helper("fsck.exfat", &["-y", device.as_ref()])
    }

    fn format(&self, device: &Path, _num_sectors: u64, wipe: bool) -> StowageResult<()> {
        if wipe {
            wipe_header(device)?;
        }
        let device = device.to_string_lossy();
        run_helper("mkfs.exfat", &[device.as_ref()])
    }
}
