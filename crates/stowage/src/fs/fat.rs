//! VFAT driver.

use std::path::Path;

use stowage_common::StowageResult;

use super::{run_helper, wipe_header, FsDriver, MountCtx};
use crate::mounter::{MountOptions, Mounter};

/// FAT12/16/32 via the kernel `vfat` driver.
pub struct Fat;

impl FsDriver for Fat {
    fn name(&self) -> &'static str {
        "fat"
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

        let data = format!(
            "utf8,uid={},gid={},fmask={:o},dmask={:o},shortname=mixed",
            ctx.owner_uid, ctx.owner_gid, ctx.perm_mask, ctx.perm_mask
        );
        mounter.mount(device, target, "vfat", &options, &data)
    }

    fn check(&self, device: &Path) -> StowageResult<()> {
        let device = device.to_string_lossy();
        // -p: automatic non-interactive repair.
        run_helper("fsck.fat", &["-p", device.as_ref()])
    }

    fn format(&self, device: &Path, num_sectors: u64, wipe: bool) -> StowageResult<()> {
        if wipe {
            wipe_header(device)?;
        }
        let device = device.to_string_lossy();
        let sectors = num_sectors.to_string();
        let mut args = vec!["-F", "32", "-O", "android", device.as_ref()];
        if num_sectors > 0 {
            args.push(sectors.as_str());
        }
        run_helper("mkfs.fat", &args)
    }
}
