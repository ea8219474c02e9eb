//! EXT2/3/4 driver.

use std::path::Path;

use stowage_common::StowageResult;

use super::{run_helper, FsDriver, MountCtx};
use crate::mounter::{MountOptions, Mounter};

/// EXT family via the kernel `ext4` driver, which also handles ext2/3.
pub struct Ext;

impl FsDriver for Ext {
    fn name(&self) -> &'static str {
        "ext"
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
        // ext has native ownership; uid/gid mapping does not apply.
        options.dirsync = false;

        mounter.mount(device, target, "ext4", &options, "noauto_da_alloc")
    }

    fn check(&self, device: &Path) -> StowageResult<()> {
        let device = device.to_string_lossy();
        run_helper("e2fsck", &["-p", device.as_ref()])
    }

    fn format(&self, device: &Path, num_sectors: u64, _wipe: bool) -> StowageResult<()> {
        let device = device.to_string_lossy();
        // mkfs.ext4 takes a block count; sectors are 512 bytes, blocks 4096.
        let blocks = (num_sectors * 512 / 4096).to_string();
        let mut args = vec!["-F", device.as_ref()];
        if num_sectors > 0 {
            args.push(blocks.as_str());
        }
        run_helper("mkfs.ext4", &args)
    }
}
