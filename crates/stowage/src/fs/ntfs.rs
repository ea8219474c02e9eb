//! NTFS driver.

use std::path::Path;

use stowage_common::StowageResult;

use super::{run_helper, FsDriver, MountCtx};
use crate::mounter::{MountOptions, Mounter};

/// NTFS via the in-kernel `ntfs3` driver.
pub struct Ntfs;

impl FsDriver for Ntfs {
    fn name(&self) -> &'static str {
        "ntfs"
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
        // ntfs3 has no dirsync support.
        options.dirsync = false;

        let data = format!(
            "uid={},gid={},fmask={:o},dmask={:o},iocharset=utf8",
            ctx.owner_uid, ctx.owner_gid, ctx.perm_mask, ctx.perm_mask
        );
        mounter.mount(device, target, "ntfs3", &options, &data)
    }

    fn check(&self, device: &Path) -> StowageResult<()> {
        let device = device.to_string_lossy();
        // Clears the dirty bit and replays the journal; full chkdsk-style
        // repair needs the host OS.
        run_helper("ntfsfix", &["-d", device.as_ref()])
    }

    fn format(&self, device: &Path, _num_sectors: u64, wipe: bool) -> StowageResult<()> {
        let device = device.to_string_lossy();
        let mut args = vec!["-f"];
        if wipe {
            // Full zeroing instead of a quick format.
            args.retain(|a| *a != "-f");
        }
        args.push(device.as_ref());
        run_helper("mkfs.ntfs", &args)
    }
}
