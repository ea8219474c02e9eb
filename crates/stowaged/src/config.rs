//! Volume declaration parsing.
//!
//! Declarations arrive pre-parsed on the daemon command line in the
//! form `label:mountpoint:sysfs_prefix[,prefix...][:flags[:partnum]]`,
//! with flags a comma list over `asec`, `nonremovable`, `encryptable`,
//! or `none`.

use std::path::PathBuf;

use color_eyre::eyre::{bail, Result};

use stowage::{VolumeConfig, VolumeFlags};
use stowage_common::StowagePaths;

/// Parse one `--volume` declaration.
pub fn parse_volume_spec(spec: &str, paths: &StowagePaths) -> Result<VolumeConfig> {
    let fields: Vec<&str> = spec.split(':').collect();
    if fields.len() < 3 || fields.len() > 5 {
        bail!("bad volume spec '{spec}': expected label:mountpoint:sysfs[:flags[:partnum]]");
    }

    let label = fields[0].trim();
    if label.is_empty() {
        bail!("bad volume spec '{spec}': empty label");
    }
    let mountpoint = PathBuf::from(fields[1]);
    if !mountpoint.is_absolute() {
        bail!("bad volume spec '{spec}': mountpoint must be absolute");
    }

    let sysfs_paths: Vec<String> = fields[2]
        .split(',')
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    if sysfs_paths.is_empty() {
        bail!("bad volume spec '{spec}': at least one sysfs prefix required");
    }

    let mut flags = VolumeFlags::default();
    if let Some(&raw) = fields.get(3) {
        for flag in raw.split(',').filter(|f| !f.is_empty()) {
            match flag {
                "asec" => flags.provides_asec = true,
                "nonremovable" => flags.non_removable = true,
                "encryptable" => flags.encryptable = true,
                "none" => {}
                other => bail!("bad volume spec '{spec}': unknown flag '{other}'"),
            }
        }
    }

    let partition = match fields.get(4) {
        Some(&raw) => Some(raw.parse::<u32>().map_err(|_| {
            color_eyre::eyre::eyre!("bad volume spec '{spec}': bad partition number '{raw}'")
        })?),
        None => None,
    };

    // Secure-storage volumes are projected for users at /storage/<label>;
    // everything else is public at its own mountpoint.
    let public_mountpoint = if flags.provides_asec {
        Some(paths.storage().join(label))
    } else {
        None
    };

    Ok(VolumeConfig {
        label: label.to_string(),
        mountpoint,
        public_mountpoint,
        flags,
        partition,
        sysfs_paths,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths() -> StowagePaths {
        StowagePaths::with_root("/")
    }

    #[test]
    fn minimal_spec() {
        let config =
            parse_volume_spec("usbdisk:/storage/usbdisk:/devices/platform/usb", &paths()).unwrap();
        assert_eq!(config.label, "usbdisk");
        assert_eq!(config.mountpoint, PathBuf::from("/storage/usbdisk"));
        assert_eq!(config.sysfs_paths, vec!["/devices/platform/usb"]);
        assert_eq!(config.flags, VolumeFlags::default());
        assert_eq!(config.partition, None);
        assert_eq!(config.public_mountpoint, None);
    }

    #[test]
    fn full_spec() {
        let config = parse_volume_spec(
            "sdcard0:/mnt/media_rw/sdcard0:/devices/platform/sdhci.1:asec,nonremovable,encryptable:1",
            &paths(),
        )
        .unwrap();
        assert!(config.flags.provides_asec);
        assert!(config.flags.non_removable);
        assert!(config.flags.encryptable);
        assert_eq!(config.partition, Some(1));
        assert_eq!(
            config.public_mountpoint,
            Some(PathBuf::from("/storage/sdcard0"))
        );
    }

    #[test]
    fn multiple_sysfs_prefixes() {
        let config = parse_volume_spec(
            "usbdisk:/storage/usbdisk:/devices/pci0/usb1,/devices/pci0/usb2",
            &paths(),
        )
        .unwrap();
        assert_eq!(config.sysfs_paths.len(), 2);
    }

    #[test]
    fn rejects_malformed_specs() {
        assert!(parse_volume_spec("justalabel", &paths()).is_err());
        assert!(parse_volume_spec(":missing:/devices/x", &paths()).is_err());
        assert!(parse_volume_spec("x:relative/path:/devices/x", &paths()).is_err());
        assert!(parse_volume_spec("x:/mnt/x:/devices/x:badflag", &paths()).is_err());
        assert!(parse_volume_spec("x:/mnt/x:/devices/x:none:notanumber", &paths()).is_err());
    }
}
