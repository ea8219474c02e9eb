//! Control-surface command dispatch.
//!
//! Requests are single lines of whitespace-separated arguments; every
//! reply carries a numeric response code and a human text. The code
//! assignments are an external contract shared with the framework on
//! the other end of the socket.

use stowage::containers::SambaConfig;
use stowage::crypto::CryptoMode;
use stowage::{ResponseCode, VolumeManager};
use stowage_common::StowageError;

/// Uid of the platform "system" user, allowed to run privileged
/// commands alongside root.
const AID_SYSTEM: u32 = 1000;

/// One response line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Numeric response code (0 for raw informational lines).
    pub code: i32,
    /// Human-readable text.
    pub message: String,
}

impl Reply {
    fn new(code: ResponseCode, message: impl Into<String>) -> Self {
        Self {
            code: code.as_i32(),
            message: message.into(),
        }
    }

    fn raw(message: impl Into<String>) -> Self {
        Self {
            code: 0,
            message: message.into(),
        }
    }
}

fn syntax(message: &str) -> Vec<Reply> {
    vec![Reply::new(ResponseCode::CommandSyntaxError, message)]
}

/// Final reply for a mutating operation: okay text on success, the
/// mapped failure code with the error appended ("include errno") on
/// failure.
fn completion(noun: &str, result: Result<(), StowageError>) -> Reply {
    match result {
        Ok(()) => Reply::new(ResponseCode::CommandOkay, format!("{noun} operation succeeded")),
        Err(err) => Reply {
            code: ResponseCode::from_error(&err).as_i32(),
            message: format!("{noun} operation failed ({err})"),
        },
    }
}

fn parse_u32(value: &str) -> Option<u32> {
    value.parse().ok()
}

/// Dispatch one request line against the manager.
pub fn dispatch(manager: &mut VolumeManager, uid: u32, line: &str) -> Vec<Reply> {
    let argv: Vec<&str> = line.split_whitespace().collect();
    let Some(&command) = argv.first() else {
        return syntax("Missing Argument");
    };

    match command {
        "dump" => dump_cmd(manager),
        "volume" => volume_cmd(manager, &argv),
        "storage" => storage_cmd(manager, &argv),
        "asec" => asec_cmd(manager, &argv),
        "obb" => obb_cmd(manager, &argv),
        "iso" => iso_cmd(manager, &argv),
        "samba" => samba_cmd(manager, &argv),
        "xwarp" => xwarp_cmd(manager, &argv),
        "cryptfs" => cryptfs_cmd(manager, uid, &argv),
        "fstrim" => fstrim_cmd(manager, uid, &argv),
        _ => syntax("Unknown command"),
    }
}

fn dump_cmd(manager: &VolumeManager) -> Vec<Reply> {
    let mut replies: Vec<Reply> = manager.dump().into_iter().map(Reply::raw).collect();
    replies.push(Reply::new(ResponseCode::CommandOkay, "dump complete"));
    replies
}

fn volume_cmd(manager: &mut VolumeManager, argv: &[&str]) -> Vec<Reply> {
    let Some(&sub) = argv.get(1) else {
        return syntax("Missing Argument");
    };

    match sub {
        "list" => {
            let mut replies: Vec<Reply> = manager
                .list_volumes()
                .into_iter()
                .map(|line| Reply::new(ResponseCode::VolumeListResult, line))
                .collect();
            replies.push(Reply::new(ResponseCode::CommandOkay, "Volumes listed"));
            replies
        }
        "debug" => match argv.get(2) {
            Some(&"on") => {
                manager.set_debug(true);
                vec![completion("volume", Ok(()))]
            }
            Some(&"off") => {
                manager.set_debug(false);
                vec![completion("volume", Ok(()))]
            }
            _ => syntax("Usage: volume debug <off/on>"),
        },
        "mount" => match argv.get(2) {
            Some(path) if argv.len() == 3 => vec![completion("volume", manager.mount_volume(path))],
            _ => syntax("Usage: volume mount <path>"),
        },
        "unmount" => {
            let (force, revert) = match argv.get(3) {
                None if argv.len() == 3 => (false, false),
                Some(&"force") if argv.len() == 4 => (true, false),
                Some(&"force_and_revert") if argv.len() == 4 => (true, true),
                _ => return syntax("Usage: volume unmount <path> [force|force_and_revert]"),
            };
            vec![completion(
                "volume",
                manager.unmount_volume(argv[2], force, revert),
            )]
        }
        "format" => {
            let wipe = match argv.get(3) {
                None if argv.len() == 3 => false,
                Some(&"wipe") if argv.len() == 4 => true,
                _ => return syntax("Usage: volume format <path> [wipe]"),
            };
            vec![completion("volume", manager.format_volume(argv[2], wipe))]
        }
        "label" => match argv.get(2) {
            Some(path) if argv.len() == 3 => match manager.volume_user_label(path) {
                Ok(label) => vec![Reply::new(
                    ResponseCode::CommandOkay,
                    label.unwrap_or_default(),
                )],
                Err(err) => vec![completion("volume", Err(err))],
            },
            _ => syntax("Usage: volume label <path>"),
        },
        "uuid" => match argv.get(2) {
            Some(path) if argv.len() == 3 => match manager.volume_uuid(path) {
                Ok(uuid) => vec![Reply::new(
                    ResponseCode::CommandOkay,
                    uuid.unwrap_or_default(),
                )],
                Err(err) => vec![completion("volume", Err(err))],
            },
            _ => syntax("Usage: volume uuid <path>"),
        },
        "share" => match (argv.get(2), argv.get(3)) {
            (Some(path), Some(method)) if argv.len() == 4 => {
                vec![completion("volume", manager.share_volume(path, method))]
            }
            _ => syntax("Usage: volume share <path> <method>"),
        },
        "unshare" => match (argv.get(2), argv.get(3)) {
            (Some(path), Some(method)) if argv.len() == 4 => {
                vec![completion("volume", manager.unshare_volume(path, method))]
            }
            _ => syntax("Usage: volume unshare <path> <method>"),
        },
        "shared" => match (argv.get(2), argv.get(3)) {
            (Some(path), Some(method)) if argv.len() == 4 => {
                match manager.share_enabled(path, method) {
                    Ok(enabled) => vec![Reply::new(
                        ResponseCode::ShareEnabledResult,
                        if enabled { "Share enabled" } else { "Share disabled" },
                    )],
                    Err(err) => vec![Reply {
                        code: ResponseCode::OperationFailed.as_i32(),
                        message: format!("Failed to determine share enable state ({err})"),
                    }],
                }
            }
            _ => syntax("Usage: volume shared <path> <method>"),
        },
        "mkdirs" => match argv.get(2) {
            Some(path) if argv.len() == 3 => vec![completion("volume", manager.mkdirs(path))],
            _ => syntax("Usage: volume mkdirs <path>"),
        },
        _ => syntax("Unknown volume cmd"),
    }
}

fn storage_cmd(manager: &VolumeManager, argv: &[&str]) -> Vec<Reply> {
    match (argv.get(1), argv.get(2)) {
        (Some(&"users"), Some(path)) => {
            let mut replies: Vec<Reply> = manager
                .storage_users(path)
                .into_iter()
                .map(|user| {
                    Reply::new(
                        ResponseCode::StorageUsersListResult,
                        format!("{} {}", user.pid, user.name),
                    )
                })
                .collect();
            replies.push(Reply::new(
                ResponseCode::CommandOkay,
                "Storage user list complete",
            ));
            replies
        }
        (Some(&"users"), None) => syntax("Usage: storage users <path>"),
        _ => syntax("Unknown storage cmd"),
    }
}

fn asec_cmd(manager: &VolumeManager, argv: &[&str]) -> Vec<Reply> {
    let Some(&sub) = argv.get(1) else {
        return syntax("Missing Argument");
    };

    match sub {
        "list" => {
            let mut replies: Vec<Reply> = manager
                .list_asecs()
                .into_iter()
                .map(|id| Reply::new(ResponseCode::AsecListResult, id.to_string()))
                .collect();
            replies.push(Reply::new(ResponseCode::CommandOkay, "asec operation succeeded"));
            replies
        }
        "create" => {
            if argv.len() != 8 {
                return syntax(
                    "Usage: asec create <container-id> <size_mb> <fstype> <key> <ownerUid> \
                     <isExternal>",
                );
            }
            let (Some(size_mb), Some(owner_uid)) = (parse_u32(argv[3]), parse_u32(argv[6])) else {
                return syntax(
                    "Usage: asec create <container-id> <size_mb> <fstype> <key> <ownerUid> \
                     <isExternal>",
                );
            };
            let num_sectors = u64::from(size_mb) * (1024 * 1024) / 512;
            let external = argv[7] == "1";
            vec![completion(
                "asec",
                manager.create_asec(argv[2], num_sectors, argv[4], argv[5], owner_uid, external),
            )]
        }
        "finalize" => match argv.get(2) {
            Some(id) if argv.len() == 3 => vec![completion("asec", manager.finalize_asec(id))],
            _ => syntax("Usage: asec finalize <container-id>"),
        },
        "fixperms" => {
            if argv.len() != 5 {
                return syntax("Usage: asec fixperms <container-id> <gid> <filename>");
            }
            let Some(gid) = parse_u32(argv[3]) else {
                return syntax("Usage: asec fixperms <container-id> <gid> <filename>");
            };
            vec![completion(
                "asec",
                manager.fix_asec_perms(argv[2], gid, argv[4]),
            )]
        }
        "destroy" => {
            let force = match argv.get(3) {
                None if argv.len() == 3 => false,
                Some(&"force") if argv.len() == 4 => true,
                _ => return syntax("Usage: asec destroy <container-id> [force]"),
            };
            vec![completion("asec", manager.destroy_asec(argv[2], force))]
        }
        "mount" => {
            if argv.len() != 5 {
                return syntax("Usage: asec mount <namespace-id> <key> <ownerUid>");
            }
            let Some(owner_uid) = parse_u32(argv[4]) else {
                return syntax("Usage: asec mount <namespace-id> <key> <ownerUid>");
            };
            vec![completion(
                "asec",
                manager.mount_asec(argv[2], argv[3], owner_uid),
            )]
        }
        "unmount" => {
            let force = match argv.get(3) {
                None if argv.len() == 3 => false,
                Some(&"force") if argv.len() == 4 => true,
                _ => return syntax("Usage: asec unmount <container-id> [force]"),
            };
            vec![completion("asec", manager.unmount_asec(argv[2], force))]
        }
        "rename" => match (argv.get(2), argv.get(3)) {
            (Some(old_id), Some(new_id)) if argv.len() == 4 => {
                vec![completion("asec", manager.rename_asec(old_id, new_id))]
            }
            _ => syntax("Usage: asec rename <old_id> <new_id>"),
        },
        "path" => match argv.get(2) {
            Some(id) if argv.len() == 3 => match manager.asec_path(id) {
                Ok(path) => vec![Reply::new(
                    ResponseCode::AsecPathResult,
                    path.display().to_string(),
                )],
                Err(err) => vec![completion("asec", Err(err))],
            },
            _ => syntax("Usage: asec path <container-id>"),
        },
        "fspath" => match argv.get(2) {
            Some(id) if argv.len() == 3 => match manager.asec_fs_path(id) {
                Ok(path) => vec![Reply::new(
                    ResponseCode::AsecPathResult,
                    path.display().to_string(),
                )],
                Err(err) => vec![completion("asec", Err(err))],
            },
            _ => syntax("Usage: asec fspath <container-id>"),
        },
        _ => syntax("Unknown asec cmd"),
    }
}

fn obb_cmd(manager: &VolumeManager, argv: &[&str]) -> Vec<Reply> {
    let Some(&sub) = argv.get(1) else {
        return syntax("Missing Argument");
    };

    match sub {
        "list" => {
            let mut replies: Vec<Reply> = manager
                .list_obbs()
                .into_iter()
                .map(|source| {
                    Reply::new(ResponseCode::AsecListResult, source.display().to_string())
                })
                .collect();
            replies.push(Reply::new(ResponseCode::CommandOkay, "obb operation succeeded"));
            replies
        }
        "mount" => {
            if argv.len() != 5 {
                return syntax("Usage: obb mount <filename> <key> <ownerGid>");
            }
            let Some(owner_gid) = parse_u32(argv[4]) else {
                return syntax("Usage: obb mount <filename> <key> <ownerGid>");
            };
            vec![completion(
                "obb",
                manager.mount_obb(argv[2], argv[3], owner_gid),
            )]
        }
        "unmount" => {
            let force = match argv.get(3) {
                None if argv.len() == 3 => false,
                Some(&"force") if argv.len() == 4 => true,
                _ => return syntax("Usage: obb unmount <source file> [force]"),
            };
            vec![completion("obb", manager.unmount_obb(argv[2], force))]
        }
        "path" => match argv.get(2) {
            Some(source) if argv.len() == 3 => match manager.obb_path(source) {
                Ok(path) => vec![Reply::new(
                    ResponseCode::AsecPathResult,
                    path.display().to_string(),
                )],
                Err(err) => vec![completion("obb", Err(err))],
            },
            _ => syntax("Usage: obb path <source file>"),
        },
        _ => syntax("Unknown obb cmd"),
    }
}

fn iso_cmd(manager: &VolumeManager, argv: &[&str]) -> Vec<Reply> {
    let Some(&sub) = argv.get(1) else {
        return syntax("Missing Argument");
    };

    match sub {
        "list" => {
            let mut replies: Vec<Reply> = manager
                .list_isos()
                .into_iter()
                .map(|source| {
                    Reply::new(ResponseCode::AsecListResult, source.display().to_string())
                })
                .collect();
            replies.push(Reply::new(ResponseCode::CommandOkay, "iso operation succeeded"));
            replies
        }
        "mount" => match argv.get(2) {
            Some(source) if argv.len() == 3 => vec![completion("iso", manager.mount_iso(source))],
            _ => syntax("Usage: iso mount <filename>"),
        },
        "unmount" => {
            let force = match argv.get(3) {
                None if argv.len() == 3 => false,
                Some(&"force") if argv.len() == 4 => true,
                _ => return syntax("Usage: iso unmount <source file> [force]"),
            };
            vec![completion("iso", manager.unmount_iso(argv[2], force))]
        }
        "path" => match argv.get(2) {
            Some(source) if argv.len() == 3 => match manager.iso_path(source) {
                Ok(path) => vec![Reply::new(
                    ResponseCode::AsecPathResult,
                    path.display().to_string(),
                )],
                Err(err) => vec![completion("iso", Err(err))],
            },
            _ => syntax("Usage: iso path <source file>"),
        },
        _ => syntax("Unknown iso cmd"),
    }
}

fn samba_cmd(manager: &VolumeManager, argv: &[&str]) -> Vec<Reply> {
    let Some(&sub) = argv.get(1) else {
        return syntax("Missing Argument");
    };

    match sub {
        "mount" => {
            if argv.len() != 9 {
                return syntax(
                    "Usage: samba mount <host> <share directory> <mount point> <user name> \
                     <password> <ro> <noexec>",
                );
            }
            let config = SambaConfig {
                host: argv[2].to_string(),
                share: argv[3].to_string(),
                mountpoint: argv[4].to_string(),
                user: argv[5].to_string(),
                password: argv[6].to_string(),
                readonly: argv[7] == "ro",
                executable: argv[8] != "noexec",
            };
            vec![completion("samba", manager.mount_samba(&config))]
        }
        "unmount" => {
            let force = match argv.get(3) {
                None if argv.len() == 3 => false,
                Some(&"force") if argv.len() == 4 => true,
                _ => return syntax("Usage: samba unmount <mount point> [force]"),
            };
            vec![completion("samba", manager.unmount_samba(argv[2], force))]
        }
        _ => syntax("Unknown samba cmd"),
    }
}

fn xwarp_cmd(manager: &VolumeManager, argv: &[&str]) -> Vec<Reply> {
    let xwarp = &manager.services().xwarp;
    match argv.get(1) {
        Some(&"enable") => match xwarp.enable() {
            Ok(()) => vec![Reply::new(ResponseCode::CommandOkay, "Xwarp mirroring started")],
            Err(err) => vec![Reply {
                code: ResponseCode::OperationFailed.as_i32(),
                message: format!("Failed to enable xwarp ({err})"),
            }],
        },
        Some(&"disable") => match xwarp.disable() {
            Ok(()) => vec![Reply::new(ResponseCode::CommandOkay, "Xwarp disabled")],
            Err(err) => vec![Reply {
                code: ResponseCode::OperationFailed.as_i32(),
                message: format!("Failed to disable xwarp ({err})"),
            }],
        },
        Some(&"status") => match xwarp.status() {
            Ok(status) => vec![Reply::new(
                ResponseCode::XwarpStatusResult,
                format!(
                    "{} {} {}",
                    if status.ready { "ready" } else { "not-ready" },
                    status.mirror_position,
                    status.max_size
                ),
            )],
            Err(err) => vec![Reply {
                code: ResponseCode::OperationFailed.as_i32(),
                message: format!("Failed to get xwarp status ({err})"),
            }],
        },
        _ => syntax("Unknown xwarp cmd"),
    }
}

fn cryptfs_cmd(manager: &VolumeManager, uid: u32, argv: &[&str]) -> Vec<Reply> {
    if uid != 0 && uid != AID_SYSTEM {
        return vec![Reply::new(
            ResponseCode::CommandNoPermission,
            "No permission to run cryptfs commands",
        )];
    }
    let crypto = manager.services().crypto.as_ref();

    let rc = match (argv.get(1), argv.len()) {
        (Some(&"checkpw"), 3) => crypto.check_password(argv[2]),
        (Some(&"restart"), 2) => crypto.restart(),
        (Some(&"cryptocomplete"), 2) => crypto.crypto_complete(),
        (Some(&"enablecrypto"), 4) => {
            let mode = match argv[2] {
                "wipe" => CryptoMode::Wipe,
                "inplace" => CryptoMode::InPlace,
                _ => return syntax("Usage: cryptfs enablecrypto <wipe|inplace> <passwd>"),
            };
            crypto.enable(mode, argv[3])
        }
        (Some(&"changepw"), 3) => crypto.change_password(argv[2]),
        (Some(&"verifypw"), 3) => crypto.verify_password(argv[2]),
        (Some(&"getfield"), 3) => match crypto.get_field(argv[2]) {
            Ok(value) => {
                return vec![
                    Reply::new(ResponseCode::CryptfsGetfieldResult, value),
                    Reply::new(ResponseCode::CommandOkay, "0"),
                ];
            }
            Err(_) => -1,
        },
        (Some(&"setfield"), 4) => crypto.set_field(argv[2], argv[3]),
        _ => return syntax("Unknown cryptfs cmd"),
    };

    // The command itself succeeded; the subsystem status rides in the
    // text for the caller to inspect.
    vec![Reply::new(ResponseCode::CommandOkay, rc.to_string())]
}

fn fstrim_cmd(manager: &VolumeManager, uid: u32, argv: &[&str]) -> Vec<Reply> {
    if uid != 0 && uid != AID_SYSTEM {
        return vec![Reply::new(
            ResponseCode::CommandNoPermission,
            "No permission to run fstrim commands",
        )];
    }
    match argv.get(1) {
        Some(&"dotrim") if argv.len() == 2 => {
            let trimmed = manager.fstrim();
            tracing::info!(trimmed, "fstrim complete");
            vec![Reply::new(ResponseCode::CommandOkay, "0")]
        }
        _ => syntax("Usage: fstrim dotrim"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stowage_common::StowagePaths;

    fn test_manager() -> (tempfile::TempDir, VolumeManager) {
        let temp = tempfile::tempdir().unwrap();
        let paths = StowagePaths::with_root(temp.path());
        paths.create_dirs().unwrap();
        let lun = temp.path().join("lun0_file");
        std::fs::write(&lun, b"").unwrap();
        let manager = VolumeManager::with_memory_props(paths, lun);
        (temp, manager)
    }

    #[test]
    fn empty_line_is_syntax_error() {
        let (_t, mut manager) = test_manager();
        let replies = dispatch(&mut manager, 0, "");
        assert_eq!(replies[0].code, 500);
    }

    #[test]
    fn unknown_command() {
        let (_t, mut manager) = test_manager();
        let replies = dispatch(&mut manager, 0, "teleport home");
        assert_eq!(replies[0].code, 500);
    }

    #[test]
    fn volume_list_empty() {
        let (_t, mut manager) = test_manager();
        let replies = dispatch(&mut manager, 0, "volume list");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].code, 200);
    }

    #[test]
    fn volume_mount_unknown_path() {
        let (_t, mut manager) = test_manager();
        let replies = dispatch(&mut manager, 0, "volume mount /storage/nope");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].code, 406, "storage-not-found code expected");
    }

    #[test]
    fn volume_unmount_arg_validation() {
        let (_t, mut manager) = test_manager();
        let replies = dispatch(&mut manager, 0, "volume unmount /x bogus");
        assert_eq!(replies[0].code, 500);
    }

    #[test]
    fn cryptfs_requires_privilege() {
        let (_t, mut manager) = test_manager();
        let replies = dispatch(&mut manager, 2000, "cryptfs restart");
        assert_eq!(replies[0].code, 502);

        let replies = dispatch(&mut manager, 1000, "cryptfs restart");
        assert_eq!(replies[0].code, 200);
    }

    #[test]
    fn fstrim_requires_privilege() {
        let (_t, mut manager) = test_manager();
        let replies = dispatch(&mut manager, 2000, "fstrim dotrim");
        assert_eq!(replies[0].code, 502);
    }

    #[test]
    fn asec_list_is_empty_initially() {
        let (_t, mut manager) = test_manager();
        let replies = dispatch(&mut manager, 0, "asec list");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].code, 200);
    }

    #[test]
    fn asec_create_validates_argc() {
        let (_t, mut manager) = test_manager();
        let replies = dispatch(&mut manager, 0, "asec create only-an-id");
        assert_eq!(replies[0].code, 500);
    }

    #[test]
    fn dump_ends_with_okay() {
        let (_t, mut manager) = test_manager();
        let replies = dispatch(&mut manager, 0, "dump");
        assert_eq!(replies.last().unwrap().code, 200);
        assert!(replies.iter().any(|r| r.message.contains("loop status")));
    }
}
