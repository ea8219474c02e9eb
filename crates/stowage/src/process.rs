//! Open-file-holder discovery and eviction.
//!
//! When an unmount or move-mount keeps failing with `EBUSY`, the engine
//! walks `/proc` for processes holding files on the contested path and
//! escalates from SIGHUP to SIGKILL. The walk is also exposed unsignalled
//! as `storage users`.

use std::fs;
use std::path::{Path, PathBuf};

/// Signal escalation level for holder eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillAction {
    /// Enumerate and log holders only.
    Warn,
    /// Send SIGHUP.
    Hup,
    /// Send SIGKILL.
    Kill,
}

/// A process found holding files under a watched path.
#[derive(Debug, Clone)]
pub struct StorageUser {
    /// Process id.
    pub pid: i32,
    /// Process name.
    pub name: String,
}

/// Seam for holder eviction so tests can observe signalling without a
/// real `/proc` or signal permissions.
pub trait ProcessKiller: Send {
    /// Signal (or just enumerate) every process holding files under
    /// `path`. Returns the number of holders found.
    fn kill_holders(&self, path: &Path, action: KillAction) -> usize;

    /// Enumerate holders without signalling (`storage users`).
    fn list_holders(&self, path: &Path) -> Vec<StorageUser>;
}

/// `/proc` scanner implementing both holder eviction and `storage users`.
#[derive(Debug)]
pub struct ProcScanner {
    proc_root: PathBuf,
}

impl ProcScanner {
    /// Scanner over the given `/proc` root.
    #[must_use]
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    /// List processes with open files, maps, or cwd/root/exe under `path`.
    pub fn storage_users(&self, path: &Path) -> Vec<StorageUser> {
        let mut users = Vec::new();
        let Ok(entries) = fs::read_dir(&self.proc_root) else {
            tracing::error!(proc = %self.proc_root.display(), "failed to open proc root");
            return users;
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(pid) = name.to_str().and_then(|n| n.parse::<i32>().ok()) else {
                continue;
            };
            if self.pid_uses_path(pid, path) {
                users.push(StorageUser {
                    pid,
                    name: self.process_name(pid),
                });
            }
        }
        users
    }

    fn pid_dir(&self, pid: i32) -> PathBuf {
        self.proc_root.join(pid.to_string())
    }

    fn process_name(&self, pid: i32) -> String {
        fs::read_to_string(self.pid_dir(pid).join("cmdline"))
            .ok()
            .and_then(|c| {
                c.split('\0')
                    .next()
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| format!("[pid {pid}]"))
    }

    fn pid_uses_path(&self, pid: i32, path: &Path) -> bool {
        self.check_fd_symlinks(pid, path)
            || self.check_maps(pid, path)
            || self.check_symlink(pid, path, "cwd")
            || self.check_symlink(pid, path, "root")
            || self.check_symlink(pid, path, "exe")
    }

    fn check_fd_symlinks(&self, pid: i32, path: &Path) -> bool {
        let Ok(fds) = fs::read_dir(self.pid_dir(pid).join("fd")) else {
            return false;
        };
        fds.flatten()
            .filter_map(|fd| fs::read_link(fd.path()).ok())
            .any(|target| target.starts_with(path))
    }

    fn check_maps(&self, pid: i32, path: &Path) -> bool {
        let Ok(maps) = fs::read_to_string(self.pid_dir(pid).join("maps")) else {
            return false;
        };
        let needle = path.to_string_lossy();
        maps.lines()
            .filter_map(|line| line.split_whitespace().nth(5))
            .any(|mapped| mapped.starts_with(needle.as_ref()))
    }

    fn check_symlink(&self, pid: i32, path: &Path, link: &str) -> bool {
        fs::read_link(self.pid_dir(pid).join(link))
            .map(|target| target.starts_with(path))
            .unwrap_or(false)
    }
}

impl ProcessKiller for ProcScanner {
    fn kill_holders(&self, path: &Path, action: KillAction) -> usize {
        let users = self.storage_users(path);
        for user in &users {
            match action {
                KillAction::Warn => {
                    tracing::warn!(pid = user.pid, name = %user.name,
                        path = %path.display(), "process holds files on busy path");
                }
                KillAction::Hup => {
                    tracing::warn!(pid = user.pid, name = %user.name, "sending SIGHUP");
                    unsafe {
                        libc::kill(user.pid, libc::SIGHUP);
                    }
                }
                KillAction::Kill => {
                    tracing::warn!(pid = user.pid, name = %user.name, "sending SIGKILL");
                    unsafe {
                        libc::kill(user.pid, libc::SIGKILL);
                    }
                }
            }
        }
        users.len()
    }

    fn list_holders(&self, path: &Path) -> Vec<StorageUser> {
        self.storage_users(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    // Builds a minimal fake /proc with one process holding an fd under
    // the watched path and one that does not.
    fn fake_proc(temp: &Path, watched: &Path) {
        let holder_fd = temp.join("100/fd");
        fs::create_dir_all(&holder_fd).unwrap();
        fs::write(temp.join("100/cmdline"), "media-scanner\0-d\0").unwrap();
        symlink(watched.join("DCIM/img.jpg"), holder_fd.join("3")).unwrap();

        let other_fd = temp.join("200/fd");
        fs::create_dir_all(&other_fd).unwrap();
        fs::write(temp.join("200/cmdline"), "sshd\0").unwrap();
        symlink("/var/log/auth.log", other_fd.join("3")).unwrap();
    }

    #[test]
    fn finds_holders_by_fd() {
        let temp = tempfile::tempdir().unwrap();
        let watched = temp.path().join("storage/sdcard1");
        fake_proc(temp.path(), &watched);

        let scanner = ProcScanner::new(temp.path());
        let users = scanner.storage_users(&watched);
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].pid, 100);
        assert_eq!(users[0].name, "media-scanner");
    }

    #[test]
    fn warn_action_counts_without_signalling() {
        let temp = tempfile::tempdir().unwrap();
        let watched = temp.path().join("storage/sdcard1");
        fake_proc(temp.path(), &watched);

        let scanner = ProcScanner::new(temp.path());
        assert_eq!(scanner.kill_holders(&watched, KillAction::Warn), 1);
    }

    #[test]
    fn finds_holders_by_cwd() {
        let temp = tempfile::tempdir().unwrap();
        let watched = temp.path().join("storage/sdcard1");
        fs::create_dir_all(temp.path().join("300")).unwrap();
        fs::write(temp.path().join("300/cmdline"), "sh\0").unwrap();
        symlink(watched.join("music"), temp.path().join("300/cwd")).unwrap();

        let scanner = ProcScanner::new(temp.path());
        let users = scanner.storage_users(&watched);
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].pid, 300);
    }
}
