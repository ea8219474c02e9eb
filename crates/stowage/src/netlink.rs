//! Kernel uevent source.
//!
//! A dedicated reader thread owns a `NETLINK_KOBJECT_UEVENT` socket and
//! forwards parsed block events to the engine channel in arrival order,
//! preserving per-volume ordering exactly as the kernel emitted it.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use tokio::sync::mpsc::UnboundedSender;

use stowage_common::{StowageError, StowageResult};

use crate::event::{parse_uevent, BlockEvent};

const UEVENT_BUF: usize = 64 * 1024;

/// Blocking reader over the kernel uevent socket.
pub struct NetlinkSource {
    fd: OwnedFd,
}

impl NetlinkSource {
    /// Open and bind the uevent socket (requires CAP_NET_ADMIN-ish
    /// privileges on most kernels).
    pub fn open() -> StowageResult<Self> {
        // SAFETY: plain socket syscalls on owned descriptors.
        unsafe {
            let fd = libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
                libc::NETLINK_KOBJECT_UEVENT,
            );
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            let fd = OwnedFd::from_raw_fd(fd);

            let mut addr: libc::sockaddr_nl = mem::zeroed();
            addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
            addr.nl_pid = 0;
            addr.nl_groups = 1; // kernel broadcast group

            if libc::bind(
                fd.as_raw_fd(),
                std::ptr::addr_of!(addr).cast(),
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            ) < 0
            {
                return Err(io::Error::last_os_error().into());
            }

            // A burst of insertions must not drop events.
            let rcvbuf: libc::c_int = 256 * 1024;
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                std::ptr::addr_of!(rcvbuf).cast(),
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            );

            Ok(Self { fd })
        }
    }

    /// Read and forward events until the channel closes or the socket
    /// fails. Parse failures are logged and dropped, never fatal.
    pub fn run(self, tx: UnboundedSender<BlockEvent>) -> StowageResult<()> {
        let mut buf = vec![0u8; UEVENT_BUF];
        loop {
            let n = self.recv(&mut buf)?;
            if n == 0 {
                return Err(StowageError::KernelEvent {
                    message: "uevent socket closed".to_string(),
                });
            }
            match parse_uevent(&buf[..n]) {
                Ok(Some(event)) => {
                    if tx.send(event).is_err() {
                        // Engine gone; shut the reader down.
                        return Ok(());
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(%err, "dropping malformed uevent");
                }
            }
        }
    }

    fn recv(&self, buf: &mut [u8]) -> StowageResult<usize> {
        loop {
            // SAFETY: buf outlives the call and the length is its own.
            let n = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                    0,
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err.into());
        }
    }
}
