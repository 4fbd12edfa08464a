//! Low-level async netlink socket operations.

use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::{Bytes, BytesMut};
use netlink_sys::{Socket, SocketAddr, protocols};
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

use super::error::{Error, Result};

/// Receive buffer size: a full 64 KiB packet copy plus notification metadata.
const RECV_BUF_SIZE: usize = 0x10000 + 8192;

/// Netlink socket-level options (SOL_NETLINK).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    /// Report send failures to broadcast listeners.
    BroadcastError,
    /// Suppress ENOBUFS when the receive buffer overflows.
    NoEnobufs,
    /// Receive notifications from all network namespaces.
    ListenAllNsid,
    /// Do not echo the original request in error acknowledgments.
    CapAck,
    /// Extended acknowledgment reporting.
    ExtAck,
}

impl SocketOption {
    fn as_raw(self) -> libc::c_int {
        match self {
            SocketOption::BroadcastError => libc::NETLINK_BROADCAST_ERROR,
            SocketOption::NoEnobufs => libc::NETLINK_NO_ENOBUFS,
            SocketOption::ListenAllNsid => libc::NETLINK_LISTEN_ALL_NSID,
            SocketOption::CapAck => libc::NETLINK_CAP_ACK,
            SocketOption::ExtAck => libc::NETLINK_EXT_ACK,
        }
    }
}

/// Async NETLINK_NETFILTER socket.
pub struct NetlinkSocket {
    /// The underlying async file descriptor.
    fd: AsyncFd<Socket>,
    /// Sequence number counter.
    seq: AtomicU32,
    /// Local port ID (assigned by kernel).
    pid: u32,
}

impl NetlinkSocket {
    /// Create a new netfilter netlink socket in the current namespace.
    pub fn new() -> Result<Self> {
        Self::create_socket()
    }

    /// Create a socket that operates in a specific network namespace.
    ///
    /// The namespace is specified by an open file descriptor to a namespace file
    /// (e.g., `/proc/<pid>/ns/net` or `/var/run/netns/<name>`).
    ///
    /// This function temporarily switches to the target namespace, creates the socket,
    /// then restores the original namespace. The socket keeps operating in the target
    /// namespace afterwards.
    ///
    /// # Safety
    ///
    /// This function uses `setns()` which affects the calling thread. It saves and
    /// restores the original namespace, but callers should be aware of potential
    /// issues in multi-threaded contexts if the restoration fails.
    pub fn new_in_namespace(ns_fd: RawFd) -> Result<Self> {
        let current_ns = File::open("/proc/self/ns/net")
            .map_err(|e| Error::InvalidMessage(format!("cannot open current namespace: {}", e)))?;
        let current_ns_fd = current_ns.as_raw_fd();

        // SAFETY: libc::setns switches to the namespace specified by ns_fd.
        // ns_fd is a valid file descriptor to a namespace file.
        let ret = unsafe { libc::setns(ns_fd, libc::CLONE_NEWNET) };
        if ret < 0 {
            return Err(last_errno().with_context("entering network namespace"));
        }

        let result = Self::create_socket();

        // SAFETY: current_ns_fd is valid (opened from /proc/self/ns/net above).
        let restore_ret = unsafe { libc::setns(current_ns_fd, libc::CLONE_NEWNET) };
        if restore_ret < 0 {
            tracing::warn!(
                error = %std::io::Error::last_os_error(),
                "failed to restore original network namespace"
            );
        }

        result
    }

    /// Create a socket in the network namespace at `ns_path`.
    ///
    /// Convenience wrapper around [`new_in_namespace`](Self::new_in_namespace).
    pub fn new_in_namespace_path<P: AsRef<Path>>(ns_path: P) -> Result<Self> {
        let ns_file = File::open(ns_path.as_ref()).map_err(|e| {
            Error::InvalidMessage(format!(
                "cannot open namespace '{}': {}",
                ns_path.as_ref().display(),
                e
            ))
        })?;
        Self::new_in_namespace(ns_file.as_raw_fd())
    }

    fn create_socket() -> Result<Self> {
        let mut socket = Socket::new(protocols::NETLINK_NETFILTER)?;
        socket.set_non_blocking(true)?;

        // Bind to get a port ID
        let mut addr = SocketAddr::new(0, 0);
        socket.bind(&addr)?;
        socket.get_address(&mut addr)?;
        let pid = addr.port_number();

        // Enable extended ACK for better error messages
        socket.set_ext_ack(true).ok(); // Ignore if not supported

        let fd = AsyncFd::new(socket)?;

        Ok(Self {
            fd,
            seq: AtomicU32::new(1),
            pid,
        })
    }

    /// Get the next sequence number.
    pub fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Get the local port ID.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Enable or disable a netlink socket option.
    pub fn set_option(&self, option: SocketOption, enabled: bool) -> Result<()> {
        let value: libc::c_int = enabled.into();
        // SAFETY: the fd is owned by self and value outlives the call.
        let ret = unsafe {
            libc::setsockopt(
                self.as_raw_fd(),
                libc::SOL_NETLINK,
                option.as_raw(),
                &value as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(last_errno().with_context(format!("setting {:?}", option)));
        }
        Ok(())
    }

    /// Send a message.
    pub async fn send(&self, msg: &[u8]) -> Result<()> {
        loop {
            let mut guard = self.fd.ready(Interest::WRITABLE).await?;

            match guard.try_io(|inner| inner.get_ref().send(msg, 0)) {
                Ok(result) => {
                    result?;
                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }

    /// Receive one datagram, which may hold several netlink messages.
    pub async fn recv_msg(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(RECV_BUF_SIZE);

        loop {
            let mut guard = self.fd.ready(Interest::READABLE).await?;

            match guard.try_io(|inner| inner.get_ref().recv(&mut buf, 0)) {
                Ok(result) => {
                    let _n = result?;
                    // buf has been advanced by recv
                    return Ok(buf.freeze());
                }
                Err(_would_block) => continue,
            }
        }
    }
}

/// The calling thread's errno as a kernel error.
fn last_errno() -> Error {
    let errno = std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO);
    Error::from_errno(-errno)
}

impl AsRawFd for NetlinkSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.get_ref().as_raw_fd()
    }
}
