//! The datagram transport a [`Connection`](super::Connection) runs on.
//!
//! [`NetlinkSocket`] is the production implementation. The trait exists so
//! the queue protocol can be driven by any netlink-family socket facility,
//! including in-memory peers in tests.

use std::future::Future;

use bytes::Bytes;

use super::error::Result;
use super::socket::{NetlinkSocket, SocketOption};

/// A netlink-family datagram socket.
pub trait Transport: Send + Sync + 'static {
    /// Send one datagram (one or more complete netlink messages).
    fn send(&self, msg: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Wait for the next datagram.
    ///
    /// Dropping the returned future must cancel the receive without losing
    /// data that has not yet been returned.
    fn recv(&self) -> impl Future<Output = Result<Bytes>> + Send;

    /// Allocate a request sequence number.
    fn next_seq(&self) -> u32;

    /// Local port ID.
    fn pid(&self) -> u32;

    /// Toggle a socket-level option.
    fn set_option(&self, option: SocketOption, enabled: bool) -> Result<()>;
}

impl Transport for NetlinkSocket {
    fn send(&self, msg: &[u8]) -> impl Future<Output = Result<()>> + Send {
        NetlinkSocket::send(self, msg)
    }

    fn recv(&self) -> impl Future<Output = Result<Bytes>> + Send {
        self.recv_msg()
    }

    fn next_seq(&self) -> u32 {
        NetlinkSocket::next_seq(self)
    }

    fn pid(&self) -> u32 {
        NetlinkSocket::pid(self)
    }

    fn set_option(&self, option: SocketOption, enabled: bool) -> Result<()> {
        NetlinkSocket::set_option(self, option, enabled)
    }
}
