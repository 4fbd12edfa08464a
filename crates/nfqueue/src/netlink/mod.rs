//! Netlink plumbing for the netfilter subsystem.
//!
//! Message and attribute framing, the async `NETLINK_NETFILTER` socket, the
//! [`Transport`] seam and the request/acknowledgment [`Connection`].

pub mod attr;
pub mod builder;
pub mod connection;
pub mod error;
pub mod message;
pub mod socket;
pub mod transport;

pub use attr::{AttrBuf, AttrIter, NlAttr};
pub use builder::MessageBuilder;
pub use connection::Connection;
pub use error::{ErrMsg, Error, Result};
pub use message::{MessageIter, NlMsgHdr, NlMsgType};
pub use socket::{NetlinkSocket, SocketOption};
pub use transport::Transport;
