//! Netlink connection with request/acknowledgment handling.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;

use super::builder::MessageBuilder;
use super::error::{Error, Result};
use super::message::{MessageIter, NlMsgError};
use super::socket::SocketOption;
use super::transport::Transport;

/// Netlink connection over a [`Transport`].
///
/// Adds sequence-correlated acknowledgments, read/write deadlines and a
/// backlog: datagrams that arrive while a request waits for its ACK are kept
/// and handed out by the next [`recv`](Self::recv) instead of being lost.
pub struct Connection<T> {
    transport: T,
    backlog: Mutex<VecDeque<Bytes>>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl<T: Transport> Connection<T> {
    /// Wrap a transport without deadlines.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            backlog: Mutex::new(VecDeque::new()),
            read_timeout: None,
            write_timeout: None,
        }
    }

    /// Apply a deadline to every receive.
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Apply a deadline to every send.
    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Get the underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Allocate a sequence number.
    pub fn next_seq(&self) -> u32 {
        self.transport.next_seq()
    }

    /// Toggle a socket-level option on the transport.
    pub fn set_option(&self, option: SocketOption, enabled: bool) -> Result<()> {
        self.transport.set_option(option, enabled)
    }

    /// Send raw message bytes, honoring the write deadline.
    pub async fn send_raw(&self, msg: &[u8]) -> Result<()> {
        match self.write_timeout {
            Some(limit) => tokio::time::timeout(limit, self.transport.send(msg))
                .await
                .map_err(|_| Error::Timeout)?,
            None => self.transport.send(msg).await,
        }
    }

    /// Send pre-built messages as a single datagram.
    pub async fn send_batch(&self, msgs: &[Vec<u8>]) -> Result<()> {
        if msgs.is_empty() {
            return Ok(());
        }
        let buf = msgs.concat();
        self.send_raw(&buf).await
    }

    /// Receive the next datagram, serving the backlog first.
    pub async fn recv(&self) -> Result<Bytes> {
        if let Some(data) = self.pop_backlog() {
            return Ok(data);
        }
        self.recv_transport().await
    }

    async fn recv_transport(&self) -> Result<Bytes> {
        match self.read_timeout {
            Some(limit) => tokio::time::timeout(limit, self.transport.recv())
                .await
                .map_err(|_| Error::Timeout)?,
            None => self.transport.recv().await,
        }
    }

    fn pop_backlog(&self) -> Option<Bytes> {
        self.backlog
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    fn push_backlog(&self, data: Bytes) {
        self.backlog
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(data);
    }

    /// Send a request with the given sequence number and wait for its ACK.
    ///
    /// A negative acknowledgment is returned as [`Error::Nack`].
    pub async fn request_ack(&self, mut builder: MessageBuilder, seq: u32) -> Result<()> {
        builder.set_seq(seq);
        builder.set_pid(self.transport.pid());
        self.send_raw(&builder.finish()).await?;

        loop {
            let data = self.recv_transport().await?;
            if let Some(outcome) = self.take_ack(&data, seq)? {
                return outcome;
            }
        }
    }

    /// Look for the ACK of `seq` in a datagram.
    ///
    /// Every other message in the datagram goes to the backlog.
    fn take_ack(&self, data: &Bytes, seq: u32) -> Result<Option<Result<()>>> {
        let mut outcome = None;
        let mut others = Vec::new();

        for result in MessageIter::new(data) {
            let (header, payload, raw) = result?;

            if outcome.is_none() && header.is_error() && header.nlmsg_seq == seq {
                let err = NlMsgError::from_bytes(payload)?;
                outcome = Some(if err.is_ack() {
                    Ok(())
                } else {
                    Err(Error::Nack(err.to_err_msg()))
                });
                continue;
            }
            others.push(raw);
        }

        if outcome.is_none() {
            self.push_backlog(data.clone());
        } else {
            for raw in others {
                self.push_backlog(data.slice_ref(raw));
            }
        }

        Ok(outcome)
    }
}
