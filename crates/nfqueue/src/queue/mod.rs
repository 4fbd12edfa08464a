//! The netfilter packet queue protocol.
//!
//! A [`Queue`] binds one queue number, runs the configuration handshake
//! when a callback is registered and then delivers every queued packet to
//! that callback from a background task. Verdicts go back through the
//! handle or through a [`VerdictSender`] cloned from it.
//!
//! # Example
//!
//! ```ignore
//! use std::ops::ControlFlow;
//! use nfqueue::queue::{Config, Packet, Queue, Verdict};
//! use tokio::sync::watch;
//!
//! let mut queue = Queue::open(Config::new(100))?;
//! let verdicts = queue.verdicts();
//! let (cancel, cancel_rx) = watch::channel(false);
//!
//! queue
//!     .register(cancel_rx, move |pkt: Packet| {
//!         let verdicts = verdicts.clone();
//!         async move {
//!             if let Err(e) = verdicts.set_verdict(pkt.id, Verdict::Accept).await {
//!                 eprintln!("verdict failed: {e}");
//!             }
//!             ControlFlow::Continue(())
//!         }
//!     })
//!     .await?;
//!
//! tokio::signal::ctrl_c().await?;
//! cancel.send(true)?;
//! queue.close().await?;
//! ```

pub mod config;
mod handshake;
pub mod packet;
mod receive;
mod state;
pub mod verdict;
pub mod wire;

#[cfg(test)]
pub(crate) mod testing;

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

pub use config::{Config, CopyMode, NetNs, VerdictDispatch, flags};
pub use handshake::BindStep;
pub use packet::{Packet, Vlan};
pub use receive::default_error_handler;
pub use state::QueueState;
pub use verdict::{Verdict, VerdictOption, VerdictSender};

use self::receive::Receiver;
use self::state::StateCell;
use crate::netlink::{Connection, Error, NetlinkSocket, Result, SocketOption, Transport};

/// State shared by the handle, the receive task and verdict senders.
pub(crate) struct Shared<T> {
    pub config: Config,
    pub conn: Connection<T>,
    pub state: StateCell,
    /// Verdicts waiting for the receive loop in buffered dispatch.
    pub pending: Mutex<Vec<Vec<u8>>>,
    /// Wakes the receive loop when `pending` gains a verdict.
    pub flush: Notify,
}

/// Handle to one netfilter queue.
///
/// Dropping the handle stops the receive task, which then unbinds the
/// queue on its own. [`close`](Self::close) does the same and waits for it.
pub struct Queue<T: Transport = NetlinkSocket> {
    shared: Arc<Shared<T>>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    seq: u32,
}

impl Queue<NetlinkSocket> {
    /// Open a netfilter netlink socket for the configured queue.
    ///
    /// No message is sent until [`register`](Self::register).
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let socket = match &config.netns {
            NetNs::Current => NetlinkSocket::new()?,
            NetNs::Fd(fd) => NetlinkSocket::new_in_namespace(*fd)?,
            NetNs::Path(path) => NetlinkSocket::new_in_namespace_path(path)?,
        };
        Self::with_transport(config, socket)
    }
}

impl<T: Transport> Queue<T> {
    /// Build a handle on an already open transport.
    pub fn with_transport(config: Config, transport: T) -> Result<Self> {
        config.validate()?;
        let conn = Connection::new(transport)
            .with_read_timeout(config.read_timeout)
            .with_write_timeout(config.write_timeout);
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                conn,
                state: StateCell::new(QueueState::Unbound),
                pending: Mutex::new(Vec::new()),
                flush: Notify::new(),
            }),
            shutdown,
            task: None,
            seq: 0,
        })
    }

    /// The configuration the handle was opened with.
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> QueueState {
        self.shared.state.get()
    }

    /// A handle for issuing verdicts from other tasks.
    pub fn verdicts(&self) -> VerdictSender<T> {
        VerdictSender::new(Arc::clone(&self.shared))
    }

    /// Toggle a netlink socket option, e.g. [`SocketOption::NoEnobufs`].
    pub fn set_option(&self, option: SocketOption, enabled: bool) -> Result<()> {
        self.shared.conn.set_option(option, enabled)
    }

    /// See [`VerdictSender::set_verdict`].
    pub async fn set_verdict<V>(&self, id: u32, verdict: V) -> Result<()>
    where
        V: TryInto<Verdict>,
        Error: From<V::Error>,
    {
        self.verdicts().set_verdict(id, verdict).await
    }

    /// See [`VerdictSender::set_verdict_batch`].
    pub async fn set_verdict_batch<V>(&self, id: u32, verdict: V) -> Result<()>
    where
        V: TryInto<Verdict>,
        Error: From<V::Error>,
    {
        self.verdicts().set_verdict_batch(id, verdict).await
    }

    /// See [`VerdictSender::set_verdict_with_options`].
    pub async fn set_verdict_with_options<V>(
        &self,
        id: u32,
        verdict: V,
        options: impl IntoIterator<Item = VerdictOption>,
    ) -> Result<()>
    where
        V: TryInto<Verdict>,
        Error: From<V::Error>,
    {
        self.verdicts()
            .set_verdict_with_options(id, verdict, options)
            .await
    }

    /// Bind the queue and start delivering packets to `callback`, using
    /// [`default_error_handler`].
    ///
    /// Returning [`ControlFlow::Break`] from the callback stops delivery.
    /// Sending `true` on the `cancel` channel does the same.
    pub async fn register<F, Fut>(&mut self, cancel: watch::Receiver<bool>, callback: F) -> Result<()>
    where
        F: FnMut(Packet) -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        self.register_with_error_handler(cancel, callback, default_error_handler)
            .await
    }

    /// Like [`register`](Self::register), with a custom policy for receive
    /// errors and kernel error reports. The loop stops when `on_error`
    /// returns [`ControlFlow::Break`].
    ///
    /// Packets are delivered one at a time, in kernel order. A failed
    /// handshake is returned as [`Error::Handshake`]; the handle should
    /// then be closed.
    pub async fn register_with_error_handler<F, Fut, H>(
        &mut self,
        cancel: watch::Receiver<bool>,
        callback: F,
        on_error: H,
    ) -> Result<()>
    where
        F: FnMut(Packet) -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
        H: FnMut(&Error) -> ControlFlow<()> + Send + 'static,
    {
        let state = self.state();
        if state != QueueState::Unbound || self.task.is_some() {
            return Err(Error::InvalidState(format!(
                "cannot register a callback on a {} queue",
                state
            )));
        }

        let shared = &self.shared;
        self.seq = shared.conn.next_seq();
        handshake::bind(&shared.conn, &shared.config, self.seq, &shared.state).await?;
        shared
            .state
            .transition(QueueState::Configured, QueueState::Receiving)
            .map_err(|s| Error::InvalidState(format!("queue became {} during handshake", s)))?;

        let receiver = Receiver {
            shared: Arc::clone(shared),
            cancel,
            shutdown: self.shutdown.subscribe(),
            callback,
            on_error,
            seq: self.seq,
        };
        self.task = Some(tokio::spawn(receiver.run()));
        tracing::debug!(queue = shared.config.queue, "receive loop started");
        Ok(())
    }

    /// Wait for the receive loop to end on its own (cancellation, callback
    /// or error handler), including the unbind.
    ///
    /// Cancel safe: dropping the future leaves the loop running.
    pub async fn wait(&mut self) -> Result<()> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };
        let result = task.await;
        self.task = None;
        result.map_err(|e| Error::Task(e.to_string()))
    }

    /// Stop the receive loop, unbind and wait for both to finish.
    ///
    /// A queue that was bound without starting a loop (a handshake that
    /// failed after binding) is unbound here.
    pub async fn close(mut self) -> Result<()> {
        self.shutdown.send_replace(true);
        if self.task.is_some() {
            return self.wait().await;
        }

        let shared = &self.shared;
        let state = shared.state.get();
        if (QueueState::QueueBound..=QueueState::Configured).contains(&state) {
            shared.state.set(QueueState::Unbinding);
            handshake::unbind(&shared.conn, &shared.config, self.seq).await;
        }
        shared.state.set(QueueState::Closed);
        Ok(())
    }
}

impl<T: Transport> Drop for Queue<T> {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}
