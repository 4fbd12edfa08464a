//! Async userspace engine for the Linux netfilter packet queue (NFQUEUE).
//!
//! Packets matched by an `NFQUEUE` rule are held by the kernel until
//! userspace issues a verdict. This crate binds a queue, decodes the
//! kernel's packet notifications and sends verdicts back, optionally
//! setting marks, conntrack labels or a rewritten payload.
//!
//! # Example
//!
//! ```ignore
//! use std::ops::ControlFlow;
//! use nfqueue::{Config, Packet, Queue, Verdict};
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> nfqueue::Result<()> {
//!     let mut queue = Queue::open(Config::new(100))?;
//!     let verdicts = queue.verdicts();
//!     let (_cancel, cancel_rx) = watch::channel(false);
//!
//!     queue
//!         .register(cancel_rx, move |pkt: Packet| {
//!             let verdicts = verdicts.clone();
//!             async move {
//!                 let _ = verdicts.set_verdict(pkt.id, Verdict::Accept).await;
//!                 ControlFlow::Continue(())
//!             }
//!         })
//!         .await?;
//!
//!     queue.wait().await
//! }
//! ```
//!
//! Logging goes through `tracing`; nothing is printed unless the
//! application installs a subscriber.

pub mod netlink;
pub mod queue;

pub use netlink::{Error, Result};
pub use queue::{Config, Packet, Queue, Verdict, VerdictOption, VerdictSender};
