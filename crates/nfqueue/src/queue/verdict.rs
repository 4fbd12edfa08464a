//! Verdicts and verdict options.

use std::sync::Arc;

use bytes::Bytes;

use super::config::VerdictDispatch;
use super::state::QueueState;
use super::wire::*;
use super::Shared;
use crate::netlink::message::NLM_F_REQUEST;
use crate::netlink::{AttrBuf, Error, NetlinkSocket, Result, Transport};

/// Fate of a queued packet (NF_*).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    Drop,
    Accept,
    /// The packet was consumed by userspace.
    Stolen,
    /// Requeue to another queue number.
    Queue(u16),
    /// Re-run the hook.
    Repeat,
}

impl TryFrom<u32> for Verdict {
    type Error = Error;

    /// Only NF_QUEUE may carry a queue number in the upper 16 bits.
    fn try_from(value: u32) -> Result<Self> {
        match (value & 0xffff, value >> 16) {
            (0, 0) => Ok(Verdict::Drop),
            (1, 0) => Ok(Verdict::Accept),
            (2, 0) => Ok(Verdict::Stolen),
            (3, queue) => Ok(Verdict::Queue(queue as u16)),
            (4, 0) => Ok(Verdict::Repeat),
            _ => Err(Error::InvalidVerdict(value)),
        }
    }
}

impl From<Verdict> for u32 {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Drop => 0,
            Verdict::Accept => 1,
            Verdict::Stolen => 2,
            Verdict::Queue(queue) => (u32::from(queue) << 16) | 3,
            Verdict::Repeat => 4,
        }
    }
}

/// Extra attribute carried by a verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerdictOption {
    /// Set the packet mark.
    Mark(u32),
    /// Set the connection mark.
    ConnMark(u32),
    /// Set the conntrack label bitmap. Must be exactly 16 bytes.
    Label(Vec<u8>),
    /// Replace the packet starting at the network header.
    AlteredPayload(Bytes),
    /// Replace the packet header attribute.
    AlteredHeader(Bytes),
}

/// Encode a verdict message.
///
/// Options are applied in order. Conntrack options are collected into one
/// NFQA_CT nested attribute that follows the others. A replacement payload
/// or header longer than an attribute can carry is rejected.
pub(crate) fn encode_verdict(
    family: u8,
    queue: u16,
    pid: u32,
    id: u32,
    verdict: Verdict,
    batch: bool,
    options: impl IntoIterator<Item = VerdictOption>,
) -> Result<Vec<u8>> {
    let mut attrs = AttrBuf::new();
    let mut ct = AttrBuf::new();
    attrs.push(NFQA_VERDICT_HDR, &verdict_hdr(verdict.into(), id))?;

    for option in options {
        match option {
            VerdictOption::Mark(mark) => attrs.push_u32_be(NFQA_MARK, mark),
            VerdictOption::ConnMark(mark) => ct.push_u32_be(CTA_MARK, mark),
            VerdictOption::Label(label) => {
                if label.len() != CT_LABEL_LEN {
                    return Err(Error::LabelSize(label.len()));
                }
                ct.push(CTA_LABELS, &label)?;
            }
            VerdictOption::AlteredPayload(payload) => attrs.push(NFQA_PAYLOAD, &payload)?,
            VerdictOption::AlteredHeader(header) => attrs.push(NFQA_PACKET_HDR, &header)?,
        }
    }
    if !ct.is_empty() {
        attrs.push_nested(NFQA_CT, &ct)?;
    }

    let msg = if batch {
        NFQNL_MSG_VERDICT_BATCH
    } else {
        NFQNL_MSG_VERDICT
    };
    let mut builder = queue_message(msg, NLM_F_REQUEST, family, queue);
    builder.append_attrs(&attrs);
    builder.set_pid(pid);
    Ok(builder.finish())
}

/// Cloneable handle for issuing verdicts, usable from inside the packet
/// callback or any other task.
pub struct VerdictSender<T: Transport = NetlinkSocket> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Clone for VerdictSender<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Transport> VerdictSender<T> {
    pub(crate) fn new(shared: Arc<Shared<T>>) -> Self {
        Self { shared }
    }

    /// Lifecycle state of the queue this sender belongs to.
    pub fn state(&self) -> QueueState {
        self.shared.state.get()
    }

    /// Issue a verdict for packet `id`.
    pub async fn set_verdict<V>(&self, id: u32, verdict: V) -> Result<()>
    where
        V: TryInto<Verdict>,
        Error: From<V::Error>,
    {
        let verdict = verdict.try_into()?;
        self.dispatch(id, verdict, false, std::iter::empty()).await
    }

    /// Issue `verdict` for every outstanding packet up to and including `id`.
    pub async fn set_verdict_batch<V>(&self, id: u32, verdict: V) -> Result<()>
    where
        V: TryInto<Verdict>,
        Error: From<V::Error>,
    {
        let verdict = verdict.try_into()?;
        self.dispatch(id, verdict, true, std::iter::empty()).await
    }

    /// Issue a verdict for packet `id` with extra attributes.
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
        let verdict = verdict.try_into()?;
        self.dispatch(id, verdict, false, options).await
    }

    async fn dispatch(
        &self,
        id: u32,
        verdict: Verdict,
        batch: bool,
        options: impl IntoIterator<Item = VerdictOption>,
    ) -> Result<()> {
        let shared = &self.shared;
        let msg = encode_verdict(
            shared.config.family,
            shared.config.queue,
            shared.conn.transport().pid(),
            id,
            verdict,
            batch,
            options,
        )?;

        let msg = match shared.config.verdict_dispatch {
            VerdictDispatch::Immediate => msg,
            VerdictDispatch::Buffered => match shared.buffer_verdict(msg) {
                None => return Ok(()),
                Some(msg) => msg,
            },
        };
        tracing::trace!(id, ?verdict, batch, "sending verdict");
        shared.conn.send_raw(&msg).await
    }
}

impl<T: Transport> Shared<T> {
    /// Queue a verdict for the receive loop and wake it.
    ///
    /// Hands the message back when no loop is receiving.
    fn buffer_verdict(&self, msg: Vec<u8>) -> Option<Vec<u8>> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if self.state.get() != QueueState::Receiving {
            return Some(msg);
        }
        pending.push(msg);
        drop(pending);
        self.flush.notify_one();
        None
    }

    /// Send every buffered verdict as one datagram.
    pub(crate) async fn flush_verdicts(&self) -> Result<()> {
        let batch = std::mem::take(&mut *self.pending.lock().unwrap_or_else(|e| e.into_inner()));
        self.conn.send_batch(&batch).await
    }

    /// Leave the receiving state and send what is still buffered.
    pub(crate) async fn stop_receiving(&self) {
        let batch = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            self.state.set(QueueState::Unbinding);
            std::mem::take(&mut *pending)
        };
        if let Err(e) = self.conn.send_batch(&batch).await {
            tracing::warn!(error = %e, count = batch.len(), "failed to flush buffered verdicts");
        }
    }
}
