//! In-memory kernel peer for unit tests.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;

use super::wire::{AF_INET, NFQA_PACKET_HDR, NFQNL_MSG_CONFIG, NFQNL_MSG_PACKET, NfGenMsg, queue_msg_type};
use crate::netlink::attr::AttrIter;
use crate::netlink::message::{NLM_F_ACK, NLMSG_HDRLEN, NlMsgHdr, NlMsgType, nlmsg_align};
use crate::netlink::{AttrBuf, Error, MessageIter, Result, SocketOption, Transport};

const MOCK_PID: u32 = 4242;

/// Build one netlink message.
pub(crate) fn raw_frame(msg_type: u16, seq: u32, payload: &[u8]) -> Vec<u8> {
    let mut hdr = NlMsgHdr::new(msg_type, 0);
    hdr.nlmsg_len = (NLMSG_HDRLEN + payload.len()) as u32;
    hdr.nlmsg_seq = seq;
    let mut buf = hdr.as_bytes().to_vec();
    buf.extend_from_slice(payload);
    buf.resize(nlmsg_align(buf.len()), 0);
    buf
}

/// NLMSG_ERROR reply to a request of type `orig_type`.
pub(crate) fn error_frame(orig_type: u16, seq: u32, code: i32) -> Vec<u8> {
    let mut orig = NlMsgHdr::new(orig_type, 0);
    orig.nlmsg_seq = seq;
    orig.nlmsg_pid = MOCK_PID;
    let mut payload = code.to_ne_bytes().to_vec();
    payload.extend_from_slice(orig.as_bytes());
    raw_frame(NlMsgType::ERROR, seq, &payload)
}

/// Positive acknowledgment of a config request.
pub(crate) fn ack_frame(seq: u32) -> Vec<u8> {
    error_frame(queue_msg_type(NFQNL_MSG_CONFIG), seq, 0)
}

/// Negative acknowledgment of a config request.
pub(crate) fn nack_frame(seq: u32, code: i32) -> Vec<u8> {
    error_frame(queue_msg_type(NFQNL_MSG_CONFIG), seq, code)
}

/// Packet notification for queue 100 with a packet header and `attrs`.
pub(crate) fn packet_frame(id: u32, attrs: &AttrBuf) -> Vec<u8> {
    let mut hdr = id.to_be_bytes().to_vec();
    hdr.extend_from_slice(&0x0800u16.to_be_bytes());
    hdr.push(1);

    let mut all = AttrBuf::new();
    all.push(NFQA_PACKET_HDR, &hdr).unwrap();

    let mut payload = NfGenMsg::new(AF_INET, 100).to_bytes().to_vec();
    payload.extend_from_slice(all.as_bytes());
    payload.extend_from_slice(attrs.as_bytes());
    raw_frame(queue_msg_type(NFQNL_MSG_PACKET), 0, &payload)
}

/// One message captured from the send path.
#[derive(Debug, Clone)]
pub(crate) struct SentMessage {
    pub hdr: NlMsgHdr,
    pub nfgen: NfGenMsg,
    pub attrs: Vec<(u16, Vec<u8>)>,
    /// Attribute area including nested-flag bits, for layout checks.
    pub raw_attrs: Vec<u8>,
}

impl SentMessage {
    pub fn attr(&self, kind: u16) -> Option<&[u8]> {
        self.attrs
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, v)| v.as_slice())
    }

    pub fn kinds(&self) -> Vec<u16> {
        self.attrs.iter().map(|(k, _)| *k).collect()
    }
}

struct Inner {
    sent: Mutex<Vec<Vec<u8>>>,
    rejects: Mutex<HashMap<usize, i32>>,
    requests: AtomicUsize,
    auto_ack: AtomicBool,
    fail_sends: AtomicBool,
    stall_after: AtomicUsize,
    seq: AtomicU32,
    tx: mpsc::UnboundedSender<Result<Bytes>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Bytes>>>,
}

/// Transport that records what is sent and replays injected datagrams.
///
/// Requests carrying NLM_F_ACK are acknowledged automatically unless
/// disabled. `recv` waits forever once nothing is left to deliver.
#[derive(Clone)]
pub(crate) struct MockTransport {
    inner: Arc<Inner>,
}

impl MockTransport {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                sent: Mutex::new(Vec::new()),
                rejects: Mutex::new(HashMap::new()),
                requests: AtomicUsize::new(0),
                auto_ack: AtomicBool::new(true),
                fail_sends: AtomicBool::new(false),
                stall_after: AtomicUsize::new(usize::MAX),
                seq: AtomicU32::new(1),
                tx,
                rx: tokio::sync::Mutex::new(rx),
            }),
        }
    }

    /// Answer the `index`th acknowledged request (zero based) with `code`.
    pub fn reject_request(&self, index: usize, code: i32) {
        self.inner.rejects.lock().unwrap().insert(index, code);
    }

    pub fn set_auto_ack(&self, enabled: bool) {
        self.inner.auto_ack.store(enabled, Ordering::SeqCst);
    }

    /// Make every subsequent send fail.
    pub fn fail_sends(&self, enabled: bool) {
        self.inner.fail_sends.store(enabled, Ordering::SeqCst);
    }

    /// Let `count` more datagrams through, then never complete a send.
    pub fn stall_sends_after(&self, count: usize) {
        let sent = self.inner.sent.lock().unwrap().len();
        self.inner.stall_after.store(sent + count, Ordering::SeqCst);
    }

    /// Queue a datagram for `recv`.
    pub fn inject(&self, datagram: Vec<u8>) {
        let _ = self.inner.tx.send(Ok(Bytes::from(datagram)));
    }

    /// Queue a receive error for `recv`.
    pub fn inject_error(&self, error: Error) {
        let _ = self.inner.tx.send(Err(error));
    }

    /// Datagrams sent so far.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.inner.sent.lock().unwrap().clone()
    }

    /// Every message sent so far, decoded.
    pub fn messages(&self) -> Vec<SentMessage> {
        let mut out = Vec::new();
        for datagram in self.sent() {
            for msg in MessageIter::new(&datagram) {
                let (hdr, payload, _) = msg.unwrap();
                let (nfgen_bytes, attr_bytes) = payload.split_at(NfGenMsg::LEN);
                let nfgen = NfGenMsg {
                    family: nfgen_bytes[0],
                    version: nfgen_bytes[1],
                    res_id: u16::from_be_bytes([nfgen_bytes[2], nfgen_bytes[3]]),
                };
                let mut iter = AttrIter::new(attr_bytes);
                let attrs = iter.by_ref().map(|(k, v)| (k, v.to_vec())).collect();
                iter.finish().unwrap();
                out.push(SentMessage {
                    hdr: *hdr,
                    nfgen,
                    attrs,
                    raw_attrs: attr_bytes.to_vec(),
                });
            }
        }
        out
    }
}

impl Transport for MockTransport {
    async fn send(&self, msg: &[u8]) -> Result<()> {
        if self.inner.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::Io(io::Error::from_raw_os_error(libc::EPIPE)));
        }
        let sent = self.inner.sent.lock().unwrap().len();
        if sent >= self.inner.stall_after.load(Ordering::SeqCst) {
            return std::future::pending().await;
        }
        self.inner.sent.lock().unwrap().push(msg.to_vec());

        for result in MessageIter::new(msg) {
            let (hdr, _, _) = result?;
            if hdr.nlmsg_flags & NLM_F_ACK == 0 {
                continue;
            }
            let index = self.inner.requests.fetch_add(1, Ordering::SeqCst);
            let code = self
                .inner
                .rejects
                .lock()
                .unwrap()
                .get(&index)
                .copied()
                .unwrap_or(0);
            if self.inner.auto_ack.load(Ordering::SeqCst) {
                let reply = error_frame(hdr.nlmsg_type, hdr.nlmsg_seq, code);
                let _ = self.inner.tx.send(Ok(Bytes::from(reply)));
            }
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Bytes> {
        let mut rx = self.inner.rx.lock().await;
        match rx.recv().await {
            Some(item) => item,
            None => std::future::pending().await,
        }
    }

    fn next_seq(&self) -> u32 {
        self.inner.seq.fetch_add(1, Ordering::SeqCst)
    }

    fn pid(&self) -> u32 {
        MOCK_PID
    }

    fn set_option(&self, _option: SocketOption, _enabled: bool) -> Result<()> {
        Ok(())
    }
}
