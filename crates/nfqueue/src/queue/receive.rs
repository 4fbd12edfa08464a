//! The receive loop.

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::sync::watch;

use super::handshake;
use super::packet::Packet;
use super::state::QueueState;
use super::wire::{NFQNL_MSG_PACKET, queue_msg_type};
use super::Shared;
use crate::netlink::message::NlMsgError;
use crate::netlink::{Error, MessageIter, Transport};

/// Error policy used by [`Queue::register`](super::Queue::register).
///
/// Keeps receiving after timeouts, temporary socket errors and kernel
/// negative acknowledgments (such as a verdict for a packet the kernel
/// already released). Stops on anything else.
pub fn default_error_handler(err: &Error) -> ControlFlow<()> {
    if err.is_temporary() || matches!(err, Error::Nack(_)) {
        ControlFlow::Continue(())
    } else {
        ControlFlow::Break(())
    }
}

/// Resolves once the caller asks for cancellation. Never resolves if the
/// sender is gone without having asked.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let closed = cancel.wait_for(|c| *c).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

/// Resolves once the handle shuts down or is dropped.
async fn shutdown(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|s| *s).await;
}

/// Everything the receive task owns.
pub(crate) struct Receiver<T, F, H> {
    pub shared: Arc<Shared<T>>,
    pub cancel: watch::Receiver<bool>,
    pub shutdown: watch::Receiver<bool>,
    pub callback: F,
    pub on_error: H,
    /// Handshake sequence number, reused for the unbind.
    pub seq: u32,
}

impl<T, F, Fut, H> Receiver<T, F, H>
where
    T: Transport,
    F: FnMut(Packet) -> Fut + Send + 'static,
    Fut: Future<Output = ControlFlow<()>> + Send,
    H: FnMut(&Error) -> ControlFlow<()> + Send + 'static,
{
    /// Deliver packets until cancelled, stopped by the callback or the
    /// error handler, then unbind.
    pub async fn run(mut self) {
        let shared = Arc::clone(&self.shared);
        let queue = shared.config.queue;

        'receive: loop {
            if *self.cancel.borrow() || *self.shutdown.borrow() {
                break;
            }
            if let Err(e) = shared.flush_verdicts().await {
                tracing::warn!(queue, error = %e, "failed to send buffered verdicts");
            }

            let result = tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel) => break 'receive,
                _ = shutdown(&mut self.shutdown) => break 'receive,
                // Verdicts issued outside the callback; flushed at the top.
                _ = shared.flush.notified() => continue,
                result = shared.conn.recv() => result,
            };

            let data = match result {
                Ok(data) => data,
                Err(e) => {
                    if e.is_timeout() {
                        tracing::trace!(queue, "receive timed out");
                    } else {
                        tracing::warn!(queue, error = %e, "could not receive message");
                    }
                    if (self.on_error)(&e).is_break() {
                        break;
                    }
                    continue;
                }
            };

            for msg in MessageIter::new(&data) {
                let (hdr, payload, _) = match msg {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::warn!(queue, error = %e, "malformed netlink frame");
                        break;
                    }
                };

                if hdr.is_done() {
                    break;
                }
                if hdr.is_error() {
                    let err = match NlMsgError::from_bytes(payload) {
                        Ok(err) if err.is_ack() => continue,
                        Ok(err) => Error::Nack(err.to_err_msg()),
                        Err(e) => e,
                    };
                    tracing::warn!(queue, error = %err, "kernel reported an error");
                    if (self.on_error)(&err).is_break() {
                        break 'receive;
                    }
                    continue;
                }
                if hdr.nlmsg_type != queue_msg_type(NFQNL_MSG_PACKET) {
                    tracing::trace!(queue, msg_type = hdr.nlmsg_type, "skipping message");
                    continue;
                }

                let packet = match Packet::decode(&data.slice_ref(payload)) {
                    Ok(packet) => packet,
                    Err(e) => {
                        tracing::warn!(queue, error = %e, "could not decode packet");
                        continue;
                    }
                };
                tracing::trace!(queue, id = packet.id, "delivering packet");
                if (self.callback)(packet).await.is_break() {
                    break 'receive;
                }
            }
        }

        shared.stop_receiving().await;
        handshake::unbind(&shared.conn, &shared.config, self.seq).await;
        shared.state.set(QueueState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::netlink::AttrBuf;
    use crate::netlink::message::NlMsgType;
    use crate::queue::config::{Config, VerdictDispatch};
    use crate::queue::testing::{MockTransport, SentMessage, nack_frame, packet_frame, raw_frame};
    use crate::queue::verdict::Verdict;
    use crate::queue::wire::*;
    use crate::queue::Queue;

    type Ids = mpsc::UnboundedReceiver<u32>;

    fn collect(
        stop_after: Option<usize>,
    ) -> (
        impl FnMut(Packet) -> std::future::Ready<ControlFlow<()>> + Send + 'static,
        Ids,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut seen = 0;
        let callback = move |pkt: Packet| {
            tx.send(pkt.id).unwrap();
            seen += 1;
            let flow = match stop_after {
                Some(n) if seen >= n => ControlFlow::Break(()),
                _ => ControlFlow::Continue(()),
            };
            std::future::ready(flow)
        };
        (callback, rx)
    }

    fn drain(rx: &mut Ids) -> Vec<u32> {
        let mut ids = Vec::new();
        while let Ok(id) = rx.try_recv() {
            ids.push(id);
        }
        ids
    }

    fn is_unbind(msg: &SentMessage) -> bool {
        msg.hdr.nlmsg_type == 0x0302 && msg.attr(NFQA_CFG_CMD).map(|c| c[0]) == Some(2)
    }

    fn malformed_packet(id: u32) -> Vec<u8> {
        let mut attrs = AttrBuf::new();
        attrs.push(NFQA_UNSPEC, &[0; 4]).unwrap();
        packet_frame(id, &attrs)
    }

    async fn registered(
        config: Config,
        stop_after: Option<usize>,
    ) -> (Queue<MockTransport>, MockTransport, watch::Sender<bool>, Ids) {
        let mock = MockTransport::new();
        let mut queue = Queue::with_transport(config, mock.clone()).unwrap();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (callback, ids) = collect(stop_after);
        queue.register(cancel_rx, callback).await.unwrap();
        assert_eq!(queue.state(), QueueState::Receiving);
        (queue, mock, cancel_tx, ids)
    }

    #[tokio::test]
    async fn test_malformed_frame_is_skipped() {
        let (mut queue, mock, cancel, mut ids) = registered(Config::new(100), Some(2)).await;

        let mut batch = packet_frame(1, &AttrBuf::new());
        batch.extend(malformed_packet(2));
        batch.extend(packet_frame(3, &AttrBuf::new()));
        mock.inject(batch);

        tokio::time::timeout(Duration::from_secs(1), queue.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(drain(&mut ids), vec![1, 3]);
        drop(cancel);
    }

    #[tokio::test]
    async fn test_unrepresentable_timestamp_is_skipped() {
        let (mut queue, mock, _cancel, mut ids) = registered(Config::new(100), Some(1)).await;

        let mut ts = u64::MAX.to_be_bytes().to_vec();
        ts.extend_from_slice(&2_000_000u64.to_be_bytes());
        let mut attrs = AttrBuf::new();
        attrs.push(NFQA_TIMESTAMP, &ts).unwrap();

        let mut batch = packet_frame(1, &attrs);
        batch.extend(packet_frame(2, &AttrBuf::new()));
        mock.inject(batch);

        tokio::time::timeout(Duration::from_secs(1), queue.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(drain(&mut ids), vec![2]);
        assert_eq!(queue.state(), QueueState::Closed);
        assert!(is_unbind(mock.messages().last().unwrap()));
    }

    #[tokio::test]
    async fn test_cancel_while_blocked_unbinds() {
        let (mut queue, mock, cancel, _ids) = registered(Config::new(100), None).await;
        tokio::task::yield_now().await;

        cancel.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), queue.wait())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(queue.state(), QueueState::Closed);
        let msgs = mock.messages();
        assert_eq!(msgs.len(), 6);
        assert!(is_unbind(msgs.last().unwrap()));
    }

    #[tokio::test]
    async fn test_callback_break_stops_loop() {
        let (mut queue, mock, _cancel, mut ids) = registered(Config::new(100), Some(1)).await;
        mock.inject(packet_frame(1, &AttrBuf::new()));
        mock.inject(packet_frame(2, &AttrBuf::new()));

        tokio::time::timeout(Duration::from_secs(1), queue.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(drain(&mut ids), vec![1]);
        assert!(is_unbind(mock.messages().last().unwrap()));
    }

    #[tokio::test]
    async fn test_done_ends_batch_only() {
        let (mut queue, mock, _cancel, mut ids) = registered(Config::new(100), Some(2)).await;

        let mut batch = packet_frame(1, &AttrBuf::new());
        batch.extend(raw_frame(NlMsgType::DONE, 0, &[0; 4]));
        batch.extend(packet_frame(2, &AttrBuf::new()));
        mock.inject(batch);
        mock.inject(packet_frame(3, &AttrBuf::new()));

        tokio::time::timeout(Duration::from_secs(1), queue.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(drain(&mut ids), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_nack_goes_to_error_handler() {
        let mock = MockTransport::new();
        let mut queue = Queue::with_transport(Config::new(100), mock.clone()).unwrap();
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (callback, _ids) = collect(None);
        let (err_tx, mut errors) = mpsc::unbounded_channel();

        queue
            .register_with_error_handler(cancel_rx, callback, move |err: &Error| {
                err_tx.send(err.errno()).unwrap();
                ControlFlow::Break(())
            })
            .await
            .unwrap();
        mock.inject(nack_frame(0, -libc::ENOENT));

        tokio::time::timeout(Duration::from_secs(1), queue.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(errors.try_recv().unwrap(), Some(libc::ENOENT));
    }

    #[tokio::test]
    async fn test_default_handler_retries_temporary_errors() {
        let (mut queue, mock, _cancel, mut ids) = registered(Config::new(100), None).await;
        mock.inject_error(Error::Timeout);
        mock.inject(nack_frame(0, -libc::ENOENT));
        mock.inject(packet_frame(1, &AttrBuf::new()));
        mock.inject_error(Error::Io(std::io::Error::from_raw_os_error(libc::EBADF)));

        tokio::time::timeout(Duration::from_secs(1), queue.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(drain(&mut ids), vec![1]);
        assert_eq!(queue.state(), QueueState::Closed);
    }

    #[tokio::test]
    async fn test_buffered_verdicts_flush_as_one_datagram() {
        let mock = MockTransport::new();
        let config = Config::new(100).verdict_dispatch(VerdictDispatch::Buffered);
        let mut queue = Queue::with_transport(config, mock.clone()).unwrap();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, mut done) = mpsc::unbounded_channel();
        let verdicts = queue.verdicts();

        queue
            .register(cancel_rx, move |pkt: Packet| {
                let verdicts = verdicts.clone();
                let done_tx = done_tx.clone();
                async move {
                    verdicts.set_verdict(pkt.id, Verdict::Accept).await.unwrap();
                    done_tx.send(pkt.id).unwrap();
                    ControlFlow::Continue(())
                }
            })
            .await
            .unwrap();

        let mut batch = packet_frame(1, &AttrBuf::new());
        batch.extend(packet_frame(2, &AttrBuf::new()));
        mock.inject(batch);
        assert_eq!(done.recv().await, Some(1));
        assert_eq!(done.recv().await, Some(2));

        cancel_tx.send(true).unwrap();
        queue.close().await.unwrap();

        let datagrams = mock.sent();
        // Five handshake steps, the verdicts, the unbind.
        assert_eq!(datagrams.len(), 7);
        let verdicts: Vec<_> = MessageIter::new(&datagrams[5])
            .map(|m| m.unwrap().0.nlmsg_type)
            .collect();
        assert_eq!(verdicts, vec![0x0301, 0x0301]);
    }

    #[tokio::test]
    async fn test_buffered_verdict_from_other_task_is_flushed() {
        let mock = MockTransport::new();
        let config = Config::new(100).verdict_dispatch(VerdictDispatch::Buffered);
        let mut queue = Queue::with_transport(config, mock.clone()).unwrap();
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let verdicts = queue.verdicts();

        queue
            .register(cancel_rx, move |pkt: Packet| {
                let verdicts = verdicts.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    verdicts.set_verdict(pkt.id, Verdict::Accept).await.unwrap();
                });
                std::future::ready(ControlFlow::Continue(()))
            })
            .await
            .unwrap();
        mock.inject(packet_frame(1, &AttrBuf::new()));

        // No further datagram arrives; the verdict must still go out.
        let verdict = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Some(msg) = mock.messages().into_iter().nth(5) {
                    return msg;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(verdict.hdr.nlmsg_type, 0x0301);
        assert_eq!(verdict.attr(NFQA_VERDICT_HDR), Some(&verdict_hdr(1, 1)[..]));
        assert_eq!(queue.state(), QueueState::Receiving);
        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_register_twice_fails() {
        let (mut queue, _mock, _cancel, _ids) = registered(Config::new(100), None).await;
        let (_tx, rx) = watch::channel(false);
        let (callback, _) = collect(None);
        let err = queue.register(rx, callback).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        queue.close().await.unwrap();
    }

    #[test]
    fn test_default_error_handler() {
        assert!(default_error_handler(&Error::Timeout).is_continue());
        assert!(default_error_handler(&Error::from_errno(-libc::ENOBUFS)).is_continue());
        assert!(
            default_error_handler(&Error::from_errno(-libc::EAGAIN).with_context("recv"))
                .is_continue()
        );
        assert!(default_error_handler(&Error::from_errno(-libc::EBADF)).is_break());
    }
}
