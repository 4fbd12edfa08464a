//! Bind/configure handshake.
//!
//! Every step is a NFQNL_MSG_CONFIG request acknowledged by the kernel
//! before the next one goes out. All steps share one sequence number.

use std::fmt;
use std::time::Duration;

use super::QueueState;
use super::config::Config;
use super::state::StateCell;
use super::wire::*;
use crate::netlink::message::{NLM_F_ACK, NLM_F_REQUEST};
use crate::netlink::{AttrBuf, Connection, Error, MessageBuilder, Result, Transport};

/// Upper bound on waiting for the unbind acknowledgment at shutdown.
const UNBIND_TIMEOUT: Duration = Duration::from_secs(1);

/// One step of the bind handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindStep {
    /// Drop any stale binding of the address family.
    UnbindFamily,
    /// Bind the address family.
    BindFamily,
    /// Bind the queue number.
    BindQueue,
    /// Copy mode and copy range.
    SetParams,
    /// Behavior flags and queue length.
    SetFlags,
}

impl BindStep {
    /// Steps in the order they are sent.
    pub const ALL: [BindStep; 5] = [
        BindStep::UnbindFamily,
        BindStep::BindFamily,
        BindStep::BindQueue,
        BindStep::SetParams,
        BindStep::SetFlags,
    ];

    /// State reached once this step is acknowledged.
    fn reached(self) -> QueueState {
        match self {
            BindStep::UnbindFamily => QueueState::PfUnbound,
            BindStep::BindFamily => QueueState::PfBound,
            BindStep::BindQueue => QueueState::QueueBound,
            BindStep::SetParams | BindStep::SetFlags => QueueState::Configured,
        }
    }

    /// Build the request for this step.
    pub(crate) fn request(self, config: &Config) -> Result<MessageBuilder> {
        let family = config.family;
        let flags = NLM_F_REQUEST | NLM_F_ACK;
        let mut attrs = AttrBuf::new();

        let (nfgen_family, res_id) = match self {
            BindStep::UnbindFamily => {
                attrs.push(NFQA_CFG_CMD, &config_cmd(NFQNL_CFG_CMD_PF_UNBIND, family))?;
                (family, 0)
            }
            BindStep::BindFamily => {
                attrs.push(NFQA_CFG_CMD, &config_cmd(NFQNL_CFG_CMD_PF_BIND, family))?;
                (family, 0)
            }
            BindStep::BindQueue => {
                attrs.push(NFQA_CFG_CMD, &config_cmd(NFQNL_CFG_CMD_BIND, family))?;
                (AF_UNSPEC, config.queue)
            }
            BindStep::SetParams => {
                attrs.push(
                    NFQA_CFG_PARAMS,
                    &config_params(config.max_packet_len, config.copy_mode as u8),
                )?;
                (AF_UNSPEC, config.queue)
            }
            BindStep::SetFlags => {
                let mask = config.effective_flags_mask();
                if mask != 0 {
                    attrs.push_u32_be(NFQA_CFG_FLAGS, config.flags);
                    attrs.push_u32_be(NFQA_CFG_MASK, mask);
                }
                attrs.push_u32_be(NFQA_CFG_QUEUE_MAXLEN, config.effective_max_queue_len());
                (AF_UNSPEC, config.queue)
            }
        };

        let mut builder = queue_message(NFQNL_MSG_CONFIG, flags, nfgen_family, res_id);
        builder.append_attrs(&attrs);
        Ok(builder)
    }
}

impl fmt::Display for BindStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BindStep::UnbindFamily => "unbind family",
            BindStep::BindFamily => "bind family",
            BindStep::BindQueue => "bind queue",
            BindStep::SetParams => "set params",
            BindStep::SetFlags => "set flags",
        };
        f.write_str(name)
    }
}

/// Run every handshake step, advancing `state` as each one is acknowledged.
///
/// Stops at the first failure. Nothing is rolled back.
pub(crate) async fn bind<T: Transport>(
    conn: &Connection<T>,
    config: &Config,
    seq: u32,
    state: &StateCell,
) -> Result<()> {
    for step in BindStep::ALL {
        tracing::debug!(%step, queue = config.queue, seq, "handshake step");
        let acked = match step.request(config) {
            Ok(request) => conn.request_ack(request, seq).await,
            Err(e) => Err(e),
        };
        acked.map_err(|e| Error::Handshake {
            step,
            source: Box::new(e),
        })?;
        state.set(step.reached());
    }
    Ok(())
}

fn unbind_request(config: &Config) -> Result<MessageBuilder> {
    let mut attrs = AttrBuf::new();
    attrs.push(NFQA_CFG_CMD, &config_cmd(NFQNL_CFG_CMD_UNBIND, config.family))?;
    let mut builder = queue_message(
        NFQNL_MSG_CONFIG,
        NLM_F_REQUEST | NLM_F_ACK,
        AF_UNSPEC,
        config.queue,
    );
    builder.append_attrs(&attrs);
    Ok(builder)
}

/// Unbind the queue. Failures are logged, never returned.
pub(crate) async fn unbind<T: Transport>(conn: &Connection<T>, config: &Config, seq: u32) {
    let builder = match unbind_request(config) {
        Ok(builder) => builder,
        Err(e) => {
            tracing::warn!(queue = config.queue, error = %e, "failed to unbind queue");
            return;
        }
    };

    tracing::debug!(queue = config.queue, "unbinding queue");
    match tokio::time::timeout(UNBIND_TIMEOUT, conn.request_ack(builder, seq)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(queue = config.queue, error = %e, "failed to unbind queue"),
        Err(_) => tracing::warn!(queue = config.queue, "unbind not acknowledged"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::config::{CopyMode, flags};
    use crate::queue::testing::MockTransport;

    async fn run(config: &Config, mock: &MockTransport) -> (Result<()>, QueueState) {
        let conn = Connection::new(mock.clone());
        let state = StateCell::new(QueueState::Unbound);
        let result = bind(&conn, config, 7, &state).await;
        (result, state.get())
    }

    #[tokio::test]
    async fn test_handshake_sequence() {
        let mock = MockTransport::new();
        let config = Config::new(100).copy_mode(CopyMode::Meta).max_packet_len(128);
        let (result, state) = run(&config, &mock).await;
        result.unwrap();
        assert_eq!(state, QueueState::Configured);

        let msgs = mock.messages();
        assert_eq!(msgs.len(), 5);
        for msg in &msgs {
            assert_eq!(msg.hdr.nlmsg_type, 0x0302);
            assert_eq!(msg.hdr.nlmsg_flags, NLM_F_REQUEST | NLM_F_ACK);
            assert_eq!(msg.hdr.nlmsg_seq, 7);
        }

        assert_eq!(msgs[0].nfgen, NfGenMsg::new(AF_INET, 0));
        assert_eq!(msgs[0].attr(NFQA_CFG_CMD), Some(&[4, 0, 0, AF_INET][..]));
        assert_eq!(msgs[1].nfgen, NfGenMsg::new(AF_INET, 0));
        assert_eq!(msgs[1].attr(NFQA_CFG_CMD), Some(&[3, 0, 0, AF_INET][..]));
        assert_eq!(msgs[2].nfgen, NfGenMsg::new(AF_UNSPEC, 100));
        assert_eq!(msgs[2].attr(NFQA_CFG_CMD), Some(&[1, 0, 0, AF_INET][..]));
        assert_eq!(msgs[3].attr(NFQA_CFG_PARAMS), Some(&[0, 0, 0, 128, 1][..]));
    }

    #[tokio::test]
    async fn test_zero_flags_only_send_queue_len() {
        let mock = MockTransport::new();
        let (result, _) = run(&Config::new(100).max_queue_len(0), &mock).await;
        result.unwrap();

        let last = mock.messages().pop().unwrap();
        assert_eq!(last.kinds(), vec![NFQA_CFG_QUEUE_MAXLEN]);
        assert_eq!(last.attr(NFQA_CFG_QUEUE_MAXLEN), Some(&1024u32.to_be_bytes()[..]));
    }

    #[tokio::test]
    async fn test_flags_and_mask_sent_together() {
        let mock = MockTransport::new();
        let config = Config::new(100).flags(flags::FAIL_OPEN | flags::CONNTRACK);
        let (result, _) = run(&config, &mock).await;
        result.unwrap();

        let last = mock.messages().pop().unwrap();
        assert_eq!(
            last.kinds(),
            vec![NFQA_CFG_FLAGS, NFQA_CFG_MASK, NFQA_CFG_QUEUE_MAXLEN]
        );
        assert_eq!(last.attr(NFQA_CFG_FLAGS), Some(&3u32.to_be_bytes()[..]));
        assert_eq!(last.attr(NFQA_CFG_MASK), Some(&3u32.to_be_bytes()[..]));
    }

    #[tokio::test]
    async fn test_failure_names_step_and_stops() {
        let mock = MockTransport::new();
        mock.reject_request(2, -libc::EBUSY);
        let (result, state) = run(&Config::new(100), &mock).await;

        match result.unwrap_err() {
            Error::Handshake { step, source } => {
                assert_eq!(step, BindStep::BindQueue);
                assert!(matches!(*source, Error::Nack(ref m) if m.errno() == libc::EBUSY));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(mock.messages().len(), 3);
        assert_eq!(state, QueueState::PfBound);
    }

    #[tokio::test]
    async fn test_unbind_is_best_effort() {
        let mock = MockTransport::new();
        mock.fail_sends(true);
        let conn = Connection::new(mock.clone());
        unbind(&conn, &Config::new(100), 7).await;
        assert!(mock.sent().is_empty());

        mock.fail_sends(false);
        unbind(&conn, &Config::new(100), 7).await;
        let msgs = mock.messages();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].nfgen, NfGenMsg::new(AF_UNSPEC, 100));
        assert_eq!(msgs[0].attr(NFQA_CFG_CMD), Some(&[2, 0, 0, AF_INET][..]));
    }
}
