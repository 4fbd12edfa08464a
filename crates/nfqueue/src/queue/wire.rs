//! nfnetlink_queue constants and message framing.

use winnow::binary::{be_u16, le_u8};
use winnow::error::{ContextError, ErrMode};
use winnow::prelude::*;

use crate::netlink::MessageBuilder;

/// Result type for winnow parsers.
pub(crate) type PResult<T> = core::result::Result<T, ErrMode<ContextError>>;

/// nfnetlink subsystem ID of the packet queue.
pub const NFNL_SUBSYS_QUEUE: u8 = 3;

/// nfnetlink protocol version.
pub const NFNETLINK_V0: u8 = 0;

/// Address families accepted by the queue subsystem.
pub const AF_UNSPEC: u8 = libc::AF_UNSPEC as u8;
pub const AF_INET: u8 = libc::AF_INET as u8;
pub const AF_INET6: u8 = libc::AF_INET6 as u8;

// Queue message types
pub const NFQNL_MSG_PACKET: u8 = 0;
pub const NFQNL_MSG_VERDICT: u8 = 1;
pub const NFQNL_MSG_CONFIG: u8 = 2;
pub const NFQNL_MSG_VERDICT_BATCH: u8 = 3;

// Packet attributes
pub const NFQA_UNSPEC: u16 = 0;
pub const NFQA_PACKET_HDR: u16 = 1;
pub const NFQA_VERDICT_HDR: u16 = 2;
pub const NFQA_MARK: u16 = 3;
pub const NFQA_TIMESTAMP: u16 = 4;
pub const NFQA_IFINDEX_INDEV: u16 = 5;
pub const NFQA_IFINDEX_OUTDEV: u16 = 6;
pub const NFQA_IFINDEX_PHYSINDEV: u16 = 7;
pub const NFQA_IFINDEX_PHYSOUTDEV: u16 = 8;
pub const NFQA_HWADDR: u16 = 9;
pub const NFQA_PAYLOAD: u16 = 10;
pub const NFQA_CT: u16 = 11;
pub const NFQA_CT_INFO: u16 = 12;
pub const NFQA_CAP_LEN: u16 = 13;
pub const NFQA_SKB_INFO: u16 = 14;
pub const NFQA_EXP: u16 = 15;
pub const NFQA_UID: u16 = 16;
pub const NFQA_GID: u16 = 17;
pub const NFQA_SECCTX: u16 = 18;
pub const NFQA_VLAN: u16 = 19;
pub const NFQA_L2HDR: u16 = 20;
pub const NFQA_PRIORITY: u16 = 21;
pub const NFQA_CGROUP_CLASSID: u16 = 22;
/// One past the highest packet attribute this crate knows.
pub const NFQA_MAX: u16 = 23;

// VLAN attributes (nested in NFQA_VLAN)
pub const NFQA_VLAN_PROTO: u16 = 1;
pub const NFQA_VLAN_TCI: u16 = 2;

// Conntrack attributes (nested in NFQA_CT)
pub const CTA_MARK: u16 = 8;
pub const CTA_LABELS: u16 = 22;

/// Width of a conntrack label bitmap.
pub const CT_LABEL_LEN: usize = 16;

// Config attributes
pub const NFQA_CFG_CMD: u16 = 1;
pub const NFQA_CFG_PARAMS: u16 = 2;
pub const NFQA_CFG_QUEUE_MAXLEN: u16 = 3;
pub const NFQA_CFG_MASK: u16 = 4;
pub const NFQA_CFG_FLAGS: u16 = 5;

// Config commands
pub const NFQNL_CFG_CMD_BIND: u8 = 1;
pub const NFQNL_CFG_CMD_UNBIND: u8 = 2;
pub const NFQNL_CFG_CMD_PF_BIND: u8 = 3;
pub const NFQNL_CFG_CMD_PF_UNBIND: u8 = 4;

/// Full nlmsg_type for a queue message.
pub const fn queue_msg_type(msg: u8) -> u16 {
    ((NFNL_SUBSYS_QUEUE as u16) << 8) | msg as u16
}

/// nfgenmsg header (4 bytes) that prefixes every nfnetlink payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NfGenMsg {
    /// Address family.
    pub family: u8,
    /// Protocol version (NFNETLINK_V0).
    pub version: u8,
    /// Resource ID: the queue number, big endian on the wire.
    pub res_id: u16,
}

impl NfGenMsg {
    /// Size on the wire.
    pub const LEN: usize = 4;

    /// Header for a queue message.
    pub fn new(family: u8, res_id: u16) -> Self {
        Self {
            family,
            version: NFNETLINK_V0,
            res_id,
        }
    }

    pub(crate) fn parse(input: &mut &[u8]) -> PResult<Self> {
        let family = le_u8.parse_next(input)?;
        let version = le_u8.parse_next(input)?;
        let res_id = be_u16.parse_next(input)?;
        Ok(Self {
            family,
            version,
            res_id,
        })
    }

    /// Encode to wire format.
    pub fn to_bytes(self) -> [u8; 4] {
        let res = self.res_id.to_be_bytes();
        [self.family, self.version, res[0], res[1]]
    }

    /// Split the header off a notification payload.
    ///
    /// The header is only trusted when the family is AF_INET/AF_INET6 and the
    /// version is NFNETLINK_V0. Otherwise the payload is returned untouched and
    /// attributes are read from offset zero.
    pub fn split(data: &[u8]) -> (Option<Self>, &[u8]) {
        if data.len() >= Self::LEN
            && (data[0] == AF_INET || data[0] == AF_INET6)
            && data[1] == NFNETLINK_V0
        {
            let mut input = data;
            if let Ok(hdr) = Self::parse(&mut input) {
                return (Some(hdr), input);
            }
        }
        (None, data)
    }
}

/// Start a queue message: nlmsghdr plus nfgenmsg.
pub fn queue_message(msg: u8, flags: u16, family: u8, res_id: u16) -> MessageBuilder {
    let mut builder = MessageBuilder::new(queue_msg_type(msg), flags);
    builder.append_bytes(&NfGenMsg::new(family, res_id).to_bytes());
    builder
}

/// Payload of NFQA_CFG_CMD (struct nfqnl_msg_config_cmd).
pub fn config_cmd(command: u8, family: u8) -> [u8; 4] {
    // pf is a big endian u16
    [command, 0, 0, family]
}

/// Payload of NFQA_CFG_PARAMS (struct nfqnl_msg_config_params).
pub fn config_params(copy_range: u32, copy_mode: u8) -> [u8; 5] {
    let range = copy_range.to_be_bytes();
    [range[0], range[1], range[2], range[3], copy_mode]
}

/// Payload of NFQA_VERDICT_HDR (struct nfqnl_msg_verdict_hdr).
pub fn verdict_hdr(verdict: u32, id: u32) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf[..4].copy_from_slice(&verdict.to_be_bytes());
    buf[4..].copy_from_slice(&id.to_be_bytes());
    buf
}
