//! Decoding of queued packet notifications (NFQNL_MSG_PACKET).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use winnow::binary::{be_i64, be_u16, be_u32, le_u8};
use winnow::prelude::*;
use winnow::token::take;

use super::wire::*;
use crate::netlink::attr::{AttrIter, get};
use crate::netlink::{Error, Result};

/// 802.1Q tag of a queued packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vlan {
    /// Tag protocol identifier (0x8100, 0x88a8).
    pub proto: u16,
    /// Tag control information.
    pub tci: u16,
}

impl Vlan {
    /// The 12-bit VLAN ID.
    pub fn id(&self) -> u16 {
        self.tci & 0x0fff
    }
}

/// A packet queued to userspace, decoded from one notification.
///
/// Only `id`, `hw_protocol` and `hook` are guaranteed; everything else is
/// present when the kernel attached it, which depends on the copy mode,
/// the queue flags and the hook.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    /// Family from the nfgenmsg header, when it was trusted.
    pub family: Option<u8>,
    /// Queue number from the nfgenmsg header, when it was trusted.
    pub queue: Option<u16>,
    /// Packet ID to quote in the verdict.
    pub id: u32,
    /// Link-layer protocol (ETH_P_*).
    pub hw_protocol: u16,
    /// Netfilter hook the packet was queued from.
    pub hook: u8,
    pub mark: Option<u32>,
    pub timestamp: Option<SystemTime>,
    pub indev: Option<u32>,
    pub outdev: Option<u32>,
    pub phys_indev: Option<u32>,
    pub phys_outdev: Option<u32>,
    /// Source hardware address.
    pub hw_addr: Option<Vec<u8>>,
    /// Packet bytes, starting at the network header.
    pub payload: Option<Bytes>,
    /// Raw nested conntrack attributes.
    pub ct: Option<Bytes>,
    /// Conntrack state (IP_CT_*).
    pub ct_info: Option<u32>,
    /// Original packet length when the payload was truncated.
    pub cap_len: Option<u32>,
    /// NFQA_SKB_* bits.
    pub skb_info: Option<u32>,
    /// Raw nested conntrack expectation attributes.
    pub exp: Option<Bytes>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Security context label.
    pub sec_ctx: Option<String>,
    pub vlan: Option<Vlan>,
    /// Full link-layer header.
    pub l2_hdr: Option<Bytes>,
    pub priority: Option<u32>,
    pub cgroup_classid: Option<u32>,
}

/// struct nfqnl_msg_packet_hdr
fn parse_packet_hdr(input: &mut &[u8]) -> PResult<(u32, u16, u8)> {
    let id = be_u32.parse_next(input)?;
    let hw_protocol = be_u16.parse_next(input)?;
    let hook = le_u8.parse_next(input)?;
    Ok((id, hw_protocol, hook))
}

/// struct nfqnl_msg_packet_hw
fn parse_hw_addr<'a>(input: &mut &'a [u8]) -> PResult<&'a [u8]> {
    let len = be_u16.parse_next(input)?;
    let _pad = be_u16.parse_next(input)?;
    take(len as usize).parse_next(input)
}

/// struct nfqnl_msg_packet_timestamp
fn parse_timestamp(input: &mut &[u8]) -> PResult<(i64, i64)> {
    let sec = be_i64.parse_next(input)?;
    let usec = be_i64.parse_next(input)?;
    Ok((sec, usec))
}

/// `sec` seconds plus `usec` microseconds from the epoch, if representable.
fn unix_time(sec: i64, usec: i64) -> Option<SystemTime> {
    if !(0..1_000_000).contains(&usec) {
        return None;
    }
    let whole = Duration::from_secs(sec.unsigned_abs());
    let base = if sec < 0 {
        UNIX_EPOCH.checked_sub(whole)?
    } else {
        UNIX_EPOCH.checked_add(whole)?
    };
    base.checked_add(Duration::from_micros(usec as u64))
}

fn parse_vlan(data: &[u8]) -> Result<Vlan> {
    let mut proto = None;
    let mut tci = None;
    let mut iter = AttrIter::new(data);
    for (kind, payload) in iter.by_ref() {
        match kind {
            NFQA_VLAN_PROTO => proto = Some(get::u16_be(payload)?),
            NFQA_VLAN_TCI => tci = Some(get::u16_be(payload)?),
            _ => {}
        }
    }
    iter.finish()?;

    Ok(Vlan {
        proto: proto.ok_or(Error::MissingAttribute("vlan proto"))?,
        tci: tci.ok_or(Error::MissingAttribute("vlan tci"))?,
    })
}

fn composite<'a, O>(
    name: &str,
    mut parser: impl FnMut(&mut &'a [u8]) -> PResult<O>,
    mut input: &'a [u8],
) -> Result<O> {
    parser(&mut input).map_err(|e| Error::InvalidAttribute(format!("{}: {:?}", name, e)))
}

impl Packet {
    /// Decode the payload of a packet notification (everything after the
    /// nlmsghdr).
    ///
    /// Byte-valued fields share `data`'s buffer. An attribute kind that is
    /// unspecified or beyond the known range fails the whole record; known
    /// kinds this decoder does not use are skipped.
    pub fn decode(data: &Bytes) -> Result<Self> {
        let (nfgen, attrs) = NfGenMsg::split(data);
        let mut pkt = Packet {
            family: nfgen.map(|h| h.family),
            queue: nfgen.map(|h| h.res_id),
            ..Default::default()
        };
        let mut have_hdr = false;

        let mut iter = AttrIter::new(attrs);
        for (kind, payload) in iter.by_ref() {
            match kind {
                NFQA_PACKET_HDR => {
                    let (id, hw_protocol, hook) =
                        composite("packet header", parse_packet_hdr, payload)?;
                    pkt.id = id;
                    pkt.hw_protocol = hw_protocol;
                    pkt.hook = hook;
                    have_hdr = true;
                }
                NFQA_MARK => pkt.mark = Some(get::u32_be(payload)?),
                NFQA_TIMESTAMP => {
                    let (sec, usec) = composite("timestamp", parse_timestamp, payload)?;
                    let ts = unix_time(sec, usec).ok_or_else(|| {
                        Error::InvalidAttribute(format!("timestamp {}s {}us out of range", sec, usec))
                    })?;
                    pkt.timestamp = Some(ts);
                }
                NFQA_IFINDEX_INDEV => pkt.indev = Some(get::u32_be(payload)?),
                NFQA_IFINDEX_OUTDEV => pkt.outdev = Some(get::u32_be(payload)?),
                NFQA_IFINDEX_PHYSINDEV => pkt.phys_indev = Some(get::u32_be(payload)?),
                NFQA_IFINDEX_PHYSOUTDEV => pkt.phys_outdev = Some(get::u32_be(payload)?),
                NFQA_HWADDR => {
                    pkt.hw_addr = Some(composite("hardware address", parse_hw_addr, payload)?.to_vec());
                }
                NFQA_PAYLOAD => pkt.payload = Some(data.slice_ref(payload)),
                NFQA_CT => pkt.ct = Some(data.slice_ref(payload)),
                NFQA_CT_INFO => pkt.ct_info = Some(get::u32_be(payload)?),
                NFQA_CAP_LEN => pkt.cap_len = Some(get::u32_be(payload)?),
                NFQA_SKB_INFO => pkt.skb_info = Some(get::u32_be(payload)?),
                NFQA_EXP => pkt.exp = Some(data.slice_ref(payload)),
                NFQA_UID => pkt.uid = Some(get::u32_be(payload)?),
                NFQA_GID => pkt.gid = Some(get::u32_be(payload)?),
                NFQA_SECCTX => pkt.sec_ctx = Some(get::string(payload)?.to_owned()),
                NFQA_VLAN => pkt.vlan = Some(parse_vlan(payload)?),
                NFQA_L2HDR => pkt.l2_hdr = Some(data.slice_ref(payload)),
                NFQA_PRIORITY => pkt.priority = Some(get::u32_be(payload)?),
                NFQA_CGROUP_CLASSID => pkt.cgroup_classid = Some(get::u32_be(payload)?),
                NFQA_UNSPEC => return Err(Error::UnknownAttribute(kind)),
                k if k >= NFQA_MAX => return Err(Error::UnknownAttribute(kind)),
                _ => tracing::debug!(kind, "ignoring packet attribute"),
            }
        }
        iter.finish()?;

        if !have_hdr {
            return Err(Error::MissingAttribute("packet header"));
        }
        Ok(pkt)
    }
}
