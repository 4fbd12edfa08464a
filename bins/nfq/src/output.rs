//! Packet printing.

use std::time::UNIX_EPOCH;

use nfqueue::Packet;
use serde::Serialize;

/// One printed packet.
#[derive(Serialize)]
struct PacketLine {
    id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    queue: Option<u16>,
    hw_protocol: u16,
    hook: u8,
    len: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    cap_len: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mark: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    indev: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    outdev: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hw_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    uid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    vlan: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    secctx: Option<String>,
}

impl From<&Packet> for PacketLine {
    fn from(pkt: &Packet) -> Self {
        Self {
            id: pkt.id,
            queue: pkt.queue,
            hw_protocol: pkt.hw_protocol,
            hook: pkt.hook,
            len: pkt.payload.as_ref().map_or(0, |p| p.len()),
            cap_len: pkt.cap_len,
            timestamp: pkt
                .timestamp
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs_f64()),
            mark: pkt.mark,
            indev: pkt.indev,
            outdev: pkt.outdev,
            hw_addr: pkt.hw_addr.as_deref().map(format_hw_addr),
            uid: pkt.uid,
            gid: pkt.gid,
            vlan: pkt.vlan.map(|v| v.id()),
            secctx: pkt.sec_ctx.clone(),
        }
    }
}

fn format_hw_addr(addr: &[u8]) -> String {
    addr.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    Text,
    Json { pretty: bool },
}

impl OutputFormat {
    pub fn print(self, pkt: &Packet) {
        let line = PacketLine::from(pkt);
        match self {
            OutputFormat::Text => println!("{}", text(&line)),
            OutputFormat::Json { pretty } => {
                let json = if pretty {
                    serde_json::to_string_pretty(&line)
                } else {
                    serde_json::to_string(&line)
                };
                match json {
                    Ok(s) => println!("{}", s),
                    Err(e) => tracing::warn!(error = %e, "failed to serialize packet"),
                }
            }
        }
    }
}

fn text(line: &PacketLine) -> String {
    let mut out = format!(
        "id {} proto 0x{:04x} hook {} len {}",
        line.id, line.hw_protocol, line.hook, line.len
    );
    if let Some(cap_len) = line.cap_len {
        out.push_str(&format!(" caplen {}", cap_len));
    }
    if let Some(dev) = line.indev {
        out.push_str(&format!(" indev {}", dev));
    }
    if let Some(dev) = line.outdev {
        out.push_str(&format!(" outdev {}", dev));
    }
    if let Some(mark) = line.mark {
        out.push_str(&format!(" mark 0x{:x}", mark));
    }
    if let Some(addr) = &line.hw_addr {
        out.push_str(&format!(" hwaddr {}", addr));
    }
    if let Some(uid) = line.uid {
        out.push_str(&format!(" uid {}", uid));
    }
    if let Some(gid) = line.gid {
        out.push_str(&format!(" gid {}", gid));
    }
    if let Some(vlan) = line.vlan {
        out.push_str(&format!(" vlan {}", vlan));
    }
    out
}
