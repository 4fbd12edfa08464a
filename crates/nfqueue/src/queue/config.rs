//! Queue configuration.

use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::time::Duration;

use super::wire::{AF_INET, AF_INET6};
use crate::netlink::{Error, Result};

/// Kernel default queue length, used when zero is configured.
pub const DEFAULT_MAX_QUEUE_LEN: u32 = 1024;

/// Default copy range: the largest IP packet.
pub const DEFAULT_MAX_PACKET_LEN: u32 = 0xffff;

/// Queue behavior flags (NFQA_CFG_F_*).
pub mod flags {
    /// Accept packets instead of dropping them when the queue is full.
    pub const FAIL_OPEN: u32 = 1 << 0;
    /// Attach conntrack information to notifications.
    pub const CONNTRACK: u32 = 1 << 1;
    /// Deliver GSO packets without segmenting them.
    pub const GSO: u32 = 1 << 2;
    /// Attach the owning socket's UID/GID.
    pub const UID_GID: u32 = 1 << 3;
    /// Attach the security context.
    pub const SECCTX: u32 = 1 << 4;
    /// First value past the known flags.
    pub const MAX: u32 = 1 << 5;
}

/// How much of each packet the kernel copies to userspace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum CopyMode {
    /// Nothing is copied.
    None = 0,
    /// Metadata only.
    Meta = 1,
    /// Metadata and up to `max_packet_len` payload bytes.
    #[default]
    Packet = 2,
}

/// Network namespace the socket is opened in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum NetNs {
    /// The namespace of the calling thread.
    #[default]
    Current,
    /// An open namespace file descriptor.
    Fd(RawFd),
    /// A namespace file such as `/var/run/netns/<name>`.
    Path(PathBuf),
}

/// How verdicts reach the kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VerdictDispatch {
    /// Every verdict is its own datagram, sent by the caller.
    #[default]
    Immediate,
    /// Verdicts are queued and flushed by the receive loop as one datagram
    /// before it waits for the next notification.
    Buffered,
}

/// Configuration of a [`Queue`](super::Queue).
///
/// ```ignore
/// use std::time::Duration;
/// use nfqueue::queue::{Config, CopyMode, flags};
///
/// let config = Config::new(100)
///     .family(libc::AF_INET6 as u8)
///     .copy_mode(CopyMode::Packet)
///     .flags(flags::FAIL_OPEN | flags::GSO)
///     .read_timeout(Duration::from_secs(1));
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Address family (AF_INET or AF_INET6).
    pub family: u8,
    /// Network namespace to open the socket in.
    pub netns: NetNs,
    /// Queue number.
    pub queue: u16,
    /// Maximum number of packets the kernel holds for this queue.
    /// Zero selects [`DEFAULT_MAX_QUEUE_LEN`].
    pub max_queue_len: u32,
    /// Maximum number of payload bytes copied per packet.
    pub max_packet_len: u32,
    /// Copy mode.
    pub copy_mode: CopyMode,
    /// Behavior flags, see [`flags`].
    pub flags: u32,
    /// Mask of flags to change. Defaults to `flags`.
    pub flags_mask: Option<u32>,
    /// Deadline for every receive.
    pub read_timeout: Option<Duration>,
    /// Deadline for every send.
    pub write_timeout: Option<Duration>,
    /// Verdict transmission mode.
    pub verdict_dispatch: VerdictDispatch,
}

impl Config {
    /// Configuration for `queue` with IPv4, full packet copy and no deadlines.
    pub fn new(queue: u16) -> Self {
        Self {
            family: AF_INET,
            netns: NetNs::Current,
            queue,
            max_queue_len: DEFAULT_MAX_QUEUE_LEN,
            max_packet_len: DEFAULT_MAX_PACKET_LEN,
            copy_mode: CopyMode::Packet,
            flags: 0,
            flags_mask: None,
            read_timeout: None,
            write_timeout: None,
            verdict_dispatch: VerdictDispatch::Immediate,
        }
    }

    pub fn family(mut self, family: u8) -> Self {
        self.family = family;
        self
    }

    pub fn netns(mut self, netns: NetNs) -> Self {
        self.netns = netns;
        self
    }

    pub fn max_queue_len(mut self, len: u32) -> Self {
        self.max_queue_len = len;
        self
    }

    pub fn max_packet_len(mut self, len: u32) -> Self {
        self.max_packet_len = len;
        self
    }

    pub fn copy_mode(mut self, mode: CopyMode) -> Self {
        self.copy_mode = mode;
        self
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn flags_mask(mut self, mask: u32) -> Self {
        self.flags_mask = Some(mask);
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    pub fn verdict_dispatch(mut self, dispatch: VerdictDispatch) -> Self {
        self.verdict_dispatch = dispatch;
        self
    }

    /// Check the configuration before any message is sent.
    pub fn validate(&self) -> Result<()> {
        if self.family != AF_INET && self.family != AF_INET6 {
            return Err(Error::UnsupportedFamily(self.family));
        }
        if self.flags >= flags::MAX {
            return Err(Error::InvalidFlags(self.flags));
        }
        if let Some(mask) = self.flags_mask
            && mask >= flags::MAX
        {
            return Err(Error::InvalidFlags(mask));
        }
        Ok(())
    }

    /// Queue length sent to the kernel.
    pub(crate) fn effective_max_queue_len(&self) -> u32 {
        if self.max_queue_len == 0 {
            DEFAULT_MAX_QUEUE_LEN
        } else {
            self.max_queue_len
        }
    }

    /// Flag mask sent to the kernel.
    pub(crate) fn effective_flags_mask(&self) -> u32 {
        self.flags_mask.unwrap_or(self.flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::wire::AF_UNSPEC;

    #[test]
    fn test_defaults() {
        let config = Config::new(100);
        assert_eq!(config.family, AF_INET);
        assert_eq!(config.copy_mode, CopyMode::Packet);
        assert_eq!(config.max_packet_len, 0xffff);
        assert_eq!(config.verdict_dispatch, VerdictDispatch::Immediate);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_family() {
        let err = Config::new(1).family(AF_UNSPEC).validate().unwrap_err();
        assert!(matches!(err, Error::UnsupportedFamily(0)));
        assert!(Config::new(1).family(AF_INET6).validate().is_ok());
    }

    #[test]
    fn test_rejects_unknown_flags() {
        let err = Config::new(1).flags(flags::MAX).validate().unwrap_err();
        assert!(matches!(err, Error::InvalidFlags(32)));

        let err = Config::new(1)
            .flags(flags::GSO)
            .flags_mask(0x40)
            .validate()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidFlags(0x40)));
    }

    #[test]
    fn test_zero_queue_len_uses_kernel_default() {
        let config = Config::new(1).max_queue_len(0);
        assert_eq!(config.effective_max_queue_len(), DEFAULT_MAX_QUEUE_LEN);
        assert_eq!(Config::new(1).max_queue_len(10).effective_max_queue_len(), 10);
    }

    #[test]
    fn test_mask_defaults_to_flags() {
        let config = Config::new(1).flags(flags::FAIL_OPEN | flags::UID_GID);
        assert_eq!(config.effective_flags_mask(), 9);
        assert_eq!(config.flags_mask(flags::MAX - 1).effective_flags_mask(), 31);
    }
}
