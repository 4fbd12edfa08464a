//! Error types for netlink and queue operations.

use std::convert::Infallible;
use std::fmt;
use std::io;

use crate::queue::BindStep;

/// Result type for netlink and queue operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Decoded kernel negative acknowledgment (mirrors struct nlmsgerr).
///
/// Carries the header fields of the request the kernel rejected so the
/// failure can be correlated with the message that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrMsg {
    /// Error code as sent by the kernel (negative errno).
    pub code: i32,
    /// Length of the original message.
    pub len: u32,
    /// Type of the original message.
    pub msg_type: u16,
    /// Flags of the original message.
    pub flags: u16,
    /// Sequence number of the original message.
    pub seq: u32,
    /// Port ID of the original sender.
    pub pid: u32,
}

impl ErrMsg {
    /// Positive errno value of this error.
    pub fn errno(&self) -> i32 {
        -self.code
    }
}

impl fmt::Display for ErrMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (errno {}, type 0x{:04x}, flags 0x{:04x}, seq {}, pid {})",
            io::Error::from_raw_os_error(self.errno()),
            self.errno(),
            self.msg_type,
            self.flags,
            self.seq,
            self.pid
        )
    }
}

/// Errors that can occur during netlink and queue operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Kernel returned an error code.
    #[error("kernel error: {message} (errno {errno})")]
    Kernel {
        /// The errno value from the kernel.
        errno: i32,
        /// Human-readable error message.
        message: String,
    },

    /// Kernel error with operation context.
    #[error("{operation}: {message} (errno {errno})")]
    KernelWithContext {
        /// The operation that failed.
        operation: String,
        /// The errno value from the kernel.
        errno: i32,
        /// Human-readable error message.
        message: String,
    },

    /// The kernel rejected a message with a negative acknowledgment.
    #[error("kernel rejected message: {0}")]
    Nack(ErrMsg),

    /// A bind/configure handshake step failed.
    #[error("handshake failed at {step}: {source}")]
    Handshake {
        /// The step that failed.
        step: BindStep,
        /// What went wrong.
        #[source]
        source: Box<Error>,
    },

    /// Message was truncated.
    #[error("message truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Expected message length.
        expected: usize,
        /// Actual bytes received.
        actual: usize,
    },

    /// Invalid message format.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Invalid attribute format.
    #[error("invalid attribute: {0}")]
    InvalidAttribute(String),

    /// Attribute kind outside the known range (or the unspecified kind).
    #[error("unsupported attribute type {0}")]
    UnknownAttribute(u16),

    /// A protocol-mandatory attribute was absent.
    #[error("missing attribute: {0}")]
    MissingAttribute(&'static str),

    /// Address family is neither AF_INET nor AF_INET6.
    #[error("unsupported address family {0}")]
    UnsupportedFamily(u8),

    /// Queue behavior flags outside the kernel-known set.
    #[error("invalid queue flags 0x{0:x}")]
    InvalidFlags(u32),

    /// Verdict value outside accept/drop/stolen/queue/repeat.
    #[error("invalid verdict {0}")]
    InvalidVerdict(u32),

    /// Conntrack label with the wrong width.
    #[error("conntrack label must be 16 bytes, got {0}")]
    LabelSize(usize),

    /// A read or write deadline elapsed.
    #[error("operation timed out")]
    Timeout,

    /// The handle is not in a state that allows the operation.
    #[error("invalid queue state: {0}")]
    InvalidState(String),

    /// A background task ended abnormally.
    #[error("background task failed: {0}")]
    Task(String),
}

impl From<Infallible> for Error {
    fn from(never: Infallible) -> Self {
        match never {}
    }
}

impl Error {
    /// Create a kernel error from an errno value.
    pub fn from_errno(errno: i32) -> Self {
        let message = io::Error::from_raw_os_error(-errno).to_string();
        Self::Kernel {
            errno: -errno,
            message,
        }
    }

    /// Add context to this error.
    ///
    /// Wraps kernel errors with operation context. Other errors are returned unchanged.
    pub fn with_context(self, operation: impl Into<String>) -> Self {
        match self {
            Self::Kernel { errno, message } => Self::KernelWithContext {
                operation: operation.into(),
                errno,
                message,
            },
            other => other,
        }
    }

    /// Get the errno value if this error carries one.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Kernel { errno, .. } | Self::KernelWithContext { errno, .. } => Some(*errno),
            Self::Nack(msg) => Some(msg.errno()),
            Self::Io(e) => e.raw_os_error(),
            Self::Handshake { source, .. } => source.errno(),
            _ => None,
        }
    }

    /// Check if this error is an elapsed deadline.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Check if retrying the same operation may succeed.
    ///
    /// Covers timeouts, interrupted calls, EAGAIN and ENOBUFS (the kernel
    /// dropped notifications because the socket buffer was full).
    pub fn is_temporary(&self) -> bool {
        if self.is_timeout() {
            return true;
        }
        match self {
            Self::Io(e) if e.kind() == io::ErrorKind::Interrupted => true,
            Self::Io(_) | Self::Kernel { .. } | Self::KernelWithContext { .. } => matches!(
                self.errno(),
                Some(libc::EINTR | libc::EAGAIN | libc::ENOBUFS)
            ),
            _ => false,
        }
    }

    /// Check if this is a permission error (EPERM, EACCES).
    pub fn is_permission_denied(&self) -> bool {
        matches!(self.errno(), Some(libc::EPERM | libc::EACCES))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nack(code: i32) -> ErrMsg {
        ErrMsg {
            code,
            len: 36,
            msg_type: 0x0302,
            flags: 0x05,
            seq: 7,
            pid: 0,
        }
    }

    #[test]
    fn test_from_errno() {
        let err = Error::from_errno(-1); // EPERM
        assert!(err.is_permission_denied());
        assert_eq!(err.errno(), Some(1));
    }

    #[test]
    fn test_with_context() {
        let err = Error::from_errno(-13).with_context("binding queue 100"); // EACCES
        assert!(err.is_permission_denied());
        assert!(err.to_string().contains("binding queue 100"));
    }

    #[test]
    fn test_nack_errno_and_display() {
        let err = Error::Nack(nack(-libc::ENOENT));
        assert_eq!(err.errno(), Some(libc::ENOENT));
        let msg = err.to_string();
        assert!(msg.contains("seq 7"));
        assert!(msg.contains("type 0x0302"));
    }

    #[test]
    fn test_handshake_wraps_step() {
        let err = Error::Handshake {
            step: BindStep::BindQueue,
            source: Box::new(Error::Nack(nack(-libc::EBUSY))),
        };
        assert_eq!(err.errno(), Some(libc::EBUSY));
        assert!(err.to_string().contains("bind queue"));
    }

    #[test]
    fn test_temporary_errors() {
        assert!(Error::Timeout.is_temporary());
        assert!(Error::Io(io::Error::from(io::ErrorKind::WouldBlock)).is_temporary());
        assert!(Error::Io(io::Error::from_raw_os_error(libc::ENOBUFS)).is_temporary());
        assert!(Error::from_errno(-libc::EINTR).is_temporary());
        assert!(!Error::from_errno(-libc::EBADF).is_temporary());
        assert!(!Error::UnknownAttribute(99).is_temporary());
        assert!(!Error::Nack(nack(-libc::EINVAL)).is_temporary());
    }
}
