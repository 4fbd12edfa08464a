//! Queue handle lifecycle.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Where a [`Queue`](super::Queue) is in its lifecycle.
///
/// States advance in declaration order. A failed handshake leaves the
/// handle in the last acknowledged state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum QueueState {
    Unbound = 0,
    PfUnbound = 1,
    PfBound = 2,
    QueueBound = 3,
    Configured = 4,
    Receiving = 5,
    Unbinding = 6,
    Closed = 7,
}

impl QueueState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => QueueState::Unbound,
            1 => QueueState::PfUnbound,
            2 => QueueState::PfBound,
            3 => QueueState::QueueBound,
            4 => QueueState::Configured,
            5 => QueueState::Receiving,
            6 => QueueState::Unbinding,
            _ => QueueState::Closed,
        }
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueueState::Unbound => "unbound",
            QueueState::PfUnbound => "family unbound",
            QueueState::PfBound => "family bound",
            QueueState::QueueBound => "queue bound",
            QueueState::Configured => "configured",
            QueueState::Receiving => "receiving",
            QueueState::Unbinding => "unbinding",
            QueueState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Atomically shared [`QueueState`].
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: QueueState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> QueueState {
        QueueState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: QueueState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move from `from` to `to`, failing with the current state otherwise.
    pub fn transition(&self, from: QueueState, to: QueueState) -> Result<(), QueueState> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(QueueState::from_u8)
    }
}
