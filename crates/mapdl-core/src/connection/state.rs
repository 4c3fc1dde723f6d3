use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// State of a connection to the solver.
///
/// `Connecting -> Ready -> (Degraded <-> Ready) -> Exited`. `Exited` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Ready = 1,
    Degraded = 2,
    Exited = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Ready,
            2 => ConnectionState::Degraded,
            _ => ConnectionState::Exited,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Ready => "READY",
            ConnectionState::Degraded => "DEGRADED",
            ConnectionState::Exited => "EXITED",
        };
        f.write_str(name)
    }
}

/// Lock-free holder for a [`ConnectionState`] enforcing the allowed transitions.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(ConnectionState::Connecting as u8))
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// `Connecting` or `Degraded` to `Ready`.
    pub fn mark_ready(&self) -> bool {
        self.transition(ConnectionState::Connecting, ConnectionState::Ready)
            || self.transition(ConnectionState::Degraded, ConnectionState::Ready)
    }

    /// `Ready` to `Degraded`.
    pub fn mark_degraded(&self) -> bool {
        self.transition(ConnectionState::Ready, ConnectionState::Degraded)
    }

    /// Any state to `Exited`. Returns the previous state.
    pub fn mark_exited(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.swap(ConnectionState::Exited as u8, Ordering::SeqCst))
    }
}
