//! Connection state machine, grounded on `doca-cpp`'s `internal::RdmaConnection`
//! and the connection-callback bullets in the executor design.

use std::time::Instant;

/// Lifecycle state of the single connection an executor ever tracks at once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Requested,
    Active,
    Disconnected,
    Failed,
}

/// Opaque connection identifier, threaded through the control protocol's Request
/// body. Routing on it beyond identity is out of scope for this implementation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u32);

#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    state: ConnectionState,
    requested_at: Option<Instant>,
}

impl Connection {
    pub fn new(id: ConnectionId) -> Connection {
        Connection { id, state: ConnectionState::Idle, requested_at: None }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn mark_requested(&mut self) {
        self.state = ConnectionState::Requested;
        self.requested_at = Some(Instant::now());
    }

    pub fn mark_active(&mut self) {
        self.state = ConnectionState::Active;
        self.requested_at = None;
    }

    pub fn mark_disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.requested_at = None;
    }

    pub fn mark_failed(&mut self) {
        self.state = ConnectionState::Failed;
        self.requested_at = None;
    }

    /// True once a connection has sat in `Requested` longer than `timeout`.
    pub fn requested_timed_out(&self, timeout: std::time::Duration) -> bool {
        matches!(self.state, ConnectionState::Requested)
            && self.requested_at.map(|t| t.elapsed() >= timeout).unwrap_or(false)
    }
}
