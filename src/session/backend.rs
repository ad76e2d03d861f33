//! Backend Session State
//!
//! Per-backend progress through the session command queue, plus the
//! per-backend prepared statement handle map. One `BackendState` exists for
//! every backend connection attached to a session and is dropped when the
//! backend leaves the session.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;

use crate::error::Result;
use super::command::Position;

/// Identifier for one backend connection attached to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendId(pub u64);

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "backend-{}", self.0)
    }
}

/// Interface to the backend-connection layer.
///
/// Implementations queue payloads for in-order delivery; nothing here
/// blocks. Connection establishment, authentication and timeouts live
/// behind this trait.
pub trait BackendLink {
    /// Queue a payload for delivery to a backend. Delivery order must match
    /// call order for any one backend.
    fn send(&mut self, backend: BackendId, payload: &Bytes) -> Result<()>;

    /// Whether the backend connection is still usable
    fn is_active(&self, backend: BackendId) -> bool;

    /// Close the backend connection with a reason
    fn close(&mut self, backend: BackendId, reason: &str);
}

/// Per-backend progress through the session command queue
#[derive(Debug)]
pub struct BackendState {
    id: BackendId,
    next_undelivered: Position,
    in_flight: Option<Position>,
    ps_handles: HashMap<Position, u32>,
}

impl BackendState {
    /// Create state for a backend starting at `start` in the command log
    pub fn new(id: BackendId, start: Position) -> Self {
        Self {
            id,
            next_undelivered: start,
            in_flight: None,
            ps_handles: HashMap::new(),
        }
    }

    pub fn id(&self) -> BackendId {
        self.id
    }

    /// Next queue position not yet sent to this backend
    pub fn next_undelivered(&self) -> Position {
        self.next_undelivered
    }

    /// Position of the command awaiting a reply, if any
    pub fn in_flight(&self) -> Option<Position> {
        self.in_flight
    }

    /// Whether the backend can be sent its next command
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none()
    }

    /// Record that `position` was sent and is now awaiting a reply
    pub fn mark_dispatched(&mut self, position: Position) {
        debug_assert!(self.in_flight.is_none());
        self.in_flight = Some(position);
        self.next_undelivered = position + 1;
    }

    /// Consume the in-flight position when its reply arrives
    pub fn take_in_flight(&mut self) -> Option<Position> {
        self.in_flight.take()
    }

    /// Record this backend's generated handle for a Prepare command
    pub fn add_ps_handle(&mut self, position: Position, handle: u32) {
        self.ps_handles.insert(position, handle);
    }

    /// Look up this backend's handle for a Prepare command.
    ///
    /// Absent if the prepare failed on this backend or was never dispatched
    /// to it.
    pub fn ps_handle(&self, position: Position) -> Option<u32> {
        self.ps_handles.get(&position).copied()
    }
}
