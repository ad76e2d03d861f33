//! WolfSplit Error Types

use thiserror::Error;
use uuid::Uuid;

use crate::session::backend::BackendId;
use crate::session::command::Position;

/// Result type alias for WolfSplit operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfSplit error types
///
/// Session-scoped errors carry the `(session, backend, position)` attribution
/// needed to diagnose which backend misbehaved at which point in the command
/// log.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Protocol errors
    #[error("Protocol violation on session {session_id} from {backend}: {reason}")]
    ProtocolViolation {
        session_id: Uuid,
        backend: BackendId,
        reason: String,
    },

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    // Session command replication errors
    #[error("Session {session_id}: backend {backend} already attached")]
    BackendAlreadyAttached { session_id: Uuid, backend: BackendId },

    #[error("Session {session_id}: backend {backend} is not active")]
    InactiveBackend { session_id: Uuid, backend: BackendId },

    #[error("Session {session_id}: no replier available for position {position}")]
    ReplierUnavailable { session_id: Uuid, position: Position },

    #[error("Session {session_id}: no active backends remain")]
    NoActiveBackends { session_id: Uuid },

    #[error("Send to backend {backend} failed: {reason}")]
    BackendSend { backend: BackendId, reason: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session closed")]
    SessionClosed,
}

impl Error {
    /// Check if this error terminates the whole session
    ///
    /// Non-fatal errors are handled by closing a single backend; the session
    /// continues on the remaining ones.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ProtocolViolation { .. }
                | Error::ReplierUnavailable { .. }
                | Error::NoActiveBackends { .. }
                | Error::SessionClosed
        )
    }
}
