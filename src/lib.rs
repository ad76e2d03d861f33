//! WolfSplit - Session-Consistent MariaDB Proxy Router
//!
//! A Rust-based database proxy router that splits a single logical client
//! session across multiple backend MariaDB connections while preserving the
//! illusion of one consistent connection.
//!
//! # Architecture
//!
//! The core of WolfSplit is its session command replication engine: every
//! connection-state-changing command (character set changes, prepared
//! statement creation, user/context resets) is appended to a per-session
//! command log and dispatched to every attached backend. One backend is
//! designated the replier and its outcome is forwarded to the client; every
//! other backend's outcome is validated against it and backends whose state
//! has drifted are closed. Resolved commands are retained as history so
//! backends attached later can be replayed to the same state.
//!
//! # Features
//!
//! - Per-session ordered command log with strictly increasing positions
//! - Authoritative replier designation with automatic promotion on failure
//! - Divergence detection and removal of inconsistent backends
//! - Per-backend prepared statement handle mapping
//! - Replayable session command history with reset-based trimming
//! - Single-worker, lock-free session processing on Tokio

pub mod config;
pub mod error;
pub mod proxy;
pub mod session;

pub use config::{RouterConfig, SessionConfig};
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{RouterConfig, SessionConfig};
    pub use crate::error::{Error, Result};
    pub use crate::proxy::Reply;
    pub use crate::session::{
        AuthoritativeOutcome, BackendId, BackendLink, ClientSink, CommandKind, Outcome, Position,
        SessionEvent, SessionHandle, SessionReplicator, SessionWorker,
    };
}
