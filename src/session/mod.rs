//! Session Command Replication Engine
//!
//! Keeps N backend connections in the same connection-level state for one
//! client session: an ordered command log, per-backend dispatch tracking,
//! authoritative outcome validation, prepared statement handle mapping and
//! replayable history.

pub mod backend;
pub mod command;
pub mod outcome;
pub mod replicator;
pub mod worker;

pub use backend::{BackendId, BackendLink, BackendState};
pub use command::{CommandKind, CommandQueue, Position, SessionCommand};
pub use outcome::{AuthoritativeOutcome, Outcome};
pub use replicator::{ClientSink, SessionReplicator};
pub use worker::{SessionEvent, SessionHandle, SessionWorker};
