//! Session Worker
//!
//! One Tokio task per session owns the replication engine and drains a
//! channel of session events. Backend replies arrive asynchronously from the
//! connection layer but are processed strictly serially here, so the engine
//! itself needs no locking.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::proxy::Reply;
use super::backend::{BackendId, BackendLink};
use super::command::{CommandKind, Position};
use super::replicator::{ClientSink, SessionReplicator};

/// Default depth of a session's event channel
pub const DEFAULT_EVENT_QUEUE_DEPTH: usize = 256;

/// Events delivered to a session worker
#[derive(Debug)]
pub enum SessionEvent {
    /// The client issued a session command
    CommandIssued { kind: CommandKind, payload: Bytes },
    /// A backend finished (or partially assembled) a reply
    BackendReply { backend: BackendId, reply: Reply },
    /// The connection layer closed a backend
    BackendClosed { backend: BackendId, reason: String },
    /// A new backend became usable for this session
    BackendAttached { backend: BackendId },
}

/// Sending half of a session's event channel
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionEvent>,
}

impl SessionHandle {
    /// Queue a session command from the client
    pub async fn issue_command(&self, kind: CommandKind, payload: Bytes) -> Result<()> {
        self.send(SessionEvent::CommandIssued { kind, payload }).await
    }

    /// Deliver a backend reply
    pub async fn backend_reply(&self, backend: BackendId, reply: Reply) -> Result<()> {
        self.send(SessionEvent::BackendReply { backend, reply }).await
    }

    /// Report a backend closure
    pub async fn backend_closed(&self, backend: BackendId, reason: impl Into<String>) -> Result<()> {
        self.send(SessionEvent::BackendClosed {
            backend,
            reason: reason.into(),
        })
        .await
    }

    /// Attach a new backend to the session
    pub async fn attach_backend(&self, backend: BackendId) -> Result<()> {
        self.send(SessionEvent::BackendAttached { backend }).await
    }

    async fn send(&self, event: SessionEvent) -> Result<()> {
        self.tx.send(event).await.map_err(|_| Error::SessionClosed)
    }
}

/// Per-session worker: owns the engine, processes events serially
pub struct SessionWorker<L: BackendLink, S: ClientSink> {
    replicator: SessionReplicator<L, S>,
    events: mpsc::Receiver<SessionEvent>,
}

impl<L: BackendLink, S: ClientSink> SessionWorker<L, S> {
    /// Create a worker and the handle used to feed it events
    pub fn new(replicator: SessionReplicator<L, S>) -> (Self, SessionHandle) {
        Self::with_queue_depth(replicator, DEFAULT_EVENT_QUEUE_DEPTH)
    }

    pub fn with_queue_depth(
        replicator: SessionReplicator<L, S>,
        depth: usize,
    ) -> (Self, SessionHandle) {
        let (tx, events) = mpsc::channel(depth);
        (Self { replicator, events }, SessionHandle { tx })
    }

    /// Access the engine, for setup before the loop starts
    pub fn replicator_mut(&mut self) -> &mut SessionReplicator<L, S> {
        &mut self.replicator
    }

    /// Run the session loop until the handle side is dropped or a fatal
    /// error terminates the session.
    ///
    /// Recoverable errors (a single backend misbehaving) are logged and the
    /// loop continues on the remaining backends.
    pub async fn run(mut self) -> Result<()> {
        let session_id = self.replicator.session_id();
        tracing::debug!("Session {} worker started", session_id);

        while let Some(event) = self.events.recv().await {
            let result = match event {
                SessionEvent::CommandIssued { kind, payload } => {
                    self.replicator.issue_command(kind, payload).map(|_| ())
                }
                SessionEvent::BackendReply { backend, reply } => {
                    self.replicator.on_reply(backend, reply)
                }
                SessionEvent::BackendClosed { backend, reason } => {
                    self.replicator.on_backend_closed(backend, &reason)
                }
                SessionEvent::BackendAttached { backend } => {
                    self.replicator.attach_backend(backend)
                }
            };

            if let Err(e) = result {
                if e.is_fatal() {
                    tracing::error!("Session {} terminated: {}", session_id, e);
                    return Err(e);
                }
                tracing::warn!("Session {}: {}", session_id, e);
            }
        }

        tracing::debug!("Session {} worker stopped", session_id);
        Ok(())
    }
}
