//! Session Command Replication
//!
//! The consistency core of the router. Every session command is dispatched
//! to every attached backend; one backend (the replier) produces the
//! authoritative outcome that is forwarded to the client, and every other
//! backend's outcome is validated against it. A backend whose outcome
//! diverges is closed and takes no further part in the session. Resolved
//! commands are retained as history and replayed to backends that attach
//! later.
//!
//! State machine per (backend, position):
//! QUEUED -> DISPATCHED -> { AWAITING_AUTHORITY | VALIDATED | CLOSED },
//! with VALIDATED and CLOSED terminal.

use std::collections::{BTreeMap, HashSet};

use bytes::Bytes;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::proxy::Reply;
use super::backend::{BackendId, BackendLink, BackendState};
use super::command::{CommandKind, CommandQueue, Position};
use super::outcome::{AuthoritativeOutcome, Outcome};

/// Client-facing session layer callbacks
pub trait ClientSink {
    /// Forward the authoritative outcome for a resolved position.
    ///
    /// Called exactly once per resolved position, in position order.
    fn forward_response(&mut self, position: Position, outcome: &AuthoritativeOutcome);

    /// A backend left the session (divergence, connection loss)
    fn on_backend_closed(&mut self, backend: BackendId, reason: &str);
}

/// Validation state for one outstanding position
#[derive(Debug)]
struct PositionState {
    kind: CommandKind,
    /// The backend whose outcome is authoritative for this position
    replier: BackendId,
    /// Backends active when the command was issued; late attachments are
    /// synchronized through history replay instead and never gate resolution
    participants: HashSet<BackendId>,
    validated: HashSet<BackendId>,
    closed: HashSet<BackendId>,
    /// Non-replier outcomes that arrived before the authoritative one
    buffered: Vec<(BackendId, Outcome)>,
    authority: Option<AuthoritativeOutcome>,
}

impl PositionState {
    fn is_resolved(&self) -> bool {
        self.participants
            .iter()
            .all(|b| self.validated.contains(b) || self.closed.contains(b))
    }
}

/// What the validator decided to do with a reply
enum ValidationStep {
    RecordAuthority,
    Compare,
    Buffer,
}

/// Session command replication engine for one client session.
///
/// Owned by the session's worker and mutated only on that single control
/// path; nothing in here blocks or locks.
pub struct SessionReplicator<L: BackendLink, S: ClientSink> {
    session_id: Uuid,
    config: SessionConfig,
    link: L,
    sink: S,
    queue: CommandQueue,
    /// Active backends in attach order; the order drives replier promotion
    backends: Vec<BackendState>,
    /// Outstanding (unresolved) positions
    positions: BTreeMap<Position, PositionState>,
    /// Success/failure class of resolved positions still retained in history
    resolved_classes: BTreeMap<Position, bool>,
    /// Replier designation for newly issued commands
    replier: Option<BackendId>,
    /// Set once the history cap is exceeded; replay is disabled from then on
    history_overflowed: bool,
}

impl<L: BackendLink, S: ClientSink> SessionReplicator<L, S> {
    pub fn new(session_id: Uuid, config: SessionConfig, link: L, sink: S) -> Self {
        Self {
            session_id,
            config,
            link,
            sink,
            queue: CommandQueue::new(),
            backends: Vec::new(),
            positions: BTreeMap::new(),
            resolved_classes: BTreeMap::new(),
            replier: None,
            history_overflowed: false,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Backends currently taking part in the session, in attach order
    pub fn active_backends(&self) -> Vec<BackendId> {
        self.backends.iter().map(|b| b.id()).collect()
    }

    /// The backend currently designated to answer for new commands
    pub fn replier(&self) -> Option<BackendId> {
        self.replier
    }

    /// Positions currently retained for history replay, in order
    pub fn history_positions(&self) -> Vec<Position> {
        self.queue.retained().map(|c| c.position()).collect()
    }

    /// Per-backend session state, if the backend is attached
    pub fn backend_state(&self, backend: BackendId) -> Option<&BackendState> {
        self.backends.iter().find(|b| b.id() == backend)
    }

    /// This backend's generated handle for a Prepare command
    pub fn ps_handle(&self, backend: BackendId, position: Position) -> Option<u32> {
        self.backend_state(backend)?.ps_handle(position)
    }

    fn history_retained(&self) -> bool {
        !self.config.disable_history && !self.history_overflowed
    }

    fn backend_mut(&mut self, backend: BackendId) -> Option<&mut BackendState> {
        self.backends.iter_mut().find(|b| b.id() == backend)
    }

    /// Attach a backend to the session.
    ///
    /// With history retention enabled the backend starts at the history
    /// baseline and is synchronized by replaying every retained command in
    /// order before it takes part in normal dispatch. Without retention it
    /// starts at the current tail, un-synchronized.
    pub fn attach_backend(&mut self, backend: BackendId) -> Result<()> {
        if self.backend_state(backend).is_some() {
            return Err(Error::BackendAlreadyAttached {
                session_id: self.session_id,
                backend,
            });
        }
        if !self.link.is_active(backend) {
            return Err(Error::InactiveBackend {
                session_id: self.session_id,
                backend,
            });
        }

        let after_tail = self.queue.tail().map(|t| t + 1).unwrap_or(1);
        let start = if self.history_retained() {
            self.queue.first_retained().unwrap_or(after_tail)
        } else {
            if self.history_overflowed {
                tracing::warn!(
                    "Session {}: history was dropped, {} attaches un-synchronized",
                    self.session_id,
                    backend
                );
            }
            after_tail
        };

        tracing::info!(
            "Session {}: {} attached, replaying from position {}",
            self.session_id,
            backend,
            start
        );

        self.backends.push(BackendState::new(backend, start));
        if self.replier.is_none() {
            self.replier = Some(backend);
        }

        self.dispatch_all()?;
        self.advance_resolved()
    }

    /// Append a session command and dispatch it to every idle backend.
    ///
    /// Returns the assigned position.
    pub fn issue_command(&mut self, kind: CommandKind, payload: Bytes) -> Result<Position> {
        let Some(replier) = self.replier else {
            return Err(Error::NoActiveBackends {
                session_id: self.session_id,
            });
        };

        let position = self.queue.append(kind, payload);
        let participants: HashSet<BackendId> = self.backends.iter().map(|b| b.id()).collect();

        tracing::debug!(
            "Session {}: command {:?} queued at position {} for {} backends, replier {}",
            self.session_id,
            kind,
            position,
            participants.len(),
            replier
        );

        self.positions.insert(
            position,
            PositionState {
                kind,
                replier,
                participants,
                validated: HashSet::new(),
                closed: HashSet::new(),
                buffered: Vec::new(),
                authority: None,
            },
        );

        self.enforce_history_limit();
        self.dispatch_all()?;
        self.advance_resolved()?;
        Ok(position)
    }

    /// Process a backend's reply to its in-flight command.
    ///
    /// A reply from a backend with nothing in flight is a protocol violation
    /// and fatal to the session. Partial replies keep the position in flight
    /// until the connection layer has assembled the full response.
    pub fn on_reply(&mut self, backend: BackendId, reply: Reply) -> Result<()> {
        if self.backend_state(backend).is_none() {
            // A final reply can race the close event; the backend is gone
            // either way
            tracing::debug!(
                "Session {}: dropping reply from detached {}",
                self.session_id,
                backend
            );
            return Ok(());
        }

        if !reply.is_complete() {
            tracing::debug!(
                "Session {}: reply from {} not yet complete",
                self.session_id,
                backend
            );
            return Ok(());
        }

        let position = match self
            .backend_mut(backend)
            .and_then(|b| b.take_in_flight())
        {
            Some(position) => position,
            None => {
                return Err(Error::ProtocolViolation {
                    session_id: self.session_id,
                    backend,
                    reason: "reply received with no command in flight".to_string(),
                });
            }
        };

        let outcome = Outcome::from_reply(&reply);
        if position < self.queue.head() {
            self.validate_replay(backend, position, outcome)?;
        } else {
            self.validate(backend, position, outcome)?;
        }

        self.advance_resolved()?;
        self.dispatch_all()?;
        self.advance_resolved()
    }

    /// React to the connection layer closing a backend (timeout, network
    /// failure, administrative action).
    pub fn on_backend_closed(&mut self, backend: BackendId, reason: &str) -> Result<()> {
        if self.backend_state(backend).is_none() {
            return Ok(());
        }
        self.close_backend(backend, reason)?;
        self.advance_resolved()?;
        self.dispatch_all()?;
        self.advance_resolved()
    }

    /// Send the next undelivered command to every idle backend
    fn dispatch_all(&mut self) -> Result<()> {
        let ids: Vec<BackendId> = self.backends.iter().map(|b| b.id()).collect();
        for id in ids {
            if let Err(e) = self.send_next(id) {
                match e {
                    Error::BackendSend { backend, reason } => {
                        tracing::warn!(
                            "Session {}: send to {} failed: {}",
                            self.session_id,
                            backend,
                            reason
                        );
                        self.close_backend(backend, &format!("send failed: {}", reason))?;
                    }
                    other => return Err(other),
                }
            }
        }
        Ok(())
    }

    /// Dispatch the backend's next undelivered command, if it is idle and
    /// behind the queue tail
    fn send_next(&mut self, backend: BackendId) -> Result<()> {
        if !self.link.is_active(backend) {
            self.close_backend(backend, "connection no longer active")?;
            return Ok(());
        }

        let Some(state) = self.backend_state(backend) else {
            return Ok(());
        };
        if !state.is_idle() {
            return Ok(());
        }
        let mut next = state.next_undelivered();
        let Some(tail) = self.queue.tail() else {
            return Ok(());
        };
        if next > tail {
            return Ok(());
        }

        // A reset may have trimmed entries out from under a replaying
        // backend; the reset baseline supersedes everything before it, so
        // jump forward to it
        if self.queue.get(next).is_none() {
            let Some(baseline) = self.queue.first_retained() else {
                return Ok(());
            };
            if baseline <= next || baseline > tail {
                return Ok(());
            }
            next = baseline;
        }

        let Some(command) = self.queue.get(next) else {
            return Ok(());
        };
        let payload = command.payload().clone();
        self.link.send(backend, &payload)?;

        if let Some(state) = self.backend_mut(backend) {
            state.mark_dispatched(next);
        }
        tracing::debug!(
            "Session {}: dispatched position {} to {}",
            self.session_id,
            next,
            backend
        );
        Ok(())
    }

    /// Validator core: record authority, compare, or buffer
    fn validate(&mut self, backend: BackendId, position: Position, outcome: Outcome) -> Result<()> {
        let Some(state) = self.positions.get_mut(&position) else {
            tracing::warn!(
                "Session {}: reply from {} for unknown position {}",
                self.session_id,
                backend,
                position
            );
            return Ok(());
        };

        let step = if state.replier == backend && state.authority.is_none() {
            ValidationStep::RecordAuthority
        } else if state.authority.is_some() {
            ValidationStep::Compare
        } else {
            ValidationStep::Buffer
        };

        match step {
            ValidationStep::RecordAuthority => {
                let kind = state.kind;
                state.validated.insert(backend);
                state.authority = Some(AuthoritativeOutcome {
                    position,
                    outcome: outcome.clone(),
                });
                let buffered = std::mem::take(&mut state.buffered);

                if let Outcome::Failure { code, message } = &outcome {
                    tracing::info!(
                        "Session {}: command at position {} returned error {} on replier {}: {}",
                        self.session_id,
                        position,
                        code,
                        backend,
                        message
                    );
                }
                self.record_ps_handle(kind, backend, position, &outcome);

                for (buffered_backend, buffered_outcome) in buffered {
                    self.compare_with_authority(position, buffered_backend, buffered_outcome)?;
                }
            }
            ValidationStep::Compare => {
                self.compare_with_authority(position, backend, outcome)?;
            }
            ValidationStep::Buffer => {
                tracing::debug!(
                    "Session {}: buffering outcome from {} at position {} until the replier answers",
                    self.session_id,
                    backend,
                    position
                );
                state.buffered.push((backend, outcome));
            }
        }
        Ok(())
    }

    /// Compare a backend's outcome against the recorded authoritative one.
    ///
    /// A matching success/failure class validates the backend for this
    /// position; a mismatch closes it.
    fn compare_with_authority(
        &mut self,
        position: Position,
        backend: BackendId,
        outcome: Outcome,
    ) -> Result<()> {
        let Some(state) = self.positions.get(&position) else {
            return Ok(());
        };
        let Some(authority) = state.authority.as_ref() else {
            return Ok(());
        };
        let kind = state.kind;

        if outcome.same_class(&authority.outcome) {
            if let Some(state) = self.positions.get_mut(&position) {
                state.validated.insert(backend);
            }
            self.record_ps_handle(kind, backend, position, &outcome);
            Ok(())
        } else {
            tracing::warn!(
                "Session {}: {} answered {} at position {} but the authoritative outcome was {}; \
                 closing it due to inconsistent session state",
                self.session_id,
                backend,
                if outcome.is_success() { "OK" } else { "ERROR" },
                position,
                if authority.outcome.is_success() { "OK" } else { "ERROR" },
            );
            self.close_backend(
                backend,
                &format!(
                    "response diverged from authoritative outcome for position {}",
                    position
                ),
            )
        }
    }

    /// Validate a reply at an already-resolved history position (replay path)
    fn validate_replay(
        &mut self,
        backend: BackendId,
        position: Position,
        outcome: Outcome,
    ) -> Result<()> {
        let Some(&authoritative_ok) = self.resolved_classes.get(&position) else {
            tracing::debug!(
                "Session {}: no recorded response class for replayed position {}",
                self.session_id,
                position
            );
            return Ok(());
        };

        if outcome.is_success() == authoritative_ok {
            let kind = self.queue.get(position).map(|c| c.kind());
            if let Some(kind) = kind {
                self.record_ps_handle(kind, backend, position, &outcome);
            }
            Ok(())
        } else {
            self.close_backend(
                backend,
                &format!(
                    "response diverged from authoritative outcome for position {}",
                    position
                ),
            )
        }
    }

    /// Store a backend's own generated handle for a validated Prepare success
    fn record_ps_handle(
        &mut self,
        kind: CommandKind,
        backend: BackendId,
        position: Position,
        outcome: &Outcome,
    ) {
        if kind != CommandKind::Prepare {
            return;
        }
        if let Some(handle) = outcome.generated_id() {
            tracing::info!(
                "Session {}: PS handle {} on {} maps to position {}",
                self.session_id,
                handle,
                backend,
                position
            );
            if let Some(state) = self.backend_mut(backend) {
                state.add_ps_handle(position, handle);
            }
        }
    }

    /// Remove a backend from the session: close its connection, mark it
    /// terminal for every outstanding position, and promote a new replier
    /// where it still held authority.
    fn close_backend(&mut self, backend: BackendId, reason: &str) -> Result<()> {
        let Some(index) = self.backends.iter().position(|b| b.id() == backend) else {
            return Ok(());
        };
        // Dropping the state cancels the in-flight and all undelivered
        // positions for this backend
        self.backends.remove(index);

        tracing::warn!(
            "Session {}: closing {}: {}",
            self.session_id,
            backend,
            reason
        );
        self.link.close(backend, reason);
        self.sink.on_backend_closed(backend, reason);

        let mut pending_promotion = Vec::new();
        for (&position, state) in self.positions.iter_mut() {
            state.buffered.retain(|(b, _)| *b != backend);
            if state.participants.contains(&backend) && !state.validated.contains(&backend) {
                state.closed.insert(backend);
            }
            if state.replier == backend && state.authority.is_none() {
                pending_promotion.push(position);
            }
        }

        if self.replier == Some(backend) {
            self.replier = self.backends.first().map(|b| b.id());
        }

        for position in pending_promotion {
            self.promote_replier(position)?;
        }
        Ok(())
    }

    /// Replier promotion policy: the earliest-attached remaining active
    /// backend becomes the replier for the orphaned position. A buffered
    /// outcome from the promoted backend is adopted as authoritative
    /// immediately; otherwise authority is recorded when its reply arrives.
    fn promote_replier(&mut self, position: Position) -> Result<()> {
        let Some(new_replier) = self.backends.first().map(|b| b.id()) else {
            return Err(Error::ReplierUnavailable {
                session_id: self.session_id,
                position,
            });
        };

        let adopted = {
            let Some(state) = self.positions.get_mut(&position) else {
                return Ok(());
            };
            state.replier = new_replier;
            // The promoted backend now gates resolution even if it was
            // attached after the command was issued
            state.participants.insert(new_replier);
            state
                .buffered
                .iter()
                .position(|(b, _)| *b == new_replier)
                .map(|i| state.buffered.remove(i).1)
        };

        tracing::warn!(
            "Session {}: promoting {} to replier for position {}",
            self.session_id,
            new_replier,
            position
        );

        if let Some(outcome) = adopted {
            self.validate(new_replier, position, outcome)?;
        }
        Ok(())
    }

    /// Forward and release every resolved position at the queue head, in
    /// position order
    fn advance_resolved(&mut self) -> Result<()> {
        loop {
            let head = self.queue.head();
            let resolved = self
                .positions
                .get(&head)
                .map(|s| s.is_resolved())
                .unwrap_or(false);
            if !resolved {
                return Ok(());
            }

            let Some(state) = self.positions.remove(&head) else {
                return Ok(());
            };
            let Some(authority) = state.authority else {
                return Err(Error::ReplierUnavailable {
                    session_id: self.session_id,
                    position: head,
                });
            };

            tracing::debug!(
                "Session {}: position {} resolved, forwarding authoritative outcome",
                self.session_id,
                head
            );
            self.sink.forward_response(head, &authority);

            if self.history_retained() {
                self.resolved_classes
                    .insert(head, authority.outcome.is_success());
            }
            self.queue.advance_head();

            if state.kind == CommandKind::FullReset {
                self.trim_history(head);
            }
            if !self.history_retained() {
                let new_head = self.queue.head();
                self.queue.trim_before(new_head);
            }
        }
    }

    /// Discard history before a resolved full-reset command, keeping the
    /// reset itself as the new replay baseline
    fn trim_history(&mut self, reset_position: Position) {
        if !self.history_retained() {
            tracing::debug!(
                "Session {}: history retention disabled, reset trim skipped",
                self.session_id
            );
            return;
        }
        let removed = self.queue.trim_before(reset_position);
        self.resolved_classes = self.resolved_classes.split_off(&reset_position);
        tracing::info!(
            "Session {}: reset at position {} trimmed {} history entries",
            self.session_id,
            reset_position,
            removed
        );
    }

    /// Drop history and disable replay once the retention cap is exceeded
    fn enforce_history_limit(&mut self) {
        if !self.history_retained() || self.config.max_history == 0 {
            return;
        }
        if self.queue.len() <= self.config.max_history {
            return;
        }
        tracing::warn!(
            "Session {}: session command history exceeded {} entries; dropping it and \
             disabling replay for this session",
            self.session_id,
            self.config.max_history
        );
        self.history_overflowed = true;
        let head = self.queue.head();
        self.queue.trim_before(head);
        self.resolved_classes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    const A: BackendId = BackendId(1);
    const B: BackendId = BackendId(2);
    const C: BackendId = BackendId(3);
    const D: BackendId = BackendId(4);

    #[derive(Default)]
    struct LinkInner {
        sent: Vec<(BackendId, Bytes)>,
        closed: Vec<(BackendId, String)>,
        inactive: HashSet<BackendId>,
    }

    #[derive(Clone, Default)]
    struct TestLink(Rc<RefCell<LinkInner>>);

    impl TestLink {
        fn sent_to(&self, backend: BackendId) -> Vec<Bytes> {
            self.0
                .borrow()
                .sent
                .iter()
                .filter(|(b, _)| *b == backend)
                .map(|(_, p)| p.clone())
                .collect()
        }

        fn closed(&self) -> Vec<(BackendId, String)> {
            self.0.borrow().closed.clone()
        }

        fn set_inactive(&self, backend: BackendId) {
            self.0.borrow_mut().inactive.insert(backend);
        }
    }

    impl BackendLink for TestLink {
        fn send(&mut self, backend: BackendId, payload: &Bytes) -> Result<()> {
            if self.0.borrow().inactive.contains(&backend) {
                return Err(Error::BackendSend {
                    backend,
                    reason: "connection reset".to_string(),
                });
            }
            self.0.borrow_mut().sent.push((backend, payload.clone()));
            Ok(())
        }

        fn is_active(&self, backend: BackendId) -> bool {
            !self.0.borrow().inactive.contains(&backend)
        }

        fn close(&mut self, backend: BackendId, reason: &str) {
            self.0
                .borrow_mut()
                .closed
                .push((backend, reason.to_string()));
        }
    }

    #[derive(Default)]
    struct SinkInner {
        forwarded: Vec<(Position, Outcome)>,
        closed: Vec<(BackendId, String)>,
    }

    #[derive(Clone, Default)]
    struct TestSink(Rc<RefCell<SinkInner>>);

    impl TestSink {
        fn forwarded(&self) -> Vec<(Position, Outcome)> {
            self.0.borrow().forwarded.clone()
        }

        fn closed(&self) -> Vec<(BackendId, String)> {
            self.0.borrow().closed.clone()
        }
    }

    impl ClientSink for TestSink {
        fn forward_response(&mut self, position: Position, outcome: &AuthoritativeOutcome) {
            self.0
                .borrow_mut()
                .forwarded
                .push((position, outcome.outcome.clone()));
        }

        fn on_backend_closed(&mut self, backend: BackendId, reason: &str) {
            self.0
                .borrow_mut()
                .closed
                .push((backend, reason.to_string()));
        }
    }

    type TestReplicator = SessionReplicator<TestLink, TestSink>;

    fn engine_with(
        config: SessionConfig,
        backends: &[BackendId],
    ) -> (TestReplicator, TestLink, TestSink) {
        let link = TestLink::default();
        let sink = TestSink::default();
        let mut engine =
            SessionReplicator::new(Uuid::new_v4(), config, link.clone(), sink.clone());
        for &b in backends {
            engine.attach_backend(b).unwrap();
        }
        (engine, link, sink)
    }

    fn engine(backends: &[BackendId]) -> (TestReplicator, TestLink, TestSink) {
        engine_with(SessionConfig::default(), backends)
    }

    fn payload(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    /// Issue a StateChange command and answer OK from every attached backend
    fn resolve_ok(engine: &mut TestReplicator, text: &str) -> Position {
        let position = engine
            .issue_command(CommandKind::StateChange, payload(text))
            .unwrap();
        for b in engine.active_backends() {
            engine.on_reply(b, Reply::ok()).unwrap();
        }
        position
    }

    #[test]
    fn test_divergence_closes_stale_backends() {
        let (mut engine, link, sink) = engine(&[A, B, C]);
        for i in 1..=4 {
            resolve_ok(&mut engine, &format!("SET @x={}", i));
        }

        let position = engine
            .issue_command(CommandKind::StateChange, payload("SET NAMES utf8"))
            .unwrap();
        assert_eq!(position, 5);

        // B and C answer first from stale state; the replier A later succeeds
        engine.on_reply(B, Reply::error(1115, "Unknown character set")).unwrap();
        engine.on_reply(C, Reply::error(1115, "Unknown character set")).unwrap();
        assert_eq!(sink.forwarded().len(), 4); // nothing forwarded for 5 yet

        engine.on_reply(A, Reply::ok()).unwrap();

        let closed: Vec<BackendId> = link.closed().iter().map(|(b, _)| *b).collect();
        assert_eq!(closed, vec![B, C]);
        for (_, reason) in link.closed() {
            assert!(reason.contains("diverged"));
            assert!(reason.contains("position 5"));
        }
        assert_eq!(sink.closed().len(), 2);

        // A's success is forwarded exactly once
        let forwarded = sink.forwarded();
        assert_eq!(forwarded.len(), 5);
        let (p, outcome) = &forwarded[4];
        assert_eq!(*p, 5);
        assert!(outcome.is_success());
        assert_eq!(engine.active_backends(), vec![A]);
    }

    #[test]
    fn test_prepare_handles_are_per_backend() {
        let (mut engine, _link, sink) = engine(&[A, B, C]);
        resolve_ok(&mut engine, "SET NAMES utf8");

        let position = engine
            .issue_command(CommandKind::Prepare, payload("SELECT ?"))
            .unwrap();
        assert_eq!(position, 2);

        engine.on_reply(A, Reply::prepared(10, 1)).unwrap();
        engine.on_reply(B, Reply::prepared(7, 1)).unwrap();
        engine.on_reply(C, Reply::prepared(7, 1)).unwrap();

        assert_eq!(engine.ps_handle(A, 2), Some(10));
        assert_eq!(engine.ps_handle(B, 2), Some(7));
        assert_eq!(engine.ps_handle(C, 2), Some(7));
        assert_eq!(sink.forwarded().len(), 2);
        assert_eq!(engine.active_backends(), vec![A, B, C]);
    }

    #[test]
    fn test_head_advances_only_when_all_terminal() {
        let (mut engine, link, sink) = engine(&[A, B]);
        engine
            .issue_command(CommandKind::StateChange, payload("SET @a=1"))
            .unwrap();
        engine
            .issue_command(CommandKind::StateChange, payload("SET @a=2"))
            .unwrap();

        // Replier answered but B has not: position 1 is not resolved
        engine.on_reply(A, Reply::ok()).unwrap();
        assert!(sink.forwarded().is_empty());
        // A cannot run ahead: position 2 goes out to A, but the head stays
        assert_eq!(link.sent_to(A).len(), 2);
        assert_eq!(link.sent_to(B).len(), 1);

        engine.on_reply(B, Reply::ok()).unwrap();
        assert_eq!(sink.forwarded().len(), 1);
        assert_eq!(sink.forwarded()[0].0, 1);
        // B's next command was dispatched when its position went terminal
        assert_eq!(link.sent_to(B).len(), 2);

        engine.on_reply(A, Reply::ok()).unwrap();
        engine.on_reply(B, Reply::ok()).unwrap();
        let order: Vec<Position> = sink.forwarded().iter().map(|(p, _)| *p).collect();
        assert_eq!(order, vec![1, 2]);
    }

    #[test]
    fn test_diverged_backend_gets_no_later_positions() {
        let (mut engine, link, _sink) = engine(&[A, B, C]);
        engine
            .issue_command(CommandKind::StateChange, payload("SET @a=1"))
            .unwrap();

        engine.on_reply(A, Reply::ok()).unwrap();
        engine.on_reply(B, Reply::error(1064, "boom")).unwrap();
        engine.on_reply(C, Reply::ok()).unwrap();
        assert_eq!(engine.active_backends(), vec![A, C]);

        let sent_to_b_before = link.sent_to(B).len();
        engine
            .issue_command(CommandKind::StateChange, payload("SET @a=2"))
            .unwrap();
        engine.on_reply(A, Reply::ok()).unwrap();
        engine.on_reply(C, Reply::ok()).unwrap();

        assert_eq!(link.sent_to(B).len(), sent_to_b_before);
    }

    #[test]
    fn test_early_replies_buffered_until_authority() {
        let (mut engine, _link, sink) = engine(&[A, B, C]);
        engine
            .issue_command(CommandKind::StateChange, payload("SET @a=1"))
            .unwrap();

        engine.on_reply(B, Reply::ok()).unwrap();
        engine.on_reply(C, Reply::ok()).unwrap();
        assert!(sink.forwarded().is_empty());

        engine.on_reply(A, Reply::ok()).unwrap();
        assert_eq!(sink.forwarded().len(), 1);
        assert_eq!(engine.active_backends(), vec![A, B, C]);
    }

    #[test]
    fn test_full_reset_trims_history() {
        let (mut engine, _link, _sink) = engine(&[A]);
        for i in 1..=8 {
            resolve_ok(&mut engine, &format!("SET @x={}", i));
        }
        assert_eq!(engine.history_positions().len(), 8);

        let reset = engine
            .issue_command(CommandKind::FullReset, payload("RESET"))
            .unwrap();
        assert_eq!(reset, 9);
        engine.on_reply(A, Reply::ok()).unwrap();

        // Only the reset command remains as the replay baseline
        assert_eq!(engine.history_positions(), vec![9]);
    }

    #[test]
    fn test_replay_history_to_new_backend() {
        let (mut engine, link, _sink) = engine(&[A]);
        engine
            .issue_command(CommandKind::Prepare, payload("SELECT ?"))
            .unwrap();
        engine.on_reply(A, Reply::prepared(10, 1)).unwrap();
        resolve_ok(&mut engine, "SET NAMES utf8");
        assert_eq!(engine.ps_handle(A, 1), Some(10));

        engine.attach_backend(D).unwrap();
        // Replay runs one command at a time, in order
        assert_eq!(link.sent_to(D), vec![payload("SELECT ?")]);
        engine.on_reply(D, Reply::prepared(7, 1)).unwrap();
        assert_eq!(
            link.sent_to(D),
            vec![payload("SELECT ?"), payload("SET NAMES utf8")]
        );
        engine.on_reply(D, Reply::ok()).unwrap();

        // The replayed backend maps the same positions to its own handles
        assert_eq!(engine.ps_handle(D, 1), Some(7));
        assert_eq!(engine.active_backends(), vec![A, D]);
    }

    #[test]
    fn test_replay_after_reset_uses_single_baseline() {
        let (mut engine, link, _sink) = engine(&[A]);
        for i in 1..=3 {
            resolve_ok(&mut engine, &format!("SET @x={}", i));
        }
        let reset = engine
            .issue_command(CommandKind::FullReset, payload("RESET"))
            .unwrap();
        engine.on_reply(A, Reply::ok()).unwrap();

        engine.attach_backend(D).unwrap();
        assert_eq!(link.sent_to(D), vec![payload("RESET")]);
        engine.on_reply(D, Reply::ok()).unwrap();
        assert_eq!(link.sent_to(D).len(), 1);
        assert_eq!(engine.history_positions(), vec![reset]);
    }

    #[test]
    fn test_replay_divergence_closes_late_backend() {
        let (mut engine, link, _sink) = engine(&[A]);
        resolve_ok(&mut engine, "SET NAMES utf8");

        engine.attach_backend(D).unwrap();
        engine.on_reply(D, Reply::error(1115, "bad charset")).unwrap();

        assert_eq!(engine.active_backends(), vec![A]);
        let closed = link.closed();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].0, D);
        assert!(closed[0].1.contains("diverged"));
    }

    #[test]
    fn test_promotes_replier_with_buffered_outcome() {
        let (mut engine, _link, sink) = engine(&[A, B]);
        engine
            .issue_command(CommandKind::StateChange, payload("SET @a=1"))
            .unwrap();

        // B answers first; A (the replier) then dies before answering
        engine.on_reply(B, Reply::ok()).unwrap();
        assert!(sink.forwarded().is_empty());
        engine.on_backend_closed(A, "connection lost").unwrap();

        // B was promoted and its buffered outcome adopted as authoritative
        assert_eq!(engine.replier(), Some(B));
        let forwarded = sink.forwarded();
        assert_eq!(forwarded.len(), 1);
        assert!(forwarded[0].1.is_success());
    }

    #[test]
    fn test_promotion_waits_for_new_replier_reply() {
        let (mut engine, _link, sink) = engine(&[A, B]);
        engine
            .issue_command(CommandKind::StateChange, payload("SET @a=1"))
            .unwrap();

        engine.on_backend_closed(A, "connection lost").unwrap();
        assert_eq!(engine.replier(), Some(B));
        assert!(sink.forwarded().is_empty());

        engine.on_reply(B, Reply::ok()).unwrap();
        assert_eq!(sink.forwarded().len(), 1);
    }

    #[test]
    fn test_replier_unavailable_when_no_backends_remain() {
        let (mut engine, _link, _sink) = engine(&[A]);
        engine
            .issue_command(CommandKind::StateChange, payload("SET @a=1"))
            .unwrap();

        let err = engine.on_backend_closed(A, "connection lost").unwrap_err();
        assert!(matches!(err, Error::ReplierUnavailable { position: 1, .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_reply_without_in_flight_is_protocol_violation() {
        let (mut engine, _link, _sink) = engine(&[A]);
        let err = engine.on_reply(A, Reply::ok()).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_partial_reply_keeps_position_in_flight() {
        let (mut engine, _link, sink) = engine(&[A]);
        engine
            .issue_command(CommandKind::StateChange, payload("SET @a=1"))
            .unwrap();

        engine.on_reply(A, Reply::partial()).unwrap();
        assert_eq!(engine.backend_state(A).unwrap().in_flight(), Some(1));
        assert!(sink.forwarded().is_empty());

        engine.on_reply(A, Reply::ok()).unwrap();
        assert_eq!(sink.forwarded().len(), 1);
    }

    #[test]
    fn test_reply_from_detached_backend_is_dropped() {
        let (mut engine, _link, sink) = engine(&[A]);
        engine.on_reply(D, Reply::ok()).unwrap();
        assert!(sink.forwarded().is_empty());
    }

    #[test]
    fn test_issue_without_backends_fails() {
        let (mut engine, _link, _sink) = engine(&[]);
        let err = engine
            .issue_command(CommandKind::Other, payload("x"))
            .unwrap_err();
        assert!(matches!(err, Error::NoActiveBackends { .. }));
    }

    #[test]
    fn test_attach_validation() {
        let (mut engine, link, _sink) = engine(&[A]);
        assert!(matches!(
            engine.attach_backend(A),
            Err(Error::BackendAlreadyAttached { .. })
        ));

        link.set_inactive(D);
        assert!(matches!(
            engine.attach_backend(D),
            Err(Error::InactiveBackend { .. })
        ));
    }

    #[test]
    fn test_history_disabled_skips_retention_and_replay() {
        let config = SessionConfig {
            disable_history: true,
            ..SessionConfig::default()
        };
        let (mut engine, link, _sink) = engine_with(config, &[A]);
        resolve_ok(&mut engine, "SET NAMES utf8");
        assert!(engine.history_positions().is_empty());

        // FullReset trim is a no-op without retention
        engine
            .issue_command(CommandKind::FullReset, payload("RESET"))
            .unwrap();
        engine.on_reply(A, Reply::ok()).unwrap();

        engine.attach_backend(D).unwrap();
        assert!(link.sent_to(D).is_empty());
    }

    #[test]
    fn test_history_overflow_disables_replay() {
        let config = SessionConfig {
            disable_history: false,
            max_history: 2,
        };
        let (mut engine, link, _sink) = engine_with(config, &[A]);
        for i in 1..=3 {
            resolve_ok(&mut engine, &format!("SET @x={}", i));
        }

        assert!(engine.history_positions().is_empty());
        engine.attach_backend(D).unwrap();
        assert!(link.sent_to(D).is_empty());
    }

    #[test]
    fn test_send_failure_closes_backend_not_session() {
        let (mut engine, link, sink) = engine(&[A, B]);
        resolve_ok(&mut engine, "SET @a=1");

        link.set_inactive(B);
        engine
            .issue_command(CommandKind::StateChange, payload("SET @a=2"))
            .unwrap();
        engine.on_reply(A, Reply::ok()).unwrap();

        assert_eq!(engine.active_backends(), vec![A]);
        assert_eq!(sink.forwarded().len(), 2);
    }
}
