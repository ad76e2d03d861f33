//! Session Command Queue
//!
//! Ordered per-session log of connection-state-changing commands. Positions
//! are strictly increasing and never reused within a session. Entries behind
//! the resolved head are retained as the replayable history used to bring
//! newly attached backends up to the session's current state.

use std::collections::VecDeque;

use bytes::Bytes;

/// Monotonic sequence number identifying a command's place in the session log
pub type Position = u64;

/// Classification of a session command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Connection-state change (character set, USE, SET variables)
    StateChange,
    /// Prepared statement creation; yields one generated handle per backend
    Prepare,
    /// Full user/context reset (COM_CHANGE_USER, COM_RESET_CONNECTION)
    FullReset,
    /// Any other command that must reach every backend
    Other,
}

/// A single immutable session command
#[derive(Debug, Clone)]
pub struct SessionCommand {
    position: Position,
    kind: CommandKind,
    payload: Bytes,
}

impl SessionCommand {
    pub fn position(&self) -> Position {
        self.position
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

/// Ordered command log with head tracking and history retention
///
/// The head is the oldest unresolved position. Entries are appended at the
/// tail and removed only from the front, so retained positions are always
/// contiguous.
#[derive(Debug)]
pub struct CommandQueue {
    entries: VecDeque<SessionCommand>,
    next_position: Position,
    head: Position,
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandQueue {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            next_position: 1,
            head: 1,
        }
    }

    /// Append a command at the tail, assigning the next position.
    ///
    /// No de-duplication: reissuing an identical command creates a distinct
    /// entry, since session commands are not idempotent across time.
    pub fn append(&mut self, kind: CommandKind, payload: Bytes) -> Position {
        let position = self.next_position;
        self.next_position += 1;
        self.entries.push_back(SessionCommand {
            position,
            kind,
            payload,
        });
        position
    }

    /// Oldest unresolved position
    pub fn head(&self) -> Position {
        self.head
    }

    /// Most recently appended position, if any command was ever appended
    pub fn tail(&self) -> Option<Position> {
        self.next_position.checked_sub(2).map(|p| p + 1)
    }

    /// Advance the head past the current head position.
    ///
    /// Callers only do this once every backend active at dispatch time is
    /// terminal (validated or closed) for the head position.
    pub fn advance_head(&mut self) {
        self.head += 1;
    }

    /// Look up a retained command by position
    pub fn get(&self, position: Position) -> Option<&SessionCommand> {
        let front = self.entries.front()?.position();
        if position < front {
            return None;
        }
        self.entries.get((position - front) as usize)
    }

    /// Discard retained entries with a position below `position`
    pub fn trim_before(&mut self, position: Position) -> usize {
        let mut removed = 0;
        while self
            .entries
            .front()
            .map(|c| c.position() < position)
            .unwrap_or(false)
        {
            self.entries.pop_front();
            removed += 1;
        }
        removed
    }

    /// Oldest retained position (the history baseline)
    pub fn first_retained(&self) -> Option<Position> {
        self.entries.front().map(|c| c.position())
    }

    /// All retained commands in position order
    pub fn retained(&self) -> impl Iterator<Item = &SessionCommand> {
        self.entries.iter()
    }

    /// Number of retained commands
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
