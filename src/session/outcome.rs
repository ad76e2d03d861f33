//! Session Command Outcomes
//!
//! The replier's outcome for a position is authoritative: it is what the
//! client sees, and what every other backend's outcome is compared against.
//! Comparison is by success/failure class only; generated handles are
//! expected to differ between backends.

use bytes::Bytes;

use crate::proxy::Reply;
use super::command::Position;

/// Outcome of a session command on one backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success {
        /// Backend-generated id (statement id for Prepare commands)
        generated_id: u32,
        /// Assembled response body, forwarded to the client when authoritative
        info: Bytes,
    },
    Failure {
        code: u16,
        message: String,
    },
}

impl Outcome {
    /// Extract the outcome from a complete backend reply
    pub fn from_reply(reply: &Reply) -> Self {
        if reply.is_error() {
            Outcome::Failure {
                code: reply.error_code().unwrap_or(0),
                message: reply.message().unwrap_or_default().to_string(),
            }
        } else {
            Outcome::Success {
                generated_id: reply.generated_id(),
                info: reply.payload().clone(),
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    /// Whether two outcomes agree for validation purposes.
    ///
    /// Success matches success and failure matches failure; ids and bodies
    /// are backend-local and do not participate.
    pub fn same_class(&self, other: &Outcome) -> bool {
        self.is_success() == other.is_success()
    }

    /// Backend-generated id, for Prepare successes
    pub fn generated_id(&self) -> Option<u32> {
        match self {
            Outcome::Success { generated_id, .. } => Some(*generated_id),
            Outcome::Failure { .. } => None,
        }
    }
}

/// The outcome recorded by the replier for one position.
///
/// Created exactly once per position and released when the position
/// resolves; only a compact success/failure class is kept afterwards for
/// history replay validation.
#[derive(Debug, Clone)]
pub struct AuthoritativeOutcome {
    pub position: Position,
    pub outcome: Outcome,
}
