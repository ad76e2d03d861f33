//! Backend Reply Status
//!
//! The assembled view of a backend's response that the replication engine
//! validates: success or error, error details, and for COM_STMT_PREPARE the
//! backend-generated statement id and parameter count. Multi-packet replies
//! are assembled by the connection layer; the engine only ever sees complete
//! replies.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::session::command::CommandKind;

/// Error details extracted from an ERR packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyError {
    pub code: u16,
    pub sql_state: String,
    pub message: String,
}

/// A backend's reply to a session command
#[derive(Debug, Clone)]
pub struct Reply {
    complete: bool,
    error: Option<ReplyError>,
    generated_id: u32,
    param_count: u16,
    payload: Bytes,
}

impl Reply {
    /// A complete OK reply with no payload of interest
    pub fn ok() -> Self {
        Self {
            complete: true,
            error: None,
            generated_id: 0,
            param_count: 0,
            payload: Bytes::new(),
        }
    }

    /// A complete OK reply carrying the assembled response body
    pub fn ok_with_payload(payload: Bytes) -> Self {
        Self {
            payload,
            ..Self::ok()
        }
    }

    /// A complete error reply
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self {
            complete: true,
            error: Some(ReplyError {
                code,
                sql_state: "HY000".to_string(),
                message: message.into(),
            }),
            generated_id: 0,
            param_count: 0,
            payload: Bytes::new(),
        }
    }

    /// A complete COM_STMT_PREPARE success reply
    pub fn prepared(generated_id: u32, param_count: u16) -> Self {
        Self {
            complete: true,
            error: None,
            generated_id,
            param_count,
            payload: Bytes::new(),
        }
    }

    /// A reply that has not been fully assembled yet
    pub fn partial() -> Self {
        Self {
            complete: false,
            error: None,
            generated_id: 0,
            param_count: 0,
            payload: Bytes::new(),
        }
    }

    /// Classify a complete reply from its first packet payload.
    ///
    /// `kind` decides how a 0x00 header is read: for Prepare commands it is
    /// the COM_STMT_PREPARE response header carrying the statement id, for
    /// everything else a plain OK packet.
    pub fn from_packet(kind: CommandKind, payload: &[u8]) -> Result<Self> {
        let header = *payload
            .first()
            .ok_or_else(|| Error::MalformedPacket("empty reply payload".to_string()))?;

        match header {
            0xff => {
                if payload.len() < 3 {
                    return Err(Error::MalformedPacket("truncated ERR packet".to_string()));
                }
                let code = u16::from_le_bytes([payload[1], payload[2]]);
                let (sql_state, message) = if payload.len() > 9 && payload[3] == b'#' {
                    (
                        String::from_utf8_lossy(&payload[4..9]).into_owned(),
                        String::from_utf8_lossy(&payload[9..]).into_owned(),
                    )
                } else {
                    (
                        "HY000".to_string(),
                        String::from_utf8_lossy(&payload[3..]).into_owned(),
                    )
                };
                Ok(Self {
                    complete: true,
                    error: Some(ReplyError {
                        code,
                        sql_state,
                        message,
                    }),
                    generated_id: 0,
                    param_count: 0,
                    payload: Bytes::copy_from_slice(payload),
                })
            }
            0x00 if kind == CommandKind::Prepare => {
                if payload.len() < 9 {
                    return Err(Error::MalformedPacket(
                        "truncated COM_STMT_PREPARE response".to_string(),
                    ));
                }
                let generated_id =
                    u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
                let param_count = u16::from_le_bytes([payload[7], payload[8]]);
                Ok(Self {
                    complete: true,
                    error: None,
                    generated_id,
                    param_count,
                    payload: Bytes::copy_from_slice(payload),
                })
            }
            _ => Ok(Self {
                complete: true,
                error: None,
                generated_id: 0,
                param_count: 0,
                payload: Bytes::copy_from_slice(payload),
            }),
        }
    }

    /// Whether the reply has been fully assembled
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Whether the backend answered with an error
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Error code, if the reply is an error
    pub fn error_code(&self) -> Option<u16> {
        self.error.as_ref().map(|e| e.code)
    }

    /// Error message, if the reply is an error
    pub fn message(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.message.as_str())
    }

    /// Full error details, if the reply is an error
    pub fn error_detail(&self) -> Option<&ReplyError> {
        self.error.as_ref()
    }

    /// Backend-generated id (statement id for COM_STMT_PREPARE)
    pub fn generated_id(&self) -> u32 {
        self.generated_id
    }

    /// Parameter count for COM_STMT_PREPARE responses
    pub fn param_count(&self) -> u16 {
        self.param_count
    }

    /// Assembled response body, for forwarding to the client
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}
