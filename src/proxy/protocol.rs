//! MySQL Wire Protocol Essentials
//!
//! Packet framing and the command classification the replication engine
//! depends on: deciding whether a client packet is a session command, and
//! which kind.

use std::io;

use crate::session::command::CommandKind;

/// MySQL command packet types relevant to session command replication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// COM_QUIT (0x01)
    Quit,
    /// COM_INIT_DB (0x02)
    InitDb,
    /// COM_QUERY (0x03)
    Query,
    /// COM_PING (0x0e)
    Ping,
    /// COM_CHANGE_USER (0x11)
    ChangeUser,
    /// COM_STMT_PREPARE (0x16)
    StmtPrepare,
    /// COM_STMT_EXECUTE (0x17)
    StmtExecute,
    /// COM_STMT_CLOSE (0x19)
    StmtClose,
    /// COM_RESET_CONNECTION (0x1f)
    ResetConnection,
    /// Unknown command
    Unknown(u8),
}

impl From<u8> for Command {
    fn from(cmd: u8) -> Self {
        match cmd {
            0x01 => Command::Quit,
            0x02 => Command::InitDb,
            0x03 => Command::Query,
            0x0e => Command::Ping,
            0x11 => Command::ChangeUser,
            0x16 => Command::StmtPrepare,
            0x17 => Command::StmtExecute,
            0x19 => Command::StmtClose,
            0x1f => Command::ResetConnection,
            other => Command::Unknown(other),
        }
    }
}

/// MySQL packet header (4 bytes)
#[derive(Debug, Clone)]
pub struct PacketHeader {
    /// Payload length (3 bytes)
    pub length: u32,
    /// Sequence ID (1 byte)
    pub sequence_id: u8,
}

impl PacketHeader {
    pub fn read(data: &[u8]) -> io::Result<Self> {
        if data.len() < 4 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Not enough data for header",
            ));
        }

        let length = (data[0] as u32) | ((data[1] as u32) << 8) | ((data[2] as u32) << 16);
        let sequence_id = data[3];

        Ok(Self { length, sequence_id })
    }

    pub fn write(&self, buf: &mut Vec<u8>) {
        buf.push((self.length & 0xff) as u8);
        buf.push(((self.length >> 8) & 0xff) as u8);
        buf.push(((self.length >> 16) & 0xff) as u8);
        buf.push(self.sequence_id);
    }
}

/// MySQL packet
#[derive(Debug, Clone)]
pub struct MySqlPacket {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}

impl MySqlPacket {
    /// Create a new packet
    pub fn new(sequence_id: u8, payload: Vec<u8>) -> Self {
        Self {
            header: PacketHeader {
                length: payload.len() as u32,
                sequence_id,
            },
            payload,
        }
    }

    /// Read a packet from a buffer
    pub fn read(data: &[u8]) -> io::Result<(Self, usize)> {
        let header = PacketHeader::read(data)?;
        let total_len = 4 + header.length as usize;

        if data.len() < total_len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Not enough data for packet",
            ));
        }

        let payload = data[4..total_len].to_vec();

        Ok((Self { header, payload }, total_len))
    }

    /// Write packet to buffer
    pub fn write(&self, buf: &mut Vec<u8>) {
        self.header.write(buf);
        buf.extend_from_slice(&self.payload);
    }

    /// Get command type (first byte of payload for command packets)
    pub fn command(&self) -> Option<Command> {
        self.payload.first().map(|&b| Command::from(b))
    }

    /// Get query string (for COM_QUERY packets)
    pub fn query_string(&self) -> Option<String> {
        match self.command()? {
            Command::Query if self.payload.len() > 1 => {
                String::from_utf8(self.payload[1..].to_vec()).ok()
            }
            _ => None,
        }
    }

    /// Classify this packet as a session command, if it is one.
    ///
    /// Session commands change connection-level state and must be replicated
    /// to every backend serving the session. Anything else (plain queries,
    /// pings, statement executions) is routed by the load balancer instead
    /// and returns `None` here.
    pub fn session_command_kind(&self) -> Option<CommandKind> {
        match self.command()? {
            Command::InitDb => Some(CommandKind::StateChange),
            Command::StmtPrepare => Some(CommandKind::Prepare),
            Command::ChangeUser | Command::ResetConnection => Some(CommandKind::FullReset),
            Command::Query => {
                let query = self.query_string()?;
                let upper = query.trim_start().to_uppercase();
                if upper.starts_with("SET ") || upper.starts_with("USE ") {
                    Some(CommandKind::StateChange)
                } else if upper.starts_with("PREPARE ") {
                    // Text protocol prepare; the handle is the statement name,
                    // still one per backend
                    Some(CommandKind::Prepare)
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

/// Build an OK packet
pub fn build_ok_packet(sequence_id: u8, affected_rows: u64, last_insert_id: u64) -> MySqlPacket {
    let mut payload = Vec::new();
    payload.push(0x00); // OK header
    write_lenenc_int(&mut payload, affected_rows);
    write_lenenc_int(&mut payload, last_insert_id);
    payload.push(0x02); // status flags (2 bytes) - autocommit
    payload.push(0x00);
    payload.push(0x00); // warnings (2 bytes)
    payload.push(0x00);

    MySqlPacket::new(sequence_id, payload)
}

/// Build an error packet
pub fn build_error_packet(
    sequence_id: u8,
    error_code: u16,
    sql_state: &str,
    message: &str,
) -> MySqlPacket {
    let mut payload = Vec::new();
    payload.push(0xff); // Error header
    payload.push((error_code & 0xff) as u8);
    payload.push(((error_code >> 8) & 0xff) as u8);
    payload.push(b'#'); // SQL state marker
    payload.extend_from_slice(sql_state.as_bytes());
    payload.extend_from_slice(message.as_bytes());

    MySqlPacket::new(sequence_id, payload)
}

/// Build a COM_STMT_PREPARE response header packet
pub fn build_prepare_ok_packet(
    sequence_id: u8,
    statement_id: u32,
    num_columns: u16,
    num_params: u16,
) -> MySqlPacket {
    let mut payload = Vec::new();
    payload.push(0x00); // OK header
    payload.extend_from_slice(&statement_id.to_le_bytes());
    payload.extend_from_slice(&num_columns.to_le_bytes());
    payload.extend_from_slice(&num_params.to_le_bytes());
    payload.push(0x00); // filler
    payload.push(0x00); // warnings (2 bytes)
    payload.push(0x00);

    MySqlPacket::new(sequence_id, payload)
}

/// Write a length-encoded integer
fn write_lenenc_int(buf: &mut Vec<u8>, value: u64) {
    if value < 251 {
        buf.push(value as u8);
    } else if value < 65536 {
        buf.push(0xfc);
        buf.push((value & 0xff) as u8);
        buf.push(((value >> 8) & 0xff) as u8);
    } else if value < 16777216 {
        buf.push(0xfd);
        buf.push((value & 0xff) as u8);
        buf.push(((value >> 8) & 0xff) as u8);
        buf.push(((value >> 16) & 0xff) as u8);
    } else {
        buf.push(0xfe);
        for i in 0..8 {
            buf.push(((value >> (i * 8)) & 0xff) as u8);
        }
    }
}
