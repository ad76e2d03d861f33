//! MySQL Protocol Surface
//!
//! Packet framing, session command classification and reply status
//! extraction. The full wire protocol (handshake, authentication, result
//! sets) is handled by the connection layer; this module only covers what
//! the replication engine needs to see.

mod protocol;
mod reply;

pub use protocol::{
    build_error_packet, build_ok_packet, build_prepare_ok_packet, Command, MySqlPacket,
    PacketHeader,
};
pub use reply::{Reply, ReplyError};
