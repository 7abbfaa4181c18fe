/// MongoDB legacy wire protocol primitives
///
/// Implements the framing described in the legacy wire protocol: a 16-byte
/// little-endian message header followed by an opcode-specific body. Only the
/// header and the stream-level helpers live here; OpQuery/OpReply body
/// interpretation belongs to the proxy core.
pub mod last_error;
pub mod wire;

use std::fmt;

pub use last_error::LastError;

/// Length of the wire header in bytes.
pub const HEADER_LEN: i32 = 16;

/// Request/response opcode carried in every message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Reply,
    Message,
    Update,
    Insert,
    Reserved,
    Query,
    GetMore,
    Delete,
    KillCursors,
    /// Opcode this proxy does not interpret. Kept verbatim so headers
    /// round-trip unchanged.
    Unknown(i32),
}

impl OpCode {
    /// Operations that mutate data and may be followed by a getLastError
    /// call on the same connection.
    pub fn is_mutation(self) -> bool {
        matches!(self, OpCode::Update | OpCode::Insert | OpCode::Delete)
    }

    /// Operations the server answers with a reply message.
    pub fn has_response(self) -> bool {
        matches!(self, OpCode::Query | OpCode::GetMore)
    }

    pub fn as_i32(self) -> i32 {
        match self {
            OpCode::Reply => 1,
            OpCode::Message => 1000,
            OpCode::Update => 2001,
            OpCode::Insert => 2002,
            OpCode::Reserved => 2003,
            OpCode::Query => 2004,
            OpCode::GetMore => 2005,
            OpCode::Delete => 2006,
            OpCode::KillCursors => 2007,
            OpCode::Unknown(raw) => raw,
        }
    }
}

impl From<i32> for OpCode {
    fn from(raw: i32) -> Self {
        match raw {
            1 => OpCode::Reply,
            1000 => OpCode::Message,
            2001 => OpCode::Update,
            2002 => OpCode::Insert,
            2003 => OpCode::Reserved,
            2004 => OpCode::Query,
            2005 => OpCode::GetMore,
            2006 => OpCode::Delete,
            2007 => OpCode::KillCursors,
            other => OpCode::Unknown(other),
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpCode::Reply => "REPLY",
            OpCode::Message => "MESSAGE",
            OpCode::Update => "UPDATE",
            OpCode::Insert => "INSERT",
            OpCode::Reserved => "RESERVED",
            OpCode::Query => "QUERY",
            OpCode::GetMore => "GET_MORE",
            OpCode::Delete => "DELETE",
            OpCode::KillCursors => "KILL_CURSORS",
            OpCode::Unknown(_) => "UNKNOWN",
        };
        write!(f, "{}", name)
    }
}

/// The 16-byte header present on every wire message.
///
/// `message_length` counts the header itself, so it is never below
/// [`HEADER_LEN`] in a well-formed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: OpCode,
}

impl MsgHeader {
    /// Serialize to the canonical little-endian wire form.
    pub fn to_wire(&self) -> [u8; HEADER_LEN as usize] {
        let mut b = [0u8; HEADER_LEN as usize];
        wire::set_i32(&mut b, 0, self.message_length);
        wire::set_i32(&mut b, 4, self.request_id);
        wire::set_i32(&mut b, 8, self.response_to);
        wire::set_i32(&mut b, 12, self.op_code.as_i32());
        b
    }

    /// Parse the canonical wire form.
    pub fn from_wire(b: &[u8; HEADER_LEN as usize]) -> Self {
        MsgHeader {
            message_length: wire::get_i32(b, 0),
            request_id: wire::get_i32(b, 4),
            response_to: wire::get_i32(b, 8),
            op_code: OpCode::from(wire::get_i32(b, 12)),
        }
    }

    /// Number of body bytes following the header.
    pub fn body_length(&self) -> i64 {
        i64::from(self.message_length) - i64::from(HEADER_LEN)
    }
}

impl fmt::Display for MsgHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "opCode:{} ({}) msgLen:{} reqID:{} respTo:{}",
            self.op_code,
            self.op_code.as_i32(),
            self.message_length,
            self.request_id,
            self.response_to,
        )
    }
}
