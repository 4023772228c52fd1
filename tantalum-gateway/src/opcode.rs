//! Discord Gateway opcodes.
//!
//! Opcodes define the type of payload being sent or received over the Gateway
//! WebSocket.

use serde_repr::{Deserialize_repr, Serialize_repr};

/// Discord Gateway operation codes.
///
/// See: <https://discord.com/developers/docs/topics/opcodes-and-status-codes#gateway-gateway-opcodes>
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum OpCode {
    /// Dispatch - An event was dispatched.
    /// Direction: Receive
    Dispatch = 0,

    /// Heartbeat - Keep the connection alive.
    /// Direction: Send/Receive
    Heartbeat = 1,

    /// Identify - Start a new session.
    /// Direction: Send
    Identify = 2,

    /// Presence Update - Update the client's presence.
    /// Direction: Send
    PresenceUpdate = 3,

    /// Voice State Update - Join/leave/move between voice channels.
    /// Direction: Send
    VoiceStateUpdate = 4,

    /// Resume - Resume a previous session.
    /// Direction: Send
    Resume = 6,

    /// Reconnect - Server requested a reconnect.
    /// Direction: Receive
    Reconnect = 7,

    /// Request Guild Members - Request guild member chunks.
    /// Direction: Send
    RequestGuildMembers = 8,

    /// Invalid Session - Session has been invalidated.
    /// Direction: Receive
    InvalidSession = 9,

    /// Hello - Sent after connecting, contains heartbeat interval.
    /// Direction: Receive
    Hello = 10,

    /// Heartbeat ACK - Acknowledgment of heartbeat received.
    /// Direction: Receive
    HeartbeatAck = 11,
}

impl OpCode {
    /// Look up a wire opcode.
    ///
    /// Returns `None` for opcodes this library does not know about; payloads
    /// carrying one are handed to the user untouched.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(OpCode::Dispatch),
            1 => Some(OpCode::Heartbeat),
            2 => Some(OpCode::Identify),
            3 => Some(OpCode::PresenceUpdate),
            4 => Some(OpCode::VoiceStateUpdate),
            6 => Some(OpCode::Resume),
            7 => Some(OpCode::Reconnect),
            8 => Some(OpCode::RequestGuildMembers),
            9 => Some(OpCode::InvalidSession),
            10 => Some(OpCode::Hello),
            11 => Some(OpCode::HeartbeatAck),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_serialization() {
        let json = serde_json::to_string(&OpCode::Hello).unwrap();
        assert_eq!(json, "10");

        let opcode: OpCode = serde_json::from_str("10").unwrap();
        assert_eq!(opcode, OpCode::Hello);
    }

    #[test]
    fn test_opcode_lookup() {
        assert_eq!(OpCode::from_u8(0), Some(OpCode::Dispatch));
        assert_eq!(OpCode::from_u8(11), Some(OpCode::HeartbeatAck));
        assert_eq!(OpCode::from_u8(5), None);
        assert_eq!(OpCode::from_u8(12), None);
    }
}
