//! Gateway error types using thiserror.
//!
//! All failures in tantalum-gateway are represented by the [`GatewayError`]
//! enum. The connection-level signals ([`GatewayError::Rejected`],
//! [`GatewayError::RejectedData`] and [`GatewayError::Closing`]) are not
//! failures in the usual sense: they are the expected way the caller learns
//! that the TCP socket must be drained and closed. No `.unwrap()` calls are
//! used outside of tests.

use thiserror::Error;

/// Errors and connection-level signals surfaced by the gateway core.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The server refused the WebSocket upgrade.
    ///
    /// The HTTP response body follows in later [`receive`] calls and is
    /// delivered through [`GatewayError::RejectedData`].
    ///
    /// [`receive`]: crate::Connection::receive
    #[error("websocket upgrade rejected with HTTP status {code}")]
    Rejected {
        /// HTTP status code of the rejection response.
        code: u16,
        /// Response headers as raw name/value pairs.
        headers: Vec<(String, Vec<u8>)>,
    },

    /// The body of a rejected upgrade response has been fully received.
    #[error("rejected upgrade body complete ({} bytes)", .data.len())]
    RejectedData {
        /// The concatenated response body.
        data: Vec<u8>,
    },

    /// The WebSocket is closing and the TCP socket should be shut down.
    ///
    /// `data` holds the closing reply to transmit before closing the socket,
    /// or `None` when the close handshake is already complete. `code` and
    /// `reason` are present when the peer initiated the closure.
    #[error("websocket closing (code {code:?})")]
    Closing {
        /// Final bytes to send before closing the socket, if any.
        data: Option<Vec<u8>>,
        /// Close code supplied by the peer.
        code: Option<u16>,
        /// Close reason supplied by the peer.
        reason: Option<String>,
    },

    /// The gateway URI could not be parsed.
    #[error("invalid gateway URL: {0}")]
    Url(#[from] url::ParseError),

    /// The gateway URI has no host to connect to.
    #[error("gateway URL does not contain a host")]
    MissingHost,

    /// A resume was requested without a stored session.
    #[error("cannot resume without a session id and sequence number")]
    NoSession,

    /// A frame was sent while the WebSocket is not open.
    #[error("websocket is not open")]
    NotOpen,

    /// The HTTP upgrade response was malformed.
    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    /// The peer violated the WebSocket framing protocol.
    #[error("websocket protocol error: {0}")]
    Protocol(String),

    /// A transport-compressed message ended without the zlib flush suffix.
    ///
    /// There is no way to recover the shared decompression context after
    /// this; the connection must be torn down.
    #[error("compressed message finished without the zlib suffix")]
    MissingZlibSuffix,

    /// A binary message arrived but no compression is configured and the
    /// encoding is JSON.
    #[error("received a binary message with no compression configured")]
    UnexpectedBinaryMessage,

    /// Zlib decompression failed.
    #[error("failed to decompress message: {0}")]
    Decompress(String),

    /// Failed to parse a JSON payload.
    #[error("JSON decode error: {0}")]
    JsonDecode(String),

    /// Failed to decode an ETF payload.
    #[error("ETF decode error: {0}")]
    EtfDecode(String),
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::JsonDecode(err.to_string())
    }
}

/// Discord Gateway close codes.
///
/// See: <https://discord.com/developers/docs/topics/opcodes-and-status-codes#gateway-gateway-close-event-codes>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseCode {
    /// Unknown error occurred.
    UnknownError = 4000,
    /// Invalid opcode sent.
    UnknownOpcode = 4001,
    /// Invalid payload (decode error).
    DecodeError = 4002,
    /// Payload sent before identifying.
    NotAuthenticated = 4003,
    /// Invalid token.
    AuthenticationFailed = 4004,
    /// Already authenticated.
    AlreadyAuthenticated = 4005,
    /// Invalid sequence number for resume.
    InvalidSeq = 4007,
    /// Rate limited.
    RateLimited = 4008,
    /// Session timed out.
    SessionTimedOut = 4009,
    /// Invalid shard configuration.
    InvalidShard = 4010,
    /// Too many guilds (sharding required).
    ShardingRequired = 4011,
    /// Invalid API version.
    InvalidApiVersion = 4012,
    /// Invalid intents.
    InvalidIntents = 4013,
    /// Disallowed intents (privileged intent not enabled).
    DisallowedIntents = 4014,
}

impl CloseCode {
    /// Returns whether reconnection is advisable after this close code.
    pub const fn can_reconnect(self) -> bool {
        !matches!(
            self,
            CloseCode::AuthenticationFailed
                | CloseCode::InvalidShard
                | CloseCode::ShardingRequired
                | CloseCode::InvalidApiVersion
                | CloseCode::InvalidIntents
                | CloseCode::DisallowedIntents
        )
    }

    /// Try to convert a u16 close code to this enum.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            4000 => Some(CloseCode::UnknownError),
            4001 => Some(CloseCode::UnknownOpcode),
            4002 => Some(CloseCode::DecodeError),
            4003 => Some(CloseCode::NotAuthenticated),
            4004 => Some(CloseCode::AuthenticationFailed),
            4005 => Some(CloseCode::AlreadyAuthenticated),
            4007 => Some(CloseCode::InvalidSeq),
            4008 => Some(CloseCode::RateLimited),
            4009 => Some(CloseCode::SessionTimedOut),
            4010 => Some(CloseCode::InvalidShard),
            4011 => Some(CloseCode::ShardingRequired),
            4012 => Some(CloseCode::InvalidApiVersion),
            4013 => Some(CloseCode::InvalidIntents),
            4014 => Some(CloseCode::DisallowedIntents),
            _ => None,
        }
    }
}

/// Whether reconnecting is advisable after observing a close code.
///
/// The table is conservative about returning `false`: unknown codes, codes
/// outside the gateway's 4000-4999 range and `None` all recommend
/// reconnecting, while the handful of codes that indicate a configuration
/// problem (bad token, bad intents, bad shard setup) do not.
pub fn should_reconnect(code: Option<u16>) -> bool {
    let Some(code) = code else {
        return true;
    };

    // Regular WebSocket close codes, including the application-reserved
    // 3000-3999 range, carry no gateway-specific meaning.
    if !(4000..5000).contains(&code) {
        return true;
    }

    CloseCode::from_code(code).is_none_or(CloseCode::can_reconnect)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_close_codes() {
        for code in [4004, 4010, 4011, 4012, 4013, 4014] {
            assert!(!should_reconnect(Some(code)), "{code} should be fatal");
        }
    }

    #[test]
    fn test_recoverable_close_codes() {
        for code in [4000, 4001, 4002, 4003, 4005, 4007, 4008, 4009] {
            assert!(should_reconnect(Some(code)), "{code} should be recoverable");
        }
    }

    #[test]
    fn test_unknown_codes_reconnect() {
        assert!(should_reconnect(None));
        assert!(should_reconnect(Some(1000)));
        assert!(should_reconnect(Some(3500)));
        assert!(should_reconnect(Some(4999)));
        assert!(should_reconnect(Some(5000)));
    }
}
