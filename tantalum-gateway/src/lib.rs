//! Tantalum Gateway - Sans-I/O Discord Gateway protocol core
#![deny(unsafe_code)]
//!
//! This crate implements the Discord Gateway protocol as a pure state
//! machine: bytes in, bytes out. It never opens sockets, reads clocks for
//! scheduling or spawns tasks; the caller owns all I/O and timing and can
//! wrap the [`Connection`] in any threaded or async driver.
//!
//! What the core does own is everything between the socket and the events:
//! WebSocket framing and the upgrade handshake, zlib-stream and per-payload
//! decompression, message reassembly across fragments, JSON and ETF payload
//! encodings, heartbeat/acknowledgement supervision, the IDENTIFY-vs-RESUME
//! session lifecycle, and the close handshake.
//!
//! # Example
//!
//! ```ignore
//! use tantalum_gateway::{Connection, ConnectionConfig};
//!
//! let mut conn = Connection::new(
//!     "wss://gateway.discord.gg/",
//!     ConnectionConfig::default(),
//! )?;
//!
//! let (host, port) = conn.destination()?;
//! // Open a TLS socket to (host, port), then send the upgrade:
//! socket.write_all(&conn.connect()?)?;
//!
//! // Feed every read into the connection, transmit what it returns and
//! // drain the received payloads.
//! let replies = conn.receive(&socket.read_some()?)?;
//! for reply in replies {
//!     socket.write_all(&reply)?;
//! }
//! for event in conn.events() {
//!     println!("{event:?}");
//! }
//! ```
mod compression;
mod connection;
pub mod error;
pub mod etf;
mod frame;
mod handshake;
mod heartbeat;
mod intents;
mod opcode;
mod payload;
mod snowflake;

// Public re-exports
pub use compression::Compression;
pub use connection::{Connection, ConnectionConfig, Resumption};
pub use error::{should_reconnect, CloseCode, GatewayError};
pub use etf::Encoding;
pub use frame::WsState;
pub use intents::Intents;
pub use opcode::OpCode;
pub use payload::{
    Activity, ActivityType, ConnectionProperties, GatewayPayload, Identify, RequestGuildMembers,
    Status, UpdatePresence, UpdateVoiceState,
};
pub use snowflake::Snowflake;

/// Discord Gateway API version spoken by this library.
pub const GATEWAY_VERSION: u8 = 9;

/// Default gateway URL (normally taken from the Get Gateway Bot endpoint).
pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg";
