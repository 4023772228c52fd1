//! Sans-I/O WebSocket client framing.
//!
//! [`WsClient`] is a push/pull state machine: bytes from the socket go in
//! through [`receive_data`](WsClient::receive_data), protocol events come out
//! of [`poll_event`](WsClient::poll_event), and every `send_*` method returns
//! the frame bytes for the caller to transmit. Client-to-server frames are
//! masked with a fresh random key as RFC 6455 requires; inbound messages are
//! surfaced fragment by fragment so the connection layer can reassemble them.

use crate::error::GatewayError;
use crate::handshake::{self, Response};

const OP_CONTINUATION: u8 = 0x0;
const OP_TEXT: u8 = 0x1;
const OP_BINARY: u8 = 0x2;
const OP_CLOSE: u8 = 0x8;
const OP_PING: u8 = 0x9;
const OP_PONG: u8 = 0xa;

const FIN: u8 = 0x80;
const MASKED: u8 = 0x80;

/// Where the WebSocket is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsState {
    /// Upgrade request sent (or about to be); waiting for the response.
    Connecting,
    /// Frames are flowing.
    Open,
    /// We sent a close frame and await the peer's echo.
    LocalClosing,
    /// The peer sent a close frame and awaits our echo.
    RemoteClosing,
    /// Close handshake complete; the TCP socket should be shut down.
    Closed,
    /// The upgrade was refused; only the rejection body remains.
    Rejected,
}

/// One protocol event pulled out of the inbound byte stream.
#[derive(Debug)]
pub(crate) enum WsEvent {
    /// The upgrade handshake completed.
    Open,
    /// The upgrade was refused.
    Reject {
        code: u16,
        headers: Vec<(String, Vec<u8>)>,
    },
    /// A chunk of the rejection response body.
    RejectData { data: Vec<u8>, finished: bool },
    /// The peer sent a ping carrying `data`.
    Ping { data: Vec<u8> },
    /// The peer answered one of our pings.
    Pong,
    /// A fragment of a text or binary message.
    Message {
        data: Vec<u8>,
        text: bool,
        finished: bool,
    },
    /// The peer's close frame, or the echo of ours.
    Close {
        code: Option<u16>,
        reason: Option<String>,
    },
}

/// A decoded inbound frame before fragmentation handling.
struct RawFrame {
    fin: bool,
    opcode: u8,
    payload: Vec<u8>,
}

/// Client-side WebSocket state machine.
#[derive(Debug)]
pub(crate) struct WsClient {
    state: WsState,
    buffer: Vec<u8>,
    /// Nonce sent in `Sec-WebSocket-Key`, kept for accept validation.
    key: String,
    /// `Some(is_text)` while a fragmented message is open.
    fragmented: Option<bool>,
    /// Countdown of rejection body bytes, when `Content-Length` was sent.
    reject_remaining: Option<usize>,
    reject_finished: bool,
    /// Whether the caller has signalled end-of-stream.
    eof: bool,
}

impl WsClient {
    pub(crate) fn new() -> Self {
        Self {
            state: WsState::Connecting,
            buffer: Vec::new(),
            key: handshake::generate_key(),
            fragmented: None,
            reject_remaining: None,
            reject_finished: false,
            eof: false,
        }
    }

    pub(crate) fn state(&self) -> WsState {
        self.state
    }

    /// The switching-protocols request opening this connection.
    pub(crate) fn upgrade_request(&self, host: &str, port: u16, target: &str) -> Vec<u8> {
        handshake::build_request(host, port, target, &self.key)
    }

    /// Feed socket bytes into the state machine.
    ///
    /// `None` marks end-of-stream, which only matters for rejection bodies
    /// sent without a `Content-Length`.
    pub(crate) fn receive_data(&mut self, data: Option<&[u8]>) {
        match data {
            Some(bytes) => self.buffer.extend_from_slice(bytes),
            None => self.eof = true,
        }
    }

    /// Pull the next protocol event, if one is fully buffered.
    pub(crate) fn poll_event(&mut self) -> Result<Option<WsEvent>, GatewayError> {
        match self.state {
            WsState::Connecting => self.poll_handshake(),
            WsState::Rejected => Ok(self.poll_reject_body()),
            WsState::Open | WsState::LocalClosing => self.poll_frame(),
            // After a close frame in either direction nothing more arrives.
            WsState::RemoteClosing | WsState::Closed => Ok(None),
        }
    }

    fn poll_handshake(&mut self) -> Result<Option<WsEvent>, GatewayError> {
        match handshake::parse_response(&self.buffer, &self.key)? {
            Response::Incomplete => Ok(None),
            Response::Accepted { consumed } => {
                self.buffer.drain(..consumed);
                self.state = WsState::Open;
                Ok(Some(WsEvent::Open))
            }
            Response::Rejected {
                consumed,
                code,
                headers,
                content_length,
            } => {
                self.buffer.drain(..consumed);
                self.state = WsState::Rejected;
                self.reject_remaining = content_length;
                Ok(Some(WsEvent::Reject { code, headers }))
            }
        }
    }

    fn poll_reject_body(&mut self) -> Option<WsEvent> {
        if self.reject_finished {
            return None;
        }

        let data = std::mem::take(&mut self.buffer);
        let finished = match self.reject_remaining.as_mut() {
            Some(remaining) => {
                *remaining = remaining.saturating_sub(data.len());
                *remaining == 0
            }
            // Without a Content-Length the body runs until end-of-stream.
            None => self.eof,
        };

        if data.is_empty() && !finished {
            return None;
        }

        self.reject_finished = finished;
        Some(WsEvent::RejectData { data, finished })
    }

    fn poll_frame(&mut self) -> Result<Option<WsEvent>, GatewayError> {
        let Some((frame, consumed)) = decode_frame(&self.buffer)? else {
            return Ok(None);
        };
        self.buffer.drain(..consumed);

        match frame.opcode {
            OP_PING => Ok(Some(WsEvent::Ping {
                data: frame.payload,
            })),

            OP_PONG => Ok(Some(WsEvent::Pong)),

            OP_CLOSE => {
                let (code, reason) = parse_close_payload(&frame.payload)?;
                self.state = if self.state == WsState::LocalClosing {
                    WsState::Closed
                } else {
                    WsState::RemoteClosing
                };
                Ok(Some(WsEvent::Close { code, reason }))
            }

            OP_TEXT | OP_BINARY => {
                if self.fragmented.is_some() {
                    return Err(GatewayError::Protocol(
                        "new data frame while a fragmented message is open".to_string(),
                    ));
                }
                let text = frame.opcode == OP_TEXT;
                if !frame.fin {
                    self.fragmented = Some(text);
                }
                Ok(Some(WsEvent::Message {
                    data: frame.payload,
                    text,
                    finished: frame.fin,
                }))
            }

            OP_CONTINUATION => {
                let Some(text) = self.fragmented else {
                    return Err(GatewayError::Protocol(
                        "continuation frame without a preceding fragment".to_string(),
                    ));
                };
                if frame.fin {
                    self.fragmented = None;
                }
                Ok(Some(WsEvent::Message {
                    data: frame.payload,
                    text,
                    finished: frame.fin,
                }))
            }

            other => Err(GatewayError::Protocol(format!(
                "unknown frame opcode {other:#x}"
            ))),
        }
    }

    pub(crate) fn send_text(&mut self, data: &str) -> Result<Vec<u8>, GatewayError> {
        self.ensure_open()?;
        Ok(encode_frame(OP_TEXT, data.as_bytes()))
    }

    pub(crate) fn send_binary(&mut self, data: &[u8]) -> Result<Vec<u8>, GatewayError> {
        self.ensure_open()?;
        Ok(encode_frame(OP_BINARY, data))
    }

    pub(crate) fn send_pong(&mut self, data: &[u8]) -> Result<Vec<u8>, GatewayError> {
        self.ensure_open()?;
        Ok(encode_frame(OP_PONG, data))
    }

    /// Initiate a close from our side.
    pub(crate) fn send_close(&mut self, code: u16, reason: &str) -> Result<Vec<u8>, GatewayError> {
        if self.state != WsState::Open {
            return Err(GatewayError::NotOpen);
        }
        self.state = WsState::LocalClosing;

        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend(code.to_be_bytes());
        payload.extend(reason.as_bytes());
        Ok(encode_frame(OP_CLOSE, &payload))
    }

    /// Echo the peer's close frame, completing the handshake.
    pub(crate) fn reply_close(&mut self, code: Option<u16>) -> Result<Vec<u8>, GatewayError> {
        if self.state != WsState::RemoteClosing {
            return Err(GatewayError::NotOpen);
        }
        self.state = WsState::Closed;

        let payload = match code {
            Some(code) => code.to_be_bytes().to_vec(),
            None => Vec::new(),
        };
        Ok(encode_frame(OP_CLOSE, &payload))
    }

    fn ensure_open(&self) -> Result<(), GatewayError> {
        if self.state == WsState::Open {
            Ok(())
        } else {
            Err(GatewayError::NotOpen)
        }
    }
}

/// Encode one masked, unfragmented client frame.
fn encode_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mask: [u8; 4] = rand::random();
    let mut frame = Vec::with_capacity(payload.len() + 14);

    frame.push(FIN | opcode);

    if payload.len() < 126 {
        frame.push(MASKED | payload.len() as u8);
    } else if payload.len() <= u16::MAX as usize {
        frame.push(MASKED | 126);
        frame.extend((payload.len() as u16).to_be_bytes());
    } else {
        frame.push(MASKED | 127);
        frame.extend((payload.len() as u64).to_be_bytes());
    }

    frame.extend(mask);
    frame.extend(
        payload
            .iter()
            .enumerate()
            .map(|(i, byte)| byte ^ mask[i % 4]),
    );
    frame
}

/// Decode the frame at the front of `buffer`, if fully received.
fn decode_frame(buffer: &[u8]) -> Result<Option<(RawFrame, usize)>, GatewayError> {
    if buffer.len() < 2 {
        return Ok(None);
    }

    let first = buffer[0];
    if first & 0x70 != 0 {
        return Err(GatewayError::Protocol(
            "reserved frame bits set without a negotiated extension".to_string(),
        ));
    }
    let fin = first & FIN != 0;
    let opcode = first & 0x0f;

    let second = buffer[1];
    let masked = second & MASKED != 0;

    let (length, mut offset) = match second & 0x7f {
        126 => {
            if buffer.len() < 4 {
                return Ok(None);
            }
            (u16::from_be_bytes([buffer[2], buffer[3]]) as usize, 4)
        }
        127 => {
            if buffer.len() < 10 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buffer[2..10]);
            (u64::from_be_bytes(raw) as usize, 10)
        }
        short => (short as usize, 2),
    };

    if opcode & 0x8 != 0 && (!fin || length > 125) {
        return Err(GatewayError::Protocol(
            "control frame fragmented or too long".to_string(),
        ));
    }

    let mask = if masked {
        if buffer.len() < offset + 4 {
            return Ok(None);
        }
        let key = [
            buffer[offset],
            buffer[offset + 1],
            buffer[offset + 2],
            buffer[offset + 3],
        ];
        offset += 4;
        Some(key)
    } else {
        None
    };

    if buffer.len() < offset + length {
        return Ok(None);
    }

    let mut payload = buffer[offset..offset + length].to_vec();
    if let Some(key) = mask {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }
    }

    Ok(Some((RawFrame { fin, opcode, payload }, offset + length)))
}

fn parse_close_payload(
    payload: &[u8],
) -> Result<(Option<u16>, Option<String>), GatewayError> {
    match payload.len() {
        0 => Ok((None, None)),
        1 => Err(GatewayError::Protocol(
            "close frame with a one-byte payload".to_string(),
        )),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            let reason = String::from_utf8_lossy(&payload[2..]);
            let reason = (!reason.is_empty()).then(|| reason.into_owned());
            Ok((Some(code), reason))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build an unmasked frame the way a server would.
    fn server_frame(opcode: u8, fin: bool, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.push(if fin { FIN | opcode } else { opcode });
        if payload.len() < 126 {
            frame.push(payload.len() as u8);
        } else {
            frame.push(126);
            frame.extend((payload.len() as u16).to_be_bytes());
        }
        frame.extend(payload);
        frame
    }

    fn open_client() -> WsClient {
        let mut client = WsClient::new();
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            handshake::accept_key(&client.key)
        );
        client.receive_data(Some(response.as_bytes()));
        assert!(matches!(
            client.poll_event().unwrap(),
            Some(WsEvent::Open)
        ));
        client
    }

    #[test]
    fn test_text_frame_round_trip() {
        let mut client = open_client();
        client.receive_data(Some(&server_frame(OP_TEXT, true, b"hello")));

        match client.poll_event().unwrap() {
            Some(WsEvent::Message {
                data,
                text: true,
                finished: true,
            }) => assert_eq!(data, b"hello"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(client.poll_event().unwrap().is_none());
    }

    #[test]
    fn test_fragmented_message() {
        let mut client = open_client();
        client.receive_data(Some(&server_frame(OP_BINARY, false, b"abc")));
        client.receive_data(Some(&server_frame(OP_CONTINUATION, true, b"def")));

        match client.poll_event().unwrap() {
            Some(WsEvent::Message {
                data,
                text: false,
                finished: false,
            }) => assert_eq!(data, b"abc"),
            other => panic!("unexpected event: {other:?}"),
        }
        match client.poll_event().unwrap() {
            Some(WsEvent::Message {
                data,
                text: false,
                finished: true,
            }) => assert_eq!(data, b"def"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_partial_frame_waits_for_more_data() {
        let mut client = open_client();
        let frame = server_frame(OP_TEXT, true, b"hello world");
        client.receive_data(Some(&frame[..5]));
        assert!(client.poll_event().unwrap().is_none());

        client.receive_data(Some(&frame[5..]));
        assert!(matches!(
            client.poll_event().unwrap(),
            Some(WsEvent::Message { .. })
        ));
    }

    #[test]
    fn test_client_frames_are_masked_and_decodable() {
        let mut client = open_client();
        let bytes = client.send_text("ping me").unwrap();
        assert_eq!(bytes[1] & MASKED, MASKED);

        let (frame, consumed) = decode_frame(&bytes).unwrap().unwrap();
        assert_eq!(consumed, bytes.len());
        assert!(frame.fin);
        assert_eq!(frame.opcode, OP_TEXT);
        assert_eq!(frame.payload, b"ping me");
    }

    #[test]
    fn test_close_handshake_local_initiation() {
        let mut client = open_client();
        client.send_close(1001, "").unwrap();
        assert_eq!(client.state(), WsState::LocalClosing);

        let mut close = vec![FIN | OP_CLOSE, 2];
        close.extend(1001u16.to_be_bytes());
        client.receive_data(Some(&close));

        match client.poll_event().unwrap() {
            Some(WsEvent::Close {
                code: Some(1001),
                reason: None,
            }) => {}
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(client.state(), WsState::Closed);
    }

    #[test]
    fn test_close_handshake_remote_initiation() {
        let mut client = open_client();
        let mut close = vec![FIN | OP_CLOSE, 7];
        close.extend(4000u16.to_be_bytes());
        close.extend(b"oops!");
        client.receive_data(Some(&close));

        match client.poll_event().unwrap() {
            Some(WsEvent::Close { code, reason }) => {
                assert_eq!(code, Some(4000));
                assert_eq!(reason.as_deref(), Some("oops!"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(client.state(), WsState::RemoteClosing);

        let reply = client.reply_close(Some(4000)).unwrap();
        let (frame, _) = decode_frame(&reply).unwrap().unwrap();
        assert_eq!(frame.opcode, OP_CLOSE);
        assert_eq!(frame.payload, 4000u16.to_be_bytes());
        assert_eq!(client.state(), WsState::Closed);
    }

    #[test]
    fn test_send_requires_open_socket() {
        let mut client = WsClient::new();
        assert!(matches!(
            client.send_text("too early"),
            Err(GatewayError::NotOpen)
        ));
    }

    #[test]
    fn test_fragmented_control_frame_is_rejected() {
        let mut client = open_client();
        client.receive_data(Some(&server_frame(OP_PING, false, b"")));
        assert!(client.poll_event().is_err());
    }

    #[test]
    fn test_reserved_bits_are_rejected() {
        let mut client = open_client();
        client.receive_data(Some(&[0xc1, 0x00]));
        assert!(client.poll_event().is_err());
    }

    #[test]
    fn test_interleaved_data_frame_is_rejected() {
        let mut client = open_client();
        client.receive_data(Some(&server_frame(OP_TEXT, false, b"abc")));
        assert!(client.poll_event().unwrap().is_some());

        client.receive_data(Some(&server_frame(OP_TEXT, true, b"def")));
        assert!(client.poll_event().is_err());
    }
}
