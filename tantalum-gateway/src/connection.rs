//! The gateway connection state machine.
//!
//! [`Connection`] owns every piece of protocol state but never touches a
//! socket or a timer. The caller feeds inbound bytes through
//! [`receive`](Connection::receive), transmits whatever bytes the operations
//! return, and sleeps for the intervals the connection reports. One
//! `Connection` survives across many TCP sessions: [`reconnect`](Connection::reconnect)
//! resets the per-socket state while the session identity (`session_id`,
//! `sequence`, the resume endpoint and the resume decision) carries over to
//! the next socket.

use std::collections::VecDeque;
use std::mem;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, trace, warn};
use url::Url;

use crate::compression::{inflate_payload, Compression, TransportInflator, ZLIB_SUFFIX};
use crate::error::GatewayError;
use crate::etf::{self, Encoding};
use crate::frame::{WsClient, WsEvent, WsState};
use crate::heartbeat::HeartbeatState;
use crate::opcode::OpCode;
use crate::payload::{
    GatewayPayload, Hello, Identify, Ready, RequestGuildMembers, UpdatePresence, UpdateVoiceState,
};
use crate::GATEWAY_VERSION;

/// What the next connection should do about the current session.
///
/// A single boolean cannot answer the three questions this state carries: is
/// there a session at all, did it die resumably, and did the server
/// invalidate it. The value set when one socket dies is the message it sends
/// to its successor, which is why [`Connection::reconnect`] never touches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Resumption {
    /// No disconnect has been classified yet; also the state right after
    /// IDENTIFY or RESUME is sent.
    #[default]
    Unknown,
    /// The session is worth resuming on the next connection.
    Resume,
    /// The session is gone; the next connection must IDENTIFY.
    Fresh,
}

/// Constructor options for a [`Connection`].
#[derive(Debug, Clone, Default)]
pub struct ConnectionConfig {
    /// Wire encoding for payloads.
    pub encoding: Encoding,

    /// Compression scheme for inbound binary messages.
    pub compress: Compression,

    /// Also queue payloads the connection handled itself (heartbeat ACKs,
    /// RECONNECT and the like) for the user.
    pub dispatch_handled: bool,
}

impl ConnectionConfig {
    /// Options for the given encoding with no compression.
    pub fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            compress: Compression::None,
            dispatch_handled: false,
        }
    }

    /// Select a compression scheme.
    pub fn with_compression(mut self, compress: Compression) -> Self {
        self.compress = compress;
        self
    }

    /// Queue auto-handled payloads for the user as well.
    pub fn with_dispatch_handled(mut self, dispatch_handled: bool) -> Self {
        self.dispatch_handled = dispatch_handled;
        self
    }
}

/// A sans-I/O connection to the Discord gateway.
pub struct Connection {
    uri: Url,
    resume_uri: Url,
    encoding: Encoding,
    compress: Compression,
    dispatch_handled: bool,

    session_id: Option<String>,
    sequence: Option<u64>,
    should_resume: Resumption,
    attempts: u64,

    heartbeat: HeartbeatState,
    ws: WsClient,
    inflator: TransportInflator,
    text_buffer: Vec<u8>,
    bytes_buffer: Vec<u8>,
    events: VecDeque<GatewayPayload>,
}

impl Connection {
    /// Create a connection to `uri`.
    ///
    /// The URI should come from the Get Gateway (Bot) endpoint. A bare host
    /// is accepted and assumed to be `wss://`.
    pub fn new(uri: &str, config: ConnectionConfig) -> Result<Self, GatewayError> {
        let uri = parse_gateway_url(uri)?;
        if uri.host_str().is_none() {
            return Err(GatewayError::MissingHost);
        }

        Ok(Self {
            resume_uri: uri.clone(),
            uri,
            encoding: config.encoding,
            compress: config.compress,
            dispatch_handled: config.dispatch_handled,
            session_id: None,
            sequence: None,
            should_resume: Resumption::Unknown,
            attempts: 0,
            heartbeat: HeartbeatState::new(),
            ws: WsClient::new(),
            inflator: TransportInflator::new(),
            text_buffer: Vec::new(),
            bytes_buffer: Vec::new(),
            events: VecDeque::new(),
        })
    }

    /// The URI the connection was created with.
    pub fn uri(&self) -> &Url {
        &self.uri
    }

    /// The endpoint READY advertised for resuming, or the original URI.
    pub fn resume_uri(&self) -> &Url {
        &self.resume_uri
    }

    /// The configured wire encoding.
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// The active compression scheme.
    ///
    /// This can change from [`Compression::None`] to [`Compression::Payload`]
    /// when payload compression is requested through IDENTIFY.
    pub fn compression(&self) -> Compression {
        self.compress
    }

    /// Session id assigned by READY, if a session has been established.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// The last sequence number the server stamped on a payload.
    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    /// What the next connection should do about the current session.
    pub fn should_resume(&self) -> Resumption {
        self.should_resume
    }

    /// Reconnect attempts since the last successful READY or RESUMED.
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    /// Whether the last heartbeat sent has been acknowledged.
    pub fn acknowledged(&self) -> bool {
        self.heartbeat.is_acknowledged()
    }

    /// The heartbeat interval delivered by HELLO, to be used by the caller
    /// as its sleep duration.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat.interval()
    }

    /// Mean of the recent heartbeat round-trip times.
    pub fn latency(&self) -> Option<Duration> {
        self.heartbeat.latency()
    }

    /// Where the underlying WebSocket is in its lifecycle.
    pub fn state(&self) -> WsState {
        self.ws.state()
    }

    /// Whether a close handshake is in progress or complete.
    ///
    /// While this is true no heartbeat should be sent; skip it and sleep
    /// another interval instead.
    pub fn closing(&self) -> bool {
        matches!(
            self.ws.state(),
            WsState::LocalClosing | WsState::RemoteClosing | WsState::Closed
        )
    }

    /// The query parameters this library adds to the gateway URL.
    pub fn query_params(&self) -> String {
        let mut params = format!("v={GATEWAY_VERSION}&encoding={}", self.encoding.as_str());
        if self.compress == Compression::TransportStream {
            params.push_str("&compress=zlib-stream");
        }
        params
    }

    /// Host and port the caller should open a TCP socket to.
    pub fn destination(&self) -> Result<(String, u16), GatewayError> {
        let target = self.target_url();
        let host = target
            .host_str()
            .ok_or(GatewayError::MissingHost)?
            .to_string();
        let port = target.port_or_known_default().unwrap_or(443);
        Ok((host, port))
    }

    /// Generate the switching-protocols request that opens the WebSocket.
    ///
    /// Targets the resume endpoint when the previous connection decided to
    /// resume. The next step is to keep calling [`receive`](Self::receive)
    /// until HELLO arrives.
    pub fn connect(&self) -> Result<Vec<u8>, GatewayError> {
        let (host, port) = self.destination()?;
        let target = self.target_url();

        let mut request_target = target.path().to_string();
        if request_target.is_empty() {
            request_target.push('/');
        }
        request_target.push('?');
        if let Some(query) = target.query() {
            if !query.is_empty() {
                request_target.push_str(query);
                request_target.push('&');
            }
        }
        request_target.push_str(&self.query_params());
        if let Some(fragment) = target.fragment() {
            request_target.push('#');
            request_target.push_str(fragment);
        }

        debug!(%host, port, "sending websocket upgrade request");
        Ok(self.ws.upgrade_request(&host, port, &request_target))
    }

    /// Reinitialize for a new TCP socket.
    ///
    /// Everything scoped to the dead socket is reset; `session_id`,
    /// `sequence`, the resume endpoint and the resume decision are kept, as
    /// they describe the session rather than the socket. Returns the
    /// recommended backoff in seconds before reopening: zero for the first
    /// attempt, growing by two seconds per attempt until READY or RESUMED
    /// resets the counter.
    pub fn reconnect(&mut self) -> u64 {
        self.ws = WsClient::new();
        self.inflator.reset();
        self.text_buffer.clear();
        self.bytes_buffer.clear();
        self.heartbeat.reset();

        let backoff = 2 * self.attempts;
        self.attempts += 1;
        debug!(attempt = self.attempts, backoff_secs = backoff, "connection state reset");
        backoff
    }

    /// Feed bytes received from the socket.
    ///
    /// An empty `data` means "no new data, just pump buffered events" (and
    /// doubles as the end-of-stream signal while a rejection body is being
    /// collected). The returned byte blobs must be transmitted in order.
    ///
    /// # Errors
    ///
    /// Besides protocol violations, three structured signals surface here:
    /// [`GatewayError::Rejected`] when the server refuses the upgrade,
    /// [`GatewayError::RejectedData`] once the rejection body is complete,
    /// and [`GatewayError::Closing`] when the WebSocket is shutting down and
    /// the TCP socket should follow.
    pub fn receive(&mut self, data: &[u8]) -> Result<Vec<Vec<u8>>, GatewayError> {
        self.ws
            .receive_data(if data.is_empty() { None } else { Some(data) });

        let mut outgoing = Vec::new();

        while let Some(event) = self.ws.poll_event()? {
            match event {
                WsEvent::Open => trace!("websocket upgrade accepted"),

                WsEvent::Ping { data } => {
                    if self.ws.state() == WsState::Open {
                        outgoing.push(self.ws.send_pong(&data)?);
                    }
                }

                WsEvent::Pong => {}

                WsEvent::Reject { code, headers } => {
                    warn!(code, "websocket upgrade rejected");
                    return Err(GatewayError::Rejected { code, headers });
                }

                WsEvent::RejectData { data, finished } => {
                    self.bytes_buffer.extend_from_slice(&data);
                    if finished {
                        return Err(GatewayError::RejectedData {
                            data: mem::take(&mut self.bytes_buffer),
                        });
                    }
                }

                WsEvent::Close { code, reason } => {
                    return Err(self.arbitrate_close(code, reason)?);
                }

                WsEvent::Message {
                    data,
                    text,
                    finished,
                } => {
                    let payload = if text {
                        self.text_buffer.extend_from_slice(&data);
                        if !finished {
                            continue;
                        }
                        let raw = mem::take(&mut self.text_buffer);
                        serde_json::from_slice::<GatewayPayload>(&raw)?
                    } else {
                        self.bytes_buffer.extend_from_slice(&data);
                        if !finished {
                            continue;
                        }
                        let raw = mem::take(&mut self.bytes_buffer);
                        self.decode_binary(&raw)?
                    };

                    let (user_visible, response) = self.handle_payload(&payload)?;
                    if user_visible || self.dispatch_handled {
                        self.events.push_back(payload);
                    }
                    if let Some(bytes) = response {
                        outgoing.push(bytes);
                    }
                }
            }
        }

        Ok(outgoing)
    }

    /// Generate an acknowledging HEARTBEAT command.
    ///
    /// When the previous heartbeat was never acknowledged the connection is a
    /// ghost: instead of another heartbeat this returns a close frame with
    /// code 1008 and marks the session for resuming, as the documentation
    /// prescribes for a missed ACK.
    pub fn heartbeat(&mut self) -> Result<Vec<u8>, GatewayError> {
        self.heartbeat_frame(true)
    }

    fn heartbeat_frame(&mut self, acknowledge: bool) -> Result<Vec<u8>, GatewayError> {
        if acknowledge {
            if !self.heartbeat.is_acknowledged() {
                warn!("heartbeat was never acknowledged, closing to resume");
                self.should_resume = Resumption::Resume;
                return self.ws.send_close(1008, "");
            }
            self.heartbeat.mark_sent();
        }

        self.encode_command(OpCode::Heartbeat, json!(self.sequence))
    }

    /// Generate a close frame to tear the connection down locally.
    ///
    /// Codes 1000 and 1001 end the session, so the next connection must
    /// IDENTIFY; any other code keeps it alive for a RESUME. Keep calling
    /// [`receive`](Self::receive) afterwards until [`GatewayError::Closing`]
    /// says the TCP socket can be shut down.
    pub fn close(&mut self, code: u16) -> Result<Vec<u8>, GatewayError> {
        self.should_resume = if matches!(code, 1000 | 1001) {
            Resumption::Fresh
        } else {
            Resumption::Resume
        };
        debug!(code, "closing the websocket locally");
        self.ws.send_close(code, "")
    }

    /// Generate an IDENTIFY command starting a fresh session.
    ///
    /// Prefer [`resume`](Self::resume) when the previous session allows it;
    /// identifying is rate limited server-side.
    pub fn identify(&mut self, identify: &Identify) -> Result<Vec<u8>, GatewayError> {
        // Payload compression is negotiated here rather than in the URL, but
        // transport compression wins when both are configured.
        if identify.compress == Some(true) && self.compress == Compression::None {
            self.compress = Compression::Payload;
        }

        self.should_resume = Resumption::Unknown;
        let body = serde_json::to_value(identify)?;
        self.encode_command(OpCode::Identify, body)
    }

    /// Generate a RESUME command reattaching to the stored session.
    pub fn resume(&mut self, token: &str) -> Result<Vec<u8>, GatewayError> {
        let (session_id, sequence) = match (&self.session_id, self.sequence) {
            (Some(session_id), Some(sequence)) => (session_id.clone(), sequence),
            _ => return Err(GatewayError::NoSession),
        };

        self.should_resume = Resumption::Unknown;
        let body = json!({
            "token": token,
            "session_id": session_id,
            "seq": sequence,
        });
        self.encode_command(OpCode::Resume, body)
    }

    /// Generate a PRESENCE UPDATE command (op 3).
    pub fn update_presence(&mut self, presence: &UpdatePresence) -> Result<Vec<u8>, GatewayError> {
        let body = serde_json::to_value(presence)?;
        self.encode_command(OpCode::PresenceUpdate, body)
    }

    /// Generate a VOICE STATE UPDATE command (op 4).
    pub fn update_voice_state(
        &mut self,
        voice_state: &UpdateVoiceState,
    ) -> Result<Vec<u8>, GatewayError> {
        let body = serde_json::to_value(voice_state)?;
        self.encode_command(OpCode::VoiceStateUpdate, body)
    }

    /// Generate a REQUEST GUILD MEMBERS command (op 8).
    pub fn request_guild_members(
        &mut self,
        request: &RequestGuildMembers,
    ) -> Result<Vec<u8>, GatewayError> {
        let body = serde_json::to_value(request)?;
        self.encode_command(OpCode::RequestGuildMembers, body)
    }

    /// Drain the received payloads in arrival order.
    ///
    /// The iterator is finite; payloads received by later
    /// [`receive`](Self::receive) calls refill the queue.
    pub fn events(&mut self) -> impl Iterator<Item = GatewayPayload> + '_ {
        std::iter::from_fn(move || self.events.pop_front())
    }

    /// Remove and return the oldest received payload, if any.
    pub fn pop_event(&mut self) -> Option<GatewayPayload> {
        self.events.pop_front()
    }

    fn target_url(&self) -> &Url {
        if self.should_resume == Resumption::Resume {
            &self.resume_uri
        } else {
            &self.uri
        }
    }

    /// Decide what a close frame means and how to answer it.
    fn arbitrate_close(
        &mut self,
        code: Option<u16>,
        reason: Option<String>,
    ) -> Result<GatewayError, GatewayError> {
        if self.should_resume == Resumption::Unknown {
            // An unexplained close; resuming is the conservative choice.
            self.should_resume = Resumption::Resume;
        }

        if self.ws.state() == WsState::Closed {
            // We initiated the close and this was the peer's echo. Nothing
            // more to send; the socket can simply be shut down.
            debug!("close handshake complete");
            return Ok(GatewayError::Closing {
                data: None,
                code: None,
                reason: None,
            });
        }

        // The peer initiated; hand the caller the echo to transmit first.
        debug!(?code, "peer initiated the close handshake");
        let reply = self.ws.reply_close(code)?;
        Ok(GatewayError::Closing {
            data: Some(reply),
            code,
            reason,
        })
    }

    /// Apply the configured decompression and decoding to a finished binary
    /// message.
    fn decode_binary(&mut self, raw: &[u8]) -> Result<GatewayPayload, GatewayError> {
        let inflated;
        let body: &[u8] = match self.compress {
            Compression::TransportStream => {
                if raw.len() < ZLIB_SUFFIX.len() || raw[raw.len() - ZLIB_SUFFIX.len()..] != ZLIB_SUFFIX {
                    return Err(GatewayError::MissingZlibSuffix);
                }
                inflated = self.inflator.inflate(raw)?;
                &inflated
            }

            Compression::Payload => {
                if raw.len() >= ZLIB_SUFFIX.len() && raw[raw.len() - ZLIB_SUFFIX.len()..] == ZLIB_SUFFIX {
                    inflated = inflate_payload(raw)?;
                    &inflated
                } else {
                    raw
                }
            }

            Compression::None => {
                if self.encoding == Encoding::Json {
                    return Err(GatewayError::UnexpectedBinaryMessage);
                }
                raw
            }
        };

        match self.encoding {
            Encoding::Json => serde_json::from_slice(body).map_err(Into::into),
            Encoding::Etf => {
                let value = etf::unpack(body)?;
                serde_json::from_value(value)
                    .map_err(|source| GatewayError::EtfDecode(source.to_string()))
            }
        }
    }

    /// Run one inbound payload through the opcode dispatcher.
    ///
    /// Returns whether the payload is user-visible and any response bytes to
    /// queue for transmission.
    fn handle_payload(
        &mut self,
        payload: &GatewayPayload,
    ) -> Result<(bool, Option<Vec<u8>>), GatewayError> {
        if let Some(sequence) = payload.s {
            self.sequence = Some(sequence);
        }

        match OpCode::from_u8(payload.op) {
            Some(OpCode::Heartbeat) => {
                debug!("server requested an immediate heartbeat");
                Ok((false, Some(self.heartbeat_frame(false)?)))
            }

            Some(OpCode::HeartbeatAck) => {
                self.heartbeat.mark_acked();
                trace!(latency = ?self.heartbeat.latency(), "heartbeat acknowledged");
                Ok((false, None))
            }

            Some(OpCode::Hello) => {
                let hello: Hello = serde_json::from_value(payload.d.clone())?;
                self.heartbeat
                    .set_interval(Duration::from_millis(hello.heartbeat_interval));
                debug!(interval_ms = hello.heartbeat_interval, "received hello");
                Ok((true, None))
            }

            Some(OpCode::Dispatch) => {
                self.handle_dispatch(payload)?;
                Ok((true, None))
            }

            Some(OpCode::Reconnect) => {
                debug!("server requested a reconnect");
                self.should_resume = Resumption::Resume;
                Ok((false, Some(self.ws.send_close(1012, "")?)))
            }

            Some(OpCode::InvalidSession) => {
                let resumable = payload.d.as_bool().unwrap_or(false);
                warn!(resumable, "session invalidated by the server");
                self.should_resume = if resumable {
                    Resumption::Resume
                } else {
                    Resumption::Fresh
                };
                Ok((false, Some(self.ws.send_close(1012, "")?)))
            }

            // Unknown opcodes belong to the user.
            _ => Ok((true, None)),
        }
    }

    fn handle_dispatch(&mut self, payload: &GatewayPayload) -> Result<(), GatewayError> {
        match payload.t.as_deref() {
            Some("READY") => {
                let ready: Ready = serde_json::from_value(payload.d.clone())?;
                if let Some(resume_url) = &ready.resume_gateway_url {
                    self.resume_uri = parse_gateway_url(resume_url)?;
                }
                debug!(session_id = %ready.session_id, "session established");
                self.session_id = Some(ready.session_id);
                self.attempts = 0;
            }

            Some("RESUMED") => {
                debug!("session resumed");
                self.attempts = 0;
            }

            _ => {}
        }

        Ok(())
    }

    /// Wrap a command body in the envelope and frame it per the encoding.
    fn encode_command(&mut self, op: OpCode, body: Value) -> Result<Vec<u8>, GatewayError> {
        let envelope = json!({ "op": op, "d": body });

        match self.encoding {
            Encoding::Json => {
                let text = serde_json::to_string(&envelope)?;
                self.ws.send_text(&text)
            }
            Encoding::Etf => {
                let packed = etf::pack(&envelope)?;
                self.ws.send_binary(&packed)
            }
        }
    }
}

fn parse_gateway_url(input: &str) -> Result<Url, GatewayError> {
    match Url::parse(input) {
        Ok(url) => Ok(url),
        // Tolerate a bare host; the gateway is always reached over wss.
        Err(url::ParseError::RelativeUrlWithoutBase) => Ok(Url::parse(&format!("wss://{input}"))?),
        Err(source) => Err(source.into()),
    }
}
