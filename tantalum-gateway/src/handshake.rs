//! HTTP/1.1 upgrade handshake for the gateway WebSocket.
//!
//! Generates the switching-protocols request and parses the server's answer.
//! An accepted upgrade must echo the request nonce through the
//! `Sec-WebSocket-Accept` digest; anything other than a 101 is captured as a
//! rejection with its status, headers and (via `Content-Length`) body size.

use base64::Engine;
use sha1::{Digest, Sha1};

use crate::error::GatewayError;

/// Fixed GUID appended to the nonce for the accept digest (RFC 6455 §4.2.2).
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on response headers we are willing to parse.
const MAX_HEADERS: usize = 64;

/// Generate a random `Sec-WebSocket-Key` nonce.
pub(crate) fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    base64::engine::general_purpose::STANDARD.encode(nonce)
}

/// The `Sec-WebSocket-Accept` value a compliant server must answer with.
pub(crate) fn accept_key(key: &str) -> String {
    let mut digest = Sha1::new();
    digest.update(key.as_bytes());
    digest.update(WEBSOCKET_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(digest.finalize())
}

/// Build the upgrade request for `target` on `host`.
pub(crate) fn build_request(host: &str, port: u16, target: &str, key: &str) -> Vec<u8> {
    let mut host_header = host.to_string();
    if port != 443 {
        host_header.push_str(&format!(":{port}"));
    }

    format!(
        "GET {target} HTTP/1.1\r\n\
         Host: {host_header}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n"
    )
    .into_bytes()
}

/// Outcome of parsing the buffered upgrade response so far.
#[derive(Debug)]
pub(crate) enum Response {
    /// The status line and headers have not fully arrived yet.
    Incomplete,
    /// The upgrade was accepted; `consumed` bytes of header can be dropped.
    Accepted { consumed: usize },
    /// The upgrade was refused.
    Rejected {
        consumed: usize,
        code: u16,
        headers: Vec<(String, Vec<u8>)>,
        /// Declared body length, when the server sent one.
        content_length: Option<usize>,
    },
}

/// Parse the upgrade response at the front of `buffer`.
pub(crate) fn parse_response(buffer: &[u8], key: &str) -> Result<Response, GatewayError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);

    let consumed = match response
        .parse(buffer)
        .map_err(|source| GatewayError::Handshake(source.to_string()))?
    {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(Response::Incomplete),
    };

    let code = response
        .code
        .ok_or_else(|| GatewayError::Handshake("response missing a status code".to_string()))?;

    if code != 101 {
        let mut collected = Vec::with_capacity(response.headers.len());
        let mut content_length = None;

        for header in response.headers.iter() {
            if header.name.eq_ignore_ascii_case("content-length") {
                content_length = std::str::from_utf8(header.value)
                    .ok()
                    .and_then(|value| value.trim().parse().ok());
            }
            collected.push((header.name.to_string(), header.value.to_vec()));
        }

        return Ok(Response::Rejected {
            consumed,
            code,
            headers: collected,
            content_length,
        });
    }

    let accept = response
        .headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case("sec-websocket-accept"))
        .ok_or_else(|| {
            GatewayError::Handshake("101 response without Sec-WebSocket-Accept".to_string())
        })?;

    if accept.value != accept_key(key).as_bytes() {
        return Err(GatewayError::Handshake(
            "Sec-WebSocket-Accept does not match the sent nonce".to_string(),
        ));
    }

    Ok(Response::Accepted { consumed })
}
