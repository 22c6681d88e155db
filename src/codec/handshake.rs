//! WebSocket opening handshake (RFC 6455 §4.2).

use base64::prelude::*;
use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};

use crate::ensure;
use crate::protocol::{HttpRequest, ParseError};

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Derives the `Sec-WebSocket-Accept` value from the client's
/// `Sec-WebSocket-Key` header.
pub fn accept_key(client_key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(client_key.trim().as_bytes());
    sha1.update(WS_GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

/// Validates an upgrade request and returns the client key.
///
/// Required: `GET` method, `Upgrade: websocket`, `Connection: Upgrade`, and a
/// non-empty `Sec-WebSocket-Key`.
pub fn validate_upgrade(request: &HttpRequest) -> Result<&str, ParseError> {
    ensure!(request.method() == http::Method::GET, ParseError::invalid_handshake("upgrade requires GET"));
    ensure!(request.is_websocket_upgrade(), ParseError::invalid_handshake("missing upgrade headers"));

    let key = request
        .header("sec-websocket-key")
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .ok_or_else(|| ParseError::invalid_handshake("missing Sec-WebSocket-Key"))?;

    Ok(key)
}

/// Renders the `101 Switching Protocols` response completing the handshake.
pub fn upgrade_response(client_key: &str) -> Bytes {
    let accept = accept_key(client_key);

    let mut dst = BytesMut::with_capacity(128 + accept.len());
    dst.put_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    dst.put_slice(b"Upgrade: websocket\r\n");
    dst.put_slice(b"Connection: Upgrade\r\n");
    dst.put_slice(b"Sec-WebSocket-Accept: ");
    dst.put_slice(accept.as_bytes());
    dst.put_slice(b"\r\n\r\n");
    dst.freeze()
}
