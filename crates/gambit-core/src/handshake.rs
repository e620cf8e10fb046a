//! HTTP upgrade handshake (RFC 6455 Section 4, server side).
//!
//! The relay upgrades a connection only when the request targets the
//! game endpoint and carries a `Sec-WebSocket-Key`; anything else is
//! dropped without a 101. The accept value derivation is fixed by the
//! protocol: SHA-1 over the client key concatenated with a well-known
//! GUID, then base64.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::http::Request;

/// Protocol-defined GUID appended to the client key before hashing.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Why an inbound request was not upgraded. Each of these drops the
/// connection before it ever reaches the open state.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Request path is not the game endpoint.
    #[error("request for {0:?} is not the game endpoint")]
    WrongEndpoint(String),
    /// Upgrade request without a `Sec-WebSocket-Key` header.
    #[error("upgrade request is missing the Sec-WebSocket-Key header")]
    MissingKey,
}

/// Derive the `Sec-WebSocket-Accept` value for a client key.
#[must_use]
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Extract the client's upgrade key from a request for `endpoint`.
///
/// This is the whole collaborator contract the relay needs from HTTP:
/// whether the request is a protocol upgrade for the game endpoint and,
/// if so, which key to answer.
pub fn upgrade_key<'r>(request: &'r Request, endpoint: &str) -> Result<&'r str, HandshakeError> {
    if request.target() != endpoint {
        return Err(HandshakeError::WrongEndpoint(request.target().to_owned()));
    }
    request
        .header("Sec-WebSocket-Key")
        .ok_or(HandshakeError::MissingKey)
}

/// The one-and-only upgrade response, sent verbatim once per connection.
#[must_use]
pub fn switching_protocols(accept: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\
         \r\n"
    )
}
