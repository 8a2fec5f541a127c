//! WebSocket opening handshake (RFC 6455 §4).
//!
//! Builds the HTTP/1.1 Upgrade request and validates the 101 response,
//! including the `Sec-WebSocket-Accept` derivation.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};

use crate::client::request::serialize_head;
use crate::error::{Error, Result};
use crate::http::{Headers, Method, ResponseHead, USER_AGENT};
use crate::url::Url;

/// The GUID appended to the nonce for the accept derivation.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// A fresh `Sec-WebSocket-Key`: 16 random bytes, base64-encoded.
pub fn nonce() -> String {
    let bytes: [u8; 16] = rand::random();
    BASE64.encode(bytes)
}

/// Derive the expected `Sec-WebSocket-Accept` for a key.
pub fn accept_key(key: &str) -> String {
    let digest = Sha1::digest(format!("{}{}", key, WS_GUID).as_bytes());
    BASE64.encode(digest)
}

/// Serialize the Upgrade request for a WebSocket URL.
///
/// Caller headers ride along but cannot displace the handshake fields
/// themselves.
pub fn build_upgrade_request(
    url: &Url,
    key: &str,
    extra_headers: &Headers,
    subprotocols: &[String],
) -> Result<Vec<u8>> {
    let mut headers = extra_headers.clone();
    headers.set("Host", url.host_header())?;
    headers.set("Upgrade", "websocket")?;
    headers.set("Connection", "Upgrade")?;
    headers.set("Sec-WebSocket-Key", key)?;
    headers.set("Sec-WebSocket-Version", "13")?;
    headers.set_if_absent("User-Agent", USER_AGENT)?;
    if !subprotocols.is_empty() {
        headers.set("Sec-WebSocket-Protocol", subprotocols.join(", "))?;
    }

    Ok(serialize_head(Method::Get, url, &headers))
}

/// Validate the server's handshake response.
///
/// Returns the negotiated subprotocol, if the server picked one.
pub fn validate_upgrade_response(
    head: &ResponseHead,
    key: &str,
    subprotocols: &[String],
) -> Result<Option<String>> {
    if head.status != 101 {
        return Err(Error::WebSocket(format!(
            "handshake failed with status {}",
            head.status
        )));
    }

    let expected = accept_key(key);
    match head.headers.get("Sec-WebSocket-Accept") {
        Some(actual) if actual == expected => {}
        Some(actual) => {
            return Err(Error::WebSocket(format!(
                "Sec-WebSocket-Accept mismatch: expected {}, got {}",
                expected, actual
            )))
        }
        None => {
            return Err(Error::WebSocket(
                "missing Sec-WebSocket-Accept header".to_string(),
            ))
        }
    }

    match head.headers.get("Sec-WebSocket-Protocol") {
        Some(proto) => {
            let proto = proto.trim();
            if !subprotocols.iter().any(|p| p == proto) {
                return Err(Error::WebSocket(format!(
                    "server selected unrequested subprotocol {}",
                    proto
                )));
            }
            Ok(Some(proto.to_string()))
        }
        None => Ok(None),
    }
}
