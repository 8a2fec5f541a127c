//! WebSocket client (RFC 6455).
//!
//! The handshake runs over the same transport layer as HTTP; the upgraded
//! connection then belongs to the WebSocket client alone. Blocking and
//! async twins share the frame codec and handshake logic.

pub mod async_client;
pub mod client;
pub mod frame;
pub mod handshake;

pub use async_client::AsyncWebSocket;
pub use client::WebSocket;
pub use frame::{Opcode, CLOSE_GOING_AWAY, CLOSE_NORMAL, CLOSE_PROTOCOL_ERROR, CLOSE_TOO_LARGE};

use std::time::Duration;

use crate::error::{Error, Result};
use crate::http::Headers;
use crate::timing::Timeout;
use crate::url::Url;

/// Default cap on a single frame's payload.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1_048_576;

/// An application-level WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

impl Message {
    /// The raw payload bytes.
    pub fn into_data(self) -> Vec<u8> {
        match self {
            Message::Text(s) => s.into_bytes(),
            Message::Binary(b) => b,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(s) => Some(s),
            Message::Binary(_) => None,
        }
    }
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Message::Text(s.to_string())
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Message::Text(s)
    }
}

impl From<Vec<u8>> for Message {
    fn from(b: Vec<u8>) -> Self {
        Message::Binary(b)
    }
}

impl From<&[u8]> for Message {
    fn from(b: &[u8]) -> Self {
        Message::Binary(b.to_vec())
    }
}

/// WebSocket connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Reconnect policy for unexpected drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub auto_reconnect: bool,
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            auto_reconnect: false,
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

/// Builder shared by both WebSocket clients.
///
/// Produced by the session `websocket()` factories with the session's
/// headers pre-merged; finish with [`build`](Self::build) for the blocking
/// client or [`build_async`](Self::build_async) for the async one.
pub struct WebSocketBuilder {
    url: String,
    headers: Headers,
    subprotocols: Vec<String>,
    timeout: Timeout,
    max_frame_size: usize,
    reconnect: ReconnectPolicy,
    pending_err: Option<Error>,
}

impl WebSocketBuilder {
    pub(crate) fn new(url: &str, headers: Headers, timeout: Timeout) -> Self {
        WebSocketBuilder {
            url: url.to_string(),
            headers,
            subprotocols: Vec::new(),
            timeout,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            reconnect: ReconnectPolicy::default(),
            pending_err: None,
        }
    }

    /// Build a standalone WebSocket without a session.
    pub fn for_url(url: &str) -> Self {
        Self::new(url, Headers::new(), Timeout::default())
    }

    /// Add a handshake header, overriding any session value.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let Err(e) = self.headers.set(name, value) {
            self.pending_err.get_or_insert(e);
        }
        self
    }

    /// Request these subprotocols, in preference order.
    pub fn subprotocols(mut self, protocols: &[&str]) -> Self {
        self.subprotocols = protocols.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn timeout(mut self, timeout: Timeout) -> Self {
        self.timeout = timeout;
        self
    }

    /// Cap on a single received frame's payload.
    pub fn max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    /// Reconnect automatically after unexpected drops.
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.reconnect.auto_reconnect = enabled;
        self
    }

    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.reconnect.max_attempts = attempts;
        self
    }

    /// Base delay for the exponential reconnect backoff.
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect.base_delay = delay;
        self
    }

    fn parse_ws_url(&self) -> Result<Url> {
        if let Some(e) = &self.pending_err {
            return Err(Error::InvalidHeader(e.to_string()));
        }
        let url = Url::parse(&self.url)?;
        if url.scheme().is_http() {
            return Err(Error::InvalidRequest(format!(
                "{} is not a WebSocket URL; expected ws or wss",
                url
            )));
        }
        Ok(url)
    }

    /// Finish as a blocking client. Not yet connected.
    pub fn build(self) -> Result<WebSocket> {
        let url = self.parse_ws_url()?;
        Ok(WebSocket::from_builder(self, url))
    }

    /// Finish as an async client. Not yet connected.
    pub fn build_async(self) -> Result<AsyncWebSocket> {
        let url = self.parse_ws_url()?;
        Ok(AsyncWebSocket::from_builder(self, url))
    }

    pub(crate) fn into_parts(
        self,
    ) -> (Headers, Vec<String>, Timeout, usize, ReconnectPolicy) {
        (
            self.headers,
            self.subprotocols,
            self.timeout,
            self.max_frame_size,
            self.reconnect,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_conversions() {
        assert_eq!(Message::from("hi"), Message::Text("hi".to_string()));
        assert_eq!(
            Message::from(vec![1u8, 2]),
            Message::Binary(vec![1, 2])
        );
        assert_eq!(Message::from("hi").into_data(), b"hi".to_vec());
        assert_eq!(Message::from("hi").as_text(), Some("hi"));
        assert_eq!(Message::from(vec![1u8]).as_text(), None);
    }

    #[test]
    fn test_builder_rejects_http_url() {
        assert!(WebSocketBuilder::for_url("http://a.example/").build().is_err());
        assert!(WebSocketBuilder::for_url("ws://a.example/").build().is_ok());
        assert!(WebSocketBuilder::for_url("wss://a.example/").build().is_ok());
    }

    #[test]
    fn test_reconnect_policy_defaults() {
        let policy = ReconnectPolicy::default();
        assert!(!policy.auto_reconnect);
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
    }
}
