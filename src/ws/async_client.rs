//! Async WebSocket client.
//!
//! Twin of the blocking [`WebSocket`](super::client::WebSocket) on tokio
//! I/O, with the same frame validation, control-frame policy, and
//! reconnect behavior.

use tracing::debug;

use super::frame::{
    self, encode_close_payload, encode_frame, parse_frame_header, FrameHeader, Opcode,
    MAX_CONTROL_PAYLOAD,
};
use super::{handshake, Message, ReconnectPolicy, WebSocketBuilder, WsState};
use crate::error::{Error, Result};
use crate::http::{HeadParser, Headers, Limits};
use crate::timing::{Deadline, Timeout};
use crate::transport::AsyncConnection;
use crate::url::Url;

/// Async WebSocket client.
pub struct AsyncWebSocket {
    url: Url,
    headers: Headers,
    subprotocols: Vec<String>,
    timeout: Timeout,
    max_frame_size: usize,
    reconnect: ReconnectPolicy,
    conn: Option<AsyncConnection>,
    buf: Vec<u8>,
    state: WsState,
    protocol: Option<String>,
}

impl AsyncWebSocket {
    pub(crate) fn from_builder(builder: WebSocketBuilder, url: Url) -> Self {
        let (headers, subprotocols, timeout, max_frame_size, reconnect) = builder.into_parts();
        AsyncWebSocket {
            url,
            headers,
            subprotocols,
            timeout,
            max_frame_size,
            reconnect,
            conn: None,
            buf: Vec::new(),
            state: WsState::Closed,
            protocol: None,
        }
    }

    pub fn state(&self) -> WsState {
        self.state
    }

    /// The subprotocol the server selected, if any.
    pub fn subprotocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Open the connection and perform the upgrade handshake.
    pub async fn connect(&mut self) -> Result<()> {
        if self.state == WsState::Open {
            return Ok(());
        }
        self.state = WsState::Connecting;

        let deadline = Deadline::start(self.timeout.total);
        let mut conn = AsyncConnection::open(self.url.origin(), &self.timeout, &deadline).await?;

        let key = handshake::nonce();
        let request =
            handshake::build_upgrade_request(&self.url, &key, &self.headers, &self.subprotocols)?;
        conn.write_all(&request, &self.timeout, &deadline).await?;

        let mut parser = HeadParser::new(Limits::default());
        let mut chunk = [0u8; 4096];
        let (head, leftover) = loop {
            let n = conn.read_some(&mut chunk, &self.timeout, &deadline).await?;
            if n == 0 {
                self.state = WsState::Closed;
                return Err(Error::WebSocket(
                    "connection closed during handshake".to_string(),
                ));
            }
            if let Some(parsed) = parser
                .feed(&chunk[..n])
                .map_err(|e| Error::WebSocket(e.to_string()))?
            {
                break parsed;
            }
        };

        match handshake::validate_upgrade_response(&head, &key, &self.subprotocols) {
            Ok(protocol) => {
                self.buf = leftover;
                self.protocol = protocol;
                self.conn = Some(conn);
                self.state = WsState::Open;
                Ok(())
            }
            Err(e) => {
                conn.close().await;
                self.state = WsState::Closed;
                Err(e)
            }
        }
    }

    /// Send one complete message.
    pub async fn send(&mut self, message: impl Into<Message>) -> Result<()> {
        let message = message.into();
        self.ensure_open()?;

        let (opcode, payload) = match message {
            Message::Text(s) => (Opcode::Text, s.into_bytes()),
            Message::Binary(b) => (Opcode::Binary, b),
        };
        let wire = encode_frame(opcode, &payload, true, true);

        let mut attempt = 0u32;
        loop {
            match self.write_wire(&wire).await {
                Ok(()) => return Ok(()),
                Err(e) if self.should_reconnect(&e, attempt) => {
                    attempt = self.backoff_and_reattach(attempt).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Receive the next message. Control frames never surface here.
    pub async fn recv(&mut self) -> Result<Message> {
        self.ensure_open()?;

        let mut attempt = 0u32;
        loop {
            match self.recv_message().await {
                Ok(message) => return Ok(message),
                Err(e) if self.should_reconnect(&e, attempt) => {
                    attempt = self.backoff_and_reattach(attempt).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Send a ping. Payloads over 125 bytes are rejected.
    pub async fn ping(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(Error::WebSocket(format!(
                "ping payload of {} bytes exceeds {}",
                payload.len(),
                MAX_CONTROL_PAYLOAD
            )));
        }
        self.ensure_open()?;
        let wire = encode_frame(Opcode::Ping, payload, true, true);
        self.write_wire(&wire).await
    }

    /// Close the connection, sending a close frame best-effort. Idempotent.
    pub async fn close(&mut self, code: Option<u16>, reason: Option<&str>) -> Result<()> {
        if matches!(self.state, WsState::Closed) {
            return Ok(());
        }
        self.state = WsState::Closing;

        let payload = match code {
            Some(c) => encode_close_payload(c, reason.unwrap_or("")),
            None => Vec::new(),
        };
        let wire = encode_frame(Opcode::Close, &payload, true, true);
        let _ = self.write_wire(&wire).await;

        if let Some(mut conn) = self.conn.take() {
            conn.close().await;
        }
        self.buf.clear();
        self.state = WsState::Closed;
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            WsState::Open => Ok(()),
            _ => Err(Error::WebSocket("websocket is not connected".to_string())),
        }
    }

    fn should_reconnect(&self, e: &Error, attempt: u32) -> bool {
        self.reconnect.auto_reconnect
            && e.is_network()
            && !matches!(self.state, WsState::Closed | WsState::Closing)
            && attempt < self.reconnect.max_attempts
    }

    async fn backoff_and_reattach(&mut self, attempt: u32) -> Result<u32> {
        let delay = self.reconnect.base_delay * 2u32.saturating_pow(attempt);
        let attempt = attempt + 1;
        debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
        tokio::time::sleep(delay).await;

        if let Err(e) = self.reattach().await {
            if attempt >= self.reconnect.max_attempts {
                return Err(e);
            }
        }
        Ok(attempt)
    }

    async fn reattach(&mut self) -> Result<()> {
        self.drop_connection();
        self.state = WsState::Connecting;
        self.connect().await
    }

    async fn write_wire(&mut self, wire: &[u8]) -> Result<()> {
        let deadline = Deadline::start(self.timeout.total);
        let timeout = self.timeout;
        let conn = self.conn.as_mut().ok_or(Error::ConnectionClosed)?;
        conn.write_all(wire, &timeout, &deadline).await
    }

    async fn recv_message(&mut self) -> Result<Message> {
        let deadline = Deadline::start(self.timeout.total);
        let mut fragments: Vec<u8> = Vec::new();
        let mut fragment_opcode: Option<Opcode> = None;

        loop {
            let (header, payload) = self.read_frame(&deadline).await?;

            match header.opcode {
                Opcode::Ping => {
                    let wire = encode_frame(Opcode::Pong, &payload, true, true);
                    self.write_wire(&wire).await?;
                }
                Opcode::Pong => {}
                Opcode::Close => {
                    self.state = WsState::Closing;
                    let wire = encode_frame(Opcode::Close, &payload, true, true);
                    let _ = self.write_wire(&wire).await;
                    if let Some(mut conn) = self.conn.take() {
                        conn.close().await;
                    }
                    self.state = WsState::Closed;
                    return Err(Error::ConnectionClosed);
                }
                Opcode::Text | Opcode::Binary => {
                    if fragment_opcode.is_some() {
                        return self
                            .fail_protocol("data frame inside a fragmented message")
                            .await;
                    }
                    if header.fin {
                        return super::client::decode_message(header.opcode, payload);
                    }
                    fragment_opcode = Some(header.opcode);
                    fragments = payload;
                }
                Opcode::Continuation => {
                    let Some(opcode) = fragment_opcode else {
                        return self
                            .fail_protocol("continuation without a first fragment")
                            .await;
                    };
                    fragments.extend_from_slice(&payload);
                    if header.fin {
                        return super::client::decode_message(opcode, fragments);
                    }
                }
            }
        }
    }

    async fn read_frame(&mut self, deadline: &Deadline) -> Result<(FrameHeader, Vec<u8>)> {
        loop {
            match parse_frame_header(&self.buf)? {
                Some(header) => {
                    self.validate_header(&header).await?;

                    let total = header.header_len + header.payload_len as usize;
                    while self.buf.len() < total {
                        self.read_more(deadline).await?;
                    }

                    let frame: Vec<u8> = self.buf.drain(..total).collect();
                    let payload = frame[header.header_len..].to_vec();
                    return Ok((header, payload));
                }
                None => self.read_more(deadline).await?,
            }
        }
    }

    async fn validate_header(&mut self, header: &FrameHeader) -> Result<()> {
        if header.masked {
            return self.fail_protocol("server frames must not be masked").await;
        }
        if header.rsv != 0 {
            return self
                .fail_protocol("reserved bits set without negotiated extension")
                .await;
        }
        if header.opcode.is_control() {
            if !header.fin {
                return self.fail_protocol("fragmented control frame").await;
            }
            if header.payload_len > MAX_CONTROL_PAYLOAD as u64 {
                return self
                    .fail_protocol("control frame payload over 125 bytes")
                    .await;
            }
        }
        if header.payload_len > self.max_frame_size as u64 {
            let close = encode_frame(
                Opcode::Close,
                &encode_close_payload(frame::CLOSE_TOO_LARGE, "frame too large"),
                true,
                true,
            );
            let _ = self.write_wire(&close).await;
            let limit = self.max_frame_size;
            self.drop_connection();
            return Err(Error::WebSocket(format!(
                "frame of {} bytes exceeds the {} byte limit",
                header.payload_len, limit
            )));
        }
        Ok(())
    }

    async fn read_more(&mut self, deadline: &Deadline) -> Result<()> {
        let timeout = self.timeout;
        let conn = self.conn.as_mut().ok_or(Error::ConnectionClosed)?;
        let mut chunk = [0u8; 4096];
        let n = conn.read_some(&mut chunk, &timeout, deadline).await?;
        if n == 0 {
            self.drop_connection();
            return Err(Error::ConnectionClosed);
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    async fn fail_protocol<T>(&mut self, message: &str) -> Result<T> {
        let close = encode_frame(
            Opcode::Close,
            &encode_close_payload(frame::CLOSE_PROTOCOL_ERROR, message),
            true,
            true,
        );
        let _ = self.write_wire(&close).await;
        self.drop_connection();
        Err(Error::WebSocket(message.to_string()))
    }

    fn drop_connection(&mut self) {
        // Dropping the connection closes the socket
        self.conn = None;
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::WebSocketBuilder;

    #[tokio::test]
    async fn test_send_requires_connection() {
        let mut ws = WebSocketBuilder::for_url("ws://a.example/ws")
            .build_async()
            .unwrap();
        assert!(matches!(ws.send("hello").await, Err(Error::WebSocket(_))));
        assert!(matches!(ws.recv().await, Err(Error::WebSocket(_))));
        assert_eq!(ws.state(), WsState::Closed);
    }

    #[tokio::test]
    async fn test_close_when_never_connected() {
        let mut ws = WebSocketBuilder::for_url("ws://a.example/ws")
            .build_async()
            .unwrap();
        ws.close(None, None).await.unwrap();
        ws.close(Some(1000), Some("again")).await.unwrap();
    }
}
