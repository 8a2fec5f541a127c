//! Blocking WebSocket client.
//!
//! Owns one upgraded [`Connection`]. Control frames are handled inside
//! `recv`: pings are answered, pongs are skipped, and a peer close is
//! echoed before surfacing as [`Error::ConnectionClosed`]. Unexpected
//! drops can trigger an exponential-backoff reconnect.

use tracing::debug;

use super::frame::{
    self, encode_close_payload, encode_frame, parse_frame_header, FrameHeader, Opcode,
    MAX_CONTROL_PAYLOAD,
};
use super::{handshake, Message, ReconnectPolicy, WebSocketBuilder, WsState};
use crate::error::{Error, Result};
use crate::http::{HeadParser, Headers, Limits};
use crate::timing::{Deadline, Timeout};
use crate::transport::Connection;
use crate::url::Url;

/// Blocking WebSocket client.
pub struct WebSocket {
    url: Url,
    headers: Headers,
    subprotocols: Vec<String>,
    timeout: Timeout,
    max_frame_size: usize,
    reconnect: ReconnectPolicy,
    conn: Option<Connection>,
    buf: Vec<u8>,
    state: WsState,
    protocol: Option<String>,
}

impl WebSocket {
    pub(crate) fn from_builder(builder: WebSocketBuilder, url: Url) -> Self {
        let (headers, subprotocols, timeout, max_frame_size, reconnect) = builder.into_parts();
        WebSocket {
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
    pub fn connect(&mut self) -> Result<()> {
        if self.state == WsState::Open {
            return Ok(());
        }
        self.state = WsState::Connecting;

        let deadline = Deadline::start(self.timeout.total);
        let mut conn = Connection::open(self.url.origin(), &self.timeout, &deadline)?;

        let key = handshake::nonce();
        let request =
            handshake::build_upgrade_request(&self.url, &key, &self.headers, &self.subprotocols)?;
        conn.write_all(&request, &self.timeout, &deadline)?;

        let mut parser = HeadParser::new(Limits::default());
        let mut chunk = [0u8; 4096];
        let (head, leftover) = loop {
            let n = conn.read_some(&mut chunk, &self.timeout, &deadline)?;
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
                // Frame bytes may have ridden in behind the 101
                self.buf = leftover;
                self.protocol = protocol;
                self.conn = Some(conn);
                self.state = WsState::Open;
                Ok(())
            }
            Err(e) => {
                conn.close();
                self.state = WsState::Closed;
                Err(e)
            }
        }
    }

    /// Send one complete message.
    pub fn send(&mut self, message: impl Into<Message>) -> Result<()> {
        let message = message.into();
        self.ensure_open()?;

        let (opcode, payload) = match message {
            Message::Text(s) => (Opcode::Text, s.into_bytes()),
            Message::Binary(b) => (Opcode::Binary, b),
        };
        let wire = encode_frame(opcode, &payload, true, true);

        self.with_reconnect(|ws| ws.write_wire(&wire))
    }

    /// Receive the next message.
    ///
    /// Fragmented messages are reassembled; control frames never surface
    /// here. Returns [`Error::ConnectionClosed`] after a peer close.
    pub fn recv(&mut self) -> Result<Message> {
        self.ensure_open()?;
        self.with_reconnect(|ws| ws.recv_message())
    }

    /// Send a ping. Payloads over 125 bytes are rejected.
    pub fn ping(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(Error::WebSocket(format!(
                "ping payload of {} bytes exceeds {}",
                payload.len(),
                MAX_CONTROL_PAYLOAD
            )));
        }
        self.ensure_open()?;
        let wire = encode_frame(Opcode::Ping, payload, true, true);
        self.write_wire(&wire)
    }

    /// Close the connection, sending a close frame best-effort.
    ///
    /// Idempotent; a clean close never triggers reconnection.
    pub fn close(&mut self, code: Option<u16>, reason: Option<&str>) -> Result<()> {
        if matches!(self.state, WsState::Closed) {
            return Ok(());
        }
        self.state = WsState::Closing;

        let payload = match code {
            Some(c) => encode_close_payload(c, reason.unwrap_or("")),
            None => Vec::new(),
        };
        let wire = encode_frame(Opcode::Close, &payload, true, true);
        let _ = self.write_wire(&wire);

        if let Some(mut conn) = self.conn.take() {
            conn.close();
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

    fn write_wire(&mut self, wire: &[u8]) -> Result<()> {
        let deadline = Deadline::start(self.timeout.total);
        let timeout = self.timeout;
        let conn = self.conn.as_mut().ok_or(Error::ConnectionClosed)?;
        conn.write_all(wire, &timeout, &deadline)
    }

    fn recv_message(&mut self) -> Result<Message> {
        let deadline = Deadline::start(self.timeout.total);
        let mut fragments: Vec<u8> = Vec::new();
        let mut fragment_opcode: Option<Opcode> = None;

        loop {
            let (header, payload) = self.read_frame(&deadline)?;

            match header.opcode {
                Opcode::Ping => {
                    let wire = encode_frame(Opcode::Pong, &payload, true, true);
                    self.write_wire(&wire)?;
                }
                Opcode::Pong => {}
                Opcode::Close => {
                    self.state = WsState::Closing;
                    let wire = encode_frame(Opcode::Close, &payload, true, true);
                    let _ = self.write_wire(&wire);
                    if let Some(mut conn) = self.conn.take() {
                        conn.close();
                    }
                    self.state = WsState::Closed;
                    return Err(Error::ConnectionClosed);
                }
                Opcode::Text | Opcode::Binary => {
                    if fragment_opcode.is_some() {
                        return self.fail_protocol("data frame inside a fragmented message");
                    }
                    if header.fin {
                        return decode_message(header.opcode, payload);
                    }
                    fragment_opcode = Some(header.opcode);
                    fragments = payload;
                }
                Opcode::Continuation => {
                    let Some(opcode) = fragment_opcode else {
                        return self.fail_protocol("continuation without a first fragment");
                    };
                    fragments.extend_from_slice(&payload);
                    if header.fin {
                        return decode_message(opcode, fragments);
                    }
                }
            }
        }
    }

    fn read_frame(&mut self, deadline: &Deadline) -> Result<(FrameHeader, Vec<u8>)> {
        loop {
            match parse_frame_header(&self.buf)? {
                Some(header) => {
                    self.validate_header(&header)?;

                    let total = header.header_len + header.payload_len as usize;
                    while self.buf.len() < total {
                        self.read_more(deadline)?;
                    }

                    let frame: Vec<u8> = self.buf.drain(..total).collect();
                    let payload = frame[header.header_len..].to_vec();
                    return Ok((header, payload));
                }
                None => self.read_more(deadline)?,
            }
        }
    }

    fn validate_header(&mut self, header: &FrameHeader) -> Result<()> {
        if header.masked {
            return self.fail_protocol("server frames must not be masked");
        }
        if header.rsv != 0 {
            return self.fail_protocol("reserved bits set without negotiated extension");
        }
        if header.opcode.is_control() {
            if !header.fin {
                return self.fail_protocol("fragmented control frame");
            }
            if header.payload_len > MAX_CONTROL_PAYLOAD as u64 {
                return self.fail_protocol("control frame payload over 125 bytes");
            }
        }
        if header.payload_len > self.max_frame_size as u64 {
            let close = encode_frame(
                Opcode::Close,
                &encode_close_payload(frame::CLOSE_TOO_LARGE, "frame too large"),
                true,
                true,
            );
            let _ = self.write_wire(&close);
            let limit = self.max_frame_size;
            self.drop_connection();
            return Err(Error::WebSocket(format!(
                "frame of {} bytes exceeds the {} byte limit",
                header.payload_len, limit
            )));
        }
        Ok(())
    }

    fn read_more(&mut self, deadline: &Deadline) -> Result<()> {
        let timeout = self.timeout;
        let conn = self.conn.as_mut().ok_or(Error::ConnectionClosed)?;
        let mut chunk = [0u8; 4096];
        let n = conn.read_some(&mut chunk, &timeout, deadline)?;
        if n == 0 {
            self.drop_connection();
            return Err(Error::ConnectionClosed);
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    fn fail_protocol<T>(&mut self, message: &str) -> Result<T> {
        let close = encode_frame(
            Opcode::Close,
            &encode_close_payload(frame::CLOSE_PROTOCOL_ERROR, message),
            true,
            true,
        );
        let _ = self.write_wire(&close);
        self.drop_connection();
        Err(Error::WebSocket(message.to_string()))
    }

    fn drop_connection(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close();
        }
        self.buf.clear();
    }

    /// Re-run the handshake after an unexpected drop.
    fn reattach(&mut self) -> Result<()> {
        self.drop_connection();
        self.state = WsState::Connecting;
        self.connect()
    }

    fn with_reconnect<T>(&mut self, mut op: impl FnMut(&mut Self) -> Result<T>) -> Result<T> {
        let mut attempt = 0u32;
        loop {
            match op(self) {
                Ok(value) => return Ok(value),
                Err(e)
                    if self.reconnect.auto_reconnect
                        && e.is_network()
                        && !matches!(self.state, WsState::Closed | WsState::Closing)
                        && attempt < self.reconnect.max_attempts =>
                {
                    let delay = self.reconnect.base_delay * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
                    std::thread::sleep(delay);
                    if let Err(reconnect_err) = self.reattach() {
                        if attempt >= self.reconnect.max_attempts {
                            return Err(reconnect_err);
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for WebSocket {
    fn drop(&mut self) {
        if !matches!(self.state, WsState::Closed) {
            let _ = self.close(Some(frame::CLOSE_GOING_AWAY), None);
        }
    }
}

pub(super) fn decode_message(opcode: Opcode, payload: Vec<u8>) -> Result<Message> {
    match opcode {
        Opcode::Text => String::from_utf8(payload)
            .map(Message::Text)
            .map_err(|_| Error::WebSocket("text frame is not valid UTF-8".to_string())),
        Opcode::Binary => Ok(Message::Binary(payload)),
        _ => Err(Error::WebSocket("unexpected opcode for message".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::WebSocketBuilder;

    #[test]
    fn test_send_requires_connection() {
        let mut ws = WebSocketBuilder::for_url("ws://a.example/ws")
            .build()
            .unwrap();
        assert!(matches!(ws.send("hello"), Err(Error::WebSocket(_))));
        assert!(matches!(ws.recv(), Err(Error::WebSocket(_))));
        assert_eq!(ws.state(), WsState::Closed);
    }

    #[test]
    fn test_close_when_never_connected() {
        let mut ws = WebSocketBuilder::for_url("ws://a.example/ws")
            .build()
            .unwrap();
        ws.close(None, None).unwrap();
        ws.close(Some(1000), Some("again")).unwrap();
    }

    #[test]
    fn test_decode_message_utf8() {
        assert_eq!(
            decode_message(Opcode::Text, b"hi".to_vec()).unwrap(),
            Message::Text("hi".to_string())
        );
        assert!(decode_message(Opcode::Text, vec![0xff, 0xfe]).is_err());
        assert_eq!(
            decode_message(Opcode::Binary, vec![0xff]).unwrap(),
            Message::Binary(vec![0xff])
        );
    }
}
