//! Request assembly and the wire drivers.
//!
//! This module serializes a validated request head, writes the body with
//! the framing picked in [`crate::http::body`], and reads the response
//! head back. The blocking and async drivers share all composition and
//! parsing; only the I/O calls differ.

use std::io::Read as _;

use crate::error::{Error, Result};
use crate::http::body::{resolve_request_framing, READER_CHUNK_SIZE};
use crate::http::chunked::{encode_chunk, FINAL_CHUNK};
use crate::http::{Body, HeadParser, Headers, Limits, Method, RequestFraming, ResponseHead, USER_AGENT};
use crate::timing::{Deadline, Timeout};
use crate::transport::{AsyncConnection, Connection};
use crate::url::Url;

/// Compose the final wire headers for a request and pick its body framing.
///
/// Injects `Host`, `User-Agent`, `Accept`, `Accept-Encoding`, and
/// `Connection: keep-alive` unless the caller already provided them, and
/// adds the framing header matching the body variant.
pub(crate) fn compose_wire_headers(
    url: &Url,
    headers: &Headers,
    body: &Body,
) -> Result<(Headers, RequestFraming)> {
    let mut wire = headers.clone();
    wire.set_if_absent("Host", url.host_header())?;
    wire.set_if_absent("User-Agent", USER_AGENT)?;
    wire.set_if_absent("Accept", "*/*")?;
    wire.set_if_absent("Accept-Encoding", "gzip, deflate")?;
    wire.set_if_absent("Connection", "keep-alive")?;

    let framing = resolve_request_framing(&wire, body)?;
    match framing {
        RequestFraming::Length(n) => wire.set_if_absent("Content-Length", n.to_string())?,
        RequestFraming::Chunked => wire.set_if_absent("Transfer-Encoding", "chunked")?,
        RequestFraming::None => {}
    }

    Ok((wire, framing))
}

/// Serialize the request line and headers.
pub(crate) fn serialize_head(method: Method, url: &Url, headers: &Headers) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);
    buf.extend_from_slice(method.as_str().as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(url.request_target().as_bytes());
    buf.extend_from_slice(b" HTTP/1.1\r\n");
    headers.write_to(&mut buf);
    buf.extend_from_slice(b"\r\n");
    buf
}

/// Write a request and read the response head over a blocking connection.
///
/// Streaming bodies are pulled lazily and written chunk by chunk; they are
/// spent afterwards. Returns the parsed head and any body bytes read past
/// it.
pub(crate) fn send_request(
    conn: &mut Connection,
    method: Method,
    url: &Url,
    headers: &Headers,
    body: &mut Body,
    timeout: &Timeout,
    deadline: &Deadline,
    limits: &Limits,
) -> Result<(ResponseHead, Vec<u8>)> {
    let (wire_headers, framing) = compose_wire_headers(url, headers, body)?;
    let head = serialize_head(method, url, &wire_headers);
    conn.write_all(&head, timeout, deadline)?;

    match (framing, &mut *body) {
        (RequestFraming::None, _) => {}
        (RequestFraming::Length(_), Body::Bytes(bytes)) => {
            conn.write_all(bytes, timeout, deadline)?;
        }
        (RequestFraming::Chunked, Body::Bytes(bytes)) => {
            conn.write_all(&encode_chunk(bytes), timeout, deadline)?;
            conn.write_all(FINAL_CHUNK, timeout, deadline)?;
        }
        (RequestFraming::Chunked, Body::Iter(iter)) => {
            for chunk in iter {
                if chunk.is_empty() {
                    continue;
                }
                conn.write_all(&encode_chunk(&chunk), timeout, deadline)?;
            }
            conn.write_all(FINAL_CHUNK, timeout, deadline)?;
        }
        (RequestFraming::Chunked, Body::Reader(reader)) => {
            let mut chunk = vec![0u8; READER_CHUNK_SIZE];
            loop {
                let n = reader
                    .read(&mut chunk)
                    .map_err(|e| Error::InvalidRequest(format!("body reader: {}", e)))?;
                if n == 0 {
                    break;
                }
                conn.write_all(&encode_chunk(&chunk[..n]), timeout, deadline)?;
            }
            conn.write_all(FINAL_CHUNK, timeout, deadline)?;
        }
        _ => {
            return Err(Error::InvalidRequest(
                "body variant does not match its framing".to_string(),
            ))
        }
    }

    read_head(conn, timeout, deadline, limits)
}

fn read_head(
    conn: &mut Connection,
    timeout: &Timeout,
    deadline: &Deadline,
    limits: &Limits,
) -> Result<(ResponseHead, Vec<u8>)> {
    let mut parser = HeadParser::new(*limits);
    let mut buf = [0u8; 4096];
    loop {
        let n = conn.read_some(&mut buf, timeout, deadline)?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        if let Some((head, leftover)) = parser.feed(&buf[..n])? {
            return Ok((head, leftover));
        }
    }
}

/// Async twin of [`send_request`].
///
/// Iterator- and reader-backed bodies are pulled between writes; the pull
/// itself is synchronous, so callers streaming large uploads should hand
/// over sources that do not block.
pub(crate) async fn send_request_async(
    conn: &mut AsyncConnection,
    method: Method,
    url: &Url,
    headers: &Headers,
    body: &mut Body,
    timeout: &Timeout,
    deadline: &Deadline,
    limits: &Limits,
) -> Result<(ResponseHead, Vec<u8>)> {
    let (wire_headers, framing) = compose_wire_headers(url, headers, body)?;
    let head = serialize_head(method, url, &wire_headers);
    conn.write_all(&head, timeout, deadline).await?;

    match (framing, &mut *body) {
        (RequestFraming::None, _) => {}
        (RequestFraming::Length(_), Body::Bytes(bytes)) => {
            let bytes = bytes.clone();
            conn.write_all(&bytes, timeout, deadline).await?;
        }
        (RequestFraming::Chunked, Body::Bytes(bytes)) => {
            let encoded = encode_chunk(bytes);
            conn.write_all(&encoded, timeout, deadline).await?;
            conn.write_all(FINAL_CHUNK, timeout, deadline).await?;
        }
        (RequestFraming::Chunked, Body::Iter(iter)) => {
            loop {
                let Some(chunk) = iter.next() else { break };
                if chunk.is_empty() {
                    continue;
                }
                let encoded = encode_chunk(&chunk);
                conn.write_all(&encoded, timeout, deadline).await?;
            }
            conn.write_all(FINAL_CHUNK, timeout, deadline).await?;
        }
        (RequestFraming::Chunked, Body::Reader(reader)) => {
            let mut chunk = vec![0u8; READER_CHUNK_SIZE];
            loop {
                let n = reader
                    .read(&mut chunk)
                    .map_err(|e| Error::InvalidRequest(format!("body reader: {}", e)))?;
                if n == 0 {
                    break;
                }
                let encoded = encode_chunk(&chunk[..n]);
                conn.write_all(&encoded, timeout, deadline).await?;
            }
            conn.write_all(FINAL_CHUNK, timeout, deadline).await?;
        }
        _ => {
            return Err(Error::InvalidRequest(
                "body variant does not match its framing".to_string(),
            ))
        }
    }

    let mut parser = HeadParser::new(*limits);
    let mut buf = [0u8; 4096];
    loop {
        let n = conn.read_some(&mut buf, timeout, deadline).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        if let Some((head, leftover)) = parser.feed(&buf[..n])? {
            return Ok((head, leftover));
        }
    }
}
