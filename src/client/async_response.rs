//! Async HTTP response handling.
//!
//! Twin of [`Response`](super::response::Response) for the async session.
//! Redirect history entries are fully buffered, so they reuse the blocking
//! response type; only the live body handle differs.

use std::fmt;

use serde::de::DeserializeOwned;

use super::response::{charset_from, connection_reusable, decode_content, decode_text, Response};
use crate::error::{Error, Result};
use crate::http::chunked::ChunkedDecoder;
use crate::http::{BodyFraming, Headers, Limits, ResponseHead, Version};
use crate::timing::{Deadline, Timeout};
use crate::transport::AsyncPooledConn;
use crate::url::Url;

pub(crate) enum AsyncResponseBody {
    Buffered(Vec<u8>),
    Streamed(AsyncBodyReader),
}

/// A parsed HTTP response from an async session.
pub struct AsyncResponse {
    status: u16,
    reason: String,
    version: Version,
    headers: Headers,
    url: Url,
    history: Vec<Response>,
    body: AsyncResponseBody,
    limits: Limits,
    decompress: bool,
    content_decoded: bool,
}

impl AsyncResponse {
    pub(crate) fn from_wire(
        head: ResponseHead,
        url: Url,
        guard: AsyncPooledConn,
        leftover: Vec<u8>,
        method: crate::http::Method,
        timeout: Timeout,
        deadline: Deadline,
        limits: Limits,
        decompress: bool,
    ) -> Result<AsyncResponse> {
        let framing = BodyFraming::resolve(method, head.status, &head.headers)?;
        let reusable = connection_reusable(&head, framing);

        let body = match framing {
            // Nothing to read: release the connection right away
            BodyFraming::None | BodyFraming::Length(0) => {
                let mut guard = guard;
                guard.set_reusable(reusable);
                guard.release();
                AsyncResponseBody::Buffered(Vec::new())
            }
            _ => AsyncResponseBody::Streamed(AsyncBodyReader::new(
                guard, framing, reusable, timeout, deadline, leftover,
            )),
        };

        Ok(AsyncResponse {
            status: head.status,
            reason: head.reason,
            version: head.version,
            headers: head.headers,
            url,
            history: Vec::new(),
            body,
            limits,
            decompress,
            content_decoded: false,
        })
    }

    /// HTTP status code
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Reason phrase, possibly empty
    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The final URL after any redirects
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Prior responses along the redirect chain, oldest first. Entries are
    /// fully buffered.
    pub fn history(&self) -> &[Response] {
        &self.history
    }

    pub(crate) fn set_history(&mut self, history: Vec<Response>) {
        self.history = history;
    }

    /// True for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub(crate) async fn drain(&mut self) -> Result<()> {
        let max = self.limits.max_body_size;
        if let AsyncResponseBody::Streamed(reader) = &mut self.body {
            let mut data = Vec::new();
            loop {
                // Never ask for more than one byte past the budget, so the
                // buffer cannot blow past the limit before the check
                let want = (max + 1 - data.len()).min(8192);
                match reader.next_chunk(want).await? {
                    Some(chunk) => {
                        if data.len() + chunk.len() > max {
                            reader.abort();
                            return Err(Error::Protocol(format!("body exceeds {} bytes", max)));
                        }
                        data.extend_from_slice(&chunk);
                    }
                    None => break,
                }
            }
            self.body = AsyncResponseBody::Buffered(data);
        }
        Ok(())
    }

    /// The complete body, content-decoded unless decompression was
    /// disabled. Drains the stream on first call.
    pub async fn body(&mut self) -> Result<&[u8]> {
        self.drain().await?;
        if self.decompress && !self.content_decoded {
            if let AsyncResponseBody::Buffered(raw) = &mut self.body {
                let decoded = decode_content(&self.headers, std::mem::take(raw))?;
                *raw = decoded;
            }
            self.content_decoded = true;
        }
        match &self.body {
            AsyncResponseBody::Buffered(data) => Ok(data),
            AsyncResponseBody::Streamed(_) => unreachable!("drained above"),
        }
    }

    /// The body decoded as text.
    pub async fn text(&mut self) -> Result<String> {
        let charset = charset_from(self.headers.get("Content-Type"));
        let body = self.body().await?;
        Ok(decode_text(body, charset.as_deref()))
    }

    /// The body parsed as JSON.
    pub async fn json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let body = self.body().await?;
        serde_json::from_slice(body)
            .map_err(|e| Error::InvalidResponse(format!("JSON decode failed: {}", e)))
    }

    /// Pull the next body chunk, at most `max` bytes. `Ok(None)` once the
    /// body is complete. Yields transfer-decoded (not content-decoded)
    /// bytes while streaming.
    pub async fn chunk(&mut self, max: usize) -> Result<Option<Vec<u8>>> {
        match &mut self.body {
            AsyncResponseBody::Buffered(data) => {
                if data.is_empty() {
                    return Ok(None);
                }
                let take = data.len().min(max.max(1));
                let chunk: Vec<u8> = data.drain(..take).collect();
                Ok(Some(chunk))
            }
            AsyncResponseBody::Streamed(reader) => reader.next_chunk(max.max(1)).await,
        }
    }

    /// Convert into a fully buffered blocking [`Response`], used for
    /// redirect history entries.
    pub(crate) async fn into_buffered(mut self) -> Result<Response> {
        self.drain().await?;
        let body = match self.body {
            AsyncResponseBody::Buffered(data) => data,
            AsyncResponseBody::Streamed(_) => unreachable!("drained above"),
        };
        let head = ResponseHead {
            version: self.version,
            status: self.status,
            reason: self.reason,
            headers: self.headers,
        };
        Ok(Response::from_parts(
            head,
            self.url,
            body,
            self.limits,
            self.decompress,
        ))
    }
}

impl fmt::Debug for AsyncResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncResponse")
            .field("status", &self.status)
            .field("url", &self.url.as_str())
            .field("history", &self.history.len())
            .finish_non_exhaustive()
    }
}

/// Async twin of the blocking body reader.
pub(crate) struct AsyncBodyReader {
    guard: Option<AsyncPooledConn>,
    framing: BodyFraming,
    reusable_hint: bool,
    timeout: Timeout,
    deadline: Deadline,
    leftover: Vec<u8>,
    remaining: u64,
    decoder: ChunkedDecoder,
    done: bool,
}

impl AsyncBodyReader {
    pub(crate) fn new(
        guard: AsyncPooledConn,
        framing: BodyFraming,
        reusable_hint: bool,
        timeout: Timeout,
        deadline: Deadline,
        leftover: Vec<u8>,
    ) -> Self {
        let remaining = match framing {
            BodyFraming::Length(n) => n,
            _ => 0,
        };
        AsyncBodyReader {
            guard: Some(guard),
            framing,
            reusable_hint,
            timeout,
            deadline,
            leftover,
            remaining,
            decoder: ChunkedDecoder::new(),
            done: false,
        }
    }

    pub(crate) async fn next_chunk(&mut self, max: usize) -> Result<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }
        match self.framing {
            BodyFraming::None => {
                self.finish();
                Ok(None)
            }
            BodyFraming::Length(_) => self.next_length_chunk(max).await,
            BodyFraming::Chunked => self.next_chunked_chunk(max).await,
            BodyFraming::Close => self.next_close_chunk(max).await,
        }
    }

    async fn next_length_chunk(&mut self, max: usize) -> Result<Option<Vec<u8>>> {
        if self.remaining == 0 {
            self.finish();
            return Ok(None);
        }

        if !self.leftover.is_empty() {
            let take = self
                .leftover
                .len()
                .min(max)
                .min(self.remaining.min(usize::MAX as u64) as usize);
            let chunk: Vec<u8> = self.leftover.drain(..take).collect();
            self.remaining -= take as u64;
            if self.remaining == 0 {
                self.finish();
            }
            return Ok(Some(chunk));
        }

        let want = (self.remaining.min(max as u64)) as usize;
        let mut buf = vec![0u8; want];
        let n = match self.conn_read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                self.abort();
                return Err(e);
            }
        };
        if n == 0 {
            self.abort();
            return Err(Error::ConnectionClosed);
        }
        buf.truncate(n);
        self.remaining -= n as u64;
        if self.remaining == 0 {
            self.finish();
        }
        Ok(Some(buf))
    }

    async fn next_chunked_chunk(&mut self, max: usize) -> Result<Option<Vec<u8>>> {
        let mut out = vec![0u8; max];
        loop {
            if !self.leftover.is_empty() {
                let (consumed, decoded, complete) =
                    match self.decoder.decode(&self.leftover, &mut out) {
                        Ok(step) => step,
                        Err(e) => {
                            self.abort();
                            return Err(e);
                        }
                    };
                self.leftover.drain(..consumed);

                if decoded > 0 {
                    out.truncate(decoded);
                    if complete {
                        self.finish();
                    }
                    return Ok(Some(out));
                }
                if complete {
                    self.finish();
                    return Ok(None);
                }
            }

            let mut buf = [0u8; 4096];
            let n = match self.conn_read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    self.abort();
                    return Err(e);
                }
            };
            if n == 0 {
                self.abort();
                return Err(Error::InvalidResponse("truncated chunked body".to_string()));
            }
            self.leftover.extend_from_slice(&buf[..n]);
        }
    }

    async fn next_close_chunk(&mut self, max: usize) -> Result<Option<Vec<u8>>> {
        if !self.leftover.is_empty() {
            let take = self.leftover.len().min(max);
            let chunk: Vec<u8> = self.leftover.drain(..take).collect();
            return Ok(Some(chunk));
        }

        let mut buf = vec![0u8; max];
        let n = match self.conn_read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                self.abort();
                return Err(e);
            }
        };
        if n == 0 {
            self.finish();
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf))
    }

    async fn conn_read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let timeout = self.timeout;
        let deadline = self.deadline;
        match self.guard.as_mut() {
            Some(conn) => conn.read_some(buf, &timeout, &deadline).await,
            None => Err(Error::ConnectionClosed),
        }
    }

    fn finish(&mut self) {
        self.done = true;
        if let Some(mut guard) = self.guard.take() {
            guard.set_reusable(self.reusable_hint);
            guard.release();
        }
    }

    pub(crate) fn abort(&mut self) {
        self.done = true;
        if let Some(mut guard) = self.guard.take() {
            guard.mark_unusable();
            guard.release();
        }
    }
}

impl Drop for AsyncBodyReader {
    fn drop(&mut self) {
        if let Some(mut guard) = self.guard.take() {
            guard.mark_unusable();
        }
    }
}
