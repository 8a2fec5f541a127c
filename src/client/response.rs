//! HTTP response handling.
//!
//! A [`Response`] is the parsed head plus a body handle. Bodies arrive
//! either already buffered (redirect intermediates, bodiless statuses) or
//! still attached to their pooled connection; in the second case the
//! connection rides along inside a [`BodyReader`] and returns to the pool
//! the moment the body is fully drained. Dropping an undrained response
//! closes the connection instead of returning it.

use std::fmt;
use std::io::Read as _;

use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::http::chunked::ChunkedDecoder;
use crate::http::{BodyFraming, Headers, Limits, ResponseHead, Version};
use crate::timing::{Deadline, Timeout};
use crate::transport::PooledConn;
use crate::url::Url;

/// Whether the connection can go back to the pool after this response.
pub(crate) fn connection_reusable(head: &ResponseHead, framing: BodyFraming) -> bool {
    if framing == BodyFraming::Close {
        return false;
    }
    if head.headers.has_token("Connection", "close") {
        return false;
    }
    if head.version == Version::Http10 && !head.headers.has_token("Connection", "keep-alive") {
        return false;
    }
    true
}

/// Decode gzip/deflate content. Unknown encodings pass through untouched.
pub(crate) fn decode_content(headers: &Headers, data: Vec<u8>) -> Result<Vec<u8>> {
    let encoding = headers
        .get("Content-Encoding")
        .map(|v| v.trim().to_ascii_lowercase());

    match encoding.as_deref() {
        Some("gzip") | Some("x-gzip") => {
            let mut out = Vec::new();
            flate2::read::GzDecoder::new(data.as_slice())
                .read_to_end(&mut out)
                .map_err(|e| Error::InvalidResponse(format!("gzip body: {}", e)))?;
            Ok(out)
        }
        Some("deflate") => {
            let mut out = Vec::new();
            match flate2::read::ZlibDecoder::new(data.as_slice()).read_to_end(&mut out) {
                Ok(_) => Ok(out),
                Err(_) => {
                    // Some peers send raw deflate without the zlib wrapper
                    let mut out = Vec::new();
                    flate2::read::DeflateDecoder::new(data.as_slice())
                        .read_to_end(&mut out)
                        .map_err(|e| Error::InvalidResponse(format!("deflate body: {}", e)))?;
                    Ok(out)
                }
            }
        }
        _ => Ok(data),
    }
}

/// The charset parameter of a `Content-Type` value, if any.
pub(crate) fn charset_from(content_type: Option<&str>) -> Option<String> {
    let ct = content_type?;
    let after = ct.split_once("charset=")?.1;
    let charset = after.split(';').next().unwrap_or("").trim().trim_matches('"');
    if charset.is_empty() {
        None
    } else {
        Some(charset.to_string())
    }
}

/// Decode body text with the given charset, falling back to lossy UTF-8.
pub(crate) fn decode_text(data: &[u8], charset: Option<&str>) -> String {
    match charset.map(str::to_ascii_lowercase).as_deref() {
        Some("iso-8859-1") | Some("latin-1") | Some("latin1") => {
            data.iter().map(|&b| b as char).collect()
        }
        // UTF-8 and anything unrecognized: best-effort UTF-8
        _ => String::from_utf8_lossy(data).into_owned(),
    }
}

pub(crate) enum ResponseBody {
    Buffered(Vec<u8>),
    Streamed(BodyReader),
}

/// A parsed HTTP response.
pub struct Response {
    status: u16,
    reason: String,
    version: Version,
    headers: Headers,
    url: Url,
    history: Vec<Response>,
    body: ResponseBody,
    limits: Limits,
    decompress: bool,
    content_decoded: bool,
}

impl Response {
    /// Build a response whose body is still on the wire.
    ///
    /// Bodiless statuses release the connection immediately; everything
    /// else keeps it inside the body handle until drained.
    pub(crate) fn from_wire(
        head: ResponseHead,
        url: Url,
        guard: PooledConn,
        leftover: Vec<u8>,
        method: crate::http::Method,
        timeout: Timeout,
        deadline: Deadline,
        limits: Limits,
        decompress: bool,
    ) -> Result<Response> {
        let framing = BodyFraming::resolve(method, head.status, &head.headers)?;
        let reusable = connection_reusable(&head, framing);

        let body = match framing {
            // Nothing to read: release the connection right away
            BodyFraming::None | BodyFraming::Length(0) => {
                let mut guard = guard;
                guard.set_reusable(reusable);
                guard.release();
                ResponseBody::Buffered(Vec::new())
            }
            _ => ResponseBody::Streamed(BodyReader::new(
                guard, framing, reusable, timeout, deadline, leftover,
            )),
        };

        Ok(Response {
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

    /// Build an already-buffered response.
    pub(crate) fn from_parts(
        head: ResponseHead,
        url: Url,
        body: Vec<u8>,
        limits: Limits,
        decompress: bool,
    ) -> Response {
        Response {
            status: head.status,
            reason: head.reason,
            version: head.version,
            headers: head.headers,
            url,
            history: Vec::new(),
            body: ResponseBody::Buffered(body),
            limits,
            decompress,
            content_decoded: false,
        }
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

    /// Prior responses along the redirect chain, oldest first
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

    /// Drain any streamed remainder into memory, bounded by
    /// `max_body_size`. Returning the connection to the pool happens here
    /// if the body was still attached.
    pub(crate) fn drain(&mut self) -> Result<()> {
        let max = self.limits.max_body_size;
        if let ResponseBody::Streamed(reader) = &mut self.body {
            let mut data = Vec::new();
            loop {
                // Never ask for more than one byte past the budget, so the
                // buffer cannot blow past the limit before the check
                let want = (max + 1 - data.len()).min(8192);
                match reader.next_chunk(want)? {
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
            self.body = ResponseBody::Buffered(data);
        }
        Ok(())
    }

    /// The complete body, content-decoded unless decompression was
    /// disabled. Drains the stream on first call.
    pub fn body(&mut self) -> Result<&[u8]> {
        self.drain()?;
        if self.decompress && !self.content_decoded {
            if let ResponseBody::Buffered(raw) = &mut self.body {
                let decoded = decode_content(&self.headers, std::mem::take(raw))?;
                *raw = decoded;
            }
            self.content_decoded = true;
        }
        match &self.body {
            ResponseBody::Buffered(data) => Ok(data),
            ResponseBody::Streamed(_) => unreachable!("drained above"),
        }
    }

    /// The body decoded as text, using the `Content-Type` charset with a
    /// lossy UTF-8 fallback.
    pub fn text(&mut self) -> Result<String> {
        let charset = charset_from(self.headers.get("Content-Type"));
        let body = self.body()?;
        Ok(decode_text(body, charset.as_deref()))
    }

    /// The body parsed as JSON.
    pub fn json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let body = self.body()?;
        serde_json::from_slice(body)
            .map_err(|e| Error::InvalidResponse(format!("JSON decode failed: {}", e)))
    }

    /// Iterate the body in chunks of at most `chunk_size` bytes.
    ///
    /// On a still-streamed body this reads from the connection as it goes
    /// and yields transfer-decoded (but not content-decoded) bytes.
    pub fn iter_content(&mut self, chunk_size: usize) -> ContentIter<'_> {
        ContentIter {
            body: &mut self.body,
            chunk_size: chunk_size.max(1),
            pos: 0,
        }
    }

    /// Iterate the body line by line, without the trailing CR/LF.
    pub fn iter_lines(&mut self) -> LinesIter<'_> {
        LinesIter {
            inner: self.iter_content(4096),
            buf: Vec::new(),
            done: false,
        }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("url", &self.url.as_str())
            .field("history", &self.history.len())
            .finish_non_exhaustive()
    }
}

/// Iterator over body chunks. See [`Response::iter_content`].
pub struct ContentIter<'a> {
    body: &'a mut ResponseBody,
    chunk_size: usize,
    pos: usize,
}

impl Iterator for ContentIter<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.body {
            ResponseBody::Buffered(data) => {
                if self.pos >= data.len() {
                    return None;
                }
                let end = (self.pos + self.chunk_size).min(data.len());
                let chunk = data[self.pos..end].to_vec();
                self.pos = end;
                Some(Ok(chunk))
            }
            ResponseBody::Streamed(reader) => reader.next_chunk(self.chunk_size).transpose(),
        }
    }
}

/// Iterator over body lines. See [`Response::iter_lines`].
pub struct LinesIter<'a> {
    inner: ContentIter<'a>,
    buf: Vec<u8>,
    done: bool,
}

impl Iterator for LinesIter<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Some(Ok(line));
            }

            if self.done {
                if self.buf.is_empty() {
                    return None;
                }
                return Some(Ok(std::mem::take(&mut self.buf)));
            }

            match self.inner.next() {
                Some(Ok(chunk)) => self.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => self.done = true,
            }
        }
    }
}

/// Move-only handle draining a streamed body off its pooled connection.
///
/// On clean completion the connection goes back to the pool (when the
/// response allows reuse). On error or early drop it is closed instead.
pub(crate) struct BodyReader {
    guard: Option<PooledConn>,
    framing: BodyFraming,
    reusable_hint: bool,
    timeout: Timeout,
    deadline: Deadline,
    leftover: Vec<u8>,
    remaining: u64,
    decoder: ChunkedDecoder,
    done: bool,
}

impl BodyReader {
    pub(crate) fn new(
        guard: PooledConn,
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
        BodyReader {
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

    /// Pull the next piece of the body, at most `max` bytes. `None` once
    /// the body is complete.
    pub(crate) fn next_chunk(&mut self, max: usize) -> Result<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }
        match self.framing {
            BodyFraming::None => {
                self.finish();
                Ok(None)
            }
            BodyFraming::Length(_) => self.next_length_chunk(max),
            BodyFraming::Chunked => self.next_chunked_chunk(max),
            BodyFraming::Close => self.next_close_chunk(max),
        }
    }

    fn next_length_chunk(&mut self, max: usize) -> Result<Option<Vec<u8>>> {
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
        let n = match self.conn_read(&mut buf) {
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

    fn next_chunked_chunk(&mut self, max: usize) -> Result<Option<Vec<u8>>> {
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
            let n = match self.conn_read(&mut buf) {
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

    fn next_close_chunk(&mut self, max: usize) -> Result<Option<Vec<u8>>> {
        if !self.leftover.is_empty() {
            let take = self.leftover.len().min(max);
            let chunk: Vec<u8> = self.leftover.drain(..take).collect();
            return Ok(Some(chunk));
        }

        let mut buf = vec![0u8; max];
        let n = match self.conn_read(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                self.abort();
                return Err(e);
            }
        };
        if n == 0 {
            // EOF terminates the body; the connection is spent either way
            self.finish();
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf))
    }

    fn conn_read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let timeout = self.timeout;
        let deadline = self.deadline;
        match self.guard.as_mut() {
            Some(conn) => conn.read_some(buf, &timeout, &deadline),
            None => Err(Error::ConnectionClosed),
        }
    }

    /// Clean completion: hand the connection back to the pool.
    fn finish(&mut self) {
        self.done = true;
        if let Some(mut guard) = self.guard.take() {
            guard.set_reusable(self.reusable_hint);
            guard.release();
        }
    }

    /// Failure path: the connection is closed, never pooled.
    pub(crate) fn abort(&mut self) {
        self.done = true;
        if let Some(mut guard) = self.guard.take() {
            guard.mark_unusable();
            guard.release();
        }
    }
}

impl Drop for BodyReader {
    fn drop(&mut self) {
        // An undrained stream cannot leave a half-read connection in the
        // pool; close it
        if let Some(mut guard) = self.guard.take() {
            guard.mark_unusable();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charset_from() {
        assert_eq!(
            charset_from(Some("text/html; charset=utf-8")),
            Some("utf-8".to_string())
        );
        assert_eq!(
            charset_from(Some("text/html; charset=\"iso-8859-1\"; boundary=x")),
            Some("iso-8859-1".to_string())
        );
        assert_eq!(charset_from(Some("text/html")), None);
        assert_eq!(charset_from(None), None);
    }

    #[test]
    fn test_decode_text_latin1() {
        let bytes = vec![0x63, 0x61, 0x66, 0xe9];
        assert_eq!(decode_text(&bytes, Some("ISO-8859-1")), "café");
    }

    #[test]
    fn test_decode_text_utf8_fallback() {
        let bytes = "héllo".as_bytes();
        assert_eq!(decode_text(bytes, None), "héllo");
        assert_eq!(decode_text(bytes, Some("unknown-charset")), "héllo");
        // Invalid UTF-8 is replaced, not fatal
        let bad = vec![0xff, 0xfe, b'a'];
        assert!(decode_text(&bad, None).ends_with('a'));
    }

    #[test]
    fn test_decode_content_gzip() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write as _;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"compressed payload").unwrap();
        let compressed = encoder.finish().unwrap();

        let mut headers = Headers::new();
        headers.set("Content-Encoding", "gzip").unwrap();
        let decoded = decode_content(&headers, compressed).unwrap();
        assert_eq!(decoded, b"compressed payload");
    }

    #[test]
    fn test_decode_content_deflate_zlib() {
        use flate2::write::ZlibEncoder;
        use flate2::Compression;
        use std::io::Write as _;

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"zlib payload").unwrap();
        let compressed = encoder.finish().unwrap();

        let mut headers = Headers::new();
        headers.set("Content-Encoding", "deflate").unwrap();
        assert_eq!(decode_content(&headers, compressed).unwrap(), b"zlib payload");
    }

    #[test]
    fn test_decode_content_unknown_untouched() {
        let mut headers = Headers::new();
        headers.set("Content-Encoding", "br").unwrap();
        let data = b"not really brotli".to_vec();
        assert_eq!(decode_content(&headers, data.clone()).unwrap(), data);
    }

    #[test]
    fn test_decode_content_corrupt_gzip_fails() {
        let mut headers = Headers::new();
        headers.set("Content-Encoding", "gzip").unwrap();
        assert!(decode_content(&headers, b"garbage".to_vec()).is_err());
    }

    fn head_with(version: Version, pairs: &[(&str, &str)]) -> ResponseHead {
        let mut headers = Headers::new();
        for (n, v) in pairs {
            headers.append(*n, *v).unwrap();
        }
        ResponseHead {
            version,
            status: 200,
            reason: "OK".to_string(),
            headers,
        }
    }

    #[test]
    fn test_connection_reusable() {
        let head = head_with(Version::Http11, &[]);
        assert!(connection_reusable(&head, BodyFraming::Length(5)));

        let head = head_with(Version::Http11, &[("Connection", "close")]);
        assert!(!connection_reusable(&head, BodyFraming::Length(5)));

        let head = head_with(Version::Http10, &[]);
        assert!(!connection_reusable(&head, BodyFraming::Length(5)));

        let head = head_with(Version::Http10, &[("Connection", "keep-alive")]);
        assert!(connection_reusable(&head, BodyFraming::Length(5)));

        let head = head_with(Version::Http11, &[]);
        assert!(!connection_reusable(&head, BodyFraming::Close));
    }

    #[test]
    fn test_buffered_response_accessors() {
        let head = head_with(Version::Http11, &[("Content-Type", "text/plain")]);
        let url = Url::parse("http://a.example/x").unwrap();
        let mut resp =
            Response::from_parts(head, url, b"hello".to_vec(), Limits::default(), true);

        assert_eq!(resp.status(), 200);
        assert_eq!(resp.reason(), "OK");
        assert_eq!(resp.url().as_str(), "http://a.example/x");
        assert!(resp.is_success());
        assert!(resp.history().is_empty());
        assert_eq!(resp.body().unwrap(), b"hello");
        assert_eq!(resp.text().unwrap(), "hello");
    }

    #[test]
    fn test_json_decode() {
        let head = head_with(Version::Http11, &[("Content-Type", "application/json")]);
        let url = Url::parse("http://a.example/").unwrap();
        let mut resp = Response::from_parts(
            head,
            url,
            br#"{"name":"x","count":3}"#.to_vec(),
            Limits::default(),
            true,
        );

        let value: serde_json::Value = resp.json().unwrap();
        assert_eq!(value["name"], "x");
        assert_eq!(value["count"], 3);
    }

    #[test]
    fn test_json_decode_failure() {
        let head = head_with(Version::Http11, &[]);
        let url = Url::parse("http://a.example/").unwrap();
        let mut resp =
            Response::from_parts(head, url, b"not json".to_vec(), Limits::default(), true);
        let result: Result<serde_json::Value> = resp.json();
        assert!(matches!(result, Err(Error::InvalidResponse(_))));
    }

    #[test]
    fn test_iter_content_buffered() {
        let head = head_with(Version::Http11, &[]);
        let url = Url::parse("http://a.example/").unwrap();
        let mut resp =
            Response::from_parts(head, url, b"abcdefghij".to_vec(), Limits::default(), true);

        let chunks: Vec<Vec<u8>> = resp.iter_content(4).map(|c| c.unwrap()).collect();
        assert_eq!(chunks, vec![b"abcd".to_vec(), b"efgh".to_vec(), b"ij".to_vec()]);
    }

    #[test]
    fn test_iter_lines() {
        let head = head_with(Version::Http11, &[]);
        let url = Url::parse("http://a.example/").unwrap();
        let mut resp = Response::from_parts(
            head,
            url,
            b"first\r\nsecond\nthird".to_vec(),
            Limits::default(),
            true,
        );

        let lines: Vec<Vec<u8>> = resp.iter_lines().map(|l| l.unwrap()).collect();
        assert_eq!(
            lines,
            vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]
        );
    }

    #[test]
    fn test_gzip_body_decoded_on_access() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write as _;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"the payload").unwrap();
        let compressed = encoder.finish().unwrap();

        let head = head_with(Version::Http11, &[("Content-Encoding", "gzip")]);
        let url = Url::parse("http://a.example/").unwrap();
        let mut resp = Response::from_parts(head, url, compressed, Limits::default(), true);
        assert_eq!(resp.body().unwrap(), b"the payload");
        // Second access stays decoded
        assert_eq!(resp.body().unwrap(), b"the payload");
    }

    #[test]
    fn test_gzip_body_untouched_when_disabled() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write as _;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"raw").unwrap();
        let compressed = encoder.finish().unwrap();

        let head = head_with(Version::Http11, &[("Content-Encoding", "gzip")]);
        let url = Url::parse("http://a.example/").unwrap();
        let mut resp =
            Response::from_parts(head, url, compressed.clone(), Limits::default(), false);
        assert_eq!(resp.body().unwrap(), compressed);
    }
}
