//! Request body variants and framing selection.
//!
//! A [`Body`] is either absent, held in memory, or streamed from an
//! iterator or reader. In-memory bodies are framed with `Content-Length`;
//! streamed bodies go out with `Transfer-Encoding: chunked`.

use std::fmt;
use std::io::Read;

use bytes::Bytes;

use super::Headers;
use crate::error::{Error, Result};

/// Chunk size used when draining a reader-backed body.
pub const READER_CHUNK_SIZE: usize = 8192;

/// A request body.
pub enum Body {
    /// No body
    Empty,
    /// Complete body held in memory
    Bytes(Bytes),
    /// Chunks pulled from an iterator, sent with chunked encoding
    Iter(Box<dyn Iterator<Item = Vec<u8>> + Send>),
    /// Bytes pulled from a reader, sent with chunked encoding
    Reader(Box<dyn Read + Send>),
}

impl Body {
    pub fn empty() -> Self {
        Body::Empty
    }

    /// Wrap an iterator of byte chunks.
    pub fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
        I::IntoIter: Send + 'static,
    {
        Body::Iter(Box::new(iter.into_iter()))
    }

    /// Wrap a file-like reader. Its contents are sent in
    /// [`READER_CHUNK_SIZE`] chunks with chunked encoding.
    pub fn from_reader<R: Read + Send + 'static>(reader: R) -> Self {
        Body::Reader(Box::new(reader))
    }

    /// True for the variants that are written with chunked encoding.
    pub fn is_streaming(&self) -> bool {
        matches!(self, Body::Iter(_) | Body::Reader(_))
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Body::Empty => true,
            Body::Bytes(b) => b.is_empty(),
            _ => false,
        }
    }

    /// Known size in bytes, for the variants that have one.
    pub fn len(&self) -> Option<usize> {
        match self {
            Body::Empty => Some(0),
            Body::Bytes(b) => Some(b.len()),
            _ => None,
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => write!(f, "Body::Empty"),
            Body::Bytes(b) => write!(f, "Body::Bytes({} bytes)", b.len()),
            Body::Iter(_) => write!(f, "Body::Iter"),
            Body::Reader(_) => write!(f, "Body::Reader"),
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Body::Empty
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self {
        Body::Bytes(Bytes::from(v))
    }
}

impl From<&[u8]> for Body {
    fn from(v: &[u8]) -> Self {
        Body::Bytes(Bytes::copy_from_slice(v))
    }
}

impl From<Bytes> for Body {
    fn from(v: Bytes) -> Self {
        Body::Bytes(v)
    }
}

impl From<String> for Body {
    fn from(v: String) -> Self {
        Body::Bytes(Bytes::from(v.into_bytes()))
    }
}

impl From<&str> for Body {
    fn from(v: &str) -> Self {
        Body::Bytes(Bytes::copy_from_slice(v.as_bytes()))
    }
}

/// How the request body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestFraming {
    None,
    Length(u64),
    Chunked,
}

/// Pick the request framing from the body variant, validating any framing
/// headers the caller supplied themselves.
pub fn resolve_request_framing(headers: &Headers, body: &Body) -> Result<RequestFraming> {
    let caller_length = match headers.get("Content-Length") {
        Some(v) => Some(v.trim().parse::<u64>().map_err(|_| {
            Error::InvalidRequest(format!("invalid Content-Length: {}", v))
        })?),
        None => None,
    };
    let caller_chunked = headers.has_token("Transfer-Encoding", "chunked");

    if caller_length.is_some() && caller_chunked {
        return Err(Error::InvalidRequest(
            "both Content-Length and Transfer-Encoding: chunked given".to_string(),
        ));
    }

    match body {
        Body::Empty => {
            if caller_chunked {
                return Err(Error::InvalidRequest(
                    "chunked transfer with no body".to_string(),
                ));
            }
            match caller_length {
                Some(0) | None => Ok(RequestFraming::None),
                Some(n) => Err(Error::InvalidRequest(format!(
                    "Content-Length {} with empty body",
                    n
                ))),
            }
        }
        Body::Bytes(b) => {
            if caller_chunked {
                // Caller opted into chunked for an in-memory body
                return Ok(RequestFraming::Chunked);
            }
            match caller_length {
                Some(n) if n != b.len() as u64 => Err(Error::InvalidRequest(format!(
                    "Content-Length {} does not match body of {} bytes",
                    n,
                    b.len()
                ))),
                _ => Ok(RequestFraming::Length(b.len() as u64)),
            }
        }
        Body::Iter(_) | Body::Reader(_) => {
            if caller_length.is_some() {
                return Err(Error::InvalidRequest(
                    "Content-Length given for a streaming body".to_string(),
                ));
            }
            Ok(RequestFraming::Chunked)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_variants() {
        assert!(Body::empty().is_empty());
        assert_eq!(Body::from("hi").len(), Some(2));
        assert!(!Body::from("hi").is_streaming());
        assert!(Body::from_iter(vec![vec![1u8]]).is_streaming());
        assert!(Body::from_reader(std::io::empty()).is_streaming());
        assert_eq!(Body::from_iter(vec![vec![1u8]]).len(), None);
    }

    #[test]
    fn test_framing_for_bytes() {
        let headers = Headers::new();
        let framing = resolve_request_framing(&headers, &Body::from("abc")).unwrap();
        assert_eq!(framing, RequestFraming::Length(3));
    }

    #[test]
    fn test_framing_for_empty() {
        let headers = Headers::new();
        let framing = resolve_request_framing(&headers, &Body::Empty).unwrap();
        assert_eq!(framing, RequestFraming::None);
    }

    #[test]
    fn test_framing_for_stream() {
        let headers = Headers::new();
        let body = Body::from_iter(vec![b"x".to_vec()]);
        assert_eq!(
            resolve_request_framing(&headers, &body).unwrap(),
            RequestFraming::Chunked
        );
    }

    #[test]
    fn test_framing_consistent_caller_length() {
        let mut headers = Headers::new();
        headers.set("Content-Length", "3").unwrap();
        assert_eq!(
            resolve_request_framing(&headers, &Body::from("abc")).unwrap(),
            RequestFraming::Length(3)
        );
    }

    #[test]
    fn test_framing_conflicts() {
        let mut headers = Headers::new();
        headers.set("Content-Length", "5").unwrap();
        assert!(resolve_request_framing(&headers, &Body::from("abc")).is_err());

        let mut headers = Headers::new();
        headers.set("Content-Length", "3").unwrap();
        headers.set("Transfer-Encoding", "chunked").unwrap();
        assert!(resolve_request_framing(&headers, &Body::from("abc")).is_err());

        let mut headers = Headers::new();
        headers.set("Content-Length", "3").unwrap();
        let body = Body::from_iter(vec![b"abc".to_vec()]);
        assert!(resolve_request_framing(&headers, &body).is_err());
    }
}
