//! HTTP response parsing.
//!
//! This module provides the incremental parser for response heads (status
//! line plus headers) and the body framing resolution that decides how the
//! bytes after the head are delimited.

use super::{Headers, Limits, Method};
use crate::error::{Error, Result};

/// HTTP version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "HTTP/1.0" => Ok(Version::Http10),
            "HTTP/1.1" => Ok(Version::Http11),
            _ => Err(Error::InvalidResponse(format!("invalid HTTP version: {}", s))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

impl Default for Version {
    fn default() -> Self {
        Version::Http11
    }
}

/// Parsed status line and headers of a response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: Version,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

impl ResponseHead {
    /// True for the status codes the redirect engine follows.
    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 307 | 308)
    }
}

/// Parse a status line: `HTTP/1.x SP status [SP reason]`.
///
/// The reason phrase may be empty.
pub fn parse_status_line(line: &str) -> Result<(Version, u16, String)> {
    let mut parts = line.splitn(3, ' ');

    let version = match parts.next() {
        Some(v) => Version::from_str(v)?,
        None => return Err(Error::InvalidResponse("empty status line".to_string())),
    };

    let code_str = parts
        .next()
        .ok_or_else(|| Error::InvalidResponse(format!("no status code in: {}", line)))?;
    let status: u16 = code_str
        .parse()
        .map_err(|_| Error::InvalidResponse(format!("invalid status code: {}", code_str)))?;
    if !(100..600).contains(&status) {
        return Err(Error::InvalidResponse(format!(
            "status code out of range: {}",
            status
        )));
    }

    let reason = parts.next().unwrap_or("").to_string();
    Ok((version, status, reason))
}

/// Incremental response head parser.
///
/// Feed it socket reads; it returns the parsed head plus any body bytes
/// that arrived in the same reads. Enforces `max_header_size` and
/// `max_field_count` from [`Limits`].
pub struct HeadParser {
    state: ParserState,
    buffer: Vec<u8>,
    head_bytes: usize,
    limits: Limits,
    version: Option<Version>,
    status: u16,
    reason: String,
    headers: Headers,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParserState {
    StatusLine,
    HeaderLines,
    Done,
}

impl HeadParser {
    pub fn new(limits: Limits) -> Self {
        HeadParser {
            state: ParserState::StatusLine,
            buffer: Vec::new(),
            head_bytes: 0,
            limits,
            version: None,
            status: 0,
            reason: String::new(),
            headers: Headers::new(),
        }
    }

    /// Feed data to the parser.
    ///
    /// Returns `Ok(Some((head, leftover)))` when the head is complete,
    /// where `leftover` holds bytes past the blank line. `Ok(None)` means
    /// more data is needed.
    pub fn feed(&mut self, data: &[u8]) -> Result<Option<(ResponseHead, Vec<u8>)>> {
        self.buffer.extend_from_slice(data);

        loop {
            if self.state == ParserState::Done {
                return Err(Error::InvalidResponse(
                    "parser fed after completion".to_string(),
                ));
            }

            let Some(crlf_pos) = find_crlf(&self.buffer) else {
                if self.buffer.len() + self.head_bytes > self.limits.max_header_size {
                    return Err(Error::Protocol(format!(
                        "headers exceed {} bytes",
                        self.limits.max_header_size
                    )));
                }
                return Ok(None);
            };

            self.head_bytes += crlf_pos + 2;
            if self.head_bytes > self.limits.max_header_size {
                return Err(Error::Protocol(format!(
                    "headers exceed {} bytes",
                    self.limits.max_header_size
                )));
            }

            let line: Vec<u8> = self.buffer.drain(..crlf_pos + 2).take(crlf_pos).collect();

            match self.state {
                ParserState::StatusLine => {
                    let line = String::from_utf8_lossy(&line);
                    let (version, status, reason) = parse_status_line(&line)?;
                    self.version = Some(version);
                    self.status = status;
                    self.reason = reason;
                    self.state = ParserState::HeaderLines;
                }
                ParserState::HeaderLines => {
                    if line.is_empty() {
                        self.state = ParserState::Done;
                        let head = ResponseHead {
                            version: self.version.take().unwrap_or_default(),
                            status: self.status,
                            reason: std::mem::take(&mut self.reason),
                            headers: std::mem::take(&mut self.headers),
                        };
                        let leftover = std::mem::take(&mut self.buffer);
                        return Ok(Some((head, leftover)));
                    }

                    if self.headers.len() >= self.limits.max_field_count {
                        return Err(Error::Protocol(format!(
                            "more than {} header fields",
                            self.limits.max_field_count
                        )));
                    }

                    let (name, value) = parse_header_line(&line)?;
                    self.headers
                        .append(name, value)
                        .map_err(|e| Error::InvalidResponse(e.to_string()))?;
                }
                ParserState::Done => unreachable!(),
            }
        }
    }
}

/// Split a raw header line into name and value.
///
/// The name must be an RFC 7230 token; the value is trimmed of optional
/// surrounding whitespace.
fn parse_header_line(line: &[u8]) -> Result<(String, String)> {
    let text = String::from_utf8_lossy(line);
    let colon = text
        .find(':')
        .ok_or_else(|| Error::InvalidResponse(format!("no colon in header line: {}", text)))?;

    let name = text[..colon].to_string();
    super::headers::validate_name(&name).map_err(|e| Error::InvalidResponse(e.to_string()))?;

    let value = text[colon + 1..]
        .trim_matches(|c: char| c == ' ' || c == '\t')
        .to_string();
    Ok((name, value))
}

/// How the response body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body follows the head
    None,
    /// Chunked transfer encoding
    Chunked,
    /// Exactly this many bytes
    Length(u64),
    /// Body runs until the peer closes the connection
    Close,
}

impl BodyFraming {
    /// Resolve how the body after this head is delimited.
    ///
    /// Bodiless statuses win over everything, chunked wins over
    /// `Content-Length`, and with neither header present the body runs
    /// until the connection closes.
    pub fn resolve(method: Method, status: u16, headers: &Headers) -> Result<Self> {
        if method == Method::Head || (100..200).contains(&status) || status == 204 || status == 304
        {
            return Ok(BodyFraming::None);
        }

        if headers.has_token("Transfer-Encoding", "chunked") {
            return Ok(BodyFraming::Chunked);
        }

        let lengths = headers.get_all("Content-Length");
        if !lengths.is_empty() {
            let first: u64 = lengths[0].trim().parse().map_err(|_| {
                Error::InvalidResponse(format!("invalid Content-Length: {}", lengths[0]))
            })?;
            if lengths.iter().any(|l| l.trim() != lengths[0].trim()) {
                return Err(Error::InvalidResponse(
                    "conflicting Content-Length values".to_string(),
                ));
            }
            return Ok(BodyFraming::Length(first));
        }

        Ok(BodyFraming::Close)
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> Limits {
        Limits::default()
    }

    #[test]
    fn test_parse_status_line() {
        let (version, status, reason) = parse_status_line("HTTP/1.1 200 OK").unwrap();
        assert_eq!(version, Version::Http11);
        assert_eq!(status, 200);
        assert_eq!(reason, "OK");

        let (version, status, reason) = parse_status_line("HTTP/1.0 404").unwrap();
        assert_eq!(version, Version::Http10);
        assert_eq!(status, 404);
        assert_eq!(reason, "");

        let (_, _, reason) = parse_status_line("HTTP/1.1 500 Internal Server Error").unwrap();
        assert_eq!(reason, "Internal Server Error");
    }

    #[test]
    fn test_status_line_violations() {
        assert!(parse_status_line("HTTP/2.0 200 OK").is_err());
        assert!(parse_status_line("ICY 200 OK").is_err());
        assert!(parse_status_line("HTTP/1.1").is_err());
        assert!(parse_status_line("HTTP/1.1 abc OK").is_err());
        assert!(parse_status_line("HTTP/1.1 99 Low").is_err());
        assert!(parse_status_line("HTTP/1.1 600 High").is_err());
    }

    #[test]
    fn test_head_parser_simple() {
        let mut parser = HeadParser::new(limits());
        let data = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nHello";
        let (head, leftover) = parser.feed(data).unwrap().unwrap();

        assert_eq!(head.status, 200);
        assert_eq!(head.reason, "OK");
        assert_eq!(head.headers.get("Content-Length"), Some("5"));
        assert_eq!(leftover, b"Hello");
    }

    #[test]
    fn test_head_parser_incremental() {
        let mut parser = HeadParser::new(limits());

        assert!(parser.feed(b"HTTP/1.1 ").unwrap().is_none());
        assert!(parser.feed(b"200 OK\r\n").unwrap().is_none());
        assert!(parser.feed(b"Content-Type: text/plain\r\n").unwrap().is_none());
        let (head, leftover) = parser.feed(b"\r\nrest").unwrap().unwrap();

        assert_eq!(head.status, 200);
        assert_eq!(head.headers.get("Content-Type"), Some("text/plain"));
        assert_eq!(leftover, b"rest");
    }

    #[test]
    fn test_head_parser_duplicate_headers() {
        let mut parser = HeadParser::new(limits());
        let data = b"HTTP/1.1 200 OK\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\n\r\n";
        let (head, _) = parser.feed(data).unwrap().unwrap();
        assert_eq!(head.headers.get_all("Set-Cookie"), vec!["a=1", "b=2"]);
    }

    #[test]
    fn test_head_parser_trims_value_whitespace() {
        let mut parser = HeadParser::new(limits());
        let data = b"HTTP/1.1 200 OK\r\nX-Padded:   spaced out \t\r\n\r\n";
        let (head, _) = parser.feed(data).unwrap().unwrap();
        assert_eq!(head.headers.get("X-Padded"), Some("spaced out"));
    }

    #[test]
    fn test_head_parser_rejects_missing_colon() {
        let mut parser = HeadParser::new(limits());
        let data = b"HTTP/1.1 200 OK\r\nNotAHeader\r\n\r\n";
        assert!(matches!(
            parser.feed(data),
            Err(Error::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_head_parser_field_count_limit() {
        let mut parser = HeadParser::new(Limits {
            max_field_count: 3,
            ..Limits::default()
        });
        let data = b"HTTP/1.1 200 OK\r\nA: 1\r\nB: 2\r\nC: 3\r\nD: 4\r\n\r\n";
        assert!(matches!(parser.feed(data), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_head_parser_header_size_limit() {
        let mut parser = HeadParser::new(Limits {
            max_header_size: 64,
            ..Limits::default()
        });
        let long = format!("HTTP/1.1 200 OK\r\nX-Long: {}\r\n\r\n", "a".repeat(100));
        assert!(matches!(
            parser.feed(long.as_bytes()),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_head_parser_size_limit_without_crlf() {
        // A peer streaming an endless status line must still be cut off
        let mut parser = HeadParser::new(Limits {
            max_header_size: 64,
            ..Limits::default()
        });
        let garbage = vec![b'a'; 128];
        assert!(matches!(parser.feed(&garbage), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_framing_no_body_statuses() {
        let headers = Headers::new();
        assert_eq!(
            BodyFraming::resolve(Method::Get, 204, &headers).unwrap(),
            BodyFraming::None
        );
        assert_eq!(
            BodyFraming::resolve(Method::Get, 304, &headers).unwrap(),
            BodyFraming::None
        );
        assert_eq!(
            BodyFraming::resolve(Method::Get, 101, &headers).unwrap(),
            BodyFraming::None
        );
        assert_eq!(
            BodyFraming::resolve(Method::Head, 200, &headers).unwrap(),
            BodyFraming::None
        );
    }

    #[test]
    fn test_framing_priority() {
        let mut headers = Headers::new();
        headers.set("Content-Length", "10").unwrap();
        headers.set("Transfer-Encoding", "chunked").unwrap();
        // Chunked wins over Content-Length
        assert_eq!(
            BodyFraming::resolve(Method::Get, 200, &headers).unwrap(),
            BodyFraming::Chunked
        );
    }

    #[test]
    fn test_framing_content_length() {
        let mut headers = Headers::new();
        headers.set("Content-Length", "42").unwrap();
        assert_eq!(
            BodyFraming::resolve(Method::Get, 200, &headers).unwrap(),
            BodyFraming::Length(42)
        );
    }

    #[test]
    fn test_framing_bad_content_length() {
        let mut headers = Headers::new();
        headers.set("Content-Length", "abc").unwrap();
        assert!(BodyFraming::resolve(Method::Get, 200, &headers).is_err());

        let mut headers = Headers::new();
        headers.append("Content-Length", "1").unwrap();
        headers.append("Content-Length", "2").unwrap();
        assert!(BodyFraming::resolve(Method::Get, 200, &headers).is_err());
    }

    #[test]
    fn test_framing_close_fallback() {
        let headers = Headers::new();
        assert_eq!(
            BodyFraming::resolve(Method::Get, 200, &headers).unwrap(),
            BodyFraming::Close
        );
    }
}
