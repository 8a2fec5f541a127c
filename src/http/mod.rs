//! HTTP/1.1 protocol types and codec.
//!
//! This module holds the pure protocol pieces shared by the blocking and
//! async halves of the engine: the header container, the response head
//! parser, the chunked codec, request body framing, and the enforced size
//! limits. Nothing in here performs I/O.

pub mod body;
pub mod chunked;
pub mod headers;
pub mod parser;

pub use body::{Body, RequestFraming};
pub use headers::Headers;
pub use parser::{BodyFraming, HeadParser, ResponseHead, Version};

use crate::error::{Error, Result};
use std::fmt;

/// CRLF line ending
pub const CRLF: &str = "\r\n";

/// Default User-Agent product string
pub const USER_AGENT: &str = concat!("lariat/", env!("CARGO_PKG_VERSION"));

/// Protocol size limits, enforced while parsing responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Total bytes of the status line plus all headers, CRLFs included
    pub max_header_size: usize,
    /// Total number of header fields
    pub max_field_count: usize,
    /// Total bytes of a body drained into memory
    pub max_body_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_header_size: 65536,
            max_field_count: 100,
            max_body_size: 10_000_000,
        }
    }
}

/// HTTP request methods supported by the engine. The set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl Method {
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "PATCH" => Ok(Method::Patch),
            "HEAD" => Ok(Method::Head),
            "OPTIONS" => Ok(Method::Options),
            _ => Err(Error::InvalidRequest(format!("invalid method: {}", s))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
