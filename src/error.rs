//! Error taxonomy for the client engine.
//!
//! Every fallible operation in the crate surfaces a single [`Error`] enum.
//! Consumers match on the variant; helper predicates cover the common
//! "is this a timeout / network problem" questions without exhaustive
//! matching.

use crate::client::response::Response;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Client engine errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// TCP or socket-layer failure after the connection was established
    #[error("network error: {0}")]
    Network(String),

    /// Could not establish the TCP connection
    #[error("connection failed: {0}")]
    Connect(String),

    /// TCP or TLS setup exceeded the connect timeout
    #[error("connect timed out: {0}")]
    ConnectTimeout(String),

    /// A read exceeded the read timeout or the remaining total budget
    #[error("read timed out")]
    ReadTimeout,

    /// The total timeout expired outside a specific read or connect window
    #[error("operation timed out")]
    Timeout,

    /// Certificate, hostname, or TLS handshake failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// The URL could not be parsed or uses an unsupported shape
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// A header name or value failed validation
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// Caller-side request validation failure
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Malformed status line, headers, or body framing in a response
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Size limits exceeded or other protocol violations
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The redirect chain exceeded the configured limit
    #[error("exceeded {limit} redirects")]
    TooManyRedirects {
        limit: usize,
        history: Vec<Response>,
    },

    /// A URL appeared twice along the redirect chain
    #[error("redirect loop at {url}")]
    RedirectLoop {
        url: String,
        history: Vec<Response>,
    },

    /// Handshake failure, invalid frame, or unexpected close on a WebSocket
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// The peer closed the connection mid-exchange
    #[error("connection closed")]
    ConnectionClosed,
}

impl Error {
    /// True for any of the timeout variants.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::ConnectTimeout(_) | Error::ReadTimeout | Error::Timeout
        )
    }

    /// True for socket-layer failures, including TLS and closed peers.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Error::Network(_)
                | Error::Connect(_)
                | Error::ConnectTimeout(_)
                | Error::ReadTimeout
                | Error::Tls(_)
                | Error::ConnectionClosed
        )
    }

    /// True for either redirect failure.
    pub fn is_redirect(&self) -> bool {
        matches!(
            self,
            Error::TooManyRedirects { .. } | Error::RedirectLoop { .. }
        )
    }

    /// The redirect history attached to a redirect failure.
    pub fn redirect_history(&self) -> Option<&[Response]> {
        match self {
            Error::TooManyRedirects { history, .. } => Some(history),
            Error::RedirectLoop { history, .. } => Some(history),
            _ => None,
        }
    }

    pub(crate) fn from_read_io(e: std::io::Error) -> Error {
        match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => Error::ReadTimeout,
            std::io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
            _ => Error::Network(e.to_string()),
        }
    }

    pub(crate) fn from_connect_io(e: std::io::Error) -> Error {
        match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                Error::ConnectTimeout(e.to_string())
            }
            _ => Error::Connect(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_predicate() {
        assert!(Error::ReadTimeout.is_timeout());
        assert!(Error::Timeout.is_timeout());
        assert!(Error::ConnectTimeout("x".into()).is_timeout());
        assert!(!Error::Network("x".into()).is_timeout());
    }

    #[test]
    fn test_network_predicate() {
        assert!(Error::Network("reset".into()).is_network());
        assert!(Error::Tls("bad cert".into()).is_network());
        assert!(Error::ConnectionClosed.is_network());
        assert!(!Error::InvalidUrl("x".into()).is_network());
    }

    #[test]
    fn test_io_mapping() {
        let e = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(matches!(Error::from_read_io(e), Error::ReadTimeout));

        let e = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(Error::from_connect_io(e), Error::Connect(_)));
    }

    #[test]
    fn test_redirect_history_accessor() {
        let err = Error::TooManyRedirects {
            limit: 3,
            history: Vec::new(),
        };
        assert!(err.is_redirect());
        assert_eq!(err.redirect_history().unwrap().len(), 0);
        assert!(Error::ReadTimeout.redirect_history().is_none());
    }
}
