//! Transport layer: connections and pooling.
//!
//! The blocking and async halves share the TLS configuration and the
//! raw-socket probes in this module; everything else lives in the
//! per-variant submodules.

pub mod async_conn;
pub mod async_pool;
pub mod conn;
pub mod pool;

pub use async_conn::AsyncConnection;
pub use async_pool::{AsyncConnectionPool, AsyncPooledConn};
pub use conn::Connection;
pub use pool::{ConnectionPool, PoolConfig, PooledConn};

use std::os::fd::RawFd;
use std::time::Duration;

use openssl::ssl::{SslConnector, SslMethod, SslVersion};

use crate::error::{Error, Result};

/// Build the TLS connector used by both connection variants.
///
/// Minimum TLS 1.2, system trust store, hostname verification on. SNI is
/// set at connect time from the target host.
pub(crate) fn tls_connector() -> Result<SslConnector> {
    let mut builder = SslConnector::builder(SslMethod::tls_client())
        .map_err(|e| Error::Tls(e.to_string()))?;
    builder
        .set_min_proto_version(Some(SslVersion::TLS1_2))
        .map_err(|e| Error::Tls(e.to_string()))?;
    Ok(builder.build())
}

/// Wait for a socket to become readable or writable.
///
/// Returns `Ok(false)` when the timeout elapses first. `None` waits
/// indefinitely.
pub(crate) fn poll_fd(fd: RawFd, want_read: bool, timeout: Option<Duration>) -> Result<bool> {
    use libc::{poll, pollfd, POLLIN, POLLOUT};

    let mut pfd = pollfd {
        fd,
        events: if want_read { POLLIN } else { POLLOUT },
        revents: 0,
    };

    let timeout_ms = timeout
        .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
        .unwrap_or(-1);

    let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };

    if result < 0 {
        return Err(Error::Network(std::io::Error::last_os_error().to_string()));
    }

    Ok(result > 0)
}

/// Fast liveness probe for an idle socket.
///
/// A healthy idle connection has nothing to read. Readable means the peer
/// either closed (EOF) or sent bytes we were not expecting; both make the
/// connection unusable for a fresh request.
pub(crate) fn socket_alive(fd: RawFd) -> bool {
    match poll_fd(fd, true, Some(Duration::ZERO)) {
        Ok(false) => true,
        // Readable while idle means EOF or stale bytes; either way the
        // connection cannot carry a fresh request
        Ok(true) => false,
        Err(_) => false,
    }
}
