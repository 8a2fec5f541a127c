//! Blocking connection management.
//!
//! A [`Connection`] owns a TCP socket, optionally wrapped in TLS, to one
//! origin. Every read and write is bounded by the per-operation timeout
//! and the remaining total budget, enforced with `poll(2)` ahead of the
//! blocking call.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use openssl::ssl::{HandshakeError, SslStream};
use tracing::{debug, trace};

use super::{poll_fd, socket_alive, tls_connector};
use crate::error::{Error, Result};
use crate::timing::{Deadline, Timeout};
use crate::url::Origin;

/// A single client connection to one origin.
#[derive(Debug)]
pub struct Connection {
    origin: Origin,
    stream: Stream,
    opened_at: Instant,
    last_used_at: Instant,
    usable: bool,
}

#[derive(Debug)]
enum Stream {
    Plain(TcpStream),
    Tls(SslStream<TcpStream>),
}

impl Connection {
    /// Open a TCP connection, wrapping it in TLS for https/wss origins.
    ///
    /// Connect and handshake together are bounded by the connect timeout
    /// and whatever is left of the total budget.
    pub fn open(origin: Origin, timeout: &Timeout, deadline: &Deadline) -> Result<Self> {
        let bound = tighter(timeout.connect_bound(), deadline.remaining()?);

        let addrs = (origin.host.as_str(), origin.port)
            .to_socket_addrs()
            .map_err(|e| Error::Connect(format!("resolving {}: {}", origin.host, e)))?;

        let mut last_err: Option<std::io::Error> = None;
        let mut tcp = None;
        for addr in addrs {
            let attempt = match bound {
                Some(d) => TcpStream::connect_timeout(&addr, d),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => {
                    tcp = Some(stream);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }

        let tcp = match tcp {
            Some(stream) => stream,
            None => {
                return Err(match last_err {
                    Some(e) => Error::from_connect_io(e),
                    None => Error::Connect(format!("no addresses for {}", origin.host)),
                })
            }
        };
        let _ = tcp.set_nodelay(true);

        let stream = if origin.is_tls() {
            // Socket timeouts bound the handshake; polling takes over after
            let _ = tcp.set_read_timeout(bound);
            let _ = tcp.set_write_timeout(bound);

            let connector = tls_connector()?;
            let config = connector
                .configure()
                .map_err(|e| Error::Tls(e.to_string()))?;
            let tls = config
                .connect(&origin.host, tcp)
                .map_err(|e| match e {
                    HandshakeError::WouldBlock(_) => {
                        Error::ConnectTimeout(format!("TLS handshake with {}", origin.host))
                    }
                    other => Error::Tls(other.to_string()),
                })?;

            let _ = tls.get_ref().set_read_timeout(None);
            let _ = tls.get_ref().set_write_timeout(None);
            Stream::Tls(tls)
        } else {
            Stream::Plain(tcp)
        };

        debug!(origin = %origin, "connection opened");
        let now = Instant::now();
        Ok(Connection {
            origin,
            stream,
            opened_at: now,
            last_used_at: now,
            usable: true,
        })
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// How long the connection has sat since its last successful read.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used_at)
    }

    /// Refresh the idle timestamp, used when returning to the pool.
    pub fn touch(&mut self) {
        self.last_used_at = Instant::now();
    }

    pub fn mark_unusable(&mut self) {
        self.usable = false;
    }

    /// Fast probe: false once the peer closed or the socket errored.
    pub fn is_usable(&self) -> bool {
        self.usable && socket_alive(self.fd())
    }

    fn fd(&self) -> RawFd {
        match &self.stream {
            Stream::Plain(s) => s.as_raw_fd(),
            Stream::Tls(s) => s.get_ref().as_raw_fd(),
        }
    }

    /// Write the whole buffer, bounded per wait by the read timeout and
    /// the remaining total budget.
    pub fn write_all(&mut self, data: &[u8], timeout: &Timeout, deadline: &Deadline) -> Result<()> {
        let mut written = 0;
        while written < data.len() {
            let bound = deadline.bound(timeout.read)?;
            if !poll_fd(self.fd(), false, bound)? {
                self.usable = false;
                return Err(Error::ReadTimeout);
            }

            let result = match &mut self.stream {
                Stream::Plain(s) => s.write(&data[written..]),
                Stream::Tls(s) => s.write(&data[written..]),
            };
            let n = result.map_err(|e| {
                self.usable = false;
                Error::Network(e.to_string())
            })?;
            if n == 0 {
                self.usable = false;
                return Err(Error::ConnectionClosed);
            }
            written += n;
        }
        Ok(())
    }

    /// Read whatever is available, up to `buf.len()` bytes.
    ///
    /// Returns `Ok(0)` at EOF. A successful read refreshes the idle
    /// timestamp.
    pub fn read_some(
        &mut self,
        buf: &mut [u8],
        timeout: &Timeout,
        deadline: &Deadline,
    ) -> Result<usize> {
        let bound = deadline.bound(timeout.read)?;

        let tls_buffered = match &self.stream {
            Stream::Tls(s) => s.ssl().pending() > 0,
            Stream::Plain(_) => false,
        };
        if !tls_buffered && !poll_fd(self.fd(), true, bound)? {
            self.usable = false;
            return Err(Error::ReadTimeout);
        }

        let result = match &mut self.stream {
            Stream::Plain(s) => s.read(buf),
            Stream::Tls(s) => s.read(buf),
        };
        let n = result.map_err(|e| {
            self.usable = false;
            Error::from_read_io(e)
        })?;

        if n == 0 {
            self.usable = false;
        } else {
            self.last_used_at = Instant::now();
        }
        Ok(n)
    }

    /// Read exactly `buf.len()` bytes or fail.
    pub fn read_exact(
        &mut self,
        buf: &mut [u8],
        timeout: &Timeout,
        deadline: &Deadline,
    ) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read_some(&mut buf[filled..], timeout, deadline)?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            filled += n;
        }
        Ok(())
    }

    /// Shut the connection down. Safe to call more than once.
    pub fn close(&mut self) {
        trace!(origin = %self.origin, "connection closed");
        self.usable = false;
        match &mut self.stream {
            Stream::Plain(s) => {
                let _ = s.shutdown(Shutdown::Both);
            }
            Stream::Tls(s) => {
                let _ = s.shutdown();
                let _ = s.get_ref().shutdown(Shutdown::Both);
            }
        }
    }
}

fn tighter(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (Some(x), None) => Some(x),
        (None, Some(y)) => Some(y),
        (None, None) => None,
    }
}
