//! Async connection management.
//!
//! [`AsyncConnection`] mirrors the blocking [`Connection`](super::Connection)
//! on tokio I/O. Deadlines are enforced with `tokio::time::timeout` instead
//! of `poll(2)`, but the liveness probe still goes straight to the socket.

use std::os::fd::{AsRawFd, RawFd};
use std::pin::Pin;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_openssl::SslStream;
use tracing::debug;

use super::{socket_alive, tls_connector};
use crate::error::{Error, Result};
use crate::timing::{Deadline, Timeout};
use crate::url::Origin;

/// A single async client connection to one origin.
#[derive(Debug)]
pub struct AsyncConnection {
    origin: Origin,
    stream: AsyncStream,
    opened_at: Instant,
    last_used_at: Instant,
    usable: bool,
}

#[derive(Debug)]
enum AsyncStream {
    Plain(TcpStream),
    Tls(SslStream<TcpStream>),
}

impl AsyncConnection {
    /// Open a TCP connection, wrapping it in TLS for https/wss origins.
    pub async fn open(origin: Origin, timeout: &Timeout, deadline: &Deadline) -> Result<Self> {
        let bound = tighter(timeout.connect_bound(), deadline.remaining()?);

        let connect = TcpStream::connect((origin.host.as_str(), origin.port));
        let tcp = match bound {
            Some(d) => tokio::time::timeout(d, connect)
                .await
                .map_err(|_| Error::ConnectTimeout(format!("{}:{}", origin.host, origin.port)))?,
            None => connect.await,
        }
        .map_err(Error::from_connect_io)?;
        let _ = tcp.set_nodelay(true);

        let stream = if origin.is_tls() {
            let connector = tls_connector()?;
            let ssl = connector
                .configure()
                .and_then(|c| c.into_ssl(&origin.host))
                .map_err(|e| Error::Tls(e.to_string()))?;
            let mut tls =
                SslStream::new(ssl, tcp).map_err(|e| Error::Tls(e.to_string()))?;

            let handshake = Pin::new(&mut tls).connect();
            match bound {
                Some(d) => tokio::time::timeout(d, handshake)
                    .await
                    .map_err(|_| {
                        Error::ConnectTimeout(format!("TLS handshake with {}", origin.host))
                    })?
                    .map_err(|e| Error::Tls(e.to_string()))?,
                None => handshake.await.map_err(|e| Error::Tls(e.to_string()))?,
            }
            AsyncStream::Tls(tls)
        } else {
            AsyncStream::Plain(tcp)
        };

        debug!(origin = %origin, "connection opened");
        let now = Instant::now();
        Ok(AsyncConnection {
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

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used_at)
    }

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
            AsyncStream::Plain(s) => s.as_raw_fd(),
            AsyncStream::Tls(s) => s.get_ref().as_raw_fd(),
        }
    }

    /// Write the whole buffer, bounded by the read timeout and the
    /// remaining total budget.
    pub async fn write_all(
        &mut self,
        data: &[u8],
        timeout: &Timeout,
        deadline: &Deadline,
    ) -> Result<()> {
        let bound = deadline.bound(timeout.read)?;

        let result = match bound {
            Some(d) => {
                match tokio::time::timeout(d, write_inner(&mut self.stream, data)).await {
                    Ok(r) => r,
                    Err(_) => {
                        self.usable = false;
                        return Err(Error::ReadTimeout);
                    }
                }
            }
            None => write_inner(&mut self.stream, data).await,
        };

        result.map_err(|e| {
            self.usable = false;
            Error::Network(e.to_string())
        })
    }

    /// Read whatever is available, up to `buf.len()` bytes. `Ok(0)` at EOF.
    pub async fn read_some(
        &mut self,
        buf: &mut [u8],
        timeout: &Timeout,
        deadline: &Deadline,
    ) -> Result<usize> {
        let bound = deadline.bound(timeout.read)?;

        let result = match bound {
            Some(d) => match tokio::time::timeout(d, read_inner(&mut self.stream, buf)).await {
                Ok(r) => r,
                Err(_) => {
                    self.usable = false;
                    return Err(Error::ReadTimeout);
                }
            },
            None => read_inner(&mut self.stream, buf).await,
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
    pub async fn read_exact(
        &mut self,
        buf: &mut [u8],
        timeout: &Timeout,
        deadline: &Deadline,
    ) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read_some(&mut buf[filled..], timeout, deadline).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            filled += n;
        }
        Ok(())
    }

    /// Shut down the write half politely. Dropping the connection closes
    /// the socket either way.
    pub async fn close(&mut self) {
        self.usable = false;
        match &mut self.stream {
            AsyncStream::Plain(s) => {
                let _ = s.shutdown().await;
            }
            AsyncStream::Tls(s) => {
                let _ = s.shutdown().await;
            }
        }
    }
}

async fn read_inner(stream: &mut AsyncStream, buf: &mut [u8]) -> std::io::Result<usize> {
    match stream {
        AsyncStream::Plain(s) => s.read(buf).await,
        AsyncStream::Tls(s) => s.read(buf).await,
    }
}

async fn write_inner(stream: &mut AsyncStream, data: &[u8]) -> std::io::Result<()> {
    match stream {
        AsyncStream::Plain(s) => s.write_all(data).await,
        AsyncStream::Tls(s) => s.write_all(data).await,
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
