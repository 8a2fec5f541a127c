//! Async connection pool.
//!
//! Same LIFO-per-origin algorithm as the blocking pool, with tokio
//! semaphores for permit waiting. Stack bookkeeping stays behind a plain
//! mutex; the lock is never held across an await point.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

use super::async_conn::AsyncConnection;
use super::pool::PoolConfig;
use crate::error::{Error, Result};
use crate::timing::{Deadline, Timeout};
use crate::url::Origin;

#[derive(Debug)]
struct AsyncPoolShared {
    stacks: Mutex<HashMap<Origin, Vec<AsyncConnection>>>,
    total: Arc<Semaphore>,
    hosts: Mutex<HashMap<Origin, Arc<Semaphore>>>,
    config: PoolConfig,
}

impl AsyncPoolShared {
    fn host_semaphore(&self, origin: &Origin) -> Arc<Semaphore> {
        let mut hosts = self.hosts.lock().expect("pool lock poisoned");
        hosts
            .entry(origin.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_per_host)))
            .clone()
    }

    fn pop_idle(&self, origin: &Origin) -> Option<AsyncConnection> {
        let mut stacks = self.stacks.lock().expect("pool lock poisoned");
        stacks.get_mut(origin).and_then(Vec::pop)
    }

    fn push_idle(&self, conn: AsyncConnection) {
        let origin = conn.origin().clone();
        let mut stacks = self.stacks.lock().expect("pool lock poisoned");
        stacks.entry(origin).or_default().push(conn);
    }
}

/// Pool of reusable async connections, keyed by origin.
#[derive(Clone)]
pub struct AsyncConnectionPool {
    shared: Arc<AsyncPoolShared>,
}

impl AsyncConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        AsyncConnectionPool {
            shared: Arc::new(AsyncPoolShared {
                stacks: Mutex::new(HashMap::new()),
                total: Arc::new(Semaphore::new(config.max_total)),
                hosts: Mutex::new(HashMap::new()),
                config,
            }),
        }
    }

    /// Check out a connection for `origin`. See the blocking pool for the
    /// acquisition algorithm; only the waiting primitive differs.
    pub async fn acquire(
        &self,
        origin: &Origin,
        timeout: &Timeout,
        deadline: &Deadline,
    ) -> Result<AsyncPooledConn> {
        let total_permit = acquire_permit(self.shared.total.clone(), deadline).await?;
        let host_sem = self.shared.host_semaphore(origin);
        // total_permit drops (and releases) if this fails
        let host_permit = acquire_permit(host_sem, deadline).await?;

        let now = Instant::now();
        while let Some(mut conn) = self.shared.pop_idle(origin) {
            if conn.idle_for(now) > self.shared.config.max_idle {
                debug!(origin = %origin, "closing idle-expired connection");
                conn.close().await;
                continue;
            }
            if !conn.is_usable() {
                debug!(origin = %origin, "closing dead idle connection");
                drop(conn);
                continue;
            }
            trace!(origin = %origin, "reusing pooled connection");
            return Ok(AsyncPooledConn {
                conn: Some(conn),
                shared: self.shared.clone(),
                _total_permit: total_permit,
                _host_permit: host_permit,
                reusable: false,
            });
        }

        let conn = AsyncConnection::open(origin.clone(), timeout, deadline).await?;
        Ok(AsyncPooledConn {
            conn: Some(conn),
            shared: self.shared.clone(),
            _total_permit: total_permit,
            _host_permit: host_permit,
            reusable: false,
        })
    }

    /// Number of idle connections currently pooled for an origin.
    pub fn idle_count(&self, origin: &Origin) -> usize {
        let stacks = self.shared.stacks.lock().expect("pool lock poisoned");
        stacks.get(origin).map_or(0, Vec::len)
    }

    /// Drop idle connections that expired or died, across all origins.
    pub fn prune(&self, now: Instant) {
        let max_idle = self.shared.config.max_idle;
        let mut stacks = self.shared.stacks.lock().expect("pool lock poisoned");
        for stack in stacks.values_mut() {
            stack.retain(|conn| conn.idle_for(now) <= max_idle && conn.is_usable());
        }
    }

    /// Drop every idle connection. Idempotent.
    pub fn close_all(&self) {
        let mut stacks = self.shared.stacks.lock().expect("pool lock poisoned");
        stacks.clear();
    }
}

impl Default for AsyncConnectionPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

async fn acquire_permit(
    sem: Arc<Semaphore>,
    deadline: &Deadline,
) -> Result<OwnedSemaphorePermit> {
    let acquire = sem.acquire_owned();
    let permit = match deadline.remaining()? {
        Some(wait) => tokio::time::timeout(wait, acquire)
            .await
            .map_err(|_| Error::Timeout)?,
        None => acquire.await,
    };
    permit.map_err(|_| Error::Network("connection pool closed".to_string()))
}

/// A checked-out async connection. Dropping the guard is the one return
/// path: the connection is restacked when reusable and alive, dropped
/// (closing the socket) otherwise, and both permits are released.
#[derive(Debug)]
pub struct AsyncPooledConn {
    conn: Option<AsyncConnection>,
    shared: Arc<AsyncPoolShared>,
    _total_permit: OwnedSemaphorePermit,
    _host_permit: OwnedSemaphorePermit,
    reusable: bool,
}

impl AsyncPooledConn {
    /// Mark whether the connection may be reused after release.
    pub fn set_reusable(&mut self, reusable: bool) {
        self.reusable = reusable;
    }

    /// Return the connection to the pool (or drop it) immediately.
    pub fn release(self) {}
}

impl Deref for AsyncPooledConn {
    type Target = AsyncConnection;

    fn deref(&self) -> &AsyncConnection {
        self.conn.as_ref().expect("connection already returned")
    }
}

impl DerefMut for AsyncPooledConn {
    fn deref_mut(&mut self) -> &mut AsyncConnection {
        self.conn.as_mut().expect("connection already returned")
    }
}

impl Drop for AsyncPooledConn {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            if self.reusable && conn.is_usable() {
                conn.touch();
                self.shared.push_idle(conn);
            }
            // else: dropping the connection closes the socket
        }
    }
}
