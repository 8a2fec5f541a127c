//! Blocking connection pool.
//!
//! Idle connections are kept in per-origin LIFO stacks. Concurrency is
//! bounded by two counting semaphores, one global and one per origin;
//! permits track checked-out connections and are released by the
//! [`PooledConn`] guard on every path. The pool lock is only ever held
//! around stack and counter mutations, never across I/O.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::conn::Connection;
use crate::error::{Error, Result};
use crate::timing::{Deadline, Timeout};
use crate::url::Origin;

/// Pool sizing configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum connections per origin, idle and checked out combined
    pub max_per_host: usize,
    /// Maximum connections across all origins
    pub max_total: usize,
    /// Idle connections older than this are closed instead of reused
    pub max_idle: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_per_host: 10,
            max_total: 100,
            max_idle: Duration::from_secs(90),
        }
    }
}

/// Counting semaphore built on a mutex and condvar.
///
/// Waiting is bounded by the caller's total deadline; there is no
/// busy-waiting.
#[derive(Debug)]
struct Semaphore {
    permits: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    fn new(count: usize) -> Self {
        Semaphore {
            permits: Mutex::new(count),
            cv: Condvar::new(),
        }
    }

    fn acquire(&self, deadline: &Deadline) -> Result<()> {
        let mut permits = self.permits.lock().expect("pool semaphore poisoned");
        while *permits == 0 {
            match deadline.remaining()? {
                Some(wait) => {
                    let (guard, result) = self
                        .cv
                        .wait_timeout(permits, wait)
                        .expect("pool semaphore poisoned");
                    permits = guard;
                    if result.timed_out() && *permits == 0 {
                        return Err(Error::Timeout);
                    }
                }
                None => {
                    permits = self.cv.wait(permits).expect("pool semaphore poisoned");
                }
            }
        }
        *permits -= 1;
        Ok(())
    }

    fn release(&self) {
        let mut permits = self.permits.lock().expect("pool semaphore poisoned");
        *permits += 1;
        self.cv.notify_one();
    }
}

#[derive(Debug)]
struct PoolShared {
    stacks: Mutex<HashMap<Origin, Vec<Connection>>>,
    total: Semaphore,
    hosts: Mutex<HashMap<Origin, Arc<Semaphore>>>,
    config: PoolConfig,
}

impl PoolShared {
    fn host_semaphore(&self, origin: &Origin) -> Arc<Semaphore> {
        let mut hosts = self.hosts.lock().expect("pool lock poisoned");
        hosts
            .entry(origin.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_per_host)))
            .clone()
    }

    fn pop_idle(&self, origin: &Origin) -> Option<Connection> {
        let mut stacks = self.stacks.lock().expect("pool lock poisoned");
        stacks.get_mut(origin).and_then(Vec::pop)
    }

    fn push_idle(&self, conn: Connection) {
        let origin = conn.origin().clone();
        let mut stacks = self.stacks.lock().expect("pool lock poisoned");
        stacks.entry(origin).or_default().push(conn);
    }
}

/// Pool of reusable connections, keyed by origin.
///
/// Cloning shares the same pool; streamed response bodies hold a clone so
/// their connection finds its way back after the session call returns.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        ConnectionPool {
            shared: Arc::new(PoolShared {
                stacks: Mutex::new(HashMap::new()),
                total: Semaphore::new(config.max_total),
                hosts: Mutex::new(HashMap::new()),
                config,
            }),
        }
    }

    /// Check out a connection for `origin`, reusing the most recently
    /// returned idle connection when possible.
    ///
    /// Blocks for permits when the pool is at capacity, bounded by the
    /// total deadline. Stale or dead idle connections are closed and
    /// skipped; a fresh connection is dialed outside all locks.
    pub fn acquire(
        &self,
        origin: &Origin,
        timeout: &Timeout,
        deadline: &Deadline,
    ) -> Result<PooledConn> {
        self.shared.total.acquire(deadline)?;
        let host_sem = self.shared.host_semaphore(origin);
        if let Err(e) = host_sem.acquire(deadline) {
            self.shared.total.release();
            return Err(e);
        }

        let permits = PermitPair {
            shared: self.shared.clone(),
            host: host_sem,
        };

        let now = Instant::now();
        while let Some(mut conn) = self.shared.pop_idle(origin) {
            if conn.idle_for(now) > self.shared.config.max_idle {
                debug!(origin = %origin, "closing idle-expired connection");
                conn.close();
                continue;
            }
            if !conn.is_usable() {
                debug!(origin = %origin, "closing dead idle connection");
                conn.close();
                continue;
            }
            trace!(origin = %origin, "reusing pooled connection");
            return Ok(PooledConn {
                conn: Some(conn),
                shared: self.shared.clone(),
                _permits: permits,
                reusable: false,
            });
        }

        match Connection::open(origin.clone(), timeout, deadline) {
            Ok(conn) => Ok(PooledConn {
                conn: Some(conn),
                shared: self.shared.clone(),
                _permits: permits,
                reusable: false,
            }),
            // PermitPair releases on drop
            Err(e) => Err(e),
        }
    }

    /// Number of idle connections currently pooled for an origin.
    pub fn idle_count(&self, origin: &Origin) -> usize {
        let stacks = self.shared.stacks.lock().expect("pool lock poisoned");
        stacks.get(origin).map_or(0, Vec::len)
    }

    /// Close idle connections that expired or died, across all origins.
    pub fn prune(&self, now: Instant) {
        let max_idle = self.shared.config.max_idle;
        let mut stacks = self.shared.stacks.lock().expect("pool lock poisoned");
        for stack in stacks.values_mut() {
            let mut kept = Vec::with_capacity(stack.len());
            for mut conn in stack.drain(..) {
                if conn.idle_for(now) <= max_idle && conn.is_usable() {
                    kept.push(conn);
                } else {
                    conn.close();
                }
            }
            *stack = kept;
        }
    }

    /// Close every idle connection. Idempotent.
    pub fn close_all(&self) {
        let mut stacks = self.shared.stacks.lock().expect("pool lock poisoned");
        for (_, stack) in stacks.drain() {
            for mut conn in stack {
                conn.close();
            }
        }
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

/// Both permits for one checked-out connection. Dropping releases them.
#[derive(Debug)]
struct PermitPair {
    shared: Arc<PoolShared>,
    host: Arc<Semaphore>,
}

impl Drop for PermitPair {
    fn drop(&mut self) {
        self.host.release();
        self.shared.total.release();
    }
}

/// A checked-out connection.
///
/// Exactly one guard exists per checkout; dropping it is the one and only
/// return path. The connection goes back on its origin's idle stack only
/// when marked reusable and still alive, and is closed otherwise. Permits
/// are released either way.
#[derive(Debug)]
pub struct PooledConn {
    conn: Option<Connection>,
    shared: Arc<PoolShared>,
    _permits: PermitPair,
    reusable: bool,
}

impl PooledConn {
    /// Mark whether the connection may be reused after release.
    pub fn set_reusable(&mut self, reusable: bool) {
        self.reusable = reusable;
    }

    /// Return the connection to the pool (or close it) immediately.
    pub fn release(self) {}
}

impl Deref for PooledConn {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection already returned")
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection already returned")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            if self.reusable && conn.is_usable() {
                conn.touch();
                self.shared.push_idle(conn);
            } else {
                conn.close();
            }
        }
        // _permits drops after the push, so a waiter that wins the permit
        // finds the idle connection already stacked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::url::Scheme;
    use std::io::{Read as _, Write as _};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    /// Accept loop that keeps connections open and counts them.
    fn keepalive_server() -> (std::net::SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        thread::spawn(move || {
            let mut held: Vec<TcpStream> = Vec::new();
            while let Ok((stream, _)) = listener.accept() {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(stream);
            }
        });
        (addr, accepted)
    }

    fn origin_for(addr: std::net::SocketAddr) -> Origin {
        Origin {
            scheme: Scheme::Http,
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }

    #[test]
    fn test_acquire_release_reuse() {
        let (addr, accepted) = keepalive_server();
        let origin = origin_for(addr);
        let pool = ConnectionPool::default();
        let timeout = Timeout::default();
        let deadline = Deadline::unbounded();

        let mut guard = pool.acquire(&origin, &timeout, &deadline).unwrap();
        guard.set_reusable(true);
        drop(guard);
        assert_eq!(pool.idle_count(&origin), 1);

        let guard = pool.acquire(&origin, &timeout, &deadline).unwrap();
        assert_eq!(pool.idle_count(&origin), 0);
        drop(guard);

        // Dropped without set_reusable: closed, not pooled
        assert_eq!(pool.idle_count(&origin), 0);
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_discard_on_drop_without_reuse() {
        let (addr, accepted) = keepalive_server();
        let origin = origin_for(addr);
        let pool = ConnectionPool::default();
        let timeout = Timeout::default();
        let deadline = Deadline::unbounded();

        let guard = pool.acquire(&origin, &timeout, &deadline).unwrap();
        drop(guard);
        assert_eq!(pool.idle_count(&origin), 0);

        // Next acquire dials a second connection
        let _guard = pool.acquire(&origin, &timeout, &deadline).unwrap();
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_lifo_order() {
        let (addr, _) = keepalive_server();
        let origin = origin_for(addr);
        let pool = ConnectionPool::default();
        let timeout = Timeout::default();
        let deadline = Deadline::unbounded();

        let mut first = pool.acquire(&origin, &timeout, &deadline).unwrap();
        let mut second = pool.acquire(&origin, &timeout, &deadline).unwrap();
        let second_opened = second.opened_at();

        first.set_reusable(true);
        second.set_reusable(true);
        drop(first);
        drop(second);
        assert_eq!(pool.idle_count(&origin), 2);

        // Most recently returned comes back first
        let reused = pool.acquire(&origin, &timeout, &deadline).unwrap();
        assert_eq!(reused.opened_at(), second_opened);
    }

    #[test]
    fn test_per_host_limit_blocks_until_release() {
        let (addr, _) = keepalive_server();
        let origin = origin_for(addr);
        let pool = ConnectionPool::new(PoolConfig {
            max_per_host: 1,
            ..PoolConfig::default()
        });
        let timeout = Timeout::default();
        let deadline = Deadline::unbounded();

        let mut guard = pool.acquire(&origin, &timeout, &deadline).unwrap();
        guard.set_reusable(true);

        let pool2 = pool.clone();
        let origin2 = origin.clone();
        let waiter = thread::spawn(move || {
            let deadline = Deadline::unbounded();
            let g = pool2.acquire(&origin2, &Timeout::default(), &deadline).unwrap();
            g.release();
        });

        thread::sleep(Duration::from_millis(50));
        drop(guard);
        waiter.join().unwrap();
    }

    #[test]
    fn test_acquire_times_out_at_capacity() {
        let (addr, _) = keepalive_server();
        let origin = origin_for(addr);
        let pool = ConnectionPool::new(PoolConfig {
            max_per_host: 1,
            ..PoolConfig::default()
        });
        let timeout = Timeout::default();

        let _held = pool
            .acquire(&origin, &timeout, &Deadline::unbounded())
            .unwrap();

        let deadline = Deadline::start(Some(Duration::from_millis(50)));
        let err = pool.acquire(&origin, &timeout, &deadline).unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }

    #[test]
    fn test_expired_idle_closed_on_acquire() {
        let (addr, accepted) = keepalive_server();
        let origin = origin_for(addr);
        let pool = ConnectionPool::new(PoolConfig {
            max_idle: Duration::from_millis(30),
            ..PoolConfig::default()
        });
        let timeout = Timeout::default();
        let deadline = Deadline::unbounded();

        let mut guard = pool.acquire(&origin, &timeout, &deadline).unwrap();
        guard.set_reusable(true);
        drop(guard);
        assert_eq!(pool.idle_count(&origin), 1);

        thread::sleep(Duration::from_millis(80));

        let _guard = pool.acquire(&origin, &timeout, &deadline).unwrap();
        // The expired idle connection was skipped and a new dial happened
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_prune_drops_expired() {
        let (addr, _) = keepalive_server();
        let origin = origin_for(addr);
        let pool = ConnectionPool::new(PoolConfig {
            max_idle: Duration::from_millis(30),
            ..PoolConfig::default()
        });
        let timeout = Timeout::default();
        let deadline = Deadline::unbounded();

        let mut guard = pool.acquire(&origin, &timeout, &deadline).unwrap();
        guard.set_reusable(true);
        drop(guard);
        assert_eq!(pool.idle_count(&origin), 1);

        thread::sleep(Duration::from_millis(80));
        pool.prune(Instant::now());
        assert_eq!(pool.idle_count(&origin), 0);
    }

    #[test]
    fn test_close_all_idempotent() {
        let (addr, _) = keepalive_server();
        let origin = origin_for(addr);
        let pool = ConnectionPool::default();
        let timeout = Timeout::default();
        let deadline = Deadline::unbounded();

        let mut guard = pool.acquire(&origin, &timeout, &deadline).unwrap();
        guard.set_reusable(true);
        drop(guard);

        pool.close_all();
        assert_eq!(pool.idle_count(&origin), 0);
        pool.close_all();
    }

    #[test]
    fn test_failed_dial_releases_permits() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let origin = origin_for(addr);
        let pool = ConnectionPool::new(PoolConfig {
            max_per_host: 1,
            ..PoolConfig::default()
        });
        let timeout = Timeout::default();
        let deadline = Deadline::unbounded();

        assert!(pool.acquire(&origin, &timeout, &deadline).is_err());
        // The permit must have been released; otherwise this blocks forever
        assert!(pool.acquire(&origin, &timeout, &deadline).is_err());
    }
}
