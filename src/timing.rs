//! Timeout configuration and deadline arithmetic.
//!
//! A [`Timeout`] splits the request budget into connect, read, and total
//! bounds. A [`Deadline`] turns the total bound into an absolute cutoff so
//! that every read along the way can be limited by whichever is tighter,
//! the per-read bound or what is left of the overall budget.

use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Split timeout configuration.
///
/// Each field may be `None`, meaning no individual bound. `total` bounds
/// wall-clock time from connect through the final body byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout {
    /// Maximum time for TCP connect plus TLS handshake
    pub connect: Option<Duration>,
    /// Maximum time for a single read to make progress
    pub read: Option<Duration>,
    /// Maximum wall-clock time for the whole operation
    pub total: Option<Duration>,
}

impl Default for Timeout {
    fn default() -> Self {
        Timeout {
            connect: Some(Duration::from_secs(10)),
            read: Some(Duration::from_secs(30)),
            total: None,
        }
    }
}

impl Timeout {
    /// A timeout with no bounds at all.
    pub const fn none() -> Self {
        Timeout {
            connect: None,
            read: None,
            total: None,
        }
    }

    /// Fan a single duration out to all three bounds.
    pub fn from_duration(d: Duration) -> Self {
        Timeout {
            connect: Some(d),
            read: Some(d),
            total: Some(d),
        }
    }

    /// Convenience constructor from whole seconds, applied to all bounds.
    pub fn from_secs(secs: u64) -> Self {
        Self::from_duration(Duration::from_secs(secs))
    }

    /// The bound for connection establishment: `connect`, falling back to
    /// `total` when no connect bound is set.
    pub fn connect_bound(&self) -> Option<Duration> {
        self.connect.or(self.total)
    }
}

/// Absolute cutoff derived from a starting instant plus the total budget.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    end: Option<Instant>,
}

impl Deadline {
    /// Start the clock. `None` means unbounded.
    pub fn start(total: Option<Duration>) -> Self {
        Deadline {
            end: total.map(|d| Instant::now() + d),
        }
    }

    /// An unbounded deadline.
    pub fn unbounded() -> Self {
        Deadline { end: None }
    }

    pub fn expired(&self) -> bool {
        match self.end {
            Some(end) => Instant::now() >= end,
            None => false,
        }
    }

    /// Time left in the total budget. `Ok(None)` when unbounded; fails with
    /// [`Error::Timeout`] once the budget is spent.
    pub fn remaining(&self) -> Result<Option<Duration>> {
        match self.end {
            None => Ok(None),
            Some(end) => {
                let now = Instant::now();
                if now >= end {
                    Err(Error::Timeout)
                } else {
                    Ok(Some(end - now))
                }
            }
        }
    }

    /// The effective bound for one I/O operation: the tighter of the
    /// per-operation limit and the remaining total budget. Fails with
    /// [`Error::ReadTimeout`] when the budget is already spent, since the
    /// caller is inside a read window.
    pub fn bound(&self, per_op: Option<Duration>) -> Result<Option<Duration>> {
        let left = self.remaining().map_err(|_| Error::ReadTimeout)?;
        Ok(match (per_op, left) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let t = Timeout::default();
        assert_eq!(t.connect, Some(Duration::from_secs(10)));
        assert_eq!(t.read, Some(Duration::from_secs(30)));
        assert_eq!(t.total, None);
    }

    #[test]
    fn test_from_secs_fans_out() {
        let t = Timeout::from_secs(7);
        assert_eq!(t.connect, Some(Duration::from_secs(7)));
        assert_eq!(t.read, Some(Duration::from_secs(7)));
        assert_eq!(t.total, Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_connect_bound_falls_back_to_total() {
        let t = Timeout {
            connect: None,
            read: None,
            total: Some(Duration::from_secs(3)),
        };
        assert_eq!(t.connect_bound(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_unbounded_deadline() {
        let d = Deadline::unbounded();
        assert!(!d.expired());
        assert_eq!(d.remaining().unwrap(), None);
        assert_eq!(
            d.bound(Some(Duration::from_secs(5))).unwrap(),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_expired_deadline() {
        let d = Deadline::start(Some(Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(d.expired());
        assert!(matches!(d.remaining(), Err(Error::Timeout)));
        assert!(matches!(d.bound(None), Err(Error::ReadTimeout)));
    }

    #[test]
    fn test_bound_takes_tighter_limit() {
        let d = Deadline::start(Some(Duration::from_secs(60)));
        let b = d.bound(Some(Duration::from_secs(1))).unwrap().unwrap();
        assert!(b <= Duration::from_secs(1));

        let b = d.bound(Some(Duration::from_secs(600))).unwrap().unwrap();
        assert!(b <= Duration::from_secs(60));
    }
}
