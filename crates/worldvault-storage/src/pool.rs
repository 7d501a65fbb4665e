//! Blocking connection pool
//!
//! A fixed number of slots circulate through a bounded channel. A slot is
//! either an open connection or empty; empty slots are connected on
//! checkout, so a connection that broke mid-call can simply be dropped and
//! is replaced the next time its slot is used.

use crossbeam_channel::{Receiver, Sender, bounded};
use std::ops::{Deref, DerefMut};
use std::time::Duration;
use tracing::{debug, warn};
use worldvault_common::{Error, Result};

type Connect<C> = Box<dyn Fn() -> Result<C> + Send + Sync>;

/// Pool of driver connections shared by every call on one backend
pub struct Pool<C> {
    name: &'static str,
    size: usize,
    checkout_timeout: Duration,
    idle_tx: Sender<Option<C>>,
    idle_rx: Receiver<Option<C>>,
    connect: Connect<C>,
}

impl<C> Pool<C> {
    /// Create a pool of `size` lazily connected slots
    pub fn new(
        name: &'static str,
        size: usize,
        checkout_timeout: Duration,
        connect: impl Fn() -> Result<C> + Send + Sync + 'static,
    ) -> Result<Self> {
        if size == 0 {
            return Err(Error::Configuration(format!("{name} pool size must be at least 1")));
        }
        let (idle_tx, idle_rx) = bounded(size);
        for _ in 0..size {
            idle_tx
                .send(None)
                .map_err(|_| Error::backend(format!("{name} pool closed")))?;
        }
        Ok(Self {
            name,
            size,
            checkout_timeout,
            idle_tx,
            idle_rx,
            connect: Box::new(connect),
        })
    }

    /// Number of slots
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Check out a connection, waiting up to the checkout timeout
    pub fn get(&self) -> Result<PooledConnection<'_, C>> {
        let slot = self.idle_rx.recv_timeout(self.checkout_timeout).map_err(|_| {
            Error::backend(format!(
                "{} pool: no connection available within {:?}",
                self.name, self.checkout_timeout
            ))
        })?;
        let conn = match slot {
            Some(conn) => conn,
            None => match (self.connect)() {
                Ok(conn) => {
                    debug!("{} pool: opened connection", self.name);
                    conn
                }
                Err(e) => {
                    self.release(None);
                    return Err(e);
                }
            },
        };
        Ok(PooledConnection {
            pool: self,
            conn: Some(conn),
        })
    }

    fn release(&self, slot: Option<C>) {
        // The channel holds exactly `size` slots, so this never blocks.
        if self.idle_tx.try_send(slot).is_err() {
            warn!("{} pool: slot lost on release", self.name);
        }
    }
}

/// A checked-out connection, returned to its pool on drop
pub struct PooledConnection<'a, C> {
    pool: &'a Pool<C>,
    conn: Option<C>,
}

impl<C> PooledConnection<'_, C> {
    /// Close the connection instead of returning it to the pool
    pub fn discard(mut self) {
        self.conn = None;
        debug!("{} pool: discarded connection", self.pool.name);
    }
}

impl<C> Deref for PooledConnection<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        // Only `discard` and `drop` take the connection, and both consume the guard.
        self.conn.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<C> DerefMut for PooledConnection<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<C> Drop for PooledConnection<'_, C> {
    fn drop(&mut self) {
        self.pool.release(self.conn.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_pool(size: usize) -> (Pool<usize>, Arc<AtomicUsize>) {
        let opened = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&opened);
        let pool = Pool::new("test", size, Duration::from_millis(50), move || {
            Ok(counter.fetch_add(1, Ordering::SeqCst))
        })
        .unwrap();
        (pool, opened)
    }

    #[test]
    fn test_connections_are_reused() {
        let (pool, opened) = counting_pool(2);
        for _ in 0..10 {
            let conn = pool.get().unwrap();
            assert_eq!(*conn, 0);
        }
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exhausted_pool_times_out() {
        let (pool, _) = counting_pool(2);
        let a = pool.get().unwrap();
        let _b = pool.get().unwrap();
        let err = pool.get().err().unwrap();
        assert!(err.is_retryable());
        drop(a);
        assert!(pool.get().is_ok());
    }

    #[test]
    fn test_discarded_connection_is_replaced() {
        let (pool, opened) = counting_pool(1);
        pool.get().unwrap().discard();
        assert_eq!(*pool.get().unwrap(), 1);
        assert_eq!(opened.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failed_connect_keeps_slot() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let pool: Pool<()> = Pool::new("failing", 1, Duration::from_millis(50), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(Error::backend("refused"))
        })
        .unwrap();
        assert!(pool.get().is_err());
        assert!(pool.get().is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(Pool::new("empty", 0, Duration::from_secs(1), || Ok(())).is_err());
    }
}
