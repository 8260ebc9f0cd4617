//! Bounded pool of proxy client connections

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::MAX_CONNECTIONS;

/// Limits how many client connections the proxy serves at once
#[derive(Clone)]
pub struct ConnectionPool {
    semaphore: Arc<Semaphore>,
    active_count: Arc<AtomicUsize>,
    max_connections: usize,
}

impl ConnectionPool {
    /// Create a new connection pool
    ///
    /// # Panics
    ///
    /// Panics if `max_connections` is 0
    #[must_use]
    pub fn new(max_connections: usize) -> Self {
        assert!(max_connections > 0, "max_connections must be > 0");

        Self {
            semaphore: Arc::new(Semaphore::new(max_connections)),
            active_count: Arc::new(AtomicUsize::new(0)),
            max_connections,
        }
    }

    /// Take a slot for a new connection, or `None` when the pool is full
    pub fn try_acquire(&self) -> Option<ConnectionGuard> {
        let permit = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
        self.active_count.fetch_add(1, Ordering::Relaxed);
        Some(ConnectionGuard {
            _permit: permit,
            active_count: Arc::clone(&self.active_count),
        })
    }

    /// Connections currently being served
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }

    /// Pool capacity
    #[must_use]
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(MAX_CONNECTIONS)
    }
}

/// Slot in the pool, released on drop
pub struct ConnectionGuard {
    _permit: OwnedSemaphorePermit,
    active_count: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active_count.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_pool_limits() {
        let pool = ConnectionPool::new(2);
        assert_eq!(pool.max_connections(), 2);

        let first = pool.try_acquire().unwrap();
        let _second = pool.try_acquire().unwrap();
        assert_eq!(pool.active_connections(), 2);
        assert!(pool.try_acquire().is_none());

        drop(first);
        assert_eq!(pool.active_connections(), 1);
        assert!(pool.try_acquire().is_some());
    }

    #[test]
    fn test_default_capacity() {
        assert_eq!(ConnectionPool::default().max_connections(), MAX_CONNECTIONS);
    }

    #[test]
    #[should_panic(expected = "max_connections must be > 0")]
    fn test_connection_pool_zero_panic() {
        let _ = ConnectionPool::new(0);
    }
}
