//! Lazily established, shared backend connection handle.

use std::future::Future;

use tokio::sync::Mutex;

use crate::error::Result;

/// Lifecycle of a backend connection.
#[derive(Debug)]
pub enum ConnectionState<C> {
    /// Never connected
    Uninitialized,
    /// Connected with a shareable handle
    Connected(C),
    /// Explicitly closed; the next use reconnects
    Closed,
}

/// Snapshot of a [`ConnectionState`] without the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Uninitialized,
    Connected,
    Closed,
}

/// Owns a connection handle that is created on first use.
///
/// The lock is held only while connecting or swapping the handle. Callers get
/// a clone of the handle and run their operations without it, so a slow
/// operation on one key never delays another.
#[derive(Debug)]
pub struct LazyConnection<C> {
    state: Mutex<ConnectionState<C>>,
}

impl<C: Clone> LazyConnection<C> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Uninitialized),
        }
    }

    /// Return the live handle, connecting with `connect` if there is none.
    ///
    /// Concurrent first callers share a single connection attempt. A failed
    /// attempt leaves the state untouched so the next call tries again.
    pub async fn get_or_connect<F, Fut>(&self, connect: F) -> Result<C>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C>>,
    {
        let mut state = self.state.lock().await;
        if let ConnectionState::Connected(handle) = &*state {
            return Ok(handle.clone());
        }

        let handle = connect().await?;
        *state = ConnectionState::Connected(handle.clone());
        Ok(handle)
    }

    /// Take the handle out, leaving the connection closed.
    ///
    /// Returns `None` when there was nothing to close.
    pub async fn close(&self) -> Option<C> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, ConnectionState::Closed) {
            ConnectionState::Connected(handle) => Some(handle),
            ConnectionState::Uninitialized => {
                *state = ConnectionState::Uninitialized;
                None
            }
            ConnectionState::Closed => None,
        }
    }

    /// Drop a handle that turned out to be broken so the next use reconnects.
    ///
    /// Returns `false` when there was no live handle to drop.
    pub async fn invalidate(&self) -> bool {
        let mut state = self.state.lock().await;
        if matches!(*state, ConnectionState::Connected(_)) {
            *state = ConnectionState::Uninitialized;
            true
        } else {
            false
        }
    }

    pub async fn status(&self) -> ConnectionStatus {
        match &*self.state.lock().await {
            ConnectionState::Uninitialized => ConnectionStatus::Uninitialized,
            ConnectionState::Connected(_) => ConnectionStatus::Connected,
            ConnectionState::Closed => ConnectionStatus::Closed,
        }
    }
}

impl<C: Clone> Default for LazyConnection<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RateLimitError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_connects_once() {
        let connection = LazyConnection::<u32>::new();
        let attempts = AtomicUsize::new(0);

        for _ in 0..3 {
            let handle = connection
                .get_or_connect(|| async {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                })
                .await
                .unwrap();
            assert_eq!(handle, 7);
        }

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(connection.status().await, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_concurrent_first_use_shares_attempt() {
        let connection = Arc::new(LazyConnection::<u32>::new());
        let attempts = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let connection = connection.clone();
                let attempts = attempts.clone();
                tokio::spawn(async move {
                    connection
                        .get_or_connect(|| async move {
                            attempts.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                            Ok(1)
                        })
                        .await
                })
            })
            .collect();

        for task in futures::future::join_all(tasks).await {
            assert_eq!(task.unwrap().unwrap(), 1);
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_is_retried_next_time() {
        let connection = LazyConnection::<u32>::new();

        let err = connection
            .get_or_connect(|| async { Err(RateLimitError::Connection("down".to_string())) })
            .await
            .unwrap_err();
        assert!(matches!(err, RateLimitError::Connection(_)));
        assert_eq!(connection.status().await, ConnectionStatus::Uninitialized);

        let handle = connection.get_or_connect(|| async { Ok(3) }).await.unwrap();
        assert_eq!(handle, 3);
    }

    #[tokio::test]
    async fn test_close_then_reconnect() {
        let connection = LazyConnection::<u32>::new();
        connection.get_or_connect(|| async { Ok(1) }).await.unwrap();

        assert_eq!(connection.close().await, Some(1));
        assert_eq!(connection.status().await, ConnectionStatus::Closed);
        assert_eq!(connection.close().await, None);

        let handle = connection.get_or_connect(|| async { Ok(2) }).await.unwrap();
        assert_eq!(handle, 2);
        assert_eq!(connection.status().await, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_invalidated_handle_is_replaced() {
        let connection = LazyConnection::<u32>::new();
        assert!(!connection.invalidate().await);

        connection.get_or_connect(|| async { Ok(1) }).await.unwrap();
        assert!(connection.invalidate().await);
        assert_eq!(connection.status().await, ConnectionStatus::Uninitialized);

        let handle = connection.get_or_connect(|| async { Ok(2) }).await.unwrap();
        assert_eq!(handle, 2);
    }

    #[tokio::test]
    async fn test_close_when_never_connected() {
        let connection = LazyConnection::<u32>::new();

        assert_eq!(connection.close().await, None);
        assert_eq!(connection.status().await, ConnectionStatus::Uninitialized);
    }
}
