//! Per-connection mutual exclusion.
//!
//! Refresh tokens are single-use at most providers. Two requests that both
//! find an expired token and both refresh will leave one of them holding a
//! revoked refresh token, so refresh-and-save runs under a lease keyed by
//! connection name. The lease is in-process only.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Held while a connection's token is being replaced.
pub type Lease = OwnedMutexGuard<()>;

/// Lazily-created async locks, one per connection name.
#[derive(Debug, Default)]
pub struct ConnectionLeases {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ConnectionLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of `connection`.
    pub async fn acquire(&self, connection: &str) -> Lease {
        let lock = {
            let mut locks = self.locks.lock();
            locks
                .entry(connection.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    fn is_held(&self, connection: &str) -> bool {
        self.locks
            .lock()
            .get(connection)
            .is_some_and(|lock| lock.try_lock().is_err())
    }
}
