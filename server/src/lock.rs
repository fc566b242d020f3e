//! Named distributed locks over the shared store.
//!
//! A lock is a string key holding an owner token, acquired with SET NX PX
//! and released with a compare-and-delete so only the owner can release it.
//! The TTL is the safety net against crashed holders; normal release is
//! explicit.

use std::time::Duration;

use tracing::debug;

use crate::store::{SharedStore, StoreError};

#[derive(Clone)]
pub struct LockService {
    store: SharedStore,
}

impl LockService {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Try to take the lock. Fails (returns `false`) when any owner
    /// currently holds it.
    pub async fn acquire(
        &self,
        key: &str,
        owner_token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let acquired = self.store.set_nx_px(key, owner_token, ttl).await?;
        if !acquired {
            debug!(lock = key, "Lock held elsewhere");
        }
        Ok(acquired)
    }

    /// Release the lock only if `owner_token` still owns it. Returns whether
    /// a deletion occurred.
    pub async fn release(&self, key: &str, owner_token: &str) -> Result<bool, StoreError> {
        self.store.compare_and_delete(key, owner_token).await
    }
}
