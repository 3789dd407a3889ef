//! Narrow lock and cache contracts used to serialize flows and to memoize
//! last-flow results.
//!
//! The engine works unchanged when both degrade to the no-op
//! implementations; it just recomputes more and stops guarding against a
//! second process flowing the same mapping.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::errors::LockError;

// ---------------------------------------------------------------------------
// Lock
// ---------------------------------------------------------------------------

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Take the lock for `ttl`. Returns `false` when someone else holds it.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError>;

    async fn release(&self, key: &str) -> Result<(), LockError>;
}

/// Run `action` while holding `key`.
pub async fn execute_with_lock<T, E, F, Fut>(
    lock: &dyn DistributedLock,
    key: &str,
    ttl: Duration,
    action: F,
) -> Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<LockError>,
{
    if !lock.try_acquire(key, ttl).await? {
        return Err(LockError::Held { key: key.to_string() }.into());
    }
    debug!(key, "lock acquired");

    let result = action().await;

    if let Err(e) = lock.release(key).await {
        warn!(key, error = %e, "failed to release lock");
    }
    result
}

/// Lock that always succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLock;

#[async_trait]
impl DistributedLock for NoopLock {
    async fn try_acquire(&self, _key: &str, _ttl: Duration) -> Result<bool, LockError> {
        Ok(true)
    }

    async fn release(&self, _key: &str) -> Result<(), LockError> {
        Ok(())
    }
}

/// Lock shared by the flows of a single process. Expired leases are reclaimed.
#[derive(Debug, Default)]
pub struct InProcessLock {
    leases: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl InProcessLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedLock for InProcessLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| LockError::Backend(e.to_string()))?;
        let now = Utc::now();
        let mut leases = self
            .leases
            .lock()
            .map_err(|e| LockError::Backend(e.to_string()))?;

        match leases.get(key) {
            Some(expires) if *expires > now => Ok(false),
            _ => {
                leases.insert(key.to_string(), now + ttl);
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str) -> Result<(), LockError> {
        self.leases
            .lock()
            .map_err(|e| LockError::Backend(e.to_string()))?
            .remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[async_trait]
pub trait FlowCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, LockError>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), LockError>;
}

/// Cache that never stores anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCache;

#[async_trait]
impl FlowCache for NoopCache {
    async fn get(&self, _key: &str) -> Result<Option<String>, LockError> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), LockError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlowCache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, LockError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| LockError::Backend(e.to_string()))?;
        match entries.get(key) {
            Some((value, expires)) if *expires > Utc::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), LockError> {
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| LockError::Backend(e.to_string()))?;
        self.entries
            .lock()
            .map_err(|e| LockError::Backend(e.to_string()))?
            .insert(key.to_string(), (value, Utc::now() + ttl));
        Ok(())
    }
}
