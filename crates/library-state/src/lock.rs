//! Cooperative advisory locks shared across workers.
//!
//! Acquisition never blocks: `try_acquire` either takes the lock or reports
//! that someone else holds it. [`with_advisory_lock`] scopes a critical
//! section so the lock is released on every exit path of the body.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::storage_traits::StorageResult;

/// Integer key identifying one advisory lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockKey(pub i64);

impl LockKey {
    /// Derive a stable key from a resource name.
    pub fn named(name: &str) -> Self {
        let digest = Sha256::digest(name.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        LockKey(i64::from_be_bytes(bytes))
    }
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Distributed, non-blocking mutual exclusion.
///
/// Guarantees:
/// - at most one holder per key at a time
/// - `try_acquire` returns immediately with `false` when the key is held
/// - `release` of a held key makes it immediately acquirable again
#[async_trait]
pub trait AdvisoryLock: Send + Sync {
    /// Try to take the lock without waiting.
    async fn try_acquire(&self, key: LockKey) -> StorageResult<bool>;

    /// Release a lock previously taken with `try_acquire`.
    async fn release(&self, key: LockKey) -> StorageResult<()>;
}

/// Returned by [`with_advisory_lock`] when the lock is held elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockUnavailable(pub LockKey);

/// A taken lock. Dropping it without [`HeldLock::release`] (the body
/// panicked, or its task was aborted) releases the lock in the background.
struct HeldLock {
    lock: Arc<dyn AdvisoryLock>,
    key: LockKey,
    armed: bool,
}

impl HeldLock {
    async fn release(mut self) {
        self.armed = false;
        if let Err(e) = self.lock.release(self.key).await {
            warn!(lock = %self.key, error = %e, "failed to release advisory lock");
        }
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let (lock, key) = (self.lock.clone(), self.key);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(lock = %key, "advisory lock holder did not finish, releasing");
                runtime.spawn(async move {
                    if let Err(e) = lock.release(key).await {
                        warn!(lock = %key, error = %e, "failed to release advisory lock");
                    }
                });
            }
            Err(_) => warn!(lock = %key, "advisory lock dropped outside a runtime, left to expire"),
        }
    }
}

/// Run `body` while holding `key`.
///
/// If the lock cannot be taken the body is never polled and the error is
/// built from [`LockUnavailable`]. Once taken, the lock is released exactly
/// once whether the body succeeds, fails, panics or is cancelled. A failing
/// release is logged and does not mask the body's outcome.
pub async fn with_advisory_lock<T, E, F, Fut>(
    lock: &Arc<dyn AdvisoryLock>,
    key: LockKey,
    body: F,
) -> Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<LockUnavailable> + From<crate::StorageError>,
{
    if !lock.try_acquire(key).await? {
        debug!(lock = %key, "advisory lock busy");
        return Err(LockUnavailable(key).into());
    }
    debug!(lock = %key, "advisory lock acquired");
    let held = HeldLock {
        lock: lock.clone(),
        key,
        armed: true,
    };

    let outcome = body().await;
    held.release().await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_keys_are_stable() {
        assert_eq!(LockKey::named("recipes"), LockKey::named("recipes"));
        assert_ne!(LockKey::named("recipes"), LockKey::named("channels"));
    }
}
