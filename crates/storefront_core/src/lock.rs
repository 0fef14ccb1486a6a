//! Distributed mutual exclusion over the shared key-value store.
//!
//! # Responsibility
//! - Acquire a named lock with one conditional write carrying the owner
//!   token and a TTL.
//! - Release only a lock the caller still owns.
//!
//! # Invariants
//! - Acquisition never blocks, sleeps or retries; callers own retry policy.
//! - Release compares the stored token with the caller's token atomically
//!   and is a no-op on mismatch.
//! - TTL expiry is the only recovery path for a crashed holder; there is no
//!   renewal, and the lock is not re-entrant.

use crate::context::LockOwner;
use crate::kv::keys::lock_key;
use crate::kv::{KvResult, KvStore};
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;

/// Named, TTL-bounded lock service.
#[derive(Clone)]
pub struct DistributedMutex {
    store: Arc<dyn KvStore>,
}

impl DistributedMutex {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Attempts to take `resource` for `ttl`.
    ///
    /// Returns `Ok(true)` only when the lock key did not exist before.
    pub fn try_acquire(&self, resource: &str, ttl: Duration, owner: &LockOwner) -> KvResult<bool> {
        let key = lock_key(resource)?;
        let acquired = self.store.set_if_absent(&key, owner.token(), ttl)?;
        debug!(
            "event=lock_acquire module=lock status={} resource={} ttl_ms={}",
            if acquired { "ok" } else { "contended" },
            resource,
            ttl.as_millis()
        );
        Ok(acquired)
    }

    /// Releases `resource` if `owner` still holds it.
    ///
    /// Returns `Ok(false)` when the lock expired or belongs to someone else.
    pub fn release(&self, resource: &str, owner: &LockOwner) -> KvResult<bool> {
        let key = lock_key(resource)?;
        let released = self.store.delete_if_equals(&key, owner.token())?;
        if !released {
            debug!(
                "event=lock_release module=lock status=skipped resource={} reason=not_owner",
                resource
            );
        }
        Ok(released)
    }

    /// Like `try_acquire`, returning a guard that releases on drop.
    pub fn try_lock(
        &self,
        resource: &str,
        ttl: Duration,
        owner: &LockOwner,
    ) -> KvResult<Option<LockGuard>> {
        if !self.try_acquire(resource, ttl, owner)? {
            return Ok(None);
        }
        Ok(Some(LockGuard {
            mutex: self.clone(),
            resource: resource.to_string(),
            owner: owner.clone(),
            released: false,
        }))
    }
}

/// Held lock; released when dropped unless already released explicitly.
pub struct LockGuard {
    mutex: DistributedMutex,
    resource: String,
    owner: LockOwner,
    released: bool,
}

impl LockGuard {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Releases now and reports whether the lock was still owned.
    pub fn unlock(mut self) -> KvResult<bool> {
        self.released = true;
        self.mutex.release(&self.resource, &self.owner)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.mutex.release(&self.resource, &self.owner) {
            warn!(
                "event=lock_release module=lock status=error resource={} error={}",
                self.resource, err
            );
        }
    }
}
