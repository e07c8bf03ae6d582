//! DB-backed advisory locks with TTL self-healing.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use forge_core::prelude::*;
use uuid::Uuid;

#[async_trait]
pub trait ConcurrencyGuard: Send + Sync {
    /// Reap expired holders of `lock_key`, then try to grant it to `run_id` for `ttl_seconds`.
    /// Re-entrant: a second `acquire` by the same `run_id` refreshes the expiry and returns
    /// true. A different holder with an unexpired lock causes this to return false.
    async fn acquire(&self, lock_key: &str, run_id: Uuid, ttl_seconds: i64) -> Result<bool>;

    /// Releases only if `run_id` (when given) matches the current holder.
    async fn release(&self, lock_key: &str, run_id: Option<Uuid>) -> Result<bool>;

    /// Self-healing read: an expired row reads as unlocked.
    async fn is_locked(&self, lock_key: &str) -> Result<bool>;

    async fn extend_lock(&self, lock_key: &str, run_id: Uuid, ttl_seconds: i64) -> Result<bool>;

    /// Bulk-delete expired rows. Idempotent: a second call at the same instant removes zero.
    async fn cleanup_expired(&self) -> Result<u64>;

    /// Count of currently unexpired locks, for the Health Checker's active-lock-count check.
    /// Defaults to 0 for implementations that don't track this cheaply.
    async fn count_active(&self) -> Result<u64> {
        Ok(0)
    }
}

use std::collections::HashMap;
use parking_lot::Mutex;

/// `dashmap`-shaped in-memory guard, but implemented with a single `Mutex<HashMap>` since the
/// reap-then-insert-then-conflict-check algorithm must run as one atomic step per key.
pub struct InMemoryConcurrencyGuard {
    locks: Mutex<HashMap<String, ConcurrencyLock>>,
}

impl Default for InMemoryConcurrencyGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryConcurrencyGuard {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ConcurrencyGuard for InMemoryConcurrencyGuard {
    async fn acquire(&self, lock_key: &str, run_id: Uuid, ttl_seconds: i64) -> Result<bool> {
        let now = Utc::now();
        let mut locks = self.locks.lock();

        // 1. reap expired holder
        if let Some(existing) = locks.get(lock_key) {
            if existing.is_expired(now) {
                locks.remove(lock_key);
            }
        }

        // 2/3. try insert; on conflict check ownership
        match locks.get_mut(lock_key) {
            None => {
                locks.insert(
                    lock_key.to_string(),
                    ConcurrencyLock {
                        lock_key: lock_key.to_string(),
                        run_id,
                        acquired_at: now,
                        expires_at: now + ChronoDuration::seconds(ttl_seconds),
                    },
                );
                tracing::debug!(lock_key, %run_id, "lock acquired");
                Ok(true)
            }
            Some(existing) if existing.run_id == run_id => {
                existing.expires_at = now + ChronoDuration::seconds(ttl_seconds);
                Ok(true)
            }
            Some(_) => {
                tracing::debug!(lock_key, %run_id, "lock conflict");
                Ok(false)
            }
        }
    }

    async fn release(&self, lock_key: &str, run_id: Option<Uuid>) -> Result<bool> {
        let mut locks = self.locks.lock();
        match locks.get(lock_key) {
            Some(existing) if run_id.is_none() || run_id == Some(existing.run_id) => {
                locks.remove(lock_key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn is_locked(&self, lock_key: &str) -> Result<bool> {
        let now = Utc::now();
        let locks = self.locks.lock();
        Ok(locks.get(lock_key).map(|l| !l.is_expired(now)).unwrap_or(false))
    }

    async fn extend_lock(&self, lock_key: &str, run_id: Uuid, ttl_seconds: i64) -> Result<bool> {
        let now = Utc::now();
        let mut locks = self.locks.lock();
        match locks.get_mut(lock_key) {
            Some(existing) if existing.run_id == run_id => {
                existing.expires_at = now + ChronoDuration::seconds(ttl_seconds);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cleanup_expired(&self) -> Result<u64> {
        let now = Utc::now();
        let mut locks = self.locks.lock();
        let before = locks.len();
        locks.retain(|_, l| !l.is_expired(now));
        Ok((before - locks.len()) as u64)
    }

    async fn count_active(&self) -> Result<u64> {
        let now = Utc::now();
        let locks = self.locks.lock();
        Ok(locks.values().filter(|l| !l.is_expired(now)).count() as u64)
    }
}
