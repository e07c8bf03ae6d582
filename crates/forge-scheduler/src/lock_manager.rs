//! Schedule locking on top of the same [`ConcurrencyGuard`] table the dispatcher and worker
//! loop use — a schedule lock is just a concurrency lock keyed `"schedule:<name>"`.

use std::collections::HashSet;
use std::sync::Arc;

use forge_core::error::Result;
use forge_store::concurrency_guard::ConcurrencyGuard;
use parking_lot::Mutex;
use uuid::Uuid;

fn lock_key(schedule_name: &str) -> String {
    format!("schedule:{schedule_name}")
}

/// One scheduler process's view of the locks it holds. `instance_id` doubles as the `run_id`
/// argument the underlying guard expects, so two scheduler instances never shadow each other.
pub struct ScheduleLockManager {
    guard: Arc<dyn ConcurrencyGuard>,
    instance_id: Uuid,
    held: Mutex<HashSet<String>>,
}

impl ScheduleLockManager {
    pub fn new(guard: Arc<dyn ConcurrencyGuard>) -> Self {
        Self {
            guard,
            instance_id: Uuid::now_v7(),
            held: Mutex::new(HashSet::new()),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub async fn acquire_schedule_lock(&self, schedule_name: &str, ttl_seconds: i64) -> Result<bool> {
        let key = lock_key(schedule_name);
        let granted = self.guard.acquire(&key, self.instance_id, ttl_seconds).await?;
        if granted {
            self.held.lock().insert(key);
        }
        Ok(granted)
    }

    pub async fn release_schedule_lock(&self, schedule_name: &str) -> Result<bool> {
        let key = lock_key(schedule_name);
        let released = self.guard.release(&key, Some(self.instance_id)).await?;
        self.held.lock().remove(&key);
        Ok(released)
    }

    pub async fn is_locked(&self, schedule_name: &str) -> Result<bool> {
        self.guard.is_locked(&lock_key(schedule_name)).await
    }

    /// Whether *this* instance currently believes it holds the lock. Cross-process holder
    /// identity isn't exposed by the narrow [`ConcurrencyGuard`] contract, so this only
    /// answers for locks this instance itself acquired.
    pub fn holds(&self, schedule_name: &str) -> bool {
        self.held.lock().contains(&lock_key(schedule_name))
    }

    pub async fn cleanup_expired_locks(&self) -> Result<u64> {
        self.guard.cleanup_expired().await
    }

    /// Recovery tool: release every lock this instance currently believes it holds.
    pub async fn force_release_all(&self) -> Result<()> {
        let keys: Vec<String> = self.held.lock().iter().cloned().collect();
        for key in keys {
            self.guard.release(&key, Some(self.instance_id)).await?;
        }
        self.held.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_store::concurrency_guard::InMemoryConcurrencyGuard;

    #[tokio::test]
    async fn acquire_then_conflict_from_other_instance() {
        let guard: Arc<dyn ConcurrencyGuard> = Arc::new(InMemoryConcurrencyGuard::new());
        let a = ScheduleLockManager::new(guard.clone());
        let b = ScheduleLockManager::new(guard.clone());

        assert!(a.acquire_schedule_lock("nightly", 60).await.unwrap());
        assert!(!b.acquire_schedule_lock("nightly", 60).await.unwrap());
        assert!(a.holds("nightly"));
        assert!(!b.holds("nightly"));
    }

    #[tokio::test]
    async fn release_then_other_instance_can_acquire() {
        let guard: Arc<dyn ConcurrencyGuard> = Arc::new(InMemoryConcurrencyGuard::new());
        let a = ScheduleLockManager::new(guard.clone());
        let b = ScheduleLockManager::new(guard.clone());

        a.acquire_schedule_lock("nightly", 60).await.unwrap();
        a.release_schedule_lock("nightly").await.unwrap();
        assert!(b.acquire_schedule_lock("nightly", 60).await.unwrap());
    }

    #[tokio::test]
    async fn force_release_all_clears_local_locks() {
        let guard: Arc<dyn ConcurrencyGuard> = Arc::new(InMemoryConcurrencyGuard::new());
        let a = ScheduleLockManager::new(guard.clone());
        a.acquire_schedule_lock("x", 60).await.unwrap();
        a.acquire_schedule_lock("y", 60).await.unwrap();

        a.force_release_all().await.unwrap();
        assert!(!a.holds("x"));
        assert!(!a.holds("y"));

        let b = ScheduleLockManager::new(guard);
        assert!(b.acquire_schedule_lock("x", 60).await.unwrap());
    }
}
