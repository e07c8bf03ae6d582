//! Fixed-size worker-pool executor. Bounds concurrency with a semaphore and tracks each
//! submission's task via a `JoinSet` so cancellation can abort in-flight work.

use std::sync::Arc;

use async_trait::async_trait;
use forge_core::model::WorkSpec;
use forge_registry::Registry;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::executor::{Executor, ExternalStatus};

enum Slot {
    Running(AbortHandle),
    Completed(serde_json::Value),
    Failed(String),
    Cancelled,
}

/// A pool of `max_concurrency` permits. Submissions beyond that queue behind the semaphore;
/// each accepted submission still spawns immediately (the permit is held for its lifetime),
/// mirroring the bounded worker-pool shape the dispatcher's worker loop uses elsewhere.
pub struct ThreadPoolExecutor {
    registry: Arc<Registry>,
    semaphore: Arc<Semaphore>,
    slots: Arc<Mutex<std::collections::HashMap<String, Slot>>>,
}

impl ThreadPoolExecutor {
    pub fn new(registry: Arc<Registry>, max_concurrency: usize) -> Self {
        Self {
            registry,
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
            slots: Arc::new(Mutex::new(std::collections::HashMap::new())),
        }
    }
}

#[async_trait]
impl Executor for ThreadPoolExecutor {
    async fn submit(&self, spec: &WorkSpec) -> forge_core::error::Result<String> {
        let external_ref = Uuid::now_v7().to_string();
        let handler = self.registry.get(spec.kind, &spec.name)?;
        let params = spec.params.clone();

        let semaphore = self.semaphore.clone();
        let slots = self.slots.clone();
        let key = external_ref.clone();

        let handle = tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
            let outcome = handler.call(params).await;
            let slot = match outcome {
                Ok(value) => Slot::Completed(value),
                Err(err) => Slot::Failed(err.to_string()),
            };
            let mut slots = slots.lock();
            if !matches!(slots.get(&key), Some(Slot::Cancelled)) {
                slots.insert(key, slot);
            }
        });

        self.slots
            .lock()
            .insert(external_ref.clone(), Slot::Running(handle.abort_handle()));
        Ok(external_ref)
    }

    async fn cancel(&self, external_ref: &str) -> forge_core::error::Result<bool> {
        let mut slots = self.slots.lock();
        match slots.get(external_ref) {
            Some(Slot::Running(handle)) => {
                handle.abort();
                slots.insert(external_ref.to_string(), Slot::Cancelled);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_status(
        &self,
        external_ref: &str,
    ) -> forge_core::error::Result<Option<ExternalStatus>> {
        let slots = self.slots.lock();
        Ok(slots.get(external_ref).map(|s| match s {
            Slot::Running(_) => ExternalStatus::Running,
            Slot::Completed(_) => ExternalStatus::Completed,
            Slot::Failed(_) => ExternalStatus::Failed,
            Slot::Cancelled => ExternalStatus::Cancelled,
        }))
    }

    async fn get_result(
        &self,
        external_ref: &str,
    ) -> forge_core::error::Result<Option<serde_json::Value>> {
        let slots = self.slots.lock();
        Ok(match slots.get(external_ref) {
            Some(Slot::Completed(value)) => Some(value.clone()),
            _ => None,
        })
    }

    async fn get_error(&self, external_ref: &str) -> forge_core::error::Result<Option<String>> {
        let slots = self.slots.lock();
        Ok(match slots.get(external_ref) {
            Some(Slot::Failed(msg)) => Some(msg.clone()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::model::WorkKind;
    use std::time::Duration;

    fn registry() -> Arc<Registry> {
        let reg = Registry::new();
        reg.register_async_fn(WorkKind::Task, "slow_double", |p| async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let x = p.get("x").and_then(|v| v.as_i64()).unwrap_or(0);
            Ok(serde_json::json!({ "out": x * 2 }))
        })
        .unwrap();
        Arc::new(reg)
    }

    #[tokio::test]
    async fn submit_eventually_completes() {
        let executor = ThreadPoolExecutor::new(registry(), 4);
        let spec = WorkSpec::new(WorkKind::Task, "slow_double", serde_json::json!({"x": 5}));
        let external_ref = executor.submit(&spec).await.unwrap();

        for _ in 0..20 {
            if executor.get_status(&external_ref).await.unwrap() == Some(ExternalStatus::Completed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            executor.get_result(&external_ref).await.unwrap(),
            Some(serde_json::json!({"out": 10}))
        );
    }

    #[tokio::test]
    async fn cancel_aborts_in_flight_task() {
        let executor = ThreadPoolExecutor::new(registry(), 4);
        let spec = WorkSpec::new(WorkKind::Task, "slow_double", serde_json::json!({"x": 5}));
        let external_ref = executor.submit(&spec).await.unwrap();
        assert!(executor.cancel(&external_ref).await.unwrap());
        assert_eq!(
            executor.get_status(&external_ref).await.unwrap(),
            Some(ExternalStatus::Cancelled)
        );
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_semaphore() {
        let executor = ThreadPoolExecutor::new(registry(), 1);
        assert_eq!(executor.semaphore.available_permits(), 1);
    }
}
