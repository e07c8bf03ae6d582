//! Cooperative single-threaded-style executor: many in-flight handler calls sharing one
//! event loop, bounded by a semaphore rather than OS threads. Suited to I/O-bound handlers.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use forge_core::model::WorkSpec;
use forge_registry::Registry;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::executor::{Executor, ExternalStatus};

enum Outcome {
    Completed(serde_json::Value),
    Failed(String),
}

pub struct CooperativeExecutor {
    registry: Arc<Registry>,
    gate: Arc<Semaphore>,
    outcomes: DashMap<String, Outcome>,
}

impl CooperativeExecutor {
    pub fn new(registry: Arc<Registry>, max_in_flight: usize) -> Self {
        Self {
            registry,
            gate: Arc::new(Semaphore::new(max_in_flight.max(1))),
            outcomes: DashMap::new(),
        }
    }
}

#[async_trait]
impl Executor for CooperativeExecutor {
    async fn submit(&self, spec: &WorkSpec) -> forge_core::error::Result<String> {
        let external_ref = Uuid::now_v7().to_string();
        let handler = self.registry.get(spec.kind, &spec.name)?;
        let _permit = self
            .gate
            .acquire()
            .await
            .expect("semaphore never closed");
        let outcome = match handler.call(spec.params.clone()).await {
            Ok(value) => Outcome::Completed(value),
            Err(err) => Outcome::Failed(err.to_string()),
        };
        self.outcomes.insert(external_ref.clone(), outcome);
        Ok(external_ref)
    }

    async fn cancel(&self, _external_ref: &str) -> forge_core::error::Result<bool> {
        Ok(false)
    }

    async fn get_status(
        &self,
        external_ref: &str,
    ) -> forge_core::error::Result<Option<ExternalStatus>> {
        Ok(self.outcomes.get(external_ref).map(|o| match o.value() {
            Outcome::Completed(_) => ExternalStatus::Completed,
            Outcome::Failed(_) => ExternalStatus::Failed,
        }))
    }

    async fn get_result(
        &self,
        external_ref: &str,
    ) -> forge_core::error::Result<Option<serde_json::Value>> {
        Ok(self.outcomes.get(external_ref).and_then(|o| match o.value() {
            Outcome::Completed(value) => Some(value.clone()),
            Outcome::Failed(_) => None,
        }))
    }

    async fn get_error(&self, external_ref: &str) -> forge_core::error::Result<Option<String>> {
        Ok(self.outcomes.get(external_ref).and_then(|o| match o.value() {
            Outcome::Failed(msg) => Some(msg.clone()),
            Outcome::Completed(_) => None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::model::WorkKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn submit_runs_and_reports_completed() {
        let reg = Registry::new();
        reg.register_async_fn(WorkKind::Task, "echo", |p| async move { Ok(p) })
            .unwrap();
        let executor = CooperativeExecutor::new(Arc::new(reg), 2);
        let spec = WorkSpec::new(WorkKind::Task, "echo", serde_json::json!({"a": 1}));
        let external_ref = executor.submit(&spec).await.unwrap();
        assert_eq!(
            executor.get_status(&external_ref).await.unwrap(),
            Some(ExternalStatus::Completed)
        );
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let reg = Registry::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_observed = Arc::new(AtomicUsize::new(0));
        {
            let in_flight = in_flight.clone();
            let max_observed = max_observed.clone();
            reg.register_async_fn(WorkKind::Task, "track", move |_p| {
                let in_flight = in_flight.clone();
                let max_observed = max_observed.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_observed.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(serde_json::Value::Null)
                }
            })
            .unwrap();
        }
        let executor = Arc::new(CooperativeExecutor::new(Arc::new(reg), 2));
        let mut handles = Vec::new();
        for _ in 0..6 {
            let executor = executor.clone();
            handles.push(tokio::spawn(async move {
                let spec = WorkSpec::new(WorkKind::Task, "track", serde_json::json!({}));
                executor.submit(&spec).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(max_observed.load(Ordering::SeqCst) <= 2);
    }
}
