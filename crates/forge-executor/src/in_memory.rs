//! Synchronous in-process executor. Runs the handler to completion inside `submit`; useful
//! for tests and for embedding the engine without a separate worker process.

use async_trait::async_trait;
use dashmap::DashMap;
use forge_core::model::WorkSpec;
use forge_registry::Registry;
use std::sync::Arc;
use uuid::Uuid;

use crate::executor::{Executor, ExternalStatus};

struct Outcome {
    status: ExternalStatus,
    result: Option<serde_json::Value>,
    error: Option<String>,
}

/// Executes handlers from `registry` synchronously on the calling task, recording the
/// terminal outcome for later lookup by `external_ref`.
pub struct InMemoryExecutor {
    registry: Arc<Registry>,
    outcomes: DashMap<String, Outcome>,
}

impl InMemoryExecutor {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            outcomes: DashMap::new(),
        }
    }
}

#[async_trait]
impl Executor for InMemoryExecutor {
    async fn submit(&self, spec: &WorkSpec) -> forge_core::error::Result<String> {
        let external_ref = Uuid::now_v7().to_string();
        let handler = self.registry.get(spec.kind, &spec.name)?;
        let outcome = match handler.call(spec.params.clone()).await {
            Ok(value) => Outcome {
                status: ExternalStatus::Completed,
                result: Some(value),
                error: None,
            },
            Err(err) => Outcome {
                status: ExternalStatus::Failed,
                result: None,
                error: Some(err.to_string()),
            },
        };
        self.outcomes.insert(external_ref.clone(), outcome);
        Ok(external_ref)
    }

    async fn cancel(&self, _external_ref: &str) -> forge_core::error::Result<bool> {
        // Execution already completed synchronously by the time a caller could cancel.
        Ok(false)
    }

    async fn get_status(
        &self,
        external_ref: &str,
    ) -> forge_core::error::Result<Option<ExternalStatus>> {
        Ok(self.outcomes.get(external_ref).map(|o| o.status))
    }

    async fn get_result(
        &self,
        external_ref: &str,
    ) -> forge_core::error::Result<Option<serde_json::Value>> {
        Ok(self.outcomes.get(external_ref).and_then(|o| o.result.clone()))
    }

    async fn get_error(&self, external_ref: &str) -> forge_core::error::Result<Option<String>> {
        Ok(self.outcomes.get(external_ref).and_then(|o| o.error.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::model::WorkKind;

    fn registry() -> Arc<Registry> {
        let reg = Registry::new();
        reg.register_fn(WorkKind::Task, "double", |p| {
            let x = p.get("x").and_then(|v| v.as_i64()).unwrap_or(0);
            Ok(serde_json::json!({ "out": x * 2 }))
        })
        .unwrap();
        reg.register_fn(WorkKind::Task, "boom", |_p| {
            Err(forge_core::error::ForgeError::handler("always fails"))
        })
        .unwrap();
        Arc::new(reg)
    }

    #[tokio::test]
    async fn submit_runs_handler_and_reports_completed() {
        let executor = InMemoryExecutor::new(registry());
        let spec = WorkSpec::new(WorkKind::Task, "double", serde_json::json!({"x": 10}));
        let external_ref = executor.submit(&spec).await.unwrap();
        assert_eq!(
            executor.get_status(&external_ref).await.unwrap(),
            Some(ExternalStatus::Completed)
        );
        assert_eq!(
            executor.get_result(&external_ref).await.unwrap(),
            Some(serde_json::json!({"out": 20}))
        );
    }

    #[tokio::test]
    async fn submit_reports_failed_with_error() {
        let executor = InMemoryExecutor::new(registry());
        let spec = WorkSpec::new(WorkKind::Task, "boom", serde_json::json!({}));
        let external_ref = executor.submit(&spec).await.unwrap();
        assert_eq!(
            executor.get_status(&external_ref).await.unwrap(),
            Some(ExternalStatus::Failed)
        );
        assert!(executor.get_error(&external_ref).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unknown_handler_bubbles_up() {
        let executor = InMemoryExecutor::new(registry());
        let spec = WorkSpec::new(WorkKind::Task, "missing", serde_json::json!({}));
        assert!(executor.submit(&spec).await.is_err());
    }
}
