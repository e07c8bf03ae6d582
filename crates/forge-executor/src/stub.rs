//! No-op executor that only records submissions, for assertions in dispatcher/worker tests.

use async_trait::async_trait;
use forge_core::model::WorkSpec;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::executor::{Executor, ExternalStatus};

#[derive(Default)]
pub struct StubExecutor {
    submissions: Mutex<Vec<WorkSpec>>,
}

impl StubExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submissions(&self) -> Vec<WorkSpec> {
        self.submissions.lock().clone()
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().len()
    }
}

#[async_trait]
impl Executor for StubExecutor {
    async fn submit(&self, spec: &WorkSpec) -> forge_core::error::Result<String> {
        self.submissions.lock().push(spec.clone());
        Ok(Uuid::now_v7().to_string())
    }

    async fn cancel(&self, _external_ref: &str) -> forge_core::error::Result<bool> {
        Ok(false)
    }

    async fn get_status(
        &self,
        _external_ref: &str,
    ) -> forge_core::error::Result<Option<ExternalStatus>> {
        Ok(None)
    }

    async fn get_result(
        &self,
        _external_ref: &str,
    ) -> forge_core::error::Result<Option<serde_json::Value>> {
        Ok(None)
    }

    async fn get_error(&self, _external_ref: &str) -> forge_core::error::Result<Option<String>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::model::WorkKind;

    #[tokio::test]
    async fn submit_records_spec_without_running_it() {
        let executor = StubExecutor::new();
        let spec = WorkSpec::new(WorkKind::Task, "noop", serde_json::json!({}));
        executor.submit(&spec).await.unwrap();
        assert_eq!(executor.submission_count(), 1);
        assert_eq!(executor.submissions()[0].name, "noop");
    }
}
