//! Process-pool executor: shells out to an external command per submission, since handlers
//! cannot cross a process boundary as closures. Handlers are referenced by a stable dotted
//! path (e.g. `"handlers.reports.generate"`) rather than by registry lookup.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use forge_core::model::WorkSpec;
use tokio::process::Command;
use uuid::Uuid;

use crate::executor::{Executor, ExternalStatus};

enum Slot {
    Completed(serde_json::Value),
    Failed(String),
}

/// Runs `{command} {dotted_path} {json_params}` in a child process for each submission,
/// capped at `max_concurrency` concurrent children via a semaphore. The dotted path is the
/// `WorkSpec.name` field verbatim — this executor does no registry lookup of its own.
pub struct ProcessPoolExecutor {
    command: String,
    env: HashMap<String, String>,
    semaphore: Arc<tokio::sync::Semaphore>,
    outcomes: DashMap<String, Slot>,
}

impl ProcessPoolExecutor {
    pub fn new(command: impl Into<String>, max_concurrency: usize) -> Self {
        Self {
            command: command.into(),
            env: HashMap::new(),
            semaphore: Arc::new(tokio::sync::Semaphore::new(max_concurrency.max(1))),
            outcomes: DashMap::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
impl Executor for ProcessPoolExecutor {
    async fn submit(&self, spec: &WorkSpec) -> forge_core::error::Result<String> {
        let external_ref = Uuid::now_v7().to_string();
        let params = serde_json::to_string(&spec.params)?;

        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("semaphore never closed");

        let output = Command::new(&self.command)
            .arg(&spec.name)
            .arg(&params)
            .envs(&self.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| forge_core::error::ForgeError::Executor(e.to_string()))?;

        let slot = if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            match serde_json::from_str::<serde_json::Value>(&stdout) {
                Ok(value) => Slot::Completed(value),
                Err(_) => Slot::Completed(serde_json::Value::String(stdout.trim().to_string())),
            }
        } else {
            Slot::Failed(String::from_utf8_lossy(&output.stderr).trim().to_string())
        };

        self.outcomes.insert(external_ref.clone(), slot);
        Ok(external_ref)
    }

    async fn cancel(&self, _external_ref: &str) -> forge_core::error::Result<bool> {
        // The child process has already exited by the time submit() returns.
        Ok(false)
    }

    async fn get_status(
        &self,
        external_ref: &str,
    ) -> forge_core::error::Result<Option<ExternalStatus>> {
        Ok(self.outcomes.get(external_ref).map(|s| match s.value() {
            Slot::Completed(_) => ExternalStatus::Completed,
            Slot::Failed(_) => ExternalStatus::Failed,
        }))
    }

    async fn get_result(
        &self,
        external_ref: &str,
    ) -> forge_core::error::Result<Option<serde_json::Value>> {
        Ok(self.outcomes.get(external_ref).and_then(|s| match s.value() {
            Slot::Completed(value) => Some(value.clone()),
            Slot::Failed(_) => None,
        }))
    }

    async fn get_error(&self, external_ref: &str) -> forge_core::error::Result<Option<String>> {
        Ok(self.outcomes.get(external_ref).and_then(|s| match s.value() {
            Slot::Failed(msg) => Some(msg.clone()),
            Slot::Completed(_) => None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::model::WorkKind;

    #[tokio::test]
    async fn submit_runs_echo_and_parses_json_stdout() {
        // `echo` is available on every CI image this crate targets; it stands in for a
        // real handler binary that prints its JSON result to stdout.
        let executor = ProcessPoolExecutor::new("echo", 2);
        let spec = WorkSpec::new(
            WorkKind::Task,
            "handlers.noop",
            serde_json::json!({"x": 1}),
        );
        let external_ref = executor.submit(&spec).await.unwrap();
        assert_eq!(
            executor.get_status(&external_ref).await.unwrap(),
            Some(ExternalStatus::Completed)
        );
    }

    #[tokio::test]
    async fn submit_reports_failure_on_nonzero_exit() {
        let executor = ProcessPoolExecutor::new("false", 2);
        let spec = WorkSpec::new(WorkKind::Task, "handlers.fail", serde_json::json!({}));
        let external_ref = executor.submit(&spec).await.unwrap();
        assert_eq!(
            executor.get_status(&external_ref).await.unwrap(),
            Some(ExternalStatus::Failed)
        );
    }
}
