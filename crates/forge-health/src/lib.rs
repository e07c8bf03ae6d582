//! Health checks over the ledger, DLQ, and concurrency guard. Each check reports
//! an independent status; the report as a whole rolls up to the worst child status,
//! suitable for surfacing on a `/health` endpoint.

use std::sync::Arc;

use chrono::Utc;
use forge_core::error::Result;
use forge_core::model::RunStatus;
use forge_store::concurrency_guard::ConcurrencyGuard;
use forge_store::dlq::DlqManager;
use forge_store::ledger::{Ledger, RunFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
    pub details: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: Vec<CheckResult>,
    pub checked_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct HealthCheckerConfig {
    pub dlq_warning_threshold: u64,
    pub dlq_critical_threshold: u64,
    pub stale_running_minutes: i64,
    pub failure_rate_window: usize,
    pub failure_rate_warning: f64,
    pub failure_rate_critical: f64,
    pub lock_count_warning: u64,
}

impl Default for HealthCheckerConfig {
    fn default() -> Self {
        Self {
            dlq_warning_threshold: 50,
            dlq_critical_threshold: 200,
            stale_running_minutes: 30,
            failure_rate_window: 100,
            failure_rate_warning: 0.1,
            failure_rate_critical: 0.3,
            lock_count_warning: 500,
        }
    }
}

/// Consumes the ledger, DLQ, and concurrency guard to produce an aggregate [`HealthReport`].
pub struct HealthChecker {
    ledger: Arc<dyn Ledger>,
    dlq: Arc<dyn DlqManager>,
    guard: Arc<dyn ConcurrencyGuard>,
    config: HealthCheckerConfig,
}

impl HealthChecker {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        dlq: Arc<dyn DlqManager>,
        guard: Arc<dyn ConcurrencyGuard>,
        config: HealthCheckerConfig,
    ) -> Self {
        Self {
            ledger,
            dlq,
            guard,
            config,
        }
    }

    pub async fn check(&self) -> HealthReport {
        let checks = vec![
            self.check_db_round_trip().await,
            self.check_dlq_depth().await,
            self.check_stale_running().await,
            self.check_failure_rate().await,
            self.check_lock_count().await,
        ];
        let status = checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        HealthReport {
            status,
            checks,
            checked_at: Utc::now(),
        }
    }

    async fn check_db_round_trip(&self) -> CheckResult {
        let mut filter = RunFilter::new();
        filter.limit = 1;
        match self.ledger.list_executions(filter).await {
            Ok(_) => CheckResult {
                name: "db_round_trip".to_string(),
                status: HealthStatus::Healthy,
                message: "ledger reachable".to_string(),
                details: serde_json::json!({}),
            },
            Err(err) => CheckResult {
                name: "db_round_trip".to_string(),
                status: HealthStatus::Unhealthy,
                message: format!("ledger query failed: {err}"),
                details: serde_json::json!({}),
            },
        }
    }

    async fn check_dlq_depth(&self) -> CheckResult {
        let depth = match self.dlq.list_unresolved(None, 0).await {
            Ok(entries) => entries.len() as u64,
            Err(err) => {
                return CheckResult {
                    name: "dlq_depth".to_string(),
                    status: HealthStatus::Unhealthy,
                    message: format!("dlq query failed: {err}"),
                    details: serde_json::json!({}),
                }
            }
        };
        let status = if depth >= self.config.dlq_critical_threshold {
            HealthStatus::Unhealthy
        } else if depth >= self.config.dlq_warning_threshold {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        CheckResult {
            name: "dlq_depth".to_string(),
            status,
            message: format!("{depth} unresolved dead letters"),
            details: serde_json::json!({"depth": depth}),
        }
    }

    async fn check_stale_running(&self) -> CheckResult {
        let mut filter = RunFilter::new();
        filter.status = Some(RunStatus::Running);
        filter.limit = 1000;
        let running = match self.ledger.list_executions(filter).await {
            Ok(records) => records,
            Err(err) => {
                return CheckResult {
                    name: "stale_running".to_string(),
                    status: HealthStatus::Unhealthy,
                    message: format!("ledger query failed: {err}"),
                    details: serde_json::json!({}),
                }
            }
        };
        let cutoff = Utc::now() - chrono::Duration::minutes(self.config.stale_running_minutes);
        let stale = running
            .iter()
            .filter(|r| r.started_at.map(|at| at < cutoff).unwrap_or(false))
            .count();
        let status = if stale > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        CheckResult {
            name: "stale_running".to_string(),
            status,
            message: format!("{stale} runs stuck in RUNNING past {} minutes", self.config.stale_running_minutes),
            details: serde_json::json!({"stale_count": stale}),
        }
    }

    async fn check_failure_rate(&self) -> CheckResult {
        let mut completed_filter = RunFilter::new();
        completed_filter.status = Some(RunStatus::Completed);
        completed_filter.limit = self.config.failure_rate_window;

        let mut failed_filter = RunFilter::new();
        failed_filter.status = Some(RunStatus::Failed);
        failed_filter.limit = self.config.failure_rate_window;

        let (completed, failed) = match (
            self.ledger.list_executions(completed_filter).await,
            self.ledger.list_executions(failed_filter).await,
        ) {
            (Ok(c), Ok(f)) => (c.len(), f.len()),
            _ => {
                return CheckResult {
                    name: "failure_rate".to_string(),
                    status: HealthStatus::Unhealthy,
                    message: "ledger query failed".to_string(),
                    details: serde_json::json!({}),
                }
            }
        };

        let total = completed + failed;
        let rate = if total == 0 { 0.0 } else { failed as f64 / total as f64 };
        let status = if rate >= self.config.failure_rate_critical {
            HealthStatus::Unhealthy
        } else if rate >= self.config.failure_rate_warning {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        CheckResult {
            name: "failure_rate".to_string(),
            status,
            message: format!("{:.1}% recent failure rate ({failed}/{total})", rate * 100.0),
            details: serde_json::json!({"rate": rate, "completed": completed, "failed": failed}),
        }
    }

    async fn check_lock_count(&self) -> CheckResult {
        let count = match self.guard.count_active().await {
            Ok(n) => n,
            Err(err) => {
                return CheckResult {
                    name: "lock_count".to_string(),
                    status: HealthStatus::Unhealthy,
                    message: format!("guard query failed: {err}"),
                    details: serde_json::json!({}),
                }
            }
        };
        let status = if count >= self.config.lock_count_warning {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        CheckResult {
            name: "lock_count".to_string(),
            status,
            message: format!("{count} active locks"),
            details: serde_json::json!({"count": count}),
        }
    }
}

pub mod prelude {
    pub use crate::{CheckResult, HealthChecker, HealthCheckerConfig, HealthReport, HealthStatus};
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::model::{RunRecord, WorkKind, WorkSpec};
    use forge_store::dlq::InMemoryDlqManager;
    use forge_store::concurrency_guard::InMemoryConcurrencyGuard;
    use forge_store::memory_ledger::InMemoryLedger;

    async fn checker() -> HealthChecker {
        let ledger: Arc<dyn Ledger> = Arc::new(InMemoryLedger::new());
        let dlq: Arc<dyn DlqManager> = Arc::new(InMemoryDlqManager::new());
        let guard: Arc<dyn ConcurrencyGuard> = Arc::new(InMemoryConcurrencyGuard::new());
        HealthChecker::new(ledger, dlq, guard, HealthCheckerConfig::default())
    }

    #[tokio::test]
    async fn empty_system_reports_healthy() {
        let checker = checker().await;
        let report = checker.check().await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.checks.len(), 5);
    }

    #[tokio::test]
    async fn dlq_over_critical_threshold_makes_report_unhealthy() {
        let ledger: Arc<dyn Ledger> = Arc::new(InMemoryLedger::new());
        let dlq: Arc<dyn DlqManager> = Arc::new(InMemoryDlqManager::new());
        for _ in 0..5 {
            dlq.add_to_dlq(uuid::Uuid::now_v7(), "task:x", serde_json::json!({}), "boom", 0, 3)
                .await
                .unwrap();
        }
        let guard: Arc<dyn ConcurrencyGuard> = Arc::new(InMemoryConcurrencyGuard::new());
        let mut config = HealthCheckerConfig::default();
        config.dlq_critical_threshold = 3;
        let checker = HealthChecker::new(ledger, dlq, guard, config);

        let report = checker.check().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn stale_running_run_is_flagged_degraded() {
        let ledger: Arc<dyn Ledger> = Arc::new(InMemoryLedger::new());
        let spec = WorkSpec::new(WorkKind::Task, "slow", serde_json::json!({}));
        let mut record = RunRecord::new(spec);
        record.status = RunStatus::Running;
        record.started_at = Some(Utc::now() - chrono::Duration::hours(2));
        ledger.create_execution(record).await.unwrap();

        let dlq: Arc<dyn DlqManager> = Arc::new(InMemoryDlqManager::new());
        let guard: Arc<dyn ConcurrencyGuard> = Arc::new(InMemoryConcurrencyGuard::new());
        let checker = HealthChecker::new(ledger, dlq, guard, HealthCheckerConfig::default());

        let report = checker.check().await;
        let stale_check = report.checks.iter().find(|c| c.name == "stale_running").unwrap();
        assert_eq!(stale_check.status, HealthStatus::Degraded);
    }
}
