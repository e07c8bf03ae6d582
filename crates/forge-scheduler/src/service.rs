//! The orchestrator: each tick, fetch due schedules, lock, check for misfires, dispatch,
//! record outcome, and always release the lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use forge_core::error::Result;
use forge_core::model::{ScheduleRunStatus, TriggerSource, WorkSpec};
use forge_dispatcher::Dispatcher;
use forge_executor::executor::Executor;
use parking_lot::Mutex;

use crate::lock_manager::ScheduleLockManager;
use crate::repository::{compute_next_run, ScheduleRepository};

#[derive(Debug, Default, Clone)]
pub struct SchedulerStats {
    pub ticks: u64,
    pub dispatched: u64,
    pub skipped: u64,
    pub missed: u64,
    pub failed: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
}

struct Counters {
    ticks: AtomicU64,
    dispatched: AtomicU64,
    skipped: AtomicU64,
    missed: AtomicU64,
    failed: AtomicU64,
    last_tick_at: Mutex<Option<DateTime<Utc>>>,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            ticks: AtomicU64::new(0),
            dispatched: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            missed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            last_tick_at: Mutex::new(None),
        }
    }
}

/// Drives due schedules to the dispatcher on every [`SchedulerService::tick`], honoring
/// per-schedule locks and misfire grace periods.
pub struct SchedulerService<E: Executor> {
    repository: Arc<dyn ScheduleRepository>,
    locks: Arc<ScheduleLockManager>,
    dispatcher: Arc<Dispatcher<E>>,
    counters: Counters,
    cleanup_every_n_ticks: u64,
}

impl<E: Executor> SchedulerService<E> {
    pub fn new(
        repository: Arc<dyn ScheduleRepository>,
        locks: Arc<ScheduleLockManager>,
        dispatcher: Arc<Dispatcher<E>>,
    ) -> Self {
        Self {
            repository,
            locks,
            dispatcher,
            counters: Counters::default(),
            cleanup_every_n_ticks: 10,
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            ticks: self.counters.ticks.load(Ordering::Relaxed),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            missed: self.counters.missed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            last_tick_at: *self.counters.last_tick_at.lock(),
        }
    }

    /// One orchestration pass: periodic lock cleanup, fetch due schedules, evaluate each.
    pub async fn tick(&self) -> Result<()> {
        let tick_count = self.counters.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        *self.counters.last_tick_at.lock() = Some(Utc::now());

        if tick_count % self.cleanup_every_n_ticks == 0 {
            if let Err(err) = self.locks.cleanup_expired_locks().await {
                tracing::warn!(error = %err, "lock cleanup failed");
            }
        }

        let now = Utc::now();
        let due = self.repository.get_due_schedules(now).await?;
        for schedule in due {
            self.evaluate(&schedule, now).await;
        }
        Ok(())
    }

    async fn evaluate(&self, schedule: &forge_core::model::Schedule, now: DateTime<Utc>) {
        let name = schedule.name.clone();
        let ttl = schedule.misfire_grace_seconds + 60;

        let acquired = match self.locks.acquire_schedule_lock(&name, ttl).await {
            Ok(acquired) => acquired,
            Err(err) => {
                tracing::warn!(schedule = %name, error = %err, "lock acquisition errored");
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if !acquired {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let result = self.evaluate_locked(schedule, now).await;
        if let Err(err) = self.locks.release_schedule_lock(&name).await {
            tracing::warn!(schedule = %name, error = %err, "failed to release schedule lock");
        }
        if let Err(err) = result {
            tracing::warn!(schedule = %name, error = %err, "schedule evaluation failed");
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn evaluate_locked(
        &self,
        schedule: &forge_core::model::Schedule,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let next_run_at = schedule.next_run_at.unwrap_or(now);
        let misfired = now > next_run_at + chrono::Duration::seconds(schedule.misfire_grace_seconds);

        let row_id = self.repository.mark_run_started(&schedule.name, next_run_at).await?;

        if misfired {
            self.counters.missed.fetch_add(1, Ordering::Relaxed);
            self.repository
                .mark_run_completed(row_id, ScheduleRunStatus::Missed, None, None)
                .await?;
        } else {
            let spec = WorkSpec {
                trigger_source: TriggerSource::Schedule,
                ..WorkSpec::new(schedule.target_type, schedule.target_name.clone(), schedule.params.clone())
            };
            match self.dispatcher.submit(spec).await {
                Ok(run_id) => {
                    self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
                    self.repository
                        .mark_run_completed(row_id, ScheduleRunStatus::Completed, Some(run_id), None)
                        .await?;
                }
                Err(err) => {
                    self.repository
                        .mark_run_completed(row_id, ScheduleRunStatus::Failed, None, Some(err.to_string()))
                        .await?;
                    return Err(err);
                }
            }
        }

        let next = compute_next_run(schedule, next_run_at)?;
        self.repository.update_next_run(&schedule.name, next).await?;
        Ok(())
    }

    /// Synchronously runs a schedule by name, bypassing the due-time check. `params_override`
    /// replaces the schedule's stored params for this one invocation only.
    pub async fn trigger(
        &self,
        name: &str,
        params_override: Option<serde_json::Value>,
    ) -> Result<uuid::Uuid> {
        let schedule = self
            .repository
            .get(name)
            .await?
            .ok_or_else(|| forge_core::error::ForgeError::ScheduleNotFound(name.to_string()))?;
        let params = params_override.unwrap_or(schedule.params);
        let spec = WorkSpec {
            trigger_source: TriggerSource::Schedule,
            ..WorkSpec::new(schedule.target_type, schedule.target_name, params)
        };
        self.dispatcher.submit(spec).await
    }

    pub async fn pause(&self, name: &str) -> Result<()> {
        self.repository.set_enabled(name, false).await
    }

    pub async fn resume(&self, name: &str) -> Result<()> {
        self.repository.set_enabled(name, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::model::{ScheduleType, WorkKind as WK};
    use forge_executor::in_memory::InMemoryExecutor;
    use forge_registry::Registry;
    use forge_store::concurrency_guard::InMemoryConcurrencyGuard;
    use uuid::Uuid;

    fn registry() -> Arc<Registry> {
        let reg = Registry::new();
        reg.register_fn(WK::Pipeline, "reports.nightly", |_p| {
            Ok(serde_json::json!({"ok": true}))
        })
        .unwrap();
        Arc::new(reg)
    }

    fn due_schedule(name: &str) -> forge_core::model::Schedule {
        forge_core::model::Schedule {
            id: Uuid::now_v7(),
            name: name.to_string(),
            target_type: WK::Pipeline,
            target_name: "reports.nightly".to_string(),
            schedule_type: ScheduleType::Interval,
            cron_expression: None,
            interval_seconds: Some(3600),
            run_at: None,
            timezone: "UTC".to_string(),
            params: serde_json::json!({}),
            enabled: true,
            max_instances: 1,
            misfire_grace_seconds: 300,
            last_run_at: None,
            next_run_at: Some(Utc::now() - chrono::Duration::seconds(5)),
            last_run_status: None,
            version: 0,
        }
    }

    async fn service() -> (
        SchedulerService<InMemoryExecutor>,
        Arc<crate::repository::InMemoryScheduleRepository>,
    ) {
        let repo = Arc::new(crate::repository::InMemoryScheduleRepository::new());
        let guard: Arc<dyn forge_store::concurrency_guard::ConcurrencyGuard> =
            Arc::new(InMemoryConcurrencyGuard::new());
        let locks = Arc::new(ScheduleLockManager::new(guard));
        let executor = Arc::new(InMemoryExecutor::new(registry()));
        let dispatcher = Arc::new(Dispatcher::in_memory(executor));
        (SchedulerService::new(repo.clone(), locks, dispatcher), repo)
    }

    #[tokio::test]
    async fn tick_dispatches_due_schedule_and_advances_next_run() {
        let (service, repo) = service().await;
        repo.create(due_schedule("nightly")).await.unwrap();

        service.tick().await.unwrap();

        let stats = service.stats();
        assert_eq!(stats.dispatched, 1);
        let schedule = repo.get("nightly").await.unwrap().unwrap();
        assert!(schedule.next_run_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn misfired_schedule_is_marked_missed_not_dispatched() {
        let (service, repo) = service().await;
        let mut schedule = due_schedule("nightly");
        schedule.next_run_at = Some(Utc::now() - chrono::Duration::seconds(10_000));
        schedule.misfire_grace_seconds = 60;
        repo.create(schedule).await.unwrap();

        service.tick().await.unwrap();

        let stats = service.stats();
        assert_eq!(stats.missed, 1);
        assert_eq!(stats.dispatched, 0);
    }

    #[tokio::test]
    async fn trigger_runs_schedule_regardless_of_due_time() {
        let (service, repo) = service().await;
        let mut schedule = due_schedule("nightly");
        schedule.next_run_at = Some(Utc::now() + chrono::Duration::hours(1));
        repo.create(schedule).await.unwrap();

        let run_id = service.trigger("nightly", None).await.unwrap();
        assert_ne!(run_id, Uuid::nil());
    }

    #[tokio::test]
    async fn pause_prevents_tick_from_dispatching() {
        let (service, repo) = service().await;
        repo.create(due_schedule("nightly")).await.unwrap();
        service.pause("nightly").await.unwrap();

        service.tick().await.unwrap();
        assert_eq!(service.stats().dispatched, 0);
    }
}
