//! CRUD over Schedule/ScheduleRun rows plus the next-fire-time computation.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use forge_core::error::{ForgeError, Result};
use forge_core::model::{Schedule, ScheduleRun, ScheduleRunStatus, ScheduleType};
use parking_lot::RwLock;
use uuid::Uuid;

/// The `cron` crate parses 6/7-field expressions (seconds first); the standard five-field
/// form (minute hour day-of-month month day-of-week) it rejects outright. Schedules are
/// authored in the standard five-field form, so a leading `0` (seconds) is prepended before
/// handing the expression to `cron::Schedule::from_str`. Expressions that already carry 6 or
/// 7 fields pass through unchanged.
fn normalize_cron_expr(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

/// Evaluates a cron expression in the schedule's named timezone (falling back to UTC with a
/// logged warning if the zone name doesn't resolve), converting the result back to UTC for
/// storage. `interval` and `date` schedules don't need timezone handling at all.
pub fn compute_next_run(schedule: &Schedule, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    match schedule.schedule_type {
        ScheduleType::Cron => {
            let expr = schedule
                .cron_expression
                .as_deref()
                .ok_or_else(|| ForgeError::store("cron schedule missing cron_expression"))?;
            let cron_schedule = cron::Schedule::from_str(&normalize_cron_expr(expr))
                .map_err(|e| ForgeError::store(format!("invalid cron expression: {e}")))?;

            let tz: Tz = schedule.timezone.parse().unwrap_or_else(|_| {
                tracing::warn!(
                    schedule = %schedule.name,
                    timezone = %schedule.timezone,
                    "unknown timezone, falling back to UTC"
                );
                chrono_tz::UTC
            });

            let after_in_tz = after.with_timezone(&tz);
            Ok(cron_schedule
                .after(&after_in_tz)
                .next()
                .map(|dt| dt.with_timezone(&Utc)))
        }
        ScheduleType::Interval => {
            let seconds = schedule
                .interval_seconds
                .ok_or_else(|| ForgeError::store("interval schedule missing interval_seconds"))?;
            Ok(Some(after + chrono::Duration::seconds(seconds)))
        }
        ScheduleType::Date => Ok(schedule.run_at.filter(|at| *at > after)),
    }
}

/// Repository contract the scheduler service drives.
#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    async fn create(&self, schedule: Schedule) -> Result<()>;
    async fn get(&self, name: &str) -> Result<Option<Schedule>>;
    async fn get_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>>;
    async fn set_enabled(&self, name: &str, enabled: bool) -> Result<()>;
    async fn update_next_run(&self, name: &str, next_run_at: Option<DateTime<Utc>>) -> Result<()>;

    async fn mark_run_started(&self, schedule_name: &str, scheduled_at: DateTime<Utc>) -> Result<Uuid>;

    async fn mark_run_completed(
        &self,
        run_row_id: Uuid,
        status: ScheduleRunStatus,
        run_id: Option<Uuid>,
        error: Option<String>,
    ) -> Result<()>;

    async fn list_runs(&self, schedule_name: &str, limit: usize) -> Result<Vec<ScheduleRun>>;
}

struct State {
    schedules: HashMap<String, Schedule>,
    runs: HashMap<Uuid, ScheduleRun>,
}

pub struct InMemoryScheduleRepository {
    state: RwLock<State>,
}

impl Default for InMemoryScheduleRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryScheduleRepository {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State {
                schedules: HashMap::new(),
                runs: HashMap::new(),
            }),
        }
    }
}

#[async_trait]
impl ScheduleRepository for InMemoryScheduleRepository {
    async fn create(&self, schedule: Schedule) -> Result<()> {
        self.state.write().schedules.insert(schedule.name.clone(), schedule);
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<Schedule>> {
        Ok(self.state.read().schedules.get(name).cloned())
    }

    async fn get_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
        let state = self.state.read();
        let mut due: Vec<Schedule> = state
            .schedules
            .values()
            .filter(|s| s.enabled && s.next_run_at.map(|next| next <= now).unwrap_or(false))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_run_at);
        Ok(due)
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let mut state = self.state.write();
        let schedule = state
            .schedules
            .get_mut(name)
            .ok_or_else(|| ForgeError::ScheduleNotFound(name.to_string()))?;
        schedule.enabled = enabled;
        Ok(())
    }

    async fn update_next_run(&self, name: &str, next_run_at: Option<DateTime<Utc>>) -> Result<()> {
        let mut state = self.state.write();
        let schedule = state
            .schedules
            .get_mut(name)
            .ok_or_else(|| ForgeError::ScheduleNotFound(name.to_string()))?;
        schedule.next_run_at = next_run_at;
        schedule.version += 1;
        Ok(())
    }

    async fn mark_run_started(&self, schedule_name: &str, scheduled_at: DateTime<Utc>) -> Result<Uuid> {
        let mut state = self.state.write();
        let schedule = state
            .schedules
            .get_mut(schedule_name)
            .ok_or_else(|| ForgeError::ScheduleNotFound(schedule_name.to_string()))?;
        schedule.last_run_at = Some(scheduled_at);
        let schedule_id = schedule.id;

        let row_id = Uuid::now_v7();
        state.runs.insert(
            row_id,
            ScheduleRun {
                id: row_id,
                schedule_id,
                schedule_name: schedule_name.to_string(),
                scheduled_at,
                started_at: Some(Utc::now()),
                completed_at: None,
                status: ScheduleRunStatus::Running,
                run_id: None,
                error: None,
            },
        );
        Ok(row_id)
    }

    async fn mark_run_completed(
        &self,
        run_row_id: Uuid,
        status: ScheduleRunStatus,
        run_id: Option<Uuid>,
        error: Option<String>,
    ) -> Result<()> {
        let mut state = self.state.write();
        let run = state
            .runs
            .get_mut(&run_row_id)
            .ok_or_else(|| ForgeError::store("schedule run not found"))?;
        run.status = status;
        run.run_id = run_id;
        run.error = error;
        run.completed_at = Some(Utc::now());

        let schedule_name = run.schedule_name.clone();
        if let Some(schedule) = state.schedules.get_mut(&schedule_name) {
            schedule.last_run_status = Some(format!("{status:?}"));
        }
        Ok(())
    }

    async fn list_runs(&self, schedule_name: &str, limit: usize) -> Result<Vec<ScheduleRun>> {
        let state = self.state.read();
        let mut runs: Vec<ScheduleRun> = state
            .runs
            .values()
            .filter(|r| r.schedule_name == schedule_name)
            .cloned()
            .collect();
        runs.sort_by_key(|r| std::cmp::Reverse(r.scheduled_at));
        runs.truncate(limit);
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::model::WorkKind;

    fn cron_schedule(expr: &str, tz: &str) -> Schedule {
        Schedule {
            id: Uuid::now_v7(),
            name: "nightly".to_string(),
            target_type: WorkKind::Pipeline,
            target_name: "reports.nightly".to_string(),
            schedule_type: ScheduleType::Cron,
            cron_expression: Some(expr.to_string()),
            interval_seconds: None,
            run_at: None,
            timezone: tz.to_string(),
            params: serde_json::json!({}),
            enabled: true,
            max_instances: 1,
            misfire_grace_seconds: 300,
            last_run_at: None,
            next_run_at: None,
            last_run_status: None,
            version: 0,
        }
    }

    #[test]
    fn cron_next_run_advances_monotonically() {
        let schedule = cron_schedule("0 0 * * * *", "UTC");
        let t0 = Utc::now();
        let first = compute_next_run(&schedule, t0).unwrap().unwrap();
        let second = compute_next_run(&schedule, first).unwrap().unwrap();
        assert!(second > first);
    }

    #[test]
    fn five_field_cron_expression_fires_every_minute() {
        let schedule = cron_schedule("* * * * *", "UTC");
        let t0 = Utc::now();
        let next = compute_next_run(&schedule, t0).unwrap().unwrap();
        assert!(next > t0);
        assert!(next - t0 <= chrono::Duration::minutes(1));
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        let schedule = cron_schedule("0 0 * * * *", "Not/AZone");
        let result = compute_next_run(&schedule, Utc::now());
        assert!(result.is_ok());
    }

    #[test]
    fn interval_schedule_adds_seconds() {
        let mut schedule = cron_schedule("", "UTC");
        schedule.schedule_type = ScheduleType::Interval;
        schedule.cron_expression = None;
        schedule.interval_seconds = Some(60);
        let after = Utc::now();
        let next = compute_next_run(&schedule, after).unwrap().unwrap();
        assert_eq!(next, after + chrono::Duration::seconds(60));
    }

    #[test]
    fn date_schedule_returns_none_once_past() {
        let mut schedule = cron_schedule("", "UTC");
        schedule.schedule_type = ScheduleType::Date;
        schedule.cron_expression = None;
        schedule.run_at = Some(Utc::now() - chrono::Duration::days(1));
        assert_eq!(compute_next_run(&schedule, Utc::now()).unwrap(), None);
    }

    #[tokio::test]
    async fn get_due_schedules_only_returns_enabled_and_due() {
        let repo = InMemoryScheduleRepository::new();
        let mut due_schedule = cron_schedule("0 0 * * * *", "UTC");
        due_schedule.next_run_at = Some(Utc::now() - chrono::Duration::seconds(10));
        repo.create(due_schedule).await.unwrap();

        let mut future_schedule = cron_schedule("0 0 * * * *", "UTC");
        future_schedule.name = "later".to_string();
        future_schedule.next_run_at = Some(Utc::now() + chrono::Duration::hours(1));
        repo.create(future_schedule).await.unwrap();

        let due = repo.get_due_schedules(Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].name, "nightly");
    }

    #[tokio::test]
    async fn mark_run_started_then_completed_updates_status() {
        let repo = InMemoryScheduleRepository::new();
        repo.create(cron_schedule("0 0 * * * *", "UTC")).await.unwrap();

        let row_id = repo.mark_run_started("nightly", Utc::now()).await.unwrap();
        repo.mark_run_completed(row_id, ScheduleRunStatus::Completed, Some(Uuid::now_v7()), None)
            .await
            .unwrap();

        let runs = repo.list_runs("nightly", 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, ScheduleRunStatus::Completed);
    }
}
