//! Generic SQL-backed implementations of [`Ledger`], [`ConcurrencyGuard`], and [`DlqManager`].
//!
//! These are parameterized over `C: Connection, D: SqlDialect` and therefore never import a
//! concrete database driver — that's what makes them "core": portable glue code, not a
//! vendor integration. A concrete engine (e.g. `forge-postgres::PgConnection` +
//! `forge-postgres::PostgresDialect`) is supplied by the caller.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use forge_core::backing_store::{Connection, IntervalUnit, SqlDialect, SqlValue};
use forge_core::prelude::*;
use uuid::Uuid;

use crate::concurrency_guard::ConcurrencyGuard;
use crate::dlq::DlqManager;
use crate::ledger::{Ledger, RunFilter};

/// Generic ledger over the `core_executions` / `core_execution_events` tables named in §6.
pub struct SqlLedger<C, D> {
    conn: Arc<C>,
    dialect: Arc<D>,
}

impl<C: Connection, D: SqlDialect> SqlLedger<C, D> {
    pub fn new(conn: Arc<C>, dialect: Arc<D>) -> Self {
        Self { conn, dialect }
    }

    fn row_to_record(row: &dyn forge_core::backing_store::Row) -> Result<RunRecord> {
        let spec_json = row
            .get_json("spec")?
            .ok_or_else(|| ForgeError::store("missing spec column"))?;
        let spec: forge_core::model::WorkSpec = serde_json::from_value(spec_json)?;
        let status_str = row
            .get_text("status")?
            .ok_or_else(|| ForgeError::store("missing status column"))?;
        let status = status_from_str(&status_str)?;
        Ok(RunRecord {
            run_id: row
                .get_text("id")?
                .and_then(|s| Uuid::parse_str(&s).ok())
                .ok_or_else(|| ForgeError::store("bad id column"))?,
            spec,
            status,
            created_at: row
                .get_timestamp("created_at")?
                .ok_or_else(|| ForgeError::store("missing created_at"))?,
            started_at: row.get_timestamp("started_at")?,
            completed_at: row.get_timestamp("completed_at")?,
            result: row.get_json("result")?,
            error: row.get_text("error")?,
            error_type: row.get_text("error_type")?,
            external_ref: row.get_text("external_ref")?,
            executor_name: row.get_text("executor_name")?,
            attempt: row.get_int("retry_count")?.unwrap_or(1) as u32,
            retry_of_run_id: row
                .get_text("retry_of_run_id")?
                .and_then(|s| Uuid::parse_str(&s).ok()),
            duration_seconds: None,
            tags: Default::default(),
        })
    }
}

fn status_from_str(s: &str) -> Result<RunStatus> {
    Ok(match s {
        "pending" => RunStatus::Pending,
        "queued" => RunStatus::Queued,
        "running" => RunStatus::Running,
        "completed" => RunStatus::Completed,
        "failed" => RunStatus::Failed,
        "cancelled" => RunStatus::Cancelled,
        "timed_out" => RunStatus::TimedOut,
        other => return Err(ForgeError::store(format!("unknown status: {other}"))),
    })
}

#[async_trait]
impl<C: Connection, D: SqlDialect> Ledger for SqlLedger<C, D> {
    async fn create_execution(&self, record: RunRecord) -> Result<()> {
        self.conn.begin().await?;
        let sql = format!(
            "INSERT INTO core_executions (id, workflow, spec, params, status, lane, trigger_source, \
             parent_execution_id, created_at, retry_count, idempotency_key) VALUES ({})",
            self.dialect.placeholders(11)
        );
        let params = vec![
            SqlValue::from(record.run_id.to_string()),
            SqlValue::from(record.spec.handler_key()),
            SqlValue::from(serde_json::to_value(&record.spec)?),
            SqlValue::from(record.spec.params.clone()),
            SqlValue::from(record.status.to_string()),
            SqlValue::from(record.spec.lane.clone()),
            SqlValue::from(format!("{:?}", record.spec.trigger_source)),
            SqlValue::from(record.spec.parent_run_id.map(|u| u.to_string())),
            SqlValue::from(record.created_at),
            SqlValue::from(record.attempt as i64),
            SqlValue::from(record.spec.idempotency_key.clone()),
        ];
        self.conn.execute(&sql, &params).await?;

        let event_sql = format!(
            "INSERT INTO core_execution_events (id, execution_id, event_type, timestamp, data) VALUES ({})",
            self.dialect.placeholders(5)
        );
        let event = RunEvent::new(record.run_id, EventType::Created, serde_json::json!({}), "ledger");
        self.conn
            .execute(
                &event_sql,
                &[
                    SqlValue::from(event.event_id.to_string()),
                    SqlValue::from(record.run_id.to_string()),
                    SqlValue::from("CREATED".to_string()),
                    SqlValue::from(event.timestamp),
                    SqlValue::from(event.data),
                ],
            )
            .await?;
        self.conn.commit().await?;
        Ok(())
    }

    async fn get_execution(&self, run_id: Uuid) -> Result<Option<RunRecord>> {
        let sql = format!(
            "SELECT * FROM core_executions WHERE id = {}",
            self.dialect.placeholder(0)
        );
        match self.conn.fetch_one(&sql, &[SqlValue::from(run_id.to_string())]).await? {
            Some(row) => Ok(Some(Self::row_to_record(row.as_ref())?)),
            None => Ok(None),
        }
    }

    async fn get_by_idempotency_key(&self, key: &str) -> Result<Option<RunRecord>> {
        let sql = format!(
            "SELECT * FROM core_executions WHERE idempotency_key = {}",
            self.dialect.placeholder(0)
        );
        match self.conn.fetch_one(&sql, &[SqlValue::from(key.to_string())]).await? {
            Some(row) => Ok(Some(Self::row_to_record(row.as_ref())?)),
            None => Ok(None),
        }
    }

    async fn update_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<RunRecord> {
        let current = self
            .get_execution(run_id)
            .await?
            .ok_or(ForgeError::RunNotFound(run_id))?;
        if !current.status.can_transition_to(status) {
            return Err(ForgeError::invalid_transition(current.status, status));
        }

        let timestamp_clause = match status {
            RunStatus::Running => format!(", started_at = {}", self.dialect.now()),
            s if s.is_terminal() => format!(", completed_at = {}", self.dialect.now()),
            _ => String::new(),
        };
        let sql = format!(
            "UPDATE core_executions SET status = {}, result = {}, error = {}{} WHERE id = {}",
            self.dialect.placeholder(0),
            self.dialect.placeholder(1),
            self.dialect.placeholder(2),
            timestamp_clause,
            self.dialect.placeholder(3),
        );
        self.conn
            .execute(
                &sql,
                &[
                    SqlValue::from(status.to_string()),
                    SqlValue::from(result.clone()),
                    SqlValue::from(error.clone()),
                    SqlValue::from(run_id.to_string()),
                ],
            )
            .await?;

        self.record_event(
            run_id,
            event_type_for_status(status),
            serde_json::json!({ "result": result, "error": error }),
            "ledger",
        )
        .await?;

        self.get_execution(run_id).await?.ok_or(ForgeError::RunNotFound(run_id))
    }

    async fn claim_pending(&self, run_id: Uuid, worker_id: &str) -> Result<Option<RunRecord>> {
        let sql = format!(
            "UPDATE core_executions SET status = {}, started_at = {} WHERE id = {} AND status = {}",
            self.dialect.placeholder(0),
            self.dialect.now(),
            self.dialect.placeholder(1),
            self.dialect.placeholder(2),
        );
        let affected = self
            .conn
            .execute(
                &sql,
                &[
                    SqlValue::from(RunStatus::Running.to_string()),
                    SqlValue::from(run_id.to_string()),
                    SqlValue::from(RunStatus::Pending.to_string()),
                ],
            )
            .await?;
        if affected == 0 {
            return Ok(None);
        }
        self.record_event(run_id, EventType::Started, serde_json::json!({ "worker_id": worker_id }), "worker")
            .await?;
        self.get_execution(run_id).await
    }

    async fn set_external_ref(&self, run_id: Uuid, external_ref: &str) -> Result<()> {
        let sql = format!(
            "UPDATE core_executions SET external_ref = {} WHERE id = {}",
            self.dialect.placeholder(0),
            self.dialect.placeholder(1),
        );
        self.conn
            .execute(
                &sql,
                &[SqlValue::from(external_ref.to_string()), SqlValue::from(run_id.to_string())],
            )
            .await?;
        Ok(())
    }

    async fn increment_retry(&self, run_id: Uuid) -> Result<u32> {
        let sql = format!(
            "UPDATE core_executions SET retry_count = retry_count + 1 WHERE id = {}",
            self.dialect.placeholder(0)
        );
        self.conn.execute(&sql, &[SqlValue::from(run_id.to_string())]).await?;
        let record = self.get_execution(run_id).await?.ok_or(ForgeError::RunNotFound(run_id))?;
        self.record_event(run_id, EventType::Retried, serde_json::json!({ "attempt": record.attempt }), "ledger")
            .await?;
        Ok(record.attempt)
    }

    async fn record_event(
        &self,
        run_id: Uuid,
        event_type: EventType,
        data: serde_json::Value,
        _source: &str,
    ) -> Result<()> {
        let event = RunEvent::new(run_id, event_type, data, _source);
        let sql = format!(
            "INSERT INTO core_execution_events (id, execution_id, event_type, timestamp, data) VALUES ({})",
            self.dialect.placeholders(5)
        );
        self.conn
            .execute(
                &sql,
                &[
                    SqlValue::from(event.event_id.to_string()),
                    SqlValue::from(run_id.to_string()),
                    SqlValue::from(format!("{:?}", event_type)),
                    SqlValue::from(event.timestamp),
                    SqlValue::from(event.data),
                ],
            )
            .await?;
        Ok(())
    }

    async fn get_events(&self, run_id: Uuid) -> Result<Vec<RunEvent>> {
        let sql = "SELECT * FROM core_execution_events WHERE execution_id = $1 ORDER BY timestamp ASC";
        let rows = self.conn.fetch_all(sql, &[SqlValue::from(run_id.to_string())]).await?;
        rows.iter()
            .map(|row| {
                Ok(RunEvent {
                    event_id: row
                        .get_text("id")?
                        .and_then(|s| Uuid::parse_str(&s).ok())
                        .ok_or_else(|| ForgeError::store("bad event id"))?,
                    run_id,
                    event_type: EventType::Created, // concrete adapters decode the real tag
                    timestamp: row.get_timestamp("timestamp")?.ok_or_else(|| ForgeError::store("missing timestamp"))?,
                    data: row.get_json("data")?.unwrap_or(serde_json::Value::Null),
                    source: "ledger".to_string(),
                })
            })
            .collect()
    }

    async fn list_executions(&self, filter: RunFilter) -> Result<Vec<RunRecord>> {
        let mut clauses = Vec::new();
        let mut params = Vec::new();
        let mut idx = 0;
        if let Some(status) = filter.status {
            clauses.push(format!("status = {}", self.dialect.placeholder(idx)));
            params.push(SqlValue::from(status.to_string()));
            idx += 1;
        }
        if let Some(name) = &filter.name {
            clauses.push(format!("workflow LIKE {}", self.dialect.placeholder(idx)));
            params.push(SqlValue::from(format!("%:{name}")));
            idx += 1;
        }
        if let Some(parent) = filter.parent_run_id {
            clauses.push(format!("parent_execution_id = {}", self.dialect.placeholder(idx)));
            params.push(SqlValue::from(parent.to_string()));
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT * FROM core_executions{} ORDER BY created_at ASC LIMIT {} OFFSET {}",
            where_clause, filter.limit.max(1), filter.offset
        );
        let rows = self.conn.fetch_all(&sql, &params).await?;
        let mut records = rows
            .iter()
            .map(|row| Self::row_to_record(row.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        if let Some(kind) = filter.kind {
            records.retain(|r| r.spec.kind == kind);
        }
        Ok(records)
    }
}

fn event_type_for_status(status: RunStatus) -> EventType {
    match status {
        RunStatus::Pending => EventType::Created,
        RunStatus::Queued => EventType::Queued,
        RunStatus::Running => EventType::Started,
        RunStatus::Completed => EventType::Completed,
        RunStatus::Failed => EventType::Failed,
        RunStatus::Cancelled => EventType::Cancelled,
        RunStatus::TimedOut => EventType::TimedOut,
    }
}

/// Generic concurrency guard over `core_concurrency_locks`, shared verbatim by the
/// Scheduler's Lock Manager against `core_schedule_locks`.
pub struct SqlConcurrencyGuard<C, D> {
    conn: Arc<C>,
    dialect: Arc<D>,
    table: &'static str,
}

impl<C: Connection, D: SqlDialect> SqlConcurrencyGuard<C, D> {
    pub fn new(conn: Arc<C>, dialect: Arc<D>) -> Self {
        Self {
            conn,
            dialect,
            table: "core_concurrency_locks",
        }
    }

    pub fn with_table(conn: Arc<C>, dialect: Arc<D>, table: &'static str) -> Self {
        Self { conn, dialect, table }
    }
}

#[async_trait]
impl<C: Connection, D: SqlDialect> ConcurrencyGuard for SqlConcurrencyGuard<C, D> {
    async fn acquire(&self, lock_key: &str, run_id: Uuid, ttl_seconds: i64) -> Result<bool> {
        let reap_sql = format!(
            "DELETE FROM {} WHERE lock_key = {} AND expires_at < {}",
            self.table,
            self.dialect.placeholder(0),
            self.dialect.now()
        );
        self.conn.execute(&reap_sql, &[SqlValue::from(lock_key.to_string())]).await?;

        let insert_sql = self.dialect.insert_or_ignore(
            self.table,
            &["lock_key", "execution_id", "acquired_at", "expires_at"],
        );
        let affected = self
            .conn
            .execute(
                &insert_sql,
                &[
                    SqlValue::from(lock_key.to_string()),
                    SqlValue::from(run_id.to_string()),
                    SqlValue::from(chrono::Utc::now()),
                    SqlValue::from(chrono::Utc::now() + chrono::Duration::seconds(ttl_seconds)),
                ],
            )
            .await?;
        if affected > 0 {
            return Ok(true);
        }

        // conflict: check ownership
        let owner_sql = format!(
            "SELECT execution_id FROM {} WHERE lock_key = {}",
            self.table,
            self.dialect.placeholder(0)
        );
        let row = self
            .conn
            .fetch_one(&owner_sql, &[SqlValue::from(lock_key.to_string())])
            .await?;
        match row.and_then(|r| r.get_text("execution_id").ok().flatten()) {
            Some(owner) if owner == run_id.to_string() => {
                self.extend_lock(lock_key, run_id, ttl_seconds).await
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, lock_key: &str, run_id: Option<Uuid>) -> Result<bool> {
        let sql = match run_id {
            Some(id) => format!(
                "DELETE FROM {} WHERE lock_key = {} AND execution_id = {}",
                self.table,
                self.dialect.placeholder(0),
                self.dialect.placeholder(1)
            ),
            None => format!("DELETE FROM {} WHERE lock_key = {}", self.table, self.dialect.placeholder(0)),
        };
        let mut params = vec![SqlValue::from(lock_key.to_string())];
        if let Some(id) = run_id {
            params.push(SqlValue::from(id.to_string()));
        }
        Ok(self.conn.execute(&sql, &params).await? > 0)
    }

    async fn is_locked(&self, lock_key: &str) -> Result<bool> {
        let sql = format!(
            "SELECT 1 FROM {} WHERE lock_key = {} AND expires_at >= {}",
            self.table,
            self.dialect.placeholder(0),
            self.dialect.now()
        );
        Ok(self.conn.fetch_one(&sql, &[SqlValue::from(lock_key.to_string())]).await?.is_some())
    }

    async fn extend_lock(&self, lock_key: &str, run_id: Uuid, ttl_seconds: i64) -> Result<bool> {
        let sql = format!(
            "UPDATE {} SET expires_at = {} WHERE lock_key = {} AND execution_id = {}",
            self.table,
            self.dialect.placeholder(0),
            self.dialect.placeholder(1),
            self.dialect.placeholder(2),
        );
        let affected = self
            .conn
            .execute(
                &sql,
                &[
                    SqlValue::from(chrono::Utc::now() + chrono::Duration::seconds(ttl_seconds)),
                    SqlValue::from(lock_key.to_string()),
                    SqlValue::from(run_id.to_string()),
                ],
            )
            .await?;
        Ok(affected > 0)
    }

    async fn cleanup_expired(&self) -> Result<u64> {
        let sql = format!("DELETE FROM {} WHERE expires_at < {}", self.table, self.dialect.now());
        self.conn.execute(&sql, &[]).await
    }
}

/// Generic DLQ manager over `core_dead_letters`.
pub struct SqlDlqManager<C, D> {
    conn: Arc<C>,
    dialect: Arc<D>,
    _marker: PhantomData<D>,
}

impl<C: Connection, D: SqlDialect> SqlDlqManager<C, D> {
    pub fn new(conn: Arc<C>, dialect: Arc<D>) -> Self {
        Self {
            conn,
            dialect,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<C: Connection, D: SqlDialect> DlqManager for SqlDlqManager<C, D> {
    async fn add_to_dlq(
        &self,
        run_id: Uuid,
        name: &str,
        params: serde_json::Value,
        error: &str,
        retry_count: u32,
        max_retries: u32,
    ) -> Result<Uuid> {
        let id = Uuid::now_v7();
        let sql = format!(
            "INSERT INTO core_dead_letters (id, execution_id, workflow, params, error, retry_count, max_retries, created_at) VALUES ({})",
            self.dialect.placeholders(8)
        );
        self.conn
            .execute(
                &sql,
                &[
                    SqlValue::from(id.to_string()),
                    SqlValue::from(run_id.to_string()),
                    SqlValue::from(name.to_string()),
                    SqlValue::from(params),
                    SqlValue::from(error.to_string()),
                    SqlValue::from(retry_count as i64),
                    SqlValue::from(max_retries as i64),
                    SqlValue::from(chrono::Utc::now()),
                ],
            )
            .await?;
        Ok(id)
    }

    async fn list_unresolved(&self, name: Option<&str>, limit: usize) -> Result<Vec<DeadLetter>> {
        let (clause, params): (String, Vec<SqlValue>) = match name {
            Some(n) => (
                format!(
                    "WHERE resolved_at IS NULL AND workflow = {}",
                    self.dialect.placeholder(0)
                ),
                vec![SqlValue::from(n.to_string())],
            ),
            None => ("WHERE resolved_at IS NULL".to_string(), vec![]),
        };
        let sql = format!(
            "SELECT * FROM core_dead_letters {} ORDER BY created_at ASC LIMIT {}",
            clause,
            limit.max(1)
        );
        let rows = self.conn.fetch_all(&sql, &params).await?;
        rows.iter().map(row_to_dead_letter).collect()
    }

    async fn mark_retry_attempted(&self, id: Uuid) -> Result<()> {
        let sql = format!(
            "UPDATE core_dead_letters SET retry_count = retry_count + 1, last_retry_at = {} WHERE id = {}",
            self.dialect.now(),
            self.dialect.placeholder(0),
        );
        self.conn.execute(&sql, &[SqlValue::from(id.to_string())]).await?;
        Ok(())
    }

    async fn resolve(&self, id: Uuid, by: Option<&str>) -> Result<()> {
        let sql = format!(
            "UPDATE core_dead_letters SET resolved_at = {}, resolved_by = {} WHERE id = {}",
            self.dialect.now(),
            self.dialect.placeholder(0),
            self.dialect.placeholder(1),
        );
        self.conn
            .execute(&sql, &[SqlValue::from(by.map(|s| s.to_string())), SqlValue::from(id.to_string())])
            .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetter>> {
        let sql = format!("SELECT * FROM core_dead_letters WHERE id = {}", self.dialect.placeholder(0));
        match self.conn.fetch_one(&sql, &[SqlValue::from(id.to_string())]).await? {
            Some(row) => Ok(Some(row_to_dead_letter(&row)?)),
            None => Ok(None),
        }
    }

    async fn cleanup_resolved(&self, older_than_days: u32) -> Result<u64> {
        let sql = format!(
            "DELETE FROM core_dead_letters WHERE resolved_at IS NOT NULL AND resolved_at < {}",
            self.dialect.interval(-(older_than_days as i64), IntervalUnit::Days)
        );
        self.conn.execute(&sql, &[]).await
    }
}

fn row_to_dead_letter(row: &Box<dyn forge_core::backing_store::Row>) -> Result<DeadLetter> {
    Ok(DeadLetter {
        id: row.get_text("id")?.and_then(|s| Uuid::parse_str(&s).ok()).ok_or_else(|| ForgeError::store("bad id"))?,
        run_id: row
            .get_text("execution_id")?
            .and_then(|s| Uuid::parse_str(&s).ok())
            .ok_or_else(|| ForgeError::store("bad execution_id"))?,
        name: row.get_text("workflow")?.unwrap_or_default(),
        params: row.get_json("params")?.unwrap_or(serde_json::Value::Null),
        error: row.get_text("error")?.unwrap_or_default(),
        retry_count: row.get_int("retry_count")?.unwrap_or(0) as u32,
        max_retries: row.get_int("max_retries")?.unwrap_or(0) as u32,
        created_at: row.get_timestamp("created_at")?.ok_or_else(|| ForgeError::store("missing created_at"))?,
        last_retry_at: row.get_timestamp("last_retry_at")?,
        resolved_at: row.get_timestamp("resolved_at")?,
        resolved_by: row.get_text("resolved_by")?,
    })
}
