//! Dead-letter capture, inspection, and manual re-queue.

use async_trait::async_trait;
use chrono::Utc;
use forge_core::prelude::*;
use uuid::Uuid;

#[async_trait]
pub trait DlqManager: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn add_to_dlq(
        &self,
        run_id: Uuid,
        name: &str,
        params: serde_json::Value,
        error: &str,
        retry_count: u32,
        max_retries: u32,
    ) -> Result<Uuid>;

    async fn list_unresolved(&self, name: Option<&str>, limit: usize) -> Result<Vec<DeadLetter>>;

    async fn mark_retry_attempted(&self, id: Uuid) -> Result<()>;

    async fn resolve(&self, id: Uuid, by: Option<&str>) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetter>>;

    /// `resolved_at is null ∧ retry_count < max_retries`
    async fn can_retry(&self, id: Uuid) -> Result<bool> {
        Ok(self.get(id).await?.map(|d| d.can_retry()).unwrap_or(false))
    }

    async fn cleanup_resolved(&self, older_than_days: u32) -> Result<u64>;
}

use std::collections::HashMap;
use parking_lot::RwLock;

#[derive(Default)]
pub struct InMemoryDlqManager {
    entries: RwLock<HashMap<Uuid, DeadLetter>>,
}

impl InMemoryDlqManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DlqManager for InMemoryDlqManager {
    async fn add_to_dlq(
        &self,
        run_id: Uuid,
        name: &str,
        params: serde_json::Value,
        error: &str,
        retry_count: u32,
        max_retries: u32,
    ) -> Result<Uuid> {
        let entry = DeadLetter {
            id: Uuid::now_v7(),
            run_id,
            name: name.to_string(),
            params,
            error: error.to_string(),
            retry_count,
            max_retries,
            created_at: Utc::now(),
            last_retry_at: None,
            resolved_at: None,
            resolved_by: None,
        };
        let id = entry.id;
        tracing::warn!(run_id = %run_id, name, error, "dead-lettered");
        self.entries.write().insert(id, entry);
        Ok(id)
    }

    async fn list_unresolved(&self, name: Option<&str>, limit: usize) -> Result<Vec<DeadLetter>> {
        let entries = self.entries.read();
        let mut matched: Vec<DeadLetter> = entries
            .values()
            .filter(|d| d.resolved_at.is_none())
            .filter(|d| name.map(|n| d.name == n).unwrap_or(true))
            .cloned()
            .collect();
        matched.sort_by_key(|d| d.created_at);
        matched.truncate(if limit == 0 { usize::MAX } else { limit });
        Ok(matched)
    }

    async fn mark_retry_attempted(&self, id: Uuid) -> Result<()> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(&id).ok_or_else(|| ForgeError::store(format!("dlq entry not found: {id}")))?;
        entry.retry_count += 1;
        entry.last_retry_at = Some(Utc::now());
        Ok(())
    }

    async fn resolve(&self, id: Uuid, by: Option<&str>) -> Result<()> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(&id).ok_or_else(|| ForgeError::store(format!("dlq entry not found: {id}")))?;
        entry.resolved_at = Some(Utc::now());
        entry.resolved_by = by.map(|s| s.to_string());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetter>> {
        Ok(self.entries.read().get(&id).cloned())
    }

    async fn cleanup_resolved(&self, older_than_days: u32) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(older_than_days as i64);
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, d| !matches!(d.resolved_at, Some(at) if at < cutoff));
        Ok((before - entries.len()) as u64)
    }
}
