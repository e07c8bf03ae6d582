//! Semaphore-bounded fan-out over async callables, collected via `futures::future::join_all`
//! rather than a thread pool — the cooperative counterpart to [`crate::sync_batch`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use forge_core::error::Result;
use tokio::sync::Semaphore;

pub type BatchCallable = Pin<Box<dyn Future<Output = std::result::Result<serde_json::Value, String>> + Send>>;

/// Runs a set of async callables with at most `max_concurrency` in flight at once.
pub struct CooperativeBatchExecutor {
    max_concurrency: usize,
    items: Vec<(String, BatchCallable)>,
}

#[derive(Debug, Clone)]
pub struct CooperativeBatchItemResult {
    pub name: String,
    pub result: std::result::Result<serde_json::Value, String>,
}

impl CooperativeBatchExecutor {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            items: Vec::new(),
        }
    }

    pub fn add(&mut self, name: impl Into<String>, callable: BatchCallable) {
        self.items.push((name.into(), callable));
    }

    pub async fn run_all(self) -> Result<Vec<CooperativeBatchItemResult>> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let futures = self.items.into_iter().map(|(name, callable)| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                let result = callable.await;
                CooperativeBatchItemResult { name, result }
            }
        });
        Ok(futures::future::join_all(futures).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn run_all_collects_results_in_submission_order() {
        let mut batch = CooperativeBatchExecutor::new(4);
        batch.add("a", Box::pin(async { Ok(serde_json::json!(1)) }));
        batch.add("b", Box::pin(async { Err("nope".to_string()) }));

        let results = batch.run_all().await.unwrap();
        assert_eq!(results[0].name, "a");
        assert_eq!(results[0].result.as_ref().unwrap(), &serde_json::json!(1));
        assert_eq!(results[1].name, "b");
        assert!(results[1].result.is_err());
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_semaphore() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_observed = Arc::new(AtomicUsize::new(0));
        let mut batch = CooperativeBatchExecutor::new(2);

        for _ in 0..6 {
            let in_flight = in_flight.clone();
            let max_observed = max_observed.clone();
            batch.add(
                "item",
                Box::pin(async move {
                    let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_observed.fetch_max(current, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(serde_json::json!({}))
                }),
            );
        }

        batch.run_all().await.unwrap();
        assert!(max_observed.load(Ordering::SeqCst) <= 2);
    }
}
