//! Deadline propagation and timeout enforcement.
//!
//! A task-local stack of deadlines lets nested operations each request their own budget while
//! never exceeding the budget an enclosing scope already committed to.

use std::time::Duration;

use forge_core::error::ForgeError;
use tokio::time::Instant;

tokio::task_local! {
    static DEADLINE_STACK: std::cell::RefCell<Vec<Instant>>;
}

/// Runs `fut` under a deadline `seconds` from now, clamped to any outer deadline already in
/// effect. Nested calls can only shrink the remaining budget, never extend it.
pub async fn with_deadline<T>(
    seconds: f64,
    fut: impl std::future::Future<Output = T>,
) -> Result<T, ForgeError> {
    let requested = Instant::now() + Duration::from_secs_f64(seconds.max(0.0));

    let deadline = match DEADLINE_STACK.try_with(|stack| stack.borrow().last().copied()) {
        Ok(Some(outer)) => requested.min(outer),
        _ => requested,
    };

    let run = async {
        match DEADLINE_STACK.try_with(|stack| {
            stack.borrow_mut().push(deadline);
        }) {
            Ok(()) => {
                let result = fut.await;
                DEADLINE_STACK.with(|stack| {
                    stack.borrow_mut().pop();
                });
                result
            }
            Err(_) => {
                let stack = std::cell::RefCell::new(vec![deadline]);
                DEADLINE_STACK.scope(stack, fut).await
            }
        }
    };

    let remaining = deadline.saturating_duration_since(Instant::now());
    match tokio::time::timeout(remaining, run).await {
        Ok(value) => Ok(value),
        Err(_) => Err(ForgeError::TimeoutExpired {
            elapsed_ms: remaining.as_millis() as u64,
            deadline_ms: deadline.saturating_duration_since(Instant::now()).as_millis() as u64,
        }),
    }
}

/// Time remaining on the innermost active deadline, if any.
pub fn remaining_deadline() -> Option<Duration> {
    DEADLINE_STACK
        .try_with(|stack| stack.borrow().last().copied())
        .ok()
        .flatten()
        .map(|deadline| deadline.saturating_duration_since(Instant::now()))
}

/// Returns an error if the innermost active deadline has already elapsed. A no-op when no
/// deadline scope is active.
pub fn check_deadline() -> Result<(), ForgeError> {
    match remaining_deadline() {
        Some(remaining) if remaining.is_zero() => Err(ForgeError::TimeoutExpired {
            elapsed_ms: 0,
            deadline_ms: 0,
        }),
        _ => Ok(()),
    }
}

/// Runs a blocking closure with a hard timeout, via `spawn_blocking`. If the timeout elapses
/// the spawned thread is left to finish in the background; its result is dropped.
pub async fn run_blocking_with_timeout<T, F>(seconds: f64, f: F) -> Result<T, ForgeError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let handle = tokio::task::spawn_blocking(f);
    match tokio::time::timeout(Duration::from_secs_f64(seconds.max(0.0)), handle).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(join_err)) => Err(ForgeError::Executor(join_err.to_string())),
        Err(_) => Err(ForgeError::TimeoutExpired {
            elapsed_ms: (seconds.max(0.0) * 1000.0) as u64,
            deadline_ms: (seconds.max(0.0) * 1000.0) as u64,
        }),
    }
}

/// Runs an async future with a cooperative timeout: the future is cancelled (dropped) the
/// moment the timeout elapses, since tokio futures are cancel-safe at `.await` points.
pub async fn run_cooperative_with_timeout<T>(
    seconds: f64,
    fut: impl std::future::Future<Output = T>,
) -> Result<T, ForgeError> {
    tokio::time::timeout(Duration::from_secs_f64(seconds.max(0.0)), fut)
        .await
        .map_err(|_| ForgeError::TimeoutExpired {
            elapsed_ms: (seconds.max(0.0) * 1000.0) as u64,
            deadline_ms: (seconds.max(0.0) * 1000.0) as u64,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn with_deadline_succeeds_within_budget() {
        let result = with_deadline(1.0, async { 42 }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn with_deadline_times_out() {
        let result = with_deadline(0.01, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            42
        })
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn nested_deadline_cannot_exceed_outer() {
        let result = with_deadline(0.05, async {
            with_deadline(10.0, async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                42
            })
            .await
        })
        .await;
        assert!(result.unwrap().is_err());
    }

    #[tokio::test]
    async fn run_cooperative_with_timeout_cancels_future() {
        let result = run_cooperative_with_timeout(0.01, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn run_blocking_with_timeout_completes_fast_work() {
        let result = run_blocking_with_timeout(1.0, || 7 + 5).await;
        assert_eq!(result.unwrap(), 12);
    }
}
