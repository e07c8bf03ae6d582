//! Retry strategies and the context that drives them.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Contract every backoff strategy implements.
pub trait RetryStrategy: Send + Sync {
    /// Delay before the given 1-based `attempt`. `next_delay(1)` is always zero — the first
    /// attempt runs immediately.
    fn next_delay(&self, attempt: u32) -> Duration;

    /// Whether a further attempt is permitted after `attempt`, optionally filtered by the
    /// error kind that just occurred.
    fn should_retry(&self, attempt: u32, error_kind: Option<&str>) -> bool;
}

fn apply_jitter(base_secs: f64, jitter: f64) -> f64 {
    if jitter <= 0.0 {
        return base_secs;
    }
    let mut rng = rand::thread_rng();
    let range = base_secs * jitter;
    (base_secs + rng.gen_range(-range..range)).max(0.0)
}

fn retryable(error_kind: Option<&str>, non_retryable: &[String]) -> bool {
    match error_kind {
        Some(kind) => !non_retryable.iter().any(|k| k == kind),
        None => true,
    }
}

/// `delay = min(base * coefficient^(attempt-1), max) +/- jitter`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExponentialBackoff {
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    pub backoff_coefficient: f64,
    pub jitter: f64,
    #[serde(default)]
    pub non_retryable_errors: Vec<String>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            jitter: 0.1,
            non_retryable_errors: vec![],
        }
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let retry_num = (attempt - 1) as i32 - 1;
        let base = self.base_delay.as_secs_f64() * self.backoff_coefficient.powi(retry_num);
        let capped = base.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(apply_jitter(capped, self.jitter))
    }

    fn should_retry(&self, attempt: u32, error_kind: Option<&str>) -> bool {
        attempt < self.max_attempts && retryable(error_kind, &self.non_retryable_errors)
    }
}

/// `delay = min(base * attempt, max) +/- jitter`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinearBackoff {
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    pub jitter: f64,
    #[serde(default)]
    pub non_retryable_errors: Vec<String>,
}

impl RetryStrategy for LinearBackoff {
    fn next_delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let retry_num = (attempt - 1) as f64;
        let base = self.base_delay.as_secs_f64() * retry_num;
        let capped = base.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(apply_jitter(capped, self.jitter))
    }

    fn should_retry(&self, attempt: u32, error_kind: Option<&str>) -> bool {
        attempt < self.max_attempts && retryable(error_kind, &self.non_retryable_errors)
    }
}

/// Every retry waits the same fixed interval.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConstantBackoff {
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub delay: Duration,
    #[serde(default)]
    pub non_retryable_errors: Vec<String>,
}

impl RetryStrategy for ConstantBackoff {
    fn next_delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            Duration::ZERO
        } else {
            self.delay
        }
    }

    fn should_retry(&self, attempt: u32, error_kind: Option<&str>) -> bool {
        attempt < self.max_attempts && retryable(error_kind, &self.non_retryable_errors)
    }
}

/// No retries: one attempt only.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NoRetry;

impl RetryStrategy for NoRetry {
    fn next_delay(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }

    fn should_retry(&self, _attempt: u32, _error_kind: Option<&str>) -> bool {
        false
    }
}

/// The polymorphic retry strategy the rest of the crate depends on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryPolicy {
    Exponential(ExponentialBackoff),
    Linear(LinearBackoff),
    Constant(ConstantBackoff),
    None(NoRetry),
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Exponential(ExponentialBackoff::default())
    }
}

impl RetryPolicy {
    pub fn exponential() -> Self {
        Self::Exponential(ExponentialBackoff::default())
    }

    pub fn no_retry() -> Self {
        Self::None(NoRetry)
    }

    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self::Constant(ConstantBackoff {
            max_attempts,
            delay,
            non_retryable_errors: vec![],
        })
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::Exponential(s) => s.next_delay(attempt),
            Self::Linear(s) => s.next_delay(attempt),
            Self::Constant(s) => s.next_delay(attempt),
            Self::None(s) => s.next_delay(attempt),
        }
    }

    pub fn should_retry(&self, attempt: u32, error_kind: Option<&str>) -> bool {
        match self {
            Self::Exponential(s) => s.should_retry(attempt, error_kind),
            Self::Linear(s) => s.should_retry(attempt, error_kind),
            Self::Constant(s) => s.should_retry(attempt, error_kind),
            Self::None(s) => s.should_retry(attempt, error_kind),
        }
    }

    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        self.should_retry(current_attempt, None)
    }
}

/// Tracks the live state of one retried operation: attempt count, elapsed time, and the
/// error history accumulated across failed attempts.
pub struct RetryContext {
    policy: RetryPolicy,
    attempt: u32,
    errors: Vec<String>,
}

impl RetryContext {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            errors: Vec::new(),
        }
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Drive a synchronous closure through the policy: call, catch, record, consult, sleep,
    /// retry. Sleeping is blocking — callers on an async runtime should prefer [`Self::run_async`].
    pub fn run<T, E: std::fmt::Display>(
        &mut self,
        mut f: impl FnMut(u32) -> std::result::Result<T, E>,
    ) -> std::result::Result<T, String> {
        loop {
            self.attempt += 1;
            match f(self.attempt) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let msg = err.to_string();
                    self.errors.push(msg.clone());
                    if !self.policy.should_retry(self.attempt, None) {
                        return Err(msg);
                    }
                    let delay = self.policy.delay_for_attempt(self.attempt + 1);
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                }
            }
        }
    }

    /// Async variant of [`Self::run`] driving a future-returning closure.
    pub async fn run_async<T, E, Fut>(
        &mut self,
        mut f: impl FnMut(u32) -> Fut,
    ) -> std::result::Result<T, String>
    where
        Fut: std::future::Future<Output = std::result::Result<T, E>>,
        E: std::fmt::Display,
    {
        loop {
            self.attempt += 1;
            match f(self.attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let msg = err.to_string();
                    self.errors.push(msg.clone());
                    if !self.policy.should_retry(self.attempt, None) {
                        return Err(msg);
                    }
                    let delay = self.policy.delay_for_attempt(self.attempt + 1);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_defaults_match_baseline() {
        let policy = ExponentialBackoff::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
    }

    #[test]
    fn no_retry_never_retries() {
        let policy = RetryPolicy::no_retry();
        assert!(!policy.has_attempts_remaining(1));
    }

    #[test]
    fn exponential_delay_progression_no_jitter() {
        let policy = RetryPolicy::Exponential(ExponentialBackoff {
            jitter: 0.0,
            ..ExponentialBackoff::default()
        });
        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(4));
    }

    #[test]
    fn exponential_caps_at_max_delay() {
        let policy = RetryPolicy::Exponential(ExponentialBackoff {
            max_delay: Duration::from_secs(5),
            jitter: 0.0,
            ..ExponentialBackoff::default()
        });
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn linear_delay_progression() {
        let policy = RetryPolicy::Linear(LinearBackoff {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(100),
            jitter: 0.0,
            non_retryable_errors: vec![],
        });
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
    }

    #[test]
    fn constant_delay_is_fixed() {
        let policy = RetryPolicy::fixed(Duration::from_secs(5), 3);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(5));
    }

    #[test]
    fn non_retryable_errors_are_respected() {
        let policy = RetryPolicy::Exponential(ExponentialBackoff {
            non_retryable_errors: vec!["INVALID_INPUT".into()],
            ..ExponentialBackoff::default()
        });
        assert!(!policy.should_retry(1, Some("INVALID_INPUT")));
        assert!(policy.should_retry(1, Some("TIMEOUT")));
    }

    #[test]
    fn retry_context_succeeds_on_second_attempt() {
        let mut ctx = RetryContext::new(RetryPolicy::fixed(Duration::from_millis(1), 3));
        let mut calls = 0;
        let result: Result<i32, String> = ctx.run(|attempt| {
            calls = attempt;
            if attempt < 2 {
                Err("boom".to_string())
            } else {
                Ok(42)
            }
        });
        assert_eq!(result, Ok(42));
        assert_eq!(calls, 2);
        assert_eq!(ctx.errors().len(), 1);
    }

    #[tokio::test]
    async fn retry_context_run_async_exhausts_attempts() {
        let mut ctx = RetryContext::new(RetryPolicy::fixed(Duration::from_millis(1), 2));
        let result: Result<i32, String> = ctx
            .run_async(|_attempt| async { Err::<i32, String>("always fails".to_string()) })
            .await;
        assert!(result.is_err());
        assert_eq!(ctx.errors().len(), 2);
    }
}
