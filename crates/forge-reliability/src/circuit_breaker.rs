//! In-process circuit breaker with a named registry.
//!
//! ```text
//! ┌─────────┐  failure threshold  ┌─────────┐  recovery timeout  ┌──────────┐
//! │ Closed  │ ──────────────────► │  Open   │ ──────────────────► │ HalfOpen │
//! └─────────┘                     └─────────┘                     └──────────┘
//!      ▲                                                                │
//!      │                  success threshold reached                    │
//!      └────────────────────────────────────────────────────────────────┘
//!                             any failure in HalfOpen -> Open
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use forge_core::error::ForgeError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    #[serde(with = "duration_millis")]
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    pub fn with_half_open_max_calls(mut self, max_calls: u32) -> Self {
        self.half_open_max_calls = max_calls;
        self
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_millis().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Attempted / rejected / state-change counters for operator visibility.
#[derive(Debug, Default)]
pub struct CircuitBreakerStats {
    pub attempted: AtomicU64,
    pub rejected: AtomicU64,
    pub state_changes: AtomicU64,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
}

/// RAII permit obtained from [`CircuitBreaker::try_acquire`]. Dropping it without calling
/// `success`/`failure` counts as neither — callers should always report an outcome.
pub struct CircuitBreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    _half_open_slot: Option<tokio::sync::OwnedSemaphorePermit>,
}

impl CircuitBreakerPermit<'_> {
    pub fn success(self) {
        self.breaker.record_success();
    }

    pub fn failure(self) {
        self.breaker.record_failure();
    }
}

/// A single named circuit breaker.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    half_open_gate: Arc<Semaphore>,
    stats: CircuitBreakerStats,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let half_open_gate = Arc::new(Semaphore::new(config.half_open_max_calls.max(1) as usize));
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
            }),
            half_open_gate,
            stats: CircuitBreakerStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.maybe_transition_to_half_open();
        self.inner.lock().state
    }

    fn maybe_transition_to_half_open(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.config.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.consecutive_successes = 0;
                    self.stats.state_changes.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(breaker = %self.name, "circuit breaker transitioning to half-open");
                }
            }
        }
    }

    /// The gate: acquire a permit before calling the wrapped operation.
    pub fn try_acquire(&self) -> Result<CircuitBreakerPermit<'_>, ForgeError> {
        self.maybe_transition_to_half_open();
        self.stats.attempted.fetch_add(1, Ordering::Relaxed);

        let state = self.inner.lock().state;
        match state {
            CircuitState::Open => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                Err(ForgeError::CircuitOpen {
                    name: self.name.clone(),
                })
            }
            CircuitState::Closed => Ok(CircuitBreakerPermit {
                breaker: self,
                _half_open_slot: None,
            }),
            CircuitState::HalfOpen => match self.half_open_gate.clone().try_acquire_owned() {
                Ok(permit) => Ok(CircuitBreakerPermit {
                    breaker: self,
                    _half_open_slot: Some(permit),
                }),
                Err(_) => {
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    Err(ForgeError::CircuitOpen {
                        name: self.name.clone(),
                    })
                }
            },
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                    self.stats.state_changes.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(breaker = %self.name, "circuit breaker closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    self.stats.state_changes.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(breaker = %self.name, "circuit breaker opened");
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.consecutive_failures = self.config.failure_threshold;
                self.stats.state_changes.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(breaker = %self.name, "circuit breaker re-opened from half-open");
            }
            CircuitState::Open => {}
        }
    }

    /// Convenience wrapper: acquire, run, report.
    pub async fn call<T, E, Fut>(&self, f: impl FnOnce() -> Fut) -> Result<T, ForgeError>
    where
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let permit = self.try_acquire()?;
        match f().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(err) => {
                permit.failure();
                Err(ForgeError::handler(err.to_string()))
            }
        }
    }

    pub fn stats(&self) -> &CircuitBreakerStats {
        &self.stats
    }
}

/// Process-local registry of named breakers.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self {
            breakers: DashMap::new(),
        }
    }

    pub fn get_or_create(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| b.clone())
    }
}

static GLOBAL: OnceLock<Arc<CircuitBreakerRegistry>> = OnceLock::new();

pub fn global_registry() -> Arc<CircuitBreakerRegistry> {
    GLOBAL
        .get_or_init(|| Arc::new(CircuitBreakerRegistry::new()))
        .clone()
}
