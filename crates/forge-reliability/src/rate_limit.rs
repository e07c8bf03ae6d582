//! Rate limiters: token bucket, sliding window, and keyed/composite wrappers.

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

/// Contract every rate limiter implements.
pub trait RateLimiter: Send + Sync {
    /// Attempt to consume one permit immediately, without waiting.
    fn try_acquire(&self) -> bool;

    /// How long the caller would need to wait before [`Self::try_acquire`] would succeed.
    /// `Duration::ZERO` if it would succeed right now.
    fn wait_time(&self) -> Duration;
}

/// A rate limiter that owns an async `acquire` which sleeps until a permit is available.
#[async_trait::async_trait]
pub trait RateLimiterExt: RateLimiter {
    async fn acquire(&self) {
        loop {
            if self.try_acquire() {
                return;
            }
            let wait = self.wait_time();
            if wait.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(wait).await;
            }
        }
    }
}

impl<T: RateLimiter + ?Sized> RateLimiterExt for T {}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Classic token bucket: refills continuously at `refill_rate` tokens/second up to `capacity`.
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity: capacity as f64,
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
        state.last_refill = now;
    }
}

impl RateLimiter for TokenBucket {
    fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn wait_time(&self) -> Duration {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            Duration::ZERO
        } else {
            let deficit = 1.0 - state.tokens;
            Duration::from_secs_f64(deficit / self.refill_rate)
        }
    }
}

/// Sliding window: at most `max_requests` timestamps recorded within the trailing `window`.
pub struct SlidingWindow {
    max_requests: usize,
    window: Duration,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl SlidingWindow {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            timestamps: Mutex::new(VecDeque::new()),
        }
    }

    fn evict_expired(&self, timestamps: &mut VecDeque<Instant>) {
        let now = Instant::now();
        while let Some(&front) = timestamps.front() {
            if now.duration_since(front) >= self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}

impl RateLimiter for SlidingWindow {
    fn try_acquire(&self) -> bool {
        let mut timestamps = self.timestamps.lock();
        self.evict_expired(&mut timestamps);
        if timestamps.len() < self.max_requests {
            timestamps.push_back(Instant::now());
            true
        } else {
            false
        }
    }

    fn wait_time(&self) -> Duration {
        let mut timestamps = self.timestamps.lock();
        self.evict_expired(&mut timestamps);
        if timestamps.len() < self.max_requests {
            Duration::ZERO
        } else {
            let oldest = *timestamps.front().expect("len >= max_requests > 0");
            self.window.saturating_sub(Instant::now().duration_since(oldest))
        }
    }
}

/// Lazily creates one sub-limiter per key (e.g. per tenant or handler kind), pruning
/// sub-limiters that have gone idle.
pub struct KeyedRateLimiter<F> {
    factory: F,
    limiters: DashMap<String, (Box<dyn RateLimiter>, Instant)>,
    idle_timeout: Duration,
}

impl<F> KeyedRateLimiter<F>
where
    F: Fn() -> Box<dyn RateLimiter> + Send + Sync,
{
    pub fn new(factory: F, idle_timeout: Duration) -> Self {
        Self {
            factory,
            limiters: DashMap::new(),
            idle_timeout,
        }
    }

    fn with_limiter<R>(&self, key: &str, f: impl FnOnce(&dyn RateLimiter) -> R) -> R {
        self.prune_idle();
        let mut entry = self
            .limiters
            .entry(key.to_string())
            .or_insert_with(|| ((self.factory)(), Instant::now()));
        entry.1 = Instant::now();
        f(entry.0.as_ref())
    }

    fn prune_idle(&self) {
        let idle_timeout = self.idle_timeout;
        self.limiters
            .retain(|_, (_, last_used)| last_used.elapsed() < idle_timeout);
    }

    pub fn try_acquire(&self, key: &str) -> bool {
        self.with_limiter(key, |l| l.try_acquire())
    }

    pub fn wait_time(&self, key: &str) -> Duration {
        self.with_limiter(key, |l| l.wait_time())
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}

/// All children must admit for the composite to admit; `wait_time` is the max across children.
pub struct CompositeRateLimiter {
    children: Vec<Box<dyn RateLimiter>>,
}

impl CompositeRateLimiter {
    pub fn new(children: Vec<Box<dyn RateLimiter>>) -> Self {
        Self { children }
    }
}

impl RateLimiter for CompositeRateLimiter {
    fn try_acquire(&self) -> bool {
        self.children.iter().all(|c| c.try_acquire())
    }

    fn wait_time(&self) -> Duration {
        self.children
            .iter()
            .map(|c| c.wait_time())
            .max()
            .unwrap_or(Duration::ZERO)
    }
}
