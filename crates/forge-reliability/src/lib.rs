//! Resilience primitives: retry strategies, circuit breaker, rate limiters, and deadlines.

pub mod circuit_breaker;
pub mod rate_limit;
pub mod retry;
pub mod timeout;

pub mod prelude {
    pub use crate::circuit_breaker::{
        CircuitBreaker, CircuitBreakerConfig, CircuitBreakerPermit, CircuitBreakerRegistry,
        CircuitBreakerStats, CircuitState,
    };
    pub use crate::rate_limit::{
        CompositeRateLimiter, KeyedRateLimiter, RateLimiter, RateLimiterExt, SlidingWindow,
        TokenBucket,
    };
    pub use crate::retry::{
        ConstantBackoff, ExponentialBackoff, LinearBackoff, NoRetry, RetryContext, RetryPolicy,
        RetryStrategy,
    };
    pub use crate::timeout::{
        check_deadline, remaining_deadline, run_blocking_with_timeout,
        run_cooperative_with_timeout, with_deadline,
    };
}
