//! Resilience toolkit: the primitives everything above leans on.
//!
//! Circuit breaker, retry with backoff, durable dead-letter queue,
//! crash-state snapshots, sliding-window rate limiting, and bounded caches.

pub mod breaker;
pub mod cache;
pub mod dlq;
pub mod ratelimit;
pub mod recovery;
pub mod retry;

pub use breaker::{BreakerError, CircuitBreaker, CircuitState};
pub use cache::{DiskCache, TtlCache};
pub use dlq::{DeadLetterItem, DeadLetterQueue, ReplayOutcome};
pub use ratelimit::RateLimiter;
pub use recovery::{Snapshot, StateRecovery};
pub use retry::{retry_with_backoff, RetryPolicy};
