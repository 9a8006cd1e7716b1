//! Sliding-window rate limiting.

mod backend;
mod limiter;

pub use backend::Limiter;
pub use limiter::{now_ms, LocalRateLimiter, RedisRateLimiter, SlidingWindowLimiter};
