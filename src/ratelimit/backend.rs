//! Rate limiter trait for abstracting local and distributed implementations.

use async_trait::async_trait;

use crate::error::Result;

/// Trait for rate limiter implementations.
///
/// This trait abstracts over the in-process and Redis-backed limiters so the
/// admission middleware can work with either.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Decide whether a new event for `key` is over the limit.
    ///
    /// `Ok(true)` means limited, `Ok(false)` means admitted. An error means the
    /// limiter could not decide; callers must not treat it as an admission.
    async fn limit(&self, key: &str) -> Result<bool>;
}
