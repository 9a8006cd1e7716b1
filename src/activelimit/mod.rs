//! Active (in-flight) request limiting.
//!
//! Unlike rate limiting, an active limit spans the whole lifetime of a
//! request, so limiters expose a two-phase protocol: [`ActiveLimiter::acquire`]
//! before the protected work and [`ActiveLimiter::release`] after it.

mod distributed;
mod local;

pub use distributed::DistributedActiveLimiter;
pub use local::{CounterScope, LocalActiveLimiter};

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::error::{FloodgateError, Result};

/// Trait for active limiter implementations.
#[async_trait]
pub trait ActiveLimiter: Send + Sync {
    /// Try to claim one in-flight slot for `key`, allowing at most `max_active`.
    ///
    /// `Ok(false)` means the caller now owns a slot and must release it.
    /// `Ok(true)` means the request is rejected and owns nothing.
    /// An error means the limiter failed and the caller owns nothing.
    async fn acquire(&self, key: &str, max_active: i64) -> Result<bool>;

    /// Give back one slot for `key`.
    ///
    /// `Ok(false)` reports an accounting anomaly, such as a release without a
    /// matching acquire.
    async fn release(&self, key: &str) -> Result<bool>;
}

/// Release a slot, reporting failures to the log only.
///
/// The response for the request has already been decided by the time a slot
/// is released, so nothing here is propagated to the caller.
pub async fn release_and_log<L>(limiter: &L, key: &str)
where
    L: ActiveLimiter + ?Sized,
{
    match limiter.release(key).await {
        Ok(true) => trace!(key = %key, "Released active slot"),
        Ok(false) => warn!(
            key = %key,
            "Active slot release found no matching acquire; counter may be out of sync"
        ),
        Err(e) => error!(
            key = %key,
            error = %e,
            "Failed to release active slot; one slot leaks until the counter expires"
        ),
    }
}

/// Acquire a slot on a detached task.
///
/// The store round trips (including a compensating decrement) always run to
/// completion. If the caller is dropped before the outcome arrives, a slot
/// that was granted is released instead of leaking.
pub async fn acquire_detached<L>(limiter: Arc<L>, key: String, max_active: i64) -> Result<bool>
where
    L: ActiveLimiter + ?Sized + 'static,
{
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let outcome = limiter.acquire(&key, max_active).await;
        if let Err(Ok(false)) = tx.send(outcome) {
            debug!(key = %key, "Caller went away while acquiring; giving the slot back");
            release_and_log(limiter.as_ref(), &key).await;
        }
    });

    rx.await.map_err(|_| {
        FloodgateError::Store("acquire task ended without an outcome".to_string())
    })?
}

/// Release a slot on a detached task, so the release completes even if the
/// caller is dropped while waiting for it.
pub fn spawn_release<L>(limiter: Arc<L>, key: String) -> JoinHandle<()>
where
    L: ActiveLimiter + ?Sized + 'static,
{
    tokio::spawn(async move {
        release_and_log(limiter.as_ref(), &key).await;
    })
}
