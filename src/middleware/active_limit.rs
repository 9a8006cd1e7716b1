//! Active request limiting layer.
//!
//! Each admitted request holds one slot of an [`ActiveLimiter`] for as long
//! as the inner service is running. The slot is owned by a [`SlotGuard`], so
//! it is given back when the request completes, fails, panics, or is dropped
//! before completion.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use tower::{Layer, Service};
use tracing::{debug, error, trace};

use super::key::{fixed_key, KeyFn, DEFAULT_ACTIVE_KEY};
use crate::activelimit::{acquire_detached, spawn_release, ActiveLimiter};
use crate::config::ActiveLimitConfig;

/// Runtime controls for an active limit, shared with the application.
///
/// Both values are read fresh on every request.
#[derive(Debug)]
pub struct ActiveLimitControl {
    max_active: AtomicI64,
    enabled: AtomicBool,
}

impl ActiveLimitControl {
    /// Create enabled controls allowing `max_active` requests in flight.
    pub fn new(max_active: i64) -> Self {
        Self {
            max_active: AtomicI64::new(max_active),
            enabled: AtomicBool::new(true),
        }
    }

    /// Maximum requests in flight.
    pub fn max_active(&self) -> i64 {
        self.max_active.load(Ordering::Acquire)
    }

    /// Change the maximum requests in flight.
    pub fn set_max_active(&self, max_active: i64) -> &Self {
        self.max_active.store(max_active, Ordering::Release);
        self
    }

    /// Whether requests are counted.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Turn counting on or off. While off, every request is admitted.
    pub fn set_enabled(&self, enabled: bool) -> &Self {
        self.enabled.store(enabled, Ordering::Release);
        self
    }
}

/// One acquired slot, released exactly once.
///
/// Call [`SlotGuard::release`] on the normal path. If the guard is dropped
/// instead, the release is spawned onto the current tokio runtime.
pub struct SlotGuard<L: ActiveLimiter + 'static> {
    limiter: Arc<L>,
    key: String,
    armed: bool,
}

impl<L: ActiveLimiter + 'static> SlotGuard<L> {
    /// Take ownership of a slot already acquired for `key`.
    pub fn new(limiter: Arc<L>, key: String) -> Self {
        Self {
            limiter,
            key,
            armed: true,
        }
    }

    /// The key the slot was acquired for.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the slot and wait for the limiter to acknowledge it.
    ///
    /// The release runs on its own task, so it still completes if this
    /// future is dropped while waiting.
    pub async fn release(mut self) {
        let handle = spawn_release(self.limiter.clone(), std::mem::take(&mut self.key));
        self.armed = false;

        if let Err(e) = handle.await {
            error!(error = %e, "Active slot release task failed");
        }
    }
}

impl<L: ActiveLimiter + 'static> Drop for SlotGuard<L> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;

        let limiter = self.limiter.clone();
        let key = std::mem::take(&mut self.key);

        match tokio::runtime::Handle::try_current() {
            Ok(_) => {
                debug!(key = %key, "Request ended early; releasing active slot in background");
                spawn_release(limiter, key);
            }
            Err(_) => {
                error!(key = %key, "No async runtime to release active slot; slot leaked");
            }
        }
    }
}

/// Tower layer capping the number of in-flight requests.
///
/// Requests over the limit get `429 Too Many Requests`; a failing limiter gets
/// `500 Internal Server Error`. In both cases the inner service is not called.
pub struct ActiveLimitLayer<L> {
    limiter: Arc<L>,
    control: Arc<ActiveLimitControl>,
    key_fn: KeyFn,
}

impl<L> Clone for ActiveLimitLayer<L> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            control: self.control.clone(),
            key_fn: self.key_fn.clone(),
        }
    }
}

impl<L: ActiveLimiter> ActiveLimitLayer<L> {
    /// Create a layer sharing one key (`active-limiter`) across all requests.
    pub fn new(limiter: Arc<L>, max_active: i64) -> Self {
        Self {
            limiter,
            control: Arc::new(ActiveLimitControl::new(max_active)),
            key_fn: fixed_key(DEFAULT_ACTIVE_KEY),
        }
    }

    /// Replace the function deriving the limiting key.
    pub fn with_key_fn(mut self, key_fn: KeyFn) -> Self {
        self.key_fn = key_fn;
        self
    }

    /// Use controls shared with other layers or the application.
    pub fn with_control(mut self, control: Arc<ActiveLimitControl>) -> Self {
        self.control = control;
        self
    }

    /// Runtime controls of this layer.
    pub fn control(&self) -> &Arc<ActiveLimitControl> {
        &self.control
    }

    /// Get the limiter.
    pub fn limiter(&self) -> &Arc<L> {
        &self.limiter
    }
}

impl<S, L> Layer<S> for ActiveLimitLayer<L> {
    type Service = ActiveLimitService<S, L>;

    fn layer(&self, inner: S) -> Self::Service {
        ActiveLimitService {
            inner,
            limiter: self.limiter.clone(),
            control: self.control.clone(),
            key_fn: self.key_fn.clone(),
        }
    }
}

/// Tower service for active request limiting.
pub struct ActiveLimitService<S, L> {
    inner: S,
    limiter: Arc<L>,
    control: Arc<ActiveLimitControl>,
    key_fn: KeyFn,
}

impl<S: Clone, L> Clone for ActiveLimitService<S, L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            control: self.control.clone(),
            key_fn: self.key_fn.clone(),
        }
    }
}

impl<S, L> Service<Request> for ActiveLimitService<S, L>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Error: Send + 'static,
    S::Future: Send + 'static,
    L: ActiveLimiter + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        if !self.control.is_enabled() {
            return Box::pin(inner.call(req));
        }

        let limiter = self.limiter.clone();
        let max_active = self.control.max_active();
        let key = (self.key_fn)(&req);

        Box::pin(async move {
            let acquired = acquire_detached(limiter.clone(), key.clone(), max_active).await;
            let rejected = match acquired {
                Ok(rejected) => rejected,
                Err(e) => {
                    error!(key = %key, error = %e, "Active limiter failed; rejecting request");
                    return Ok(StatusCode::INTERNAL_SERVER_ERROR.into_response());
                }
            };

            if rejected {
                debug!(key = %key, max_active = max_active, "Request rejected by active limit");
                return Ok(StatusCode::TOO_MANY_REQUESTS.into_response());
            }

            trace!(key = %key, "Active slot acquired");
            let guard = SlotGuard::new(limiter, key);
            let result = inner.call(req).await;
            guard.release().await;
            result
        })
    }
}

/// Build an active limit layer from configuration.
///
/// Returns `None` if the configuration disables active limiting. Use
/// [`ActiveLimitControl::set_enabled`] instead to switch it at runtime.
pub fn build_active_limit_layer<L: ActiveLimiter>(
    config: &ActiveLimitConfig,
    limiter: Arc<L>,
) -> Option<ActiveLimitLayer<L>> {
    if !config.enabled {
        return None;
    }

    Some(ActiveLimitLayer::new(limiter, config.max_active).with_key_fn(fixed_key(config.key.clone())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activelimit::{DistributedActiveLimiter, LocalActiveLimiter};
    use crate::error::{FloodgateError, Result};
    use crate::store::{CounterStore, MemoryStore};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};
    use tokio::sync::{Barrier, Semaphore};
    use tower::ServiceExt;

    struct FailingLimiter;

    #[async_trait]
    impl ActiveLimiter for FailingLimiter {
        async fn acquire(&self, _key: &str, _max_active: i64) -> Result<bool> {
            Err(FloodgateError::Store("connection refused".to_string()))
        }

        async fn release(&self, _key: &str) -> Result<bool> {
            Err(FloodgateError::Store("connection refused".to_string()))
        }
    }

    fn request() -> Request {
        axum::http::Request::builder()
            .uri("/")
            .body(Body::empty())
            .unwrap()
    }

    fn counting_app<L: ActiveLimiter + 'static>(
        layer: ActiveLimitLayer<L>,
        calls: Arc<AtomicUsize>,
    ) -> Router {
        Router::new()
            .route(
                "/",
                get(move || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        "ok"
                    }
                }),
            )
            .layer(layer)
    }

    /// App whose handler parks until `gate` hands out a permit.
    fn blocking_app<L: ActiveLimiter + 'static>(
        layer: ActiveLimitLayer<L>,
        entered: Arc<Barrier>,
        gate: Arc<Semaphore>,
    ) -> Router {
        Router::new()
            .route(
                "/",
                get(move || {
                    let entered = entered.clone();
                    let gate = gate.clone();
                    async move {
                        entered.wait().await;
                        let _permit = gate.acquire().await.unwrap();
                        "done"
                    }
                }),
            )
            .layer(layer)
    }

    async fn panicking_handler() -> &'static str {
        panic!("handler failure")
    }

    /// Store whose counter round trips are slow: an increment lands before
    /// the reply is delayed, a decrement lands only after the delay.
    #[derive(Default)]
    struct SlowStore {
        inner: MemoryStore,
        incr_delay: Duration,
        decr_delay: Duration,
    }

    #[async_trait]
    impl CounterStore for SlowStore {
        async fn sliding_window(
            &self,
            key: &str,
            interval: Duration,
            rate: u64,
            now_ms: u64,
        ) -> Result<bool> {
            self.inner.sliding_window(key, interval, rate, now_ms).await
        }

        async fn incr(&self, key: &str) -> Result<i64> {
            let value = self.inner.incr(key).await?;
            tokio::time::sleep(self.incr_delay).await;
            Ok(value)
        }

        async fn decr(&self, key: &str) -> Result<i64> {
            tokio::time::sleep(self.decr_delay).await;
            self.inner.decr(key).await
        }
    }

    async fn eventually_counter(store: &MemoryStore, key: &str, expected: i64) {
        let start = Instant::now();
        while store.counter(key) != expected {
            if start.elapsed() > Duration::from_secs(2) {
                panic!(
                    "counter for {key} stayed at {} instead of {expected}",
                    store.counter(key)
                );
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn eventually_in_flight(limiter: &LocalActiveLimiter, key: &str, expected: i64) {
        let start = Instant::now();
        while limiter.in_flight(key) != expected {
            if start.elapsed() > Duration::from_secs(2) {
                panic!(
                    "in-flight count for {key} stayed at {} instead of {expected}",
                    limiter.in_flight(key)
                );
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_slot_released_after_response() {
        let limiter = Arc::new(LocalActiveLimiter::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let app = counting_app(ActiveLimitLayer::new(limiter.clone(), 1), calls.clone());

        for _ in 0..3 {
            let response = app.clone().oneshot(request()).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(limiter.in_flight(DEFAULT_ACTIVE_KEY), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_rejects_when_max_in_flight() {
        const MAX: usize = 3;

        let limiter = Arc::new(LocalActiveLimiter::new());
        let entered = Arc::new(Barrier::new(MAX + 1));
        let gate = Arc::new(Semaphore::new(0));
        let app = blocking_app(
            ActiveLimitLayer::new(limiter.clone(), MAX as i64),
            entered.clone(),
            gate.clone(),
        );

        let mut pending = Vec::new();
        for _ in 0..MAX {
            pending.push(tokio::spawn(app.clone().oneshot(request())));
        }
        entered.wait().await;
        assert_eq!(limiter.in_flight(DEFAULT_ACTIVE_KEY), MAX as i64);

        let response = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        gate.add_permits(100);
        for handle in pending {
            let response = handle.await.unwrap().unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(limiter.in_flight(DEFAULT_ACTIVE_KEY), 0);

        // Slots are available again once the earlier requests finished
        let entered = Arc::new(Barrier::new(2));
        let app = blocking_app(
            ActiveLimitLayer::new(limiter.clone(), MAX as i64),
            entered.clone(),
            gate.clone(),
        );
        let handle = tokio::spawn(app.oneshot(request()));
        entered.wait().await;
        gate.add_permits(100);
        assert_eq!(handle.await.unwrap().unwrap().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_slot_released_when_handler_panics() {
        const MAX: i64 = 2;

        let limiter = Arc::new(LocalActiveLimiter::new());
        let layer = ActiveLimitLayer::new(limiter.clone(), MAX);
        let app = Router::new()
            .route("/", get(panicking_handler))
            .layer(layer.clone());

        for _ in 0..MAX {
            let result = tokio::spawn(app.clone().oneshot(request())).await;
            assert!(result.unwrap_err().is_panic());
        }
        eventually_in_flight(&limiter, DEFAULT_ACTIVE_KEY, 0).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let app = counting_app(layer, calls.clone());
        let response = app.oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slot_released_when_request_cancelled() {
        let limiter = Arc::new(LocalActiveLimiter::new());
        let entered = Arc::new(Barrier::new(2));
        let gate = Arc::new(Semaphore::new(0));
        let app = blocking_app(
            ActiveLimitLayer::new(limiter.clone(), 1),
            entered.clone(),
            gate,
        );

        let handle = tokio::spawn(app.oneshot(request()));
        entered.wait().await;
        assert_eq!(limiter.in_flight(DEFAULT_ACTIVE_KEY), 1);

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
        eventually_in_flight(&limiter, DEFAULT_ACTIVE_KEY, 0).await;
    }

    #[tokio::test]
    async fn test_disabled_admits_everything() {
        let limiter = Arc::new(LocalActiveLimiter::new());
        let entered = Arc::new(Barrier::new(11));
        let gate = Arc::new(Semaphore::new(0));
        let layer = ActiveLimitLayer::new(limiter.clone(), 1);
        layer.control().set_enabled(false);
        let app = blocking_app(layer, entered.clone(), gate.clone());

        let mut pending = Vec::new();
        for _ in 0..10 {
            pending.push(tokio::spawn(app.clone().oneshot(request())));
        }
        entered.wait().await;
        assert_eq!(limiter.in_flight(DEFAULT_ACTIVE_KEY), 0);

        gate.add_permits(100);
        for handle in pending {
            assert_eq!(handle.await.unwrap().unwrap().status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_runtime_max_active_change() {
        let limiter = Arc::new(LocalActiveLimiter::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let layer = ActiveLimitLayer::new(limiter.clone(), 0);
        let control = layer.control().clone();
        let app = counting_app(layer, calls.clone());

        let response = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        control.set_max_active(5);
        assert_eq!(control.max_active(), 5);
        let response = app.oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_limiter_failure_is_internal_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let app = counting_app(ActiveLimitLayer::new(Arc::new(FailingLimiter), 10), calls.clone());

        let response = app.oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_distributed_limiter_through_layer() {
        let store = Arc::new(MemoryStore::new());
        let limiter = Arc::new(DistributedActiveLimiter::new(store.clone()));
        let calls = Arc::new(AtomicUsize::new(0));
        let layer = ActiveLimitLayer::new(limiter, 1)
            .with_key_fn(crate::middleware::fixed_key("orders"));
        let app = counting_app(layer, calls.clone());

        let response = app.oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(store.counter("orders"), 0);
    }

    #[tokio::test]
    async fn test_guard_release_runs_once() {
        let limiter = Arc::new(LocalActiveLimiter::new());
        assert!(!limiter.acquire("k", 1).await.unwrap());

        let guard = SlotGuard::new(limiter.clone(), "k".to_string());
        assert_eq!(guard.key(), "k");
        guard.release().await;
        assert_eq!(limiter.in_flight("k"), 0);

        // Dropping an acquired guard releases in the background
        assert!(!limiter.acquire("k", 1).await.unwrap());
        drop(SlotGuard::new(limiter.clone(), "k".to_string()));
        eventually_in_flight(&limiter, "k", 0).await;
    }

    #[tokio::test]
    async fn test_slot_released_when_cancelled_during_acquire() {
        let store = Arc::new(SlowStore {
            incr_delay: Duration::from_millis(200),
            ..SlowStore::default()
        });
        let limiter = Arc::new(DistributedActiveLimiter::new(store.clone()));
        let calls = Arc::new(AtomicUsize::new(0));
        let app = counting_app(ActiveLimitLayer::new(limiter, 1), calls.clone());

        let handle = tokio::spawn(app.clone().oneshot(request()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.inner.counter(DEFAULT_ACTIVE_KEY), 1);

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
        eventually_counter(&store.inner, DEFAULT_ACTIVE_KEY, 0).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let response = app.oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_compensation_completes_when_cancelled() {
        let store = Arc::new(SlowStore {
            decr_delay: Duration::from_millis(200),
            ..SlowStore::default()
        });
        let limiter = Arc::new(DistributedActiveLimiter::new(store.clone()));
        let app = counting_app(ActiveLimitLayer::new(limiter, 0), Arc::new(AtomicUsize::new(0)));

        // Over the limit: the increment is undone by a slow decrement
        let handle = tokio::spawn(app.oneshot(request()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.inner.counter(DEFAULT_ACTIVE_KEY), 1);

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
        eventually_counter(&store.inner, DEFAULT_ACTIVE_KEY, 0).await;
    }

    #[tokio::test]
    async fn test_release_completes_when_cancelled_during_release() {
        let store = Arc::new(SlowStore {
            decr_delay: Duration::from_millis(200),
            ..SlowStore::default()
        });
        let limiter = Arc::new(DistributedActiveLimiter::new(store.clone()));
        let calls = Arc::new(AtomicUsize::new(0));
        let app = counting_app(ActiveLimitLayer::new(limiter, 1), calls.clone());

        let handle = tokio::spawn(app.oneshot(request()));
        // The handler has run and the release is waiting on the store
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.inner.counter(DEFAULT_ACTIVE_KEY), 1);

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
        eventually_counter(&store.inner, DEFAULT_ACTIVE_KEY, 0).await;
    }

    #[test]
    fn test_build_disabled_layer() {
        let limiter = Arc::new(LocalActiveLimiter::new());
        let config = ActiveLimitConfig {
            enabled: false,
            ..ActiveLimitConfig::default()
        };
        assert!(build_active_limit_layer(&config, limiter.clone()).is_none());

        let layer = build_active_limit_layer(&ActiveLimitConfig::default(), limiter).unwrap();
        assert_eq!(layer.control().max_active(), 100);
    }
}
