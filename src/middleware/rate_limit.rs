//! Rate limiting layer.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use tower::{Layer, Service};
use tracing::{debug, error};

use super::key::{ip_key, KeyFn, DEFAULT_IP_KEY_PREFIX};
use crate::config::RateLimitConfig;
use crate::ratelimit::Limiter;

/// Tower layer rejecting requests that exceed a [`Limiter`].
///
/// Limited requests get `429 Too Many Requests`; a failing limiter gets
/// `500 Internal Server Error`. In both cases the inner service is not called.
pub struct RateLimitLayer<L> {
    limiter: Arc<L>,
    key_fn: KeyFn,
}

impl<L> Clone for RateLimitLayer<L> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            key_fn: self.key_fn.clone(),
        }
    }
}

impl<L: Limiter> RateLimitLayer<L> {
    /// Create a layer keyed by client address (`ip-limiter:<ip>`).
    pub fn new(limiter: Arc<L>) -> Self {
        Self {
            limiter,
            key_fn: ip_key(DEFAULT_IP_KEY_PREFIX, false),
        }
    }

    /// Replace the function deriving the limiting key.
    pub fn with_key_fn(mut self, key_fn: KeyFn) -> Self {
        self.key_fn = key_fn;
        self
    }

    /// Get the limiter.
    pub fn limiter(&self) -> &Arc<L> {
        &self.limiter
    }
}

impl<S, L> Layer<S> for RateLimitLayer<L> {
    type Service = RateLimitService<S, L>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
            key_fn: self.key_fn.clone(),
        }
    }
}

/// Tower service for rate limiting.
pub struct RateLimitService<S, L> {
    inner: S,
    limiter: Arc<L>,
    key_fn: KeyFn,
}

impl<S: Clone, L> Clone for RateLimitService<S, L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            key_fn: self.key_fn.clone(),
        }
    }
}

impl<S, L> Service<Request> for RateLimitService<S, L>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Error: Send + 'static,
    S::Future: Send + 'static,
    L: Limiter + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        // Take the service that was driven to readiness
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let limiter = self.limiter.clone();
        let key = (self.key_fn)(&req);

        Box::pin(async move {
            match limiter.limit(&key).await {
                Ok(false) => inner.call(req).await,
                Ok(true) => {
                    debug!(key = %key, "Request rejected by rate limit");
                    Ok(StatusCode::TOO_MANY_REQUESTS.into_response())
                }
                Err(e) => {
                    error!(key = %key, error = %e, "Rate limiter failed; rejecting request");
                    Ok(StatusCode::INTERNAL_SERVER_ERROR.into_response())
                }
            }
        })
    }
}

/// Build a rate limit layer from configuration.
///
/// Returns `None` if rate limiting is disabled.
pub fn build_rate_limit_layer<L: Limiter>(
    config: &RateLimitConfig,
    limiter: Arc<L>,
) -> Option<RateLimitLayer<L>> {
    if !config.enabled {
        return None;
    }

    Some(
        RateLimitLayer::new(limiter)
            .with_key_fn(ip_key(config.key_prefix.clone(), config.trust_proxy)),
    )
}
