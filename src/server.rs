//! HTTP server with admission control.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::activelimit::ActiveLimiter;
use crate::config::FloodgateConfig;
use crate::error::{FloodgateError, Result};
use crate::middleware::{build_active_limit_layer, build_rate_limit_layer};
use crate::ratelimit::Limiter;

/// Wrap `routes` in the admission layers enabled by `config`.
///
/// The rate limit runs first, so a request over its rate never takes an
/// active slot.
pub fn with_admission<R, A>(
    routes: Router,
    config: &FloodgateConfig,
    rate_limiter: Arc<R>,
    active_limiter: Arc<A>,
) -> Router
where
    R: Limiter + 'static,
    A: ActiveLimiter + 'static,
{
    let mut router = routes;

    if let Some(layer) = build_active_limit_layer(&config.active_limit, active_limiter) {
        info!(
            max_active = config.active_limit.max_active,
            key = %config.active_limit.key,
            "Active limit enabled"
        );
        router = router.layer(layer);
    }

    if let Some(layer) = build_rate_limit_layer(&config.rate_limit, rate_limiter) {
        info!(
            rate = config.rate_limit.rate,
            interval_ms = config.rate_limit.interval_ms,
            "Rate limit enabled"
        );
        router = router.layer(layer);
    }

    router
}

/// Routes served by the standalone binary.
pub fn default_routes() -> Router {
    Router::new().route("/", get(|| async { "ok" }))
}

/// HTTP server for admission-controlled routes.
pub struct AdmissionServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Routes, already wrapped in their admission layers
    router: Router,
}

impl AdmissionServer {
    /// Create a new server.
    pub fn new(addr: SocketAddr, router: Router) -> Self {
        Self { addr, router }
    }

    /// Start the server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending::<()>()).await
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve_listener(listener, signal).await
    }

    /// Serve on an already bound listener.
    pub async fn serve_listener<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        info!(addr = %listener.local_addr()?, "Starting HTTP server");

        // Client addresses are needed for per-IP keys
        let service = self
            .router
            .into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, service)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                FloodgateError::Io(e)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activelimit::LocalActiveLimiter;
    use crate::ratelimit::LocalRateLimiter;
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::extract::{ConnectInfo, Request};
    use axum::http::StatusCode;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tower::ServiceExt;

    fn limiters(config: &FloodgateConfig) -> (Arc<LocalRateLimiter>, Arc<LocalActiveLimiter>) {
        let rate_limiter = LocalRateLimiter::new(
            Arc::new(MemoryStore::new()),
            config.rate_limit.rate,
            config.rate_limit.interval(),
        )
        .unwrap();
        let active_limiter = LocalActiveLimiter::with_scope(config.active_limit.scope);
        (Arc::new(rate_limiter), Arc::new(active_limiter))
    }

    fn request() -> Request {
        let mut req = axum::http::Request::builder()
            .uri("/")
            .body(Body::empty())
            .unwrap();
        let addr: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        req.extensions_mut().insert(ConnectInfo(addr));
        req
    }

    #[tokio::test]
    async fn test_rate_limited_router() {
        let mut config = FloodgateConfig::default();
        config.rate_limit.rate = 1;
        config.rate_limit.interval_ms = 60_000;
        let (rate_limiter, active_limiter) = limiters(&config);
        let app = with_admission(default_routes(), &config, rate_limiter, active_limiter.clone());

        let response = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        // The rejected request never reached the active limiter
        assert_eq!(active_limiter.in_flight("active-limiter"), 0);
    }

    #[tokio::test]
    async fn test_disabled_layers() {
        let mut config = FloodgateConfig::default();
        config.rate_limit.enabled = false;
        config.rate_limit.rate = 0;
        config.active_limit.enabled = false;
        config.active_limit.max_active = 0;
        let (rate_limiter, active_limiter) = limiters(&config);
        let app = with_admission(default_routes(), &config, rate_limiter, active_limiter);

        for _ in 0..3 {
            let response = app.clone().oneshot(request()).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_serve_and_shutdown() {
        let config = FloodgateConfig::default();
        let (rate_limiter, active_limiter) = limiters(&config);
        let app = with_admission(default_routes(), &config, rate_limiter, active_limiter);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = AdmissionServer::new(addr, app);
        let handle = tokio::spawn(server.serve_listener(listener, async move {
            let _ = rx.await;
        }));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
