//! Limiting key derivation.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request};

/// Default prefix of per-client rate limiting keys.
pub const DEFAULT_IP_KEY_PREFIX: &str = "ip-limiter";

/// Default key shared by every request for active limiting.
pub const DEFAULT_ACTIVE_KEY: &str = "active-limiter";

/// Computes the limiting key for a request.
pub type KeyFn = Arc<dyn Fn(&Request) -> String + Send + Sync>;

/// Wrap a closure as a [`KeyFn`].
pub fn key_fn<F>(f: F) -> KeyFn
where
    F: Fn(&Request) -> String + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Key every request by the client address: `"{prefix}:{ip}"`.
///
/// Requests with no known address share the key `"{prefix}:unknown"`.
pub fn ip_key(prefix: impl Into<String>, trust_proxy: bool) -> KeyFn {
    let prefix = prefix.into();
    Arc::new(move |req: &Request| {
        let ip = client_ip(req, trust_proxy).unwrap_or_else(|| "unknown".to_string());
        format!("{}:{}", prefix, ip)
    })
}

/// Use the same key for every request.
pub fn fixed_key(key: impl Into<String>) -> KeyFn {
    let key = key.into();
    Arc::new(move |_: &Request| key.clone())
}

/// Client address of a request.
///
/// Proxy headers are only consulted when `trust_proxy` is set; otherwise the
/// connection address recorded by `into_make_service_with_connect_info` is used.
pub fn client_ip(req: &Request, trust_proxy: bool) -> Option<String> {
    if trust_proxy {
        let forwarded = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            // The leftmost entry is the original client
            .and_then(|s| s.split(',').next())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let real_ip = || {
            req.headers()
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };

        if let Some(ip) = forwarded.or_else(real_ip) {
            return Some(ip);
        }
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
}
