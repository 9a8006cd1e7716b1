//! HTTP admission middleware.
//!
//! Two tower layers guard a service: [`RateLimitLayer`] caps how many
//! requests a key may make per window, and [`ActiveLimitLayer`] caps how many
//! requests may be in flight at once. A rejected request is answered with
//! `429 Too Many Requests` and a limiter failure with `500 Internal Server
//! Error`; the wrapped service only runs for admitted requests.

mod active_limit;
mod key;
mod rate_limit;

pub use active_limit::{
    build_active_limit_layer, ActiveLimitControl, ActiveLimitLayer, ActiveLimitService, SlotGuard,
};
pub use key::{client_ip, fixed_key, ip_key, key_fn, KeyFn, DEFAULT_ACTIVE_KEY, DEFAULT_IP_KEY_PREFIX};
pub use rate_limit::{build_rate_limit_layer, RateLimitLayer, RateLimitService};
