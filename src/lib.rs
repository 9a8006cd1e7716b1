//! Floodgate - HTTP admission control
//!
//! This crate decides, per inbound HTTP request, whether the request may
//! proceed. It provides a sliding-window rate limiter, an active request
//! limiter capping requests in flight, and tower middleware wiring both into
//! an axum service. Counters live either in process or in Redis, so that
//! every instance of a service shares one limit.

pub mod activelimit;
pub mod config;
pub mod error;
pub mod middleware;
pub mod ratelimit;
pub mod server;
pub mod store;
