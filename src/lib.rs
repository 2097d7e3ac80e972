//! Turnstile - Admission Control over a Shared Counter Store
//!
//! This crate decides, per client key, whether a unit of work may proceed.
//! Three strategies (fixed window, sliding window log, token bucket) keep
//! their state in Redis and coordinate across processes using only the
//! store's atomic primitives. An axum middleware applies the decision to
//! HTTP requests.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
