//! Ratelimiter - per-client request admission control
//!
//! This crate implements two independent rate limiting engines, a
//! fixed-window counter and a token bucket, each keyed by a client identifier
//! such as an IP address, plus the axum middleware and server that put them in
//! front of HTTP routes.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
