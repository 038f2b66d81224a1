//! Bouncer - Abuse-Blocking Rate Limiter
//!
//! This crate bounds how many attempts an identifier (client IP, account, API
//! key) may make against a protected operation within a time window, and
//! escalates to a temporary hard block once the bound is reached. State lives
//! in a shared counter store, so every instance of a service enforces the
//! same limits.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use error::{BouncerError, Result};
pub use ratelimit::{Decision, RateLimitConfig, RateLimiter, ScopeRegistry};
