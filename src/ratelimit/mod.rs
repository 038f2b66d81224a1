//! Rate limiting logic: scope configuration, decisions and administration.

mod admin;
mod keys;
mod limiter;
mod registry;

pub use admin::{BlockStatus, LimitStatus};
pub use keys::{scope_patterns, LimitKeys};
pub use limiter::{
    CounterMode, Decision, LimiterOptions, RateLimiter, RetryPolicy, DEFAULT_KEY_PREFIX,
    DEFAULT_OP_TIMEOUT, DEFAULT_SCAN_PAGE_SIZE,
};
pub use registry::{RateLimitConfig, ScopeRegistry, DEFAULT_SCOPE};
