//! Distributed rate limiting for the redgate substrate.
//!
//! Sliding-window and token-bucket algorithms, evaluated atomically
//! server-side so concurrent checks across instances see a consistent
//! count. Composite checks admit a request only when every applicable
//! limit (user, project, ip, endpoint) passes, returning the most
//! restrictive decision.
//!
//! When the store is unreachable or the circuit breaker is open, checks
//! **fail open**: the request is admitted and counters are left alone.
//! The health component raises an alert on the fail-open counter so
//! operators notice.
//!
//! ## Example
//!
//! ```rust,no_run
//! use redgate_connection::{ConnectionConfig, ConnectionFactory};
//! use redgate_core::TenantId;
//! use redgate_ratelimiter::{RateLimiter, RateLimiterConfig, RequestDescriptor, READ_COST};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let factory = ConnectionFactory::connect(ConnectionConfig::from_env()).await?;
//! let limiter = RateLimiter::new(factory, RateLimiterConfig::default());
//! limiter.warm_up().await?;
//!
//! let tenant = TenantId::parse("6f7deacc-9d74-4984-a6ae-d0a78597bbcb")?;
//! let decision = limiter
//!     .check_request(
//!         &tenant,
//!         &RequestDescriptor {
//!             client_ip: Some("10.0.0.1".into()),
//!             endpoint: Some("/api/v1/documents".into()),
//!             cost: READ_COST,
//!             ..Default::default()
//!         },
//!     )
//!     .await?;
//!
//! if !decision.allowed {
//!     // Map to HTTP 429 with Retry-After.
//! }
//! # Ok(())
//! # }
//! ```

pub use config::{
    normalize_path, LimitKind, RateLimitConfig, RateLimiterConfig, RateLimiterConfigBuilder,
    READ_COST, WRITE_COST,
};
pub use error::RateLimitError;
pub use limiter::{RateLimitDecision, RateLimiter, RequestDescriptor, WindowUsage};

mod config;
mod error;
mod limiter;
mod scripts;
