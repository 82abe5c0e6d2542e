//! Cache and session layer for the redgate substrate.
//!
//! Three tenant-scoped stores over the shared connection factory:
//!
//! - [`TenantCache`]: versioned, tagged data cache with tag-based
//!   invalidation backed by a secondary index
//! - [`SessionStore`]: single-session-per-user sessions with sliding
//!   expiration and cross-tenant access grants
//! - [`ProgressTracker`]: monotonic progress records for long-running
//!   operations
//!
//! ## Example
//!
//! ```rust,no_run
//! use redgate_cache::TenantCache;
//! use redgate_connection::{ConnectionConfig, ConnectionFactory};
//! use redgate_core::TenantId;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let factory = ConnectionFactory::connect(ConnectionConfig::from_env()).await?;
//! let cache = TenantCache::new(factory);
//! let tenant = TenantId::parse("6f7deacc-9d74-4984-a6ae-d0a78597bbcb")?;
//!
//! cache
//!     .write(
//!         &tenant,
//!         "project:data",
//!         serde_json::json!({"name": "alpha"}),
//!         Duration::from_secs(3600),
//!         &["project_data".to_string()],
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub use cache::TenantCache;
pub use entry::CacheRecord;
pub use error::CacheError;
pub use progress::{Progress, ProgressState, ProgressTracker, StepEntry};
pub use session::{Session, SessionStore};

mod cache;
mod entry;
mod error;
mod progress;
mod session;
