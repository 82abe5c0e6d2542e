//! Tenant-isolated Redis connection management for the redgate substrate.
//!
//! One logical Redis endpoint is multiplexed into an admin pool plus one
//! lazily-created, bounded pool per tenant. Every scope runs under a shared
//! circuit breaker, and every tenant-scoped operation goes through the
//! key-rewriting [`Connection`] allowlist, so cross-tenant access is
//! impossible by construction.
//!
//! ## Example
//!
//! ```rust,no_run
//! use redgate_connection::{ConnectionConfig, ConnectionFactory};
//! use redgate_core::TenantId;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let factory = ConnectionFactory::connect(ConnectionConfig::from_env()).await?;
//! let tenant = TenantId::parse("6f7deacc-9d74-4984-a6ae-d0a78597bbcb")?;
//!
//! let value = factory
//!     .with_connection(&tenant, |conn| async move {
//!         conn.get("project:data").await
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//! - `metrics`: enables metrics collection using the `metrics` crate
//! - `test-util`: in-memory [`FakeStore`](fake::FakeStore) backend for tests

pub use commands::{Connector, RawCommands, ScriptReply};
pub use config::ConnectionConfig;
pub use error::{CommandError, ConnectionError};
pub use factory::{ConnectionFactory, FactoryHealth};
pub use isolated::Connection;
pub use pool::PoolStats;
pub use redis_backend::{RedisBackend, RedisConnector};
pub use scripts::{ScriptDef, ScriptExecutor};
pub use trace::{CommandCategory, CommandObserver, CommandRecord};

mod commands;
mod config;
mod error;
mod factory;
mod isolated;
mod pool;
mod redis_backend;
mod scripts;
mod trace;

#[cfg(feature = "test-util")]
pub mod fake;
