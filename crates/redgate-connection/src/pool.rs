//! Bounded per-tenant pools.
//!
//! The backend multiplexes one transport, so the pool bound is enforced as
//! a concurrency bound: a semaphore with one permit per slot. Acquiring
//! holds a permit for the whole connection scope; when none frees up
//! within the wait budget the caller gets `PoolExhausted`.

use crate::commands::RawCommands;
use crate::error::ConnectionError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Point-in-time pool usage, exposed through factory metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// "admin" or the tenant UUID.
    pub name: String,
    /// Configured slot count.
    pub max_size: usize,
    /// Slots currently held by in-flight scopes.
    pub in_use: usize,
}

pub(crate) struct Pool {
    name: String,
    backend: Arc<dyn RawCommands>,
    permits: Arc<Semaphore>,
    max_size: usize,
}

pub(crate) struct PoolSlot {
    pub(crate) backend: Arc<dyn RawCommands>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PoolSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolSlot").finish_non_exhaustive()
    }
}

impl Pool {
    pub(crate) fn new(name: impl Into<String>, backend: Arc<dyn RawCommands>, max_size: usize) -> Self {
        Self {
            name: name.into(),
            backend,
            permits: Arc::new(Semaphore::new(max_size)),
            max_size,
        }
    }

    pub(crate) fn backend(&self) -> Arc<dyn RawCommands> {
        Arc::clone(&self.backend)
    }

    pub(crate) async fn acquire(&self, wait: Duration) -> Result<PoolSlot, ConnectionError> {
        let permits = Arc::clone(&self.permits);
        match tokio::time::timeout(wait, permits.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(PoolSlot {
                backend: Arc::clone(&self.backend),
                _permit: permit,
            }),
            // The semaphore is never closed while the pool is alive.
            Ok(Err(_)) | Err(_) => Err(ConnectionError::PoolExhausted {
                pool: self.name.clone(),
            }),
        }
    }

    pub(crate) fn stats(&self) -> PoolStats {
        PoolStats {
            name: self.name.clone(),
            max_size: self.max_size,
            in_use: self.max_size - self.permits.available_permits(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{RawCommands, ScriptReply};
    use crate::error::CommandError;
    use async_trait::async_trait;

    struct NullBackend;

    #[async_trait]
    impl RawCommands for NullBackend {
        async fn ping(&self) -> Result<(), CommandError> {
            Ok(())
        }
        async fn info(&self, _: &str) -> Result<String, CommandError> {
            Ok(String::new())
        }
        async fn get(&self, _: &str) -> Result<Option<String>, CommandError> {
            Ok(None)
        }
        async fn set(&self, _: &str, _: &str) -> Result<(), CommandError> {
            Ok(())
        }
        async fn set_ex(&self, _: &str, _: &str, _: u64) -> Result<(), CommandError> {
            Ok(())
        }
        async fn set_keepttl(&self, _: &str, _: &str) -> Result<(), CommandError> {
            Ok(())
        }
        async fn del(&self, _: &[String]) -> Result<u64, CommandError> {
            Ok(0)
        }
        async fn exists(&self, _: &str) -> Result<bool, CommandError> {
            Ok(false)
        }
        async fn expire(&self, _: &str, _: i64) -> Result<bool, CommandError> {
            Ok(false)
        }
        async fn ttl(&self, _: &str) -> Result<i64, CommandError> {
            Ok(-2)
        }
        async fn incr_by(&self, _: &str, _: i64) -> Result<i64, CommandError> {
            Ok(0)
        }
        async fn hget(&self, _: &str, _: &str) -> Result<Option<String>, CommandError> {
            Ok(None)
        }
        async fn hset(&self, _: &str, _: &str, _: &str) -> Result<bool, CommandError> {
            Ok(true)
        }
        async fn hset_multiple(&self, _: &str, _: &[(String, String)]) -> Result<(), CommandError> {
            Ok(())
        }
        async fn hgetall(&self, _: &str) -> Result<Vec<(String, String)>, CommandError> {
            Ok(Vec::new())
        }
        async fn hincr_by(&self, _: &str, _: &str, _: i64) -> Result<i64, CommandError> {
            Ok(0)
        }
        async fn lpush(&self, _: &str, _: &[String]) -> Result<u64, CommandError> {
            Ok(0)
        }
        async fn rpush(&self, _: &str, _: &[String]) -> Result<u64, CommandError> {
            Ok(0)
        }
        async fn lpop(&self, _: &str) -> Result<Option<String>, CommandError> {
            Ok(None)
        }
        async fn lrange(&self, _: &str, _: i64, _: i64) -> Result<Vec<String>, CommandError> {
            Ok(Vec::new())
        }
        async fn llen(&self, _: &str) -> Result<u64, CommandError> {
            Ok(0)
        }
        async fn lrem(&self, _: &str, _: i64, _: &str) -> Result<u64, CommandError> {
            Ok(0)
        }
        async fn zadd(&self, _: &str, _: &str, _: f64) -> Result<u64, CommandError> {
            Ok(0)
        }
        async fn zrem(&self, _: &str, _: &str) -> Result<u64, CommandError> {
            Ok(0)
        }
        async fn zcard(&self, _: &str) -> Result<u64, CommandError> {
            Ok(0)
        }
        async fn zcount(&self, _: &str, _: f64, _: f64) -> Result<u64, CommandError> {
            Ok(0)
        }
        async fn zrange_withscores(
            &self,
            _: &str,
            _: i64,
            _: i64,
        ) -> Result<Vec<(String, f64)>, CommandError> {
            Ok(Vec::new())
        }
        async fn zrangebyscore(&self, _: &str, _: f64, _: f64) -> Result<Vec<String>, CommandError> {
            Ok(Vec::new())
        }
        async fn zremrangebyscore(&self, _: &str, _: f64, _: f64) -> Result<u64, CommandError> {
            Ok(0)
        }
        async fn sadd(&self, _: &str, _: &[String]) -> Result<u64, CommandError> {
            Ok(0)
        }
        async fn srem(&self, _: &str, _: &[String]) -> Result<u64, CommandError> {
            Ok(0)
        }
        async fn smembers(&self, _: &str) -> Result<Vec<String>, CommandError> {
            Ok(Vec::new())
        }
        async fn scan_match(&self, _: &str) -> Result<Vec<String>, CommandError> {
            Ok(Vec::new())
        }
        async fn script_load(&self, _: &str) -> Result<String, CommandError> {
            Ok("sha".to_string())
        }
        async fn evalsha(
            &self,
            _: &str,
            _: &[String],
            _: &[String],
        ) -> Result<ScriptReply, CommandError> {
            Ok(ScriptReply::Nil)
        }
    }

    #[tokio::test]
    async fn pool_bounds_concurrent_slots() {
        let pool = Pool::new("test", Arc::new(NullBackend), 2);

        let a = pool.acquire(Duration::from_millis(10)).await.unwrap();
        let _b = pool.acquire(Duration::from_millis(10)).await.unwrap();
        assert_eq!(pool.stats().in_use, 2);

        let err = pool.acquire(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, ConnectionError::PoolExhausted { .. }));

        drop(a);
        let _c = pool.acquire(Duration::from_millis(10)).await.unwrap();
    }
}
