//! The tenant-isolating connection.
//!
//! `Connection` is the only handle component code ever sees. Every
//! key-accepting method rewrites its keys with the tenant prefix before
//! touching the backend, and strips the prefix from returned keys, so
//! cross-tenant access is impossible by construction. The method set is a
//! closed allowlist: an operation that is not defined here cannot be
//! expressed at all.
//!
//! Connections created through the admin path carry no tenant and perform
//! no rewriting; they are reserved for health sampling, script loading and
//! agent configuration.

use crate::commands::{RawCommands, ScriptReply};
use crate::error::{CommandError, ConnectionError};
use crate::pool::PoolSlot;
use crate::trace::{CommandCategory, CommandObserver, CommandRecord};
use redgate_core::TenantId;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

/// A scoped handle on a pool slot, isolated to one tenant (or the admin
/// path when created without one).
pub struct Connection {
    backend: Arc<dyn RawCommands>,
    tenant: Option<TenantId>,
    prefix: Option<String>,
    observer: Option<Arc<dyn CommandObserver>>,
    // Held for the scope so the pool bound is honored on all exit paths.
    _slot: Option<PoolSlot>,
}

impl Connection {
    pub(crate) fn isolated(
        slot: PoolSlot,
        tenant: TenantId,
        observer: Option<Arc<dyn CommandObserver>>,
    ) -> Self {
        Self {
            backend: Arc::clone(&slot.backend),
            prefix: Some(tenant.key_prefix()),
            tenant: Some(tenant),
            observer,
            _slot: Some(slot),
        }
    }

    pub(crate) fn admin(slot: PoolSlot, observer: Option<Arc<dyn CommandObserver>>) -> Self {
        Self {
            backend: Arc::clone(&slot.backend),
            tenant: None,
            prefix: None,
            observer,
            _slot: Some(slot),
        }
    }

    /// The tenant this connection is isolated to; `None` on the admin path.
    pub fn tenant(&self) -> Option<&TenantId> {
        self.tenant.as_ref()
    }

    fn key(&self, logical: &str) -> String {
        match &self.prefix {
            Some(prefix) if !logical.starts_with(prefix.as_str()) => {
                format!("{prefix}{logical}")
            }
            _ => logical.to_string(),
        }
    }

    fn strip<'a>(&self, raw: &'a str) -> &'a str {
        match &self.prefix {
            Some(prefix) => raw.strip_prefix(prefix.as_str()).unwrap_or(raw),
            None => raw,
        }
    }

    async fn observe<T>(
        &self,
        command: &'static str,
        category: CommandCategory,
        fut: impl Future<Output = Result<T, CommandError>>,
    ) -> Result<T, ConnectionError> {
        let start = Instant::now();
        let result = fut.await;
        if let Some(observer) = &self.observer {
            observer.record(CommandRecord {
                command,
                category,
                duration: start.elapsed(),
                success: result.is_ok(),
                tenant: self.tenant,
                error: result.as_ref().err().map(|e| e.to_string()),
            });
        }
        result.map_err(ConnectionError::from)
    }

    pub async fn ping(&self) -> Result<(), ConnectionError> {
        self.observe("PING", CommandCategory::Introspection, self.backend.ping())
            .await
    }

    pub async fn info(&self, section: &str) -> Result<String, ConnectionError> {
        self.observe(
            "INFO",
            CommandCategory::Introspection,
            self.backend.info(section),
        )
        .await
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, ConnectionError> {
        let k = self.key(key);
        self.observe("GET", CommandCategory::Read, self.backend.get(&k))
            .await
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), ConnectionError> {
        let k = self.key(key);
        self.observe("SET", CommandCategory::Write, self.backend.set(&k, value))
            .await
    }

    pub async fn set_ex(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<(), ConnectionError> {
        let k = self.key(key);
        self.observe(
            "SET",
            CommandCategory::Write,
            self.backend.set_ex(&k, value, ttl_seconds),
        )
        .await
    }

    pub async fn set_keepttl(&self, key: &str, value: &str) -> Result<(), ConnectionError> {
        let k = self.key(key);
        self.observe(
            "SET",
            CommandCategory::Write,
            self.backend.set_keepttl(&k, value),
        )
        .await
    }

    pub async fn del(&self, key: &str) -> Result<bool, ConnectionError> {
        let keys = vec![self.key(key)];
        self.observe("DEL", CommandCategory::Write, self.backend.del(&keys))
            .await
            .map(|n| n > 0)
    }

    pub async fn del_many(&self, keys: &[String]) -> Result<u64, ConnectionError> {
        let keys: Vec<String> = keys.iter().map(|k| self.key(k)).collect();
        self.observe("DEL", CommandCategory::Write, self.backend.del(&keys))
            .await
    }

    pub async fn exists(&self, key: &str) -> Result<bool, ConnectionError> {
        let k = self.key(key);
        self.observe("EXISTS", CommandCategory::Read, self.backend.exists(&k))
            .await
    }

    pub async fn expire(&self, key: &str, seconds: i64) -> Result<bool, ConnectionError> {
        let k = self.key(key);
        self.observe(
            "EXPIRE",
            CommandCategory::Write,
            self.backend.expire(&k, seconds),
        )
        .await
    }

    pub async fn ttl(&self, key: &str) -> Result<i64, ConnectionError> {
        let k = self.key(key);
        self.observe("TTL", CommandCategory::Read, self.backend.ttl(&k))
            .await
    }

    pub async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, ConnectionError> {
        let k = self.key(key);
        self.observe(
            "INCRBY",
            CommandCategory::Write,
            self.backend.incr_by(&k, delta),
        )
        .await
    }

    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, ConnectionError> {
        let k = self.key(key);
        self.observe("HGET", CommandCategory::Read, self.backend.hget(&k, field))
            .await
    }

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<bool, ConnectionError> {
        let k = self.key(key);
        self.observe(
            "HSET",
            CommandCategory::Write,
            self.backend.hset(&k, field, value),
        )
        .await
    }

    pub async fn hset_multiple(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> Result<(), ConnectionError> {
        let k = self.key(key);
        self.observe(
            "HSET",
            CommandCategory::Write,
            self.backend.hset_multiple(&k, fields),
        )
        .await
    }

    pub async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, ConnectionError> {
        let k = self.key(key);
        self.observe("HGETALL", CommandCategory::Read, self.backend.hgetall(&k))
            .await
    }

    pub async fn hincr_by(
        &self,
        key: &str,
        field: &str,
        delta: i64,
    ) -> Result<i64, ConnectionError> {
        let k = self.key(key);
        self.observe(
            "HINCRBY",
            CommandCategory::Write,
            self.backend.hincr_by(&k, field, delta),
        )
        .await
    }

    pub async fn lpush(&self, key: &str, values: &[String]) -> Result<u64, ConnectionError> {
        let k = self.key(key);
        self.observe(
            "LPUSH",
            CommandCategory::Write,
            self.backend.lpush(&k, values),
        )
        .await
    }

    pub async fn rpush(&self, key: &str, values: &[String]) -> Result<u64, ConnectionError> {
        let k = self.key(key);
        self.observe(
            "RPUSH",
            CommandCategory::Write,
            self.backend.rpush(&k, values),
        )
        .await
    }

    pub async fn lpop(&self, key: &str) -> Result<Option<String>, ConnectionError> {
        let k = self.key(key);
        self.observe("LPOP", CommandCategory::Write, self.backend.lpop(&k))
            .await
    }

    pub async fn lrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<String>, ConnectionError> {
        let k = self.key(key);
        self.observe(
            "LRANGE",
            CommandCategory::Read,
            self.backend.lrange(&k, start, stop),
        )
        .await
    }

    pub async fn llen(&self, key: &str) -> Result<u64, ConnectionError> {
        let k = self.key(key);
        self.observe("LLEN", CommandCategory::Read, self.backend.llen(&k))
            .await
    }

    pub async fn lrem(&self, key: &str, count: i64, value: &str) -> Result<u64, ConnectionError> {
        let k = self.key(key);
        self.observe(
            "LREM",
            CommandCategory::Write,
            self.backend.lrem(&k, count, value),
        )
        .await
    }

    pub async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<u64, ConnectionError> {
        let k = self.key(key);
        self.observe(
            "ZADD",
            CommandCategory::Write,
            self.backend.zadd(&k, member, score),
        )
        .await
    }

    pub async fn zrem(&self, key: &str, member: &str) -> Result<u64, ConnectionError> {
        let k = self.key(key);
        self.observe("ZREM", CommandCategory::Write, self.backend.zrem(&k, member))
            .await
    }

    pub async fn zcard(&self, key: &str) -> Result<u64, ConnectionError> {
        let k = self.key(key);
        self.observe("ZCARD", CommandCategory::Read, self.backend.zcard(&k))
            .await
    }

    pub async fn zcount(&self, key: &str, min: f64, max: f64) -> Result<u64, ConnectionError> {
        let k = self.key(key);
        self.observe(
            "ZCOUNT",
            CommandCategory::Read,
            self.backend.zcount(&k, min, max),
        )
        .await
    }

    pub async fn zrange_withscores(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<(String, f64)>, ConnectionError> {
        let k = self.key(key);
        self.observe(
            "ZRANGE",
            CommandCategory::Read,
            self.backend.zrange_withscores(&k, start, stop),
        )
        .await
    }

    pub async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, ConnectionError> {
        let k = self.key(key);
        self.observe(
            "ZRANGEBYSCORE",
            CommandCategory::Read,
            self.backend.zrangebyscore(&k, min, max),
        )
        .await
    }

    pub async fn zremrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<u64, ConnectionError> {
        let k = self.key(key);
        self.observe(
            "ZREMRANGEBYSCORE",
            CommandCategory::Write,
            self.backend.zremrangebyscore(&k, min, max),
        )
        .await
    }

    pub async fn sadd(&self, key: &str, members: &[String]) -> Result<u64, ConnectionError> {
        let k = self.key(key);
        self.observe("SADD", CommandCategory::Write, self.backend.sadd(&k, members))
            .await
    }

    pub async fn srem(&self, key: &str, members: &[String]) -> Result<u64, ConnectionError> {
        let k = self.key(key);
        self.observe("SREM", CommandCategory::Write, self.backend.srem(&k, members))
            .await
    }

    pub async fn smembers(&self, key: &str) -> Result<Vec<String>, ConnectionError> {
        let k = self.key(key);
        self.observe("SMEMBERS", CommandCategory::Read, self.backend.smembers(&k))
            .await
    }

    /// Scans keys matching the logical pattern, returning logical
    /// (un-prefixed) keys.
    pub async fn scan_match(&self, pattern: &str) -> Result<Vec<String>, ConnectionError> {
        let p = self.key(pattern);
        let keys = self
            .observe(
                "SCAN",
                CommandCategory::Introspection,
                self.backend.scan_match(&p),
            )
            .await?;
        Ok(keys.iter().map(|k| self.strip(k).to_string()).collect())
    }

    /// Loads a script, returning its SHA. Scripts are server-global; no
    /// rewriting applies.
    pub async fn script_load(&self, text: &str) -> Result<String, ConnectionError> {
        self.observe(
            "SCRIPT",
            CommandCategory::Script,
            self.backend.script_load(text),
        )
        .await
    }

    /// Executes a loaded script. The declared key arguments are rewritten
    /// with the tenant prefix; plain arguments pass through untouched.
    pub async fn evalsha(
        &self,
        sha: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptReply, ConnectionError> {
        let keys: Vec<String> = keys.iter().map(|k| self.key(k)).collect();
        self.observe(
            "EVALSHA",
            CommandCategory::Script,
            self.backend.evalsha(sha, &keys, args),
        )
        .await
    }
}
