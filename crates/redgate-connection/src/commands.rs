//! The raw command surface.
//!
//! This trait is the explicit allowlist the substrate is built on: every
//! operation the isolating connection can express is a named method here,
//! and nothing else reaches the store. Backends implement it over a real
//! Redis connection or (behind `test-util`) an in-memory fake.

use crate::error::CommandError;
use async_trait::async_trait;
use std::sync::Arc;

/// Reply value from a server-side script.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptReply {
    /// Nil reply.
    Nil,
    /// Integer reply.
    Int(i64),
    /// Bulk string reply.
    Data(String),
    /// Array reply.
    Array(Vec<ScriptReply>),
}

impl ScriptReply {
    /// Integer value, if this reply is an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ScriptReply::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// String value, if this reply is a bulk string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScriptReply::Data(s) => Some(s),
            _ => None,
        }
    }

    /// Consumes an array reply; errors on any other shape.
    pub fn into_array(self) -> Result<Vec<ScriptReply>, CommandError> {
        match self {
            ScriptReply::Array(items) => Ok(items),
            other => Err(CommandError::Other(format!(
                "expected array script reply, got {other:?}"
            ))),
        }
    }
}

/// Object-safe command surface over one logical Redis endpoint.
///
/// All keys arrive fully qualified (tenant prefix already applied by the
/// isolating connection). Implementations map their native errors into
/// [`CommandError`] so the layers above can classify them.
#[async_trait]
pub trait RawCommands: Send + Sync {
    async fn ping(&self) -> Result<(), CommandError>;
    async fn info(&self, section: &str) -> Result<String, CommandError>;

    // Strings
    async fn get(&self, key: &str) -> Result<Option<String>, CommandError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), CommandError>;
    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), CommandError>;
    /// SET with KEEPTTL: overwrites the value while preserving the key's
    /// remaining TTL.
    async fn set_keepttl(&self, key: &str, value: &str) -> Result<(), CommandError>;
    async fn del(&self, keys: &[String]) -> Result<u64, CommandError>;
    async fn exists(&self, key: &str) -> Result<bool, CommandError>;
    async fn expire(&self, key: &str, seconds: i64) -> Result<bool, CommandError>;
    async fn ttl(&self, key: &str) -> Result<i64, CommandError>;
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, CommandError>;

    // Hashes
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, CommandError>;
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<bool, CommandError>;
    async fn hset_multiple(&self, key: &str, fields: &[(String, String)])
        -> Result<(), CommandError>;
    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, CommandError>;
    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, CommandError>;

    // Lists
    async fn lpush(&self, key: &str, values: &[String]) -> Result<u64, CommandError>;
    async fn rpush(&self, key: &str, values: &[String]) -> Result<u64, CommandError>;
    async fn lpop(&self, key: &str) -> Result<Option<String>, CommandError>;
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, CommandError>;
    async fn llen(&self, key: &str) -> Result<u64, CommandError>;
    async fn lrem(&self, key: &str, count: i64, value: &str) -> Result<u64, CommandError>;

    // Sorted sets
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<u64, CommandError>;
    async fn zrem(&self, key: &str, member: &str) -> Result<u64, CommandError>;
    async fn zcard(&self, key: &str) -> Result<u64, CommandError>;
    async fn zcount(&self, key: &str, min: f64, max: f64) -> Result<u64, CommandError>;
    async fn zrange_withscores(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<(String, f64)>, CommandError>;
    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, CommandError>;
    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<u64, CommandError>;

    // Sets
    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64, CommandError>;
    async fn srem(&self, key: &str, members: &[String]) -> Result<u64, CommandError>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>, CommandError>;

    /// Full SCAN over keys matching a glob pattern.
    async fn scan_match(&self, pattern: &str) -> Result<Vec<String>, CommandError>;

    // Scripts
    async fn script_load(&self, text: &str) -> Result<String, CommandError>;
    async fn evalsha(
        &self,
        sha: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptReply, CommandError>;
}

/// Creates backends for the factory's pools.
///
/// The factory calls this once per pool (admin first, then lazily per
/// tenant), which is the seam tests use to substitute the fake store.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn RawCommands>, CommandError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_reply_accessors() {
        assert_eq!(ScriptReply::Int(3).as_i64(), Some(3));
        assert_eq!(ScriptReply::Data("x".into()).as_str(), Some("x"));
        assert!(ScriptReply::Nil.as_i64().is_none());

        let arr = ScriptReply::Array(vec![ScriptReply::Int(1), ScriptReply::Data("ok".into())]);
        let items = arr.into_array().unwrap();
        assert_eq!(items.len(), 2);

        assert!(ScriptReply::Int(1).into_array().is_err());
    }
}
