//! [`RawCommands`] over a real Redis endpoint.

use crate::commands::{Connector, RawCommands, ScriptReply};
use crate::error::CommandError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;

fn reply_from_value(value: redis::Value) -> ScriptReply {
    match value {
        redis::Value::Nil => ScriptReply::Nil,
        redis::Value::Int(v) => ScriptReply::Int(v),
        redis::Value::Data(bytes) => ScriptReply::Data(String::from_utf8_lossy(&bytes).into_owned()),
        redis::Value::Bulk(items) => {
            ScriptReply::Array(items.into_iter().map(reply_from_value).collect())
        }
        redis::Value::Status(s) => ScriptReply::Data(s),
        redis::Value::Okay => ScriptReply::Data("OK".to_string()),
    }
}

/// Backend executing commands over a multiplexed connection manager.
///
/// `ConnectionManager` reconnects transparently on dropped connections;
/// the pool layer above bounds how many tasks use it concurrently.
pub struct RedisBackend {
    manager: ConnectionManager,
}

impl RedisBackend {
    /// Connects to the endpoint, bounded by `connect_timeout`.
    pub async fn connect(url: &str, connect_timeout: Duration) -> Result<Self, CommandError> {
        let client = redis::Client::open(url).map_err(CommandError::from)?;
        let manager = tokio::time::timeout(connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                CommandError::Timeout(format!("connect to {url} exceeded {connect_timeout:?}"))
            })?
            .map_err(CommandError::from)?;
        Ok(Self { manager })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl RawCommands for RedisBackend {
    async fn ping(&self) -> Result<(), CommandError> {
        let mut conn = self.conn();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(Into::into)
    }

    async fn info(&self, section: &str) -> Result<String, CommandError> {
        let mut conn = self.conn();
        redis::cmd("INFO")
            .arg(section)
            .query_async(&mut conn)
            .await
            .map_err(Into::into)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CommandError> {
        let mut conn = self.conn();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(Into::into)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), CommandError> {
        let mut conn = self.conn();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(Into::into)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), CommandError> {
        let mut conn = self.conn();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await
            .map_err(Into::into)
    }

    async fn set_keepttl(&self, key: &str, value: &str) -> Result<(), CommandError> {
        let mut conn = self.conn();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("KEEPTTL")
            .query_async(&mut conn)
            .await
            .map_err(Into::into)
    }

    async fn del(&self, keys: &[String]) -> Result<u64, CommandError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        redis::cmd("DEL")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(Into::into)
    }

    async fn exists(&self, key: &str) -> Result<bool, CommandError> {
        let mut conn = self.conn();
        redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(Into::into)
    }

    async fn expire(&self, key: &str, seconds: i64) -> Result<bool, CommandError> {
        let mut conn = self.conn();
        redis::cmd("EXPIRE")
            .arg(key)
            .arg(seconds)
            .query_async(&mut conn)
            .await
            .map_err(Into::into)
    }

    async fn ttl(&self, key: &str) -> Result<i64, CommandError> {
        let mut conn = self.conn();
        redis::cmd("TTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(Into::into)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, CommandError> {
        let mut conn = self.conn();
        redis::cmd("INCRBY")
            .arg(key)
            .arg(delta)
            .query_async(&mut conn)
            .await
            .map_err(Into::into)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, CommandError> {
        let mut conn = self.conn();
        redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await
            .map_err(Into::into)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<bool, CommandError> {
        let mut conn = self.conn();
        redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async::<_, i64>(&mut conn)
            .await
            .map(|created| created > 0)
            .map_err(Into::into)
    }

    async fn hset_multiple(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> Result<(), CommandError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        cmd.query_async::<_, i64>(&mut conn)
            .await
            .map(|_| ())
            .map_err(Into::into)
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, CommandError> {
        let mut conn = self.conn();
        redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(Into::into)
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, CommandError> {
        let mut conn = self.conn();
        redis::cmd("HINCRBY")
            .arg(key)
            .arg(field)
            .arg(delta)
            .query_async(&mut conn)
            .await
            .map_err(Into::into)
    }

    async fn lpush(&self, key: &str, values: &[String]) -> Result<u64, CommandError> {
        let mut conn = self.conn();
        redis::cmd("LPUSH")
            .arg(key)
            .arg(values)
            .query_async(&mut conn)
            .await
            .map_err(Into::into)
    }

    async fn rpush(&self, key: &str, values: &[String]) -> Result<u64, CommandError> {
        let mut conn = self.conn();
        redis::cmd("RPUSH")
            .arg(key)
            .arg(values)
            .query_async(&mut conn)
            .await
            .map_err(Into::into)
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, CommandError> {
        let mut conn = self.conn();
        redis::cmd("LPOP")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(Into::into)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, CommandError> {
        let mut conn = self.conn();
        redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await
            .map_err(Into::into)
    }

    async fn llen(&self, key: &str) -> Result<u64, CommandError> {
        let mut conn = self.conn();
        redis::cmd("LLEN")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(Into::into)
    }

    async fn lrem(&self, key: &str, count: i64, value: &str) -> Result<u64, CommandError> {
        let mut conn = self.conn();
        redis::cmd("LREM")
            .arg(key)
            .arg(count)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(Into::into)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<u64, CommandError> {
        let mut conn = self.conn();
        redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(Into::into)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<u64, CommandError> {
        let mut conn = self.conn();
        redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(Into::into)
    }

    async fn zcard(&self, key: &str) -> Result<u64, CommandError> {
        let mut conn = self.conn();
        redis::cmd("ZCARD")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(Into::into)
    }

    async fn zcount(&self, key: &str, min: f64, max: f64) -> Result<u64, CommandError> {
        let mut conn = self.conn();
        redis::cmd("ZCOUNT")
            .arg(key)
            .arg(min)
            .arg(max)
            .query_async(&mut conn)
            .await
            .map_err(Into::into)
    }

    async fn zrange_withscores(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<(String, f64)>, CommandError> {
        let mut conn = self.conn();
        redis::cmd("ZRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await
            .map_err(Into::into)
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, CommandError> {
        let mut conn = self.conn();
        redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(min)
            .arg(max)
            .query_async(&mut conn)
            .await
            .map_err(Into::into)
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<u64, CommandError> {
        let mut conn = self.conn();
        redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg(min)
            .arg(max)
            .query_async(&mut conn)
            .await
            .map_err(Into::into)
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64, CommandError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        redis::cmd("SADD")
            .arg(key)
            .arg(members)
            .query_async(&mut conn)
            .await
            .map_err(Into::into)
    }

    async fn srem(&self, key: &str, members: &[String]) -> Result<u64, CommandError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        redis::cmd("SREM")
            .arg(key)
            .arg(members)
            .query_async(&mut conn)
            .await
            .map_err(Into::into)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, CommandError> {
        let mut conn = self.conn();
        redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(Into::into)
    }

    async fn scan_match(&self, pattern: &str) -> Result<Vec<String>, CommandError> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(CommandError::from)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }

    async fn script_load(&self, text: &str) -> Result<String, CommandError> {
        let mut conn = self.conn();
        redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(text)
            .query_async(&mut conn)
            .await
            .map_err(Into::into)
    }

    async fn evalsha(
        &self,
        sha: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptReply, CommandError> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("EVALSHA");
        cmd.arg(sha).arg(keys.len());
        for key in keys {
            cmd.arg(key);
        }
        for arg in args {
            cmd.arg(arg);
        }
        cmd.query_async::<_, redis::Value>(&mut conn)
            .await
            .map(reply_from_value)
            .map_err(Into::into)
    }
}

/// [`Connector`] producing one [`RedisBackend`] per pool.
pub struct RedisConnector {
    url: String,
    connect_timeout: Duration,
}

impl RedisConnector {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self) -> Result<Arc<dyn RawCommands>, CommandError> {
        let backend = RedisBackend::connect(&self.url, self.connect_timeout).await?;
        Ok(Arc::new(backend))
    }
}
