//! Atomic rate-limiting scripts.
//!
//! Both algorithms evaluate entirely server-side so concurrent checks
//! against the same identifier are serialized by the store. Timestamps are
//! milliseconds; the `reset` and `retry_after` values returned to callers
//! are whole seconds, rounded up.

use crate::error::RateLimitError;
use redgate_connection::{ScriptDef, ScriptReply};

pub(crate) const SLIDING_WINDOW: ScriptDef = ScriptDef {
    name: "rate_limit_sliding",
    text: r#"-- redgate:rate_limit_sliding
local key = KEYS[1]
local window_ms = tonumber(ARGV[1])
local now_ms = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local limit = tonumber(ARGV[4])

redis.call('ZREMRANGEBYSCORE', key, 0, now_ms - window_ms)
local current = redis.call('ZCARD', key)

local window_secs = math.ceil(window_ms / 1000)
if current + cost > limit then
    local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
    local reset = window_secs
    if oldest[2] then
        reset = math.ceil((tonumber(oldest[2]) + window_ms - now_ms) / 1000)
        if reset < 0 then
            reset = 0
        end
    end
    return {0, current, math.max(0, limit - current), reset, limit}
end

for i = 1, cost do
    redis.call('ZADD', key, now_ms, now_ms .. ':' .. i)
end
redis.call('EXPIRE', key, window_secs)

return {1, current + cost, limit - current - cost, window_secs, limit}
"#,
};

pub(crate) const TOKEN_BUCKET: ScriptDef = ScriptDef {
    name: "rate_limit_bucket",
    text: r#"-- redgate:rate_limit_bucket
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])

local bucket = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens = tonumber(bucket[1]) or capacity
local last_refill = tonumber(bucket[2]) or now_ms

local elapsed = now_ms - last_refill
if elapsed > 0 then
    tokens = math.min(capacity, tokens + elapsed / 1000 * refill_rate)
end

local ttl = math.ceil(capacity / refill_rate) + 1

if tokens < cost then
    local retry_after = math.ceil((cost - tokens) / refill_rate)
    redis.call('HSET', key, 'tokens', tokens, 'last_refill', now_ms)
    redis.call('EXPIRE', key, ttl)
    return {0, math.floor(tokens), retry_after, capacity}
end

tokens = tokens - cost
redis.call('HSET', key, 'tokens', tokens, 'last_refill', now_ms)
redis.call('EXPIRE', key, ttl)
return {1, math.floor(tokens), 0, capacity}
"#,
};

pub(crate) struct SlidingReply {
    pub allowed: bool,
    pub current: u64,
    pub remaining: u64,
    pub reset_seconds: u64,
    pub limit: u64,
}

pub(crate) struct BucketReply {
    pub allowed: bool,
    pub tokens: u64,
    pub retry_after_seconds: u64,
    pub capacity: u64,
}

fn ints(reply: ScriptReply, expected: usize) -> Result<Vec<i64>, RateLimitError> {
    let items = reply
        .into_array()
        .map_err(|e| RateLimitError::Decode(e.to_string()))?;
    if items.len() < expected {
        return Err(RateLimitError::Decode(format!(
            "expected {expected} elements, got {}",
            items.len()
        )));
    }
    items
        .into_iter()
        .take(expected)
        .map(|item| {
            item.as_i64()
                .ok_or_else(|| RateLimitError::Decode(format!("non-integer element {item:?}")))
        })
        .collect()
}

pub(crate) fn decode_sliding(reply: ScriptReply) -> Result<SlidingReply, RateLimitError> {
    let v = ints(reply, 5)?;
    Ok(SlidingReply {
        allowed: v[0] == 1,
        current: v[1].max(0) as u64,
        remaining: v[2].max(0) as u64,
        reset_seconds: v[3].max(0) as u64,
        limit: v[4].max(0) as u64,
    })
}

pub(crate) fn decode_bucket(reply: ScriptReply) -> Result<BucketReply, RateLimitError> {
    let v = ints(reply, 4)?;
    Ok(BucketReply {
        allowed: v[0] == 1,
        tokens: v[1].max(0) as u64,
        retry_after_seconds: v[2].max(0) as u64,
        capacity: v[3].max(0) as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_sliding_reply() {
        let reply = ScriptReply::Array(vec![
            ScriptReply::Int(1),
            ScriptReply::Int(3),
            ScriptReply::Int(7),
            ScriptReply::Int(60),
            ScriptReply::Int(10),
        ]);
        let decoded = decode_sliding(reply).unwrap();
        assert!(decoded.allowed);
        assert_eq!(decoded.current, 3);
        assert_eq!(decoded.remaining, 7);
        assert_eq!(decoded.reset_seconds, 60);
        assert_eq!(decoded.limit, 10);
    }

    #[test]
    fn rejects_short_reply() {
        let reply = ScriptReply::Array(vec![ScriptReply::Int(1)]);
        assert!(matches!(
            decode_sliding(reply),
            Err(RateLimitError::Decode(_))
        ));
    }

    #[test]
    fn rejects_non_array_reply() {
        assert!(matches!(
            decode_bucket(ScriptReply::Int(1)),
            Err(RateLimitError::Decode(_))
        ));
    }
}
