//! In-memory fake backend for tests.
//!
//! Implements the full [`RawCommands`] surface over a process-local
//! keyspace, records every key any command touches (the isolation
//! invariant is asserted against this log), and natively emulates the
//! substrate's server-side scripts, dispatching on each script's
//! `-- redgate:<name>` marker line. All backends handed out by one
//! [`FakeStore`] share the same keyspace, exactly like pools sharing one
//! Redis server.

use crate::commands::{Connector, RawCommands, ScriptReply};
use crate::error::CommandError;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
    ZSet(Vec<(String, f64)>),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct FakeState {
    entries: HashMap<String, Entry>,
    scripts: HashMap<String, String>,
    touched: Vec<String>,
    failure: Option<CommandError>,
}

/// Handle on a shared fake keyspace.
#[derive(Clone, Default)]
pub struct FakeStore {
    state: Arc<Mutex<FakeState>>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend sharing this store's keyspace.
    pub fn backend(&self) -> Arc<dyn RawCommands> {
        Arc::new(FakeBackend {
            state: Arc::clone(&self.state),
        })
    }

    /// Every key touched by any command so far, in order.
    pub fn touched_keys(&self) -> Vec<String> {
        self.state.lock().unwrap().touched.clone()
    }

    pub fn clear_touched(&self) {
        self.state.lock().unwrap().touched.clear();
    }

    /// Drops all loaded scripts, like SCRIPT FLUSH after a restart.
    pub fn flush_scripts(&self) {
        self.state.lock().unwrap().scripts.clear();
    }

    /// Makes every subsequent command fail with the given error.
    pub fn fail_with(&self, error: CommandError) {
        self.state.lock().unwrap().failure = Some(error);
    }

    /// Clears an injected failure.
    pub fn clear_failure(&self) {
        self.state.lock().unwrap().failure = None;
    }
}

struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
}

fn glob_match(pattern: &str, text: &str) -> bool {
    // Only `*` is supported; that is all the substrate's patterns use.
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }
    let mut rest = text;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 && !pattern.ends_with('*') {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

impl FakeState {
    fn check_failure(&self) -> Result<(), CommandError> {
        match &self.failure {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn touch(&mut self, key: &str) {
        self.touched.push(key.to_string());
    }

    fn live_entry(&mut self, key: &str) -> Option<&mut Entry> {
        let expired = match self.entries.get(key) {
            Some(entry) => entry
                .expires_at
                .map(|at| at <= Instant::now())
                .unwrap_or(false),
            None => return None,
        };
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get_mut(key)
    }

    fn str_value(&mut self, key: &str) -> Result<Option<&mut String>, CommandError> {
        match self.live_entry(key) {
            None => Ok(None),
            Some(entry) => match &mut entry.value {
                Value::Str(s) => Ok(Some(s)),
                _ => Err(CommandError::Other("WRONGTYPE".to_string())),
            },
        }
    }

    fn hash_value(&mut self, key: &str, create: bool) -> Result<Option<&mut HashMap<String, String>>, CommandError> {
        if self.live_entry(key).is_none() && create {
            self.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Hash(HashMap::new()),
                    expires_at: None,
                },
            );
        }
        match self.live_entry(key) {
            None => Ok(None),
            Some(entry) => match &mut entry.value {
                Value::Hash(h) => Ok(Some(h)),
                _ => Err(CommandError::Other("WRONGTYPE".to_string())),
            },
        }
    }

    fn list_value(&mut self, key: &str, create: bool) -> Result<Option<&mut VecDeque<String>>, CommandError> {
        if self.live_entry(key).is_none() && create {
            self.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::List(VecDeque::new()),
                    expires_at: None,
                },
            );
        }
        match self.live_entry(key) {
            None => Ok(None),
            Some(entry) => match &mut entry.value {
                Value::List(l) => Ok(Some(l)),
                _ => Err(CommandError::Other("WRONGTYPE".to_string())),
            },
        }
    }

    fn zset_value(&mut self, key: &str, create: bool) -> Result<Option<&mut Vec<(String, f64)>>, CommandError> {
        if self.live_entry(key).is_none() && create {
            self.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::ZSet(Vec::new()),
                    expires_at: None,
                },
            );
        }
        match self.live_entry(key) {
            None => Ok(None),
            Some(entry) => match &mut entry.value {
                Value::ZSet(z) => Ok(Some(z)),
                _ => Err(CommandError::Other("WRONGTYPE".to_string())),
            },
        }
    }

    fn set_value(&mut self, key: &str, create: bool) -> Result<Option<&mut BTreeSet<String>>, CommandError> {
        if self.live_entry(key).is_none() && create {
            self.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Set(BTreeSet::new()),
                    expires_at: None,
                },
            );
        }
        match self.live_entry(key) {
            None => Ok(None),
            Some(entry) => match &mut entry.value {
                Value::Set(s) => Ok(Some(s)),
                _ => Err(CommandError::Other("WRONGTYPE".to_string())),
            },
        }
    }

    fn sorted_zset(&mut self, key: &str) -> Vec<(String, f64)> {
        match self.zset_value(key, false) {
            Ok(Some(z)) => {
                let mut items = z.clone();
                items.sort_by(|a, b| {
                    a.1.partial_cmp(&b.1)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.0.cmp(&b.0))
                });
                items
            }
            _ => Vec::new(),
        }
    }

    fn zadd(&mut self, key: &str, member: &str, score: f64) -> u64 {
        let z = self.zset_value(key, true).unwrap().unwrap();
        if let Some(existing) = z.iter_mut().find(|(m, _)| m == member) {
            existing.1 = score;
            0
        } else {
            z.push((member.to_string(), score));
            1
        }
    }

    fn zrem(&mut self, key: &str, member: &str) -> u64 {
        match self.zset_value(key, false) {
            Ok(Some(z)) => {
                let before = z.len();
                z.retain(|(m, _)| m != member);
                (before - z.len()) as u64
            }
            _ => 0,
        }
    }

    fn expire_in(&mut self, key: &str, seconds: i64) -> bool {
        match self.live_entry(key) {
            Some(entry) => {
                entry.expires_at = if seconds <= 0 {
                    Some(Instant::now())
                } else {
                    Some(Instant::now() + Duration::from_secs(seconds as u64))
                };
                true
            }
            None => false,
        }
    }

    fn set_str(&mut self, key: &str, value: &str, ttl: Option<Duration>, keep_ttl: bool) {
        let expires_at = if keep_ttl {
            self.live_entry(key).and_then(|e| e.expires_at)
        } else {
            ttl.map(|d| Instant::now() + d)
        };
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at,
            },
        );
    }
}

macro_rules! with_state {
    ($self:ident, $keys:expr, |$state:ident| $body:expr) => {{
        let mut guard = $self.state.lock().unwrap();
        guard.check_failure()?;
        for key in $keys {
            guard.touch(key);
        }
        let $state = &mut *guard;
        $body
    }};
}

#[async_trait]
impl RawCommands for FakeBackend {
    async fn ping(&self) -> Result<(), CommandError> {
        self.state.lock().unwrap().check_failure()
    }

    async fn info(&self, section: &str) -> Result<String, CommandError> {
        self.state.lock().unwrap().check_failure()?;
        // Small but realistically-shaped INFO payloads for the sampler.
        Ok(match section {
            "memory" => "# Memory\r\nused_memory:1048576\r\nused_memory_rss:2097152\r\nmaxmemory:8388608\r\nmem_fragmentation_ratio:1.5\r\n".to_string(),
            "clients" => "# Clients\r\nconnected_clients:3\r\n".to_string(),
            "stats" => "# Stats\r\nkeyspace_hits:90\r\nkeyspace_misses:10\r\n".to_string(),
            _ => String::new(),
        })
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CommandError> {
        with_state!(self, [key], |state| Ok(state.str_value(key)?.cloned()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), CommandError> {
        with_state!(self, [key], |state| {
            state.set_str(key, value, None, false);
            Ok(())
        })
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), CommandError> {
        with_state!(self, [key], |state| {
            state.set_str(key, value, Some(Duration::from_secs(ttl_seconds)), false);
            Ok(())
        })
    }

    async fn set_keepttl(&self, key: &str, value: &str) -> Result<(), CommandError> {
        with_state!(self, [key], |state| {
            state.set_str(key, value, None, true);
            Ok(())
        })
    }

    async fn del(&self, keys: &[String]) -> Result<u64, CommandError> {
        with_state!(self, keys, |state| {
            let mut removed = 0;
            for key in keys {
                if state.live_entry(key).is_some() {
                    state.entries.remove(key.as_str());
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }

    async fn exists(&self, key: &str) -> Result<bool, CommandError> {
        with_state!(self, [key], |state| Ok(state.live_entry(key).is_some()))
    }

    async fn expire(&self, key: &str, seconds: i64) -> Result<bool, CommandError> {
        with_state!(self, [key], |state| Ok(state.expire_in(key, seconds)))
    }

    async fn ttl(&self, key: &str) -> Result<i64, CommandError> {
        with_state!(self, [key], |state| {
            match state.live_entry(key) {
                None => Ok(-2),
                Some(entry) => match entry.expires_at {
                    None => Ok(-1),
                    Some(at) => Ok(at.saturating_duration_since(Instant::now()).as_secs() as i64),
                },
            }
        })
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, CommandError> {
        with_state!(self, [key], |state| {
            let current: i64 = match state.str_value(key)? {
                Some(s) => s
                    .parse()
                    .map_err(|_| CommandError::Other("value is not an integer".to_string()))?,
                None => 0,
            };
            let next = current + delta;
            state.set_str(key, &next.to_string(), None, true);
            Ok(next)
        })
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, CommandError> {
        with_state!(self, [key], |state| {
            Ok(state
                .hash_value(key, false)?
                .and_then(|h| h.get(field).cloned()))
        })
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<bool, CommandError> {
        with_state!(self, [key], |state| {
            let h = state.hash_value(key, true)?.unwrap();
            Ok(h.insert(field.to_string(), value.to_string()).is_none())
        })
    }

    async fn hset_multiple(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> Result<(), CommandError> {
        with_state!(self, [key], |state| {
            let h = state.hash_value(key, true)?.unwrap();
            for (field, value) in fields {
                h.insert(field.clone(), value.clone());
            }
            Ok(())
        })
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, CommandError> {
        with_state!(self, [key], |state| {
            Ok(state
                .hash_value(key, false)?
                .map(|h| {
                    let mut fields: Vec<(String, String)> =
                        h.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                    fields.sort();
                    fields
                })
                .unwrap_or_default())
        })
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, CommandError> {
        with_state!(self, [key], |state| {
            let h = state.hash_value(key, true)?.unwrap();
            let current: i64 = h.get(field).and_then(|s| s.parse().ok()).unwrap_or(0);
            let next = current + delta;
            h.insert(field.to_string(), next.to_string());
            Ok(next)
        })
    }

    async fn lpush(&self, key: &str, values: &[String]) -> Result<u64, CommandError> {
        with_state!(self, [key], |state| {
            let l = state.list_value(key, true)?.unwrap();
            for value in values {
                l.push_front(value.clone());
            }
            Ok(l.len() as u64)
        })
    }

    async fn rpush(&self, key: &str, values: &[String]) -> Result<u64, CommandError> {
        with_state!(self, [key], |state| {
            let l = state.list_value(key, true)?.unwrap();
            for value in values {
                l.push_back(value.clone());
            }
            Ok(l.len() as u64)
        })
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, CommandError> {
        with_state!(self, [key], |state| {
            Ok(state.list_value(key, false)?.and_then(|l| l.pop_front()))
        })
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, CommandError> {
        with_state!(self, [key], |state| {
            let l = match state.list_value(key, false)? {
                Some(l) => l,
                None => return Ok(Vec::new()),
            };
            let len = l.len() as i64;
            let norm = |i: i64| if i < 0 { (len + i).max(0) } else { i.min(len) };
            let (start, stop) = (norm(start), norm(stop));
            Ok(l.iter()
                .skip(start as usize)
                .take((stop - start + 1).max(0) as usize)
                .cloned()
                .collect())
        })
    }

    async fn llen(&self, key: &str) -> Result<u64, CommandError> {
        with_state!(self, [key], |state| {
            Ok(state
                .list_value(key, false)?
                .map(|l| l.len() as u64)
                .unwrap_or(0))
        })
    }

    async fn lrem(&self, key: &str, count: i64, value: &str) -> Result<u64, CommandError> {
        with_state!(self, [key], |state| {
            let l = match state.list_value(key, false)? {
                Some(l) => l,
                None => return Ok(0),
            };
            let mut to_remove = if count == 0 { i64::MAX } else { count.abs() };
            let before = l.len();
            // count < 0 (tail-first) is unused by the substrate; head-first
            // removal covers both directions here.
            l.retain(|v| {
                if v == value && to_remove > 0 {
                    to_remove -= 1;
                    false
                } else {
                    true
                }
            });
            Ok((before - l.len()) as u64)
        })
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<u64, CommandError> {
        with_state!(self, [key], |state| Ok(state.zadd(key, member, score)))
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<u64, CommandError> {
        with_state!(self, [key], |state| Ok(state.zrem(key, member)))
    }

    async fn zcard(&self, key: &str) -> Result<u64, CommandError> {
        with_state!(self, [key], |state| {
            Ok(state
                .zset_value(key, false)?
                .map(|z| z.len() as u64)
                .unwrap_or(0))
        })
    }

    async fn zcount(&self, key: &str, min: f64, max: f64) -> Result<u64, CommandError> {
        with_state!(self, [key], |state| {
            Ok(state
                .sorted_zset(key)
                .iter()
                .filter(|(_, s)| *s >= min && *s <= max)
                .count() as u64)
        })
    }

    async fn zrange_withscores(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<(String, f64)>, CommandError> {
        with_state!(self, [key], |state| {
            let items = state.sorted_zset(key);
            let len = items.len() as i64;
            let norm = |i: i64| if i < 0 { (len + i).max(0) } else { i.min(len) };
            let (start, stop) = (norm(start), norm(stop));
            Ok(items
                .into_iter()
                .skip(start as usize)
                .take((stop - start + 1).max(0) as usize)
                .collect())
        })
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, CommandError> {
        with_state!(self, [key], |state| {
            Ok(state
                .sorted_zset(key)
                .into_iter()
                .filter(|(_, s)| *s >= min && *s <= max)
                .map(|(m, _)| m)
                .collect())
        })
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<u64, CommandError> {
        with_state!(self, [key], |state| {
            match state.zset_value(key, false)? {
                Some(z) => {
                    let before = z.len();
                    z.retain(|(_, s)| *s < min || *s > max);
                    Ok((before - z.len()) as u64)
                }
                None => Ok(0),
            }
        })
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64, CommandError> {
        with_state!(self, [key], |state| {
            let s = state.set_value(key, true)?.unwrap();
            let mut added = 0;
            for member in members {
                if s.insert(member.clone()) {
                    added += 1;
                }
            }
            Ok(added)
        })
    }

    async fn srem(&self, key: &str, members: &[String]) -> Result<u64, CommandError> {
        with_state!(self, [key], |state| {
            match state.set_value(key, false)? {
                Some(s) => {
                    let mut removed = 0;
                    for member in members {
                        if s.remove(member) {
                            removed += 1;
                        }
                    }
                    Ok(removed)
                }
                None => Ok(0),
            }
        })
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, CommandError> {
        with_state!(self, [key], |state| {
            Ok(state
                .set_value(key, false)?
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default())
        })
    }

    async fn scan_match(&self, pattern: &str) -> Result<Vec<String>, CommandError> {
        let mut guard = self.state.lock().unwrap();
        guard.check_failure()?;
        let keys: Vec<String> = guard.entries.keys().cloned().collect();
        let mut matched = Vec::new();
        for key in keys {
            if guard.live_entry(&key).is_some() && glob_match(pattern, &key) {
                matched.push(key);
            }
        }
        matched.sort();
        Ok(matched)
    }

    async fn script_load(&self, text: &str) -> Result<String, CommandError> {
        let mut guard = self.state.lock().unwrap();
        guard.check_failure()?;
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        text.hash(&mut hasher);
        let sha = format!("{:040x}", hasher.finish());
        guard.scripts.insert(sha.clone(), text.to_string());
        Ok(sha)
    }

    async fn evalsha(
        &self,
        sha: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptReply, CommandError> {
        let mut guard = self.state.lock().unwrap();
        guard.check_failure()?;
        let text = guard
            .scripts
            .get(sha)
            .cloned()
            .ok_or_else(|| CommandError::ScriptMissing(format!("NOSCRIPT {sha}")))?;
        for key in keys {
            guard.touch(key);
        }

        let name = text
            .lines()
            .next()
            .and_then(|line| line.trim().strip_prefix("-- redgate:"))
            .unwrap_or("")
            .to_string();

        scripts::dispatch(&mut guard, &name, keys, args)
    }
}

/// Native emulations of the substrate's registered scripts.
mod scripts {
    use super::*;

    pub(super) fn dispatch(
        state: &mut FakeState,
        name: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptReply, CommandError> {
        match name {
            "echo" => Ok(args
                .first()
                .map(|a| ScriptReply::Data(a.clone()))
                .unwrap_or(ScriptReply::Nil)),
            "rate_limit_sliding" => sliding_window(state, keys, args),
            "rate_limit_bucket" => token_bucket(state, keys, args),
            "queue_enqueue" => queue_enqueue(state, keys, args),
            "queue_dequeue" => queue_dequeue(state, keys, args, None),
            "queue_dequeue_project" => {
                queue_dequeue(state, keys, args, Some(keys[5].clone()))
            }
            "queue_complete" => queue_complete(state, keys, args),
            "queue_cancel" => queue_cancel(state, keys, args),
            other => Err(CommandError::Other(format!(
                "fake backend cannot emulate script {other:?}"
            ))),
        }
    }

    fn num(args: &[String], i: usize) -> Result<f64, CommandError> {
        args.get(i)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| CommandError::Other(format!("bad numeric script arg {i}")))
    }

    fn sliding_window(
        state: &mut FakeState,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptReply, CommandError> {
        let key = &keys[0];
        let window_ms = num(args, 0)?;
        let now_ms = num(args, 1)?;
        let cost = num(args, 2)? as i64;
        let limit = num(args, 3)? as i64;

        if let Ok(Some(z)) = state.zset_value(key, false) {
            let cutoff = now_ms - window_ms;
            z.retain(|(_, s)| *s > cutoff);
        }
        let current = state
            .zset_value(key, false)?
            .map(|z| z.len() as i64)
            .unwrap_or(0);

        let window_secs = (window_ms / 1000.0).ceil() as i64;
        if current + cost > limit {
            let oldest = state.sorted_zset(key).first().map(|(_, s)| *s);
            let reset = match oldest {
                Some(score) => (((score + window_ms - now_ms) / 1000.0).ceil() as i64).max(0),
                None => window_secs,
            };
            return Ok(ScriptReply::Array(vec![
                ScriptReply::Int(0),
                ScriptReply::Int(current),
                ScriptReply::Int((limit - current).max(0)),
                ScriptReply::Int(reset),
                ScriptReply::Int(limit),
            ]));
        }

        for i in 1..=cost {
            state.zadd(key, &format!("{}:{i}", now_ms as i64), now_ms);
        }
        state.expire_in(key, window_secs);

        Ok(ScriptReply::Array(vec![
            ScriptReply::Int(1),
            ScriptReply::Int(current + cost),
            ScriptReply::Int(limit - current - cost),
            ScriptReply::Int(window_secs),
            ScriptReply::Int(limit),
        ]))
    }

    fn token_bucket(
        state: &mut FakeState,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptReply, CommandError> {
        let key = &keys[0];
        let capacity = num(args, 0)?;
        let refill_rate = num(args, 1)?;
        let now_ms = num(args, 2)?;
        let cost = num(args, 3)?;

        let (mut tokens, last_refill) = {
            let h = state.hash_value(key, true)?.unwrap();
            (
                h.get("tokens").and_then(|s| s.parse().ok()).unwrap_or(capacity),
                h.get("last_refill")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(now_ms),
            )
        };

        let elapsed = now_ms - last_refill;
        if elapsed > 0.0 {
            tokens = (tokens + elapsed / 1000.0 * refill_rate).min(capacity);
        }
        let ttl = (capacity / refill_rate).ceil() as i64 + 1;

        let (allowed, retry_after) = if tokens < cost {
            (0, ((cost - tokens) / refill_rate).ceil() as i64)
        } else {
            tokens -= cost;
            (1, 0)
        };

        {
            let h = state.hash_value(key, true)?.unwrap();
            h.insert("tokens".to_string(), tokens.to_string());
            h.insert("last_refill".to_string(), (now_ms as i64).to_string());
        }
        state.expire_in(key, ttl);

        Ok(ScriptReply::Array(vec![
            ScriptReply::Int(allowed),
            ScriptReply::Int(tokens.floor() as i64),
            ScriptReply::Int(retry_after),
            ScriptReply::Int(capacity as i64),
        ]))
    }

    fn task_field(task_json: &str, field: &str) -> Result<serde_json::Value, CommandError> {
        let parsed: serde_json::Value = serde_json::from_str(task_json)
            .map_err(|e| CommandError::Other(format!("bad task json in script: {e}")))?;
        Ok(parsed.get(field).cloned().unwrap_or(serde_json::Value::Null))
    }

    fn queue_enqueue(
        state: &mut FakeState,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptReply, CommandError> {
        let (priority_key, scheduled_key, seq_key, project_key, task_key, status_key) =
            (&keys[0], &keys[1], &keys[2], &keys[3], &keys[4], &keys[5]);
        let priority = num(args, 0)?;
        let task_json = &args[1];
        let max_size = num(args, 2)? as u64;
        let now_iso = &args[3];
        let scheduled_ms = num(args, 4)?;

        let depth = state.zset_value(priority_key, false)?.map(|z| z.len()).unwrap_or(0)
            + state.zset_value(scheduled_key, false)?.map(|z| z.len()).unwrap_or(0);
        if depth as u64 >= max_size {
            return Ok(ScriptReply::Array(vec![
                ScriptReply::Int(0),
                ScriptReply::Data("queue_full".to_string()),
                ScriptReply::Int(depth as i64),
            ]));
        }
        let project_depth = state
            .list_value(project_key, false)?
            .map(|l| l.len() as u64)
            .unwrap_or(0);
        if project_depth >= max_size / 4 {
            return Ok(ScriptReply::Array(vec![
                ScriptReply::Int(0),
                ScriptReply::Data("project_queue_full".to_string()),
                ScriptReply::Int(depth as i64),
            ]));
        }

        state.set_str(task_key, task_json, Some(Duration::from_secs(86400)), false);

        if scheduled_ms > 0.0 {
            state.zadd(scheduled_key, task_json, scheduled_ms);
            state.expire_in(scheduled_key, 86400);
        } else {
            let seq: f64 = {
                let current: i64 = state
                    .str_value(seq_key)?
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                let next = current + 1;
                state.set_str(seq_key, &next.to_string(), None, true);
                next as f64
            };
            state.zadd(priority_key, task_json, -priority * 1e12 + seq);
            state.expire_in(priority_key, 86400);
            let l = state.list_value(project_key, true)?.unwrap();
            l.push_back(task_json.clone());
            state.expire_in(project_key, 86400);
        }

        {
            let h = state.hash_value(status_key, true)?.unwrap();
            h.insert("status".to_string(), "queued".to_string());
            h.insert("queued_at".to_string(), now_iso.clone());
            h.entry("attempts".to_string()).or_insert_with(|| "0".to_string());
        }
        state.expire_in(status_key, 86400);

        Ok(ScriptReply::Array(vec![
            ScriptReply::Int(1),
            ScriptReply::Data("queued".to_string()),
            ScriptReply::Int(depth as i64 + 1),
        ]))
    }

    fn promote_due(
        state: &mut FakeState,
        priority_key: &str,
        scheduled_key: &str,
        seq_key: &str,
        base_key: &str,
        now_ms: f64,
    ) -> Result<(), CommandError> {
        let due: Vec<String> = state
            .sorted_zset(scheduled_key)
            .into_iter()
            .filter(|(_, s)| *s <= now_ms)
            .map(|(m, _)| m)
            .collect();
        for task_json in due {
            state.zrem(scheduled_key, &task_json);
            let priority = task_field(&task_json, "priority")?.as_f64().unwrap_or(1.0);
            let project = task_field(&task_json, "project_id")?
                .as_str()
                .unwrap_or("")
                .to_string();
            let seq: f64 = {
                let current: i64 = state
                    .str_value(seq_key)?
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                let next = current + 1;
                state.set_str(seq_key, &next.to_string(), None, true);
                next as f64
            };
            state.zadd(priority_key, &task_json, -priority * 1e12 + seq);
            state.expire_in(priority_key, 86400);
            let project_key = format!("{base_key}:project:{project}");
            let l = state.list_value(&project_key, true)?.unwrap();
            l.push_back(task_json.clone());
            state.expire_in(&project_key, 86400);
        }
        Ok(())
    }

    fn queue_dequeue(
        state: &mut FakeState,
        keys: &[String],
        args: &[String],
        project_queue: Option<String>,
    ) -> Result<ScriptReply, CommandError> {
        let (priority_key, scheduled_key, seq_key, base_key, task_prefix) =
            (&keys[0], &keys[1], &keys[2], &keys[3], &keys[4]);
        let worker_id = &args[0];
        let now_iso = &args[1];
        let now_ms = num(args, 2)?;

        promote_due(state, priority_key, scheduled_key, seq_key, base_key, now_ms)?;

        let task_json = match &project_queue {
            Some(project_key) => {
                let popped = state.list_value(project_key, false)?.and_then(|l| l.pop_front());
                match popped {
                    Some(task_json) => {
                        state.zrem(priority_key, &task_json);
                        Some(task_json)
                    }
                    None => pop_global(state, priority_key, base_key)?,
                }
            }
            None => pop_global(state, priority_key, base_key)?,
        };

        let task_json = match task_json {
            Some(t) => t,
            None => {
                return Ok(ScriptReply::Array(vec![
                    ScriptReply::Int(0),
                    ScriptReply::Data("empty".to_string()),
                    ScriptReply::Int(0),
                ]))
            }
        };

        let task_id = task_field(&task_json, "task_id")?
            .as_str()
            .unwrap_or("")
            .to_string();
        let status_key = format!("{task_prefix}{task_id}:status");
        let attempts = {
            let h = state.hash_value(&status_key, true)?.unwrap();
            let attempts: i64 = h.get("attempts").and_then(|s| s.parse().ok()).unwrap_or(0);
            let attempts = attempts + 1;
            h.insert("status".to_string(), "running".to_string());
            h.insert("worker_id".to_string(), worker_id.clone());
            h.insert("started_at".to_string(), now_iso.clone());
            h.insert("attempts".to_string(), attempts.to_string());
            attempts
        };
        state.expire_in(&status_key, 86400);

        Ok(ScriptReply::Array(vec![
            ScriptReply::Int(1),
            ScriptReply::Data(task_json),
            ScriptReply::Int(attempts),
        ]))
    }

    fn pop_global(
        state: &mut FakeState,
        priority_key: &str,
        base_key: &str,
    ) -> Result<Option<String>, CommandError> {
        let top = state.sorted_zset(priority_key).first().map(|(m, _)| m.clone());
        match top {
            Some(task_json) => {
                state.zrem(priority_key, &task_json);
                let project = task_field(&task_json, "project_id")?
                    .as_str()
                    .unwrap_or("")
                    .to_string();
                let project_key = format!("{base_key}:project:{project}");
                if let Some(l) = state.list_value(&project_key, false)? {
                    if let Some(pos) = l.iter().position(|v| v == &task_json) {
                        l.remove(pos);
                    }
                }
                Ok(Some(task_json))
            }
            None => Ok(None),
        }
    }

    fn queue_complete(
        state: &mut FakeState,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptReply, CommandError> {
        let status_key = &keys[0];
        let status = &args[0];
        let now_iso = &args[1];
        let result = &args[2];
        let error = &args[3];
        let worker_id = &args[4];

        let h = state.hash_value(status_key, true)?.unwrap();
        h.insert("status".to_string(), status.clone());
        if matches!(status.as_str(), "completed" | "failed" | "cancelled" | "dead_letter") {
            h.insert("completed_at".to_string(), now_iso.clone());
        }
        if !result.is_empty() {
            h.insert("result".to_string(), result.clone());
        }
        if !error.is_empty() {
            h.insert("error".to_string(), error.clone());
        }
        if !worker_id.is_empty() {
            h.insert("worker_id".to_string(), worker_id.clone());
        }
        state.expire_in(status_key, 86400);

        Ok(ScriptReply::Array(vec![
            ScriptReply::Int(1),
            ScriptReply::Data(status.clone()),
        ]))
    }

    fn queue_cancel(
        state: &mut FakeState,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptReply, CommandError> {
        let (priority_key, scheduled_key, base_key, task_key, status_key) =
            (&keys[0], &keys[1], &keys[2], &keys[3], &keys[4]);
        let now_iso = &args[0];

        let task_json = match state.str_value(task_key)? {
            Some(s) => s.clone(),
            None => {
                return Ok(ScriptReply::Array(vec![
                    ScriptReply::Int(0),
                    ScriptReply::Data("not_found".to_string()),
                ]))
            }
        };

        let removed =
            state.zrem(priority_key, &task_json) + state.zrem(scheduled_key, &task_json);
        let project = task_field(&task_json, "project_id")?
            .as_str()
            .unwrap_or("")
            .to_string();
        let project_key = format!("{base_key}:project:{project}");
        if let Some(l) = state.list_value(&project_key, false)? {
            if let Some(pos) = l.iter().position(|v| v == &task_json) {
                l.remove(pos);
            }
        }

        if removed == 0 {
            return Ok(ScriptReply::Array(vec![
                ScriptReply::Int(0),
                ScriptReply::Data("not_queued".to_string()),
            ]));
        }

        let h = state.hash_value(status_key, true)?.unwrap();
        h.insert("status".to_string(), "cancelled".to_string());
        h.insert("completed_at".to_string(), now_iso.clone());
        state.expire_in(status_key, 86400);

        Ok(ScriptReply::Array(vec![
            ScriptReply::Int(1),
            ScriptReply::Data("cancelled".to_string()),
        ]))
    }
}

/// [`Connector`] handing out backends that share one fake keyspace.
pub struct FakeConnector {
    store: FakeStore,
}

impl FakeConnector {
    pub fn new(store: FakeStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self) -> Result<Arc<dyn RawCommands>, CommandError> {
        self.store.state.lock().unwrap().check_failure()?;
        Ok(self.store.backend())
    }
}
