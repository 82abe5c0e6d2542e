//! Logical Redis key schema.
//!
//! Every key the substrate stores is built by one of these constructors.
//! The constructors produce *logical* keys; the tenant prefix
//! (`proj:<tenant>:`) is applied by the isolating connection, never here.
//!
//! Free-form name segments (queue names, agent types, rate-limit
//! identifiers) are validated at construction so malformed shapes are
//! rejected before any I/O.

use crate::tenant::TenantId;
use thiserror::Error;
use uuid::Uuid;

/// Returned when a key segment has an invalid shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// The segment was empty.
    #[error("empty key segment for {0}")]
    Empty(&'static str),

    /// The segment contained a character outside `[A-Za-z0-9_.-]`.
    #[error("invalid character {ch:?} in {what} segment {segment:?}")]
    InvalidCharacter {
        what: &'static str,
        segment: String,
        ch: char,
    },
}

/// Validates a strict name segment: non-empty, `[A-Za-z0-9_.-]` only.
///
/// Used for queue names and agent types, which become key path components.
pub fn validate_segment(what: &'static str, segment: &str) -> Result<(), KeyError> {
    if segment.is_empty() {
        return Err(KeyError::Empty(what));
    }
    for ch in segment.chars() {
        if !(ch.is_ascii_alphanumeric() || ch == '_' || ch == '.' || ch == '-') {
            return Err(KeyError::InvalidCharacter {
                what,
                segment: segment.to_string(),
                ch,
            });
        }
    }
    Ok(())
}

/// Validates a rate-limit identifier: non-empty and free of whitespace.
///
/// Identifiers may be UUIDs, IP addresses (including IPv6 colons) or
/// normalized endpoint paths, so the character set is looser than
/// [`validate_segment`].
pub fn validate_identifier(identifier: &str) -> Result<(), KeyError> {
    if identifier.is_empty() {
        return Err(KeyError::Empty("identifier"));
    }
    for ch in identifier.chars() {
        if ch.is_whitespace() {
            return Err(KeyError::InvalidCharacter {
                what: "identifier",
                segment: identifier.to_string(),
                ch,
            });
        }
    }
    Ok(())
}

/// `project:<tenant>:data` — tenant data cache.
pub fn project_data(tenant: &TenantId) -> String {
    format!("project:{tenant}:data")
}

/// `project:<tenant>:context` — tenant context cache.
pub fn project_context(tenant: &TenantId) -> String {
    format!("project:{tenant}:context")
}

/// `session:<session-id>` — session record.
pub fn session(session_id: &Uuid) -> String {
    format!("session:{session_id}")
}

/// `session:<session-id>:grants` — granted tenant access set.
pub fn session_grants(session_id: &Uuid) -> String {
    format!("session:{session_id}:grants")
}

/// `session_user:<user-id>` — user's current session pointer
/// (single-session policy).
pub fn session_user(user_id: &Uuid) -> String {
    format!("session_user:{user_id}")
}

/// `agent:<agent-type>:config` — agent configuration (admin path only).
pub fn agent_config(agent_type: &str) -> Result<String, KeyError> {
    validate_segment("agent type", agent_type)?;
    Ok(format!("agent:{agent_type}:config"))
}

/// `rate_limit:<kind>:<identifier>:<window-seconds>` — sliding window set.
pub fn rate_limit_sliding(kind: &str, identifier: &str, window_seconds: u64) -> String {
    format!("rate_limit:{kind}:{identifier}:{window_seconds}")
}

/// `rate_limit:token_bucket:<identifier>` — token bucket hash.
pub fn rate_limit_bucket(identifier: &str) -> String {
    format!("rate_limit:token_bucket:{identifier}")
}

/// `queue:<name>` — queue base key; derived keys hang off this.
pub fn queue_base(queue: &str) -> String {
    format!("queue:{queue}")
}

/// `queue:<name>:priority` — priority index (sorted set).
pub fn queue_priority(queue: &str) -> String {
    format!("queue:{queue}:priority")
}

/// `queue:<name>:scheduled` — parked future tasks (sorted set by due time).
pub fn queue_scheduled(queue: &str) -> String {
    format!("queue:{queue}:scheduled")
}

/// `queue:<name>:seq` — insertion counter used for FIFO tie-breaking.
pub fn queue_seq(queue: &str) -> String {
    format!("queue:{queue}:seq")
}

/// `queue:<name>:project:<tenant>` — tenant sub-queue (list).
pub fn queue_project(queue: &str, tenant: &TenantId) -> String {
    format!("queue:{queue}:project:{tenant}")
}

/// `task:` — task key prefix handed to queue scripts.
pub fn task_prefix() -> String {
    "task:".to_string()
}

/// `task:<task-id>` — serialized task body.
pub fn task_body(task_id: &Uuid) -> String {
    format!("task:{task_id}")
}

/// `task:<task-id>:status` — task status hash.
pub fn task_status(task_id: &Uuid) -> String {
    format!("task:{task_id}:status")
}

/// `progress:<correlation-id>` — progress tracker.
pub fn progress(correlation_id: &Uuid) -> String {
    format!("progress:{correlation_id}")
}

/// `dead_letter_queue:task:<task-id>` — dead-letter entry.
pub fn dead_letter(task_id: &Uuid) -> String {
    format!("dead_letter_queue:task:{task_id}")
}

/// `dead_letter_queue:stats` — per-tenant dead-letter counters.
pub fn dead_letter_stats() -> String {
    "dead_letter_queue:stats".to_string()
}

/// `cache_tag:<tag>` — secondary index from tag to cached logical keys.
pub fn cache_tag(tag: &str) -> String {
    format!("cache_tag:{tag}")
}
