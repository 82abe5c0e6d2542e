//! Command tracing hook.
//!
//! Every operation issued through a [`Connection`](crate::Connection) is
//! reported to the factory's registered observer, which is how the health
//! component builds its per-command latency histories without the
//! connection layer knowing anything about it.

use redgate_core::TenantId;
use std::time::Duration;

/// Coarse command classification used by the latency histories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandCategory {
    /// Point reads and range reads.
    Read,
    /// Mutations.
    Write,
    /// Server-side script execution and loading.
    Script,
    /// PING, INFO, SCAN.
    Introspection,
}

impl CommandCategory {
    /// Stable label for metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandCategory::Read => "read",
            CommandCategory::Write => "write",
            CommandCategory::Script => "script",
            CommandCategory::Introspection => "introspection",
        }
    }
}

/// One traced command execution.
#[derive(Debug, Clone)]
pub struct CommandRecord {
    /// Redis command name, e.g. "GET".
    pub command: &'static str,
    pub category: CommandCategory,
    pub duration: Duration,
    pub success: bool,
    /// Tenant the command executed under; `None` for the admin path.
    pub tenant: Option<TenantId>,
    pub error: Option<String>,
}

/// Sink for traced commands.
pub trait CommandObserver: Send + Sync {
    fn record(&self, record: CommandRecord);
}
