//! The scripted executor.
//!
//! Components register named server-side scripts at build time. The first
//! invocation loads the script and caches its SHA; if the server later
//! reports the script missing (restart, SCRIPT FLUSH), the executor
//! reloads the full text exactly once and retries. Any further failure
//! surfaces to the caller.
//!
//! Every script's first line is a `-- redgate:<name>` marker. The marker
//! is how the in-memory fake recognizes which behavior to emulate, and it
//! doubles as documentation when scripts show up in server logs.

use crate::commands::ScriptReply;
use crate::error::ConnectionError;
use crate::isolated::Connection;
use std::collections::HashMap;
use std::sync::RwLock;

/// A named server-side script.
#[derive(Debug, Clone, Copy)]
pub struct ScriptDef {
    pub name: &'static str,
    pub text: &'static str,
}

struct ScriptEntry {
    text: &'static str,
    sha: RwLock<Option<String>>,
}

/// Caches SHAs for a set of named scripts and recovers from NOSCRIPT.
pub struct ScriptExecutor {
    entries: HashMap<&'static str, ScriptEntry>,
}

impl ScriptExecutor {
    /// Registers the given scripts. Panics on a duplicate name, which is a
    /// build-time mistake.
    pub fn new(defs: &[ScriptDef]) -> Self {
        let mut entries = HashMap::new();
        for def in defs {
            debug_assert!(
                def.text.trim_start().starts_with("-- redgate:"),
                "script {} is missing its marker line",
                def.name
            );
            let previous = entries.insert(
                def.name,
                ScriptEntry {
                    text: def.text,
                    sha: RwLock::new(None),
                },
            );
            assert!(previous.is_none(), "duplicate script name: {}", def.name);
        }
        Self { entries }
    }

    /// Loads every registered script through the given connection,
    /// populating the SHA cache. Called once at startup via the admin path.
    pub async fn warm_up(&self, conn: &Connection) -> Result<(), ConnectionError> {
        for (name, entry) in &self.entries {
            let sha = conn.script_load(entry.text).await?;
            tracing::debug!(script = *name, sha = %sha, "loaded server-side script");
            *entry.sha.write().expect("script sha lock poisoned") = Some(sha);
        }
        Ok(())
    }

    /// Invokes a registered script by name.
    ///
    /// Loads on first use; reloads once if the server reports the script
    /// missing.
    pub async fn invoke(
        &self,
        conn: &Connection,
        name: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptReply, ConnectionError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| ConnectionError::Store(format!("unknown script: {name}")))?;

        let cached = entry
            .sha
            .read()
            .expect("script sha lock poisoned")
            .clone();
        let sha = match cached {
            Some(sha) => sha,
            None => {
                let sha = conn.script_load(entry.text).await?;
                *entry.sha.write().expect("script sha lock poisoned") = Some(sha.clone());
                sha
            }
        };

        match conn.evalsha(&sha, keys, args).await {
            Err(ConnectionError::ScriptMissing(_)) => {
                tracing::warn!(script = name, "script missing on server; reloading");
                let sha = conn.script_load(entry.text).await?;
                *entry.sha.write().expect("script sha lock poisoned") = Some(sha.clone());
                conn.evalsha(&sha, keys, args).await
            }
            other => other,
        }
    }

    /// Names of all registered scripts.
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.keys().copied().collect()
    }
}

#[cfg(all(test, feature = "test-util"))]
mod tests {
    use super::*;
    use crate::fake::FakeStore;
    use crate::pool::Pool;
    use redgate_core::TenantId;
    use std::time::Duration;

    const ECHO: ScriptDef = ScriptDef {
        name: "echo",
        text: "-- redgate:echo\nreturn ARGV[1]",
    };

    async fn conn(store: &FakeStore) -> Connection {
        let pool = Pool::new("test", store.backend(), 2);
        let slot = pool.acquire(Duration::from_secs(1)).await.unwrap();
        Connection::isolated(slot, TenantId::random(), None)
    }

    #[tokio::test]
    async fn loads_on_first_use_and_reuses_sha() {
        let store = FakeStore::new();
        let conn = conn(&store).await;
        let executor = ScriptExecutor::new(&[ECHO]);

        let reply = executor
            .invoke(&conn, "echo", &[], &["hi".to_string()])
            .await
            .unwrap();
        assert_eq!(reply.as_str(), Some("hi"));

        // Second call hits the cached SHA.
        let reply = executor
            .invoke(&conn, "echo", &[], &["again".to_string()])
            .await
            .unwrap();
        assert_eq!(reply.as_str(), Some("again"));
    }

    #[tokio::test]
    async fn recovers_once_from_script_flush() {
        let store = FakeStore::new();
        let conn = conn(&store).await;
        let executor = ScriptExecutor::new(&[ECHO]);

        executor
            .invoke(&conn, "echo", &[], &["hi".to_string()])
            .await
            .unwrap();

        store.flush_scripts();

        let reply = executor
            .invoke(&conn, "echo", &[], &["back".to_string()])
            .await
            .unwrap();
        assert_eq!(reply.as_str(), Some("back"));
    }

    #[tokio::test]
    async fn unknown_script_is_an_error() {
        let store = FakeStore::new();
        let conn = conn(&store).await;
        let executor = ScriptExecutor::new(&[ECHO]);

        let err = executor.invoke(&conn, "nope", &[], &[]).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Store(_)));
    }
}
