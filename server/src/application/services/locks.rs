//! Per-agent operation locks.
//!
//! A keyed table rather than one global mutex, so workflows for distinct
//! agents run in parallel while each agent stays single-flight. Entries are
//! created lazily and garbage-collected once nothing holds them. Contention
//! is never queued: a held lock means the new request fails with `conflict`
//! immediately, because stacking (say) a start behind a delete could
//! resurrect a deleted agent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Guard proving single-flight ownership of one agent for one workflow.
/// Dropping it releases the agent.
pub struct AgentGuard {
    _guard: OwnedMutexGuard<()>,
}

/// Lazily populated agent-id → lock table.
#[derive(Default)]
pub struct LockTable {
    entries: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl LockTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the agent's lock without waiting.
    ///
    /// Returns `None` when another workflow already holds it.
    #[must_use]
    pub fn try_acquire(&self, agent_id: &str) -> Option<AgentGuard> {
        let entry = {
            let mut entries = match self.entries.lock() {
                Ok(e) => e,
                Err(poisoned) => poisoned.into_inner(),
            };
            // Drop table entries nobody references anymore before adding one.
            entries.retain(|_, lock| Arc::strong_count(lock) > 1);
            entries
                .entry(agent_id.to_owned())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        entry
            .try_lock_owned()
            .ok()
            .map(|guard| AgentGuard { _guard: guard })
    }

    /// Number of live table entries; used by tests to observe collection.
    #[must_use]
    pub fn len(&self) -> usize {
        match self.entries.lock() {
            Ok(e) => e.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
