//! Development-time consistency guards.
//!
//! Guards watch the write paths into shared state and flag three classes of
//! bug: a write attributed to a mutation that is not in a state to make it,
//! an optimistic write left in place after its mutation failed, and a removed
//! record id showing up again. Violations are logged and kept for tests.
//! Release builds never enable them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::config::Config;
use crate::mutation::MutationId;
use crate::store::WriteSource;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// A write tagged with a mutation id that was unknown, already settled, or
    /// (for reconcile writes) never confirmed by the remote side.
    UnconfirmedWrite {
        store: String,
        mutation_id: MutationId,
        source: WriteSource,
    },
    /// A failed mutation wrote optimistic state but had no rollback to undo it.
    UnrevertedOptimistic { mutation_id: MutationId, key: String },
    /// A record removed from a collection came back.
    Resurrected { collection: String, record_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Confirmed,
}

#[derive(Default)]
struct GuardState {
    open: HashMap<MutationId, Phase>,
    removed: HashMap<String, HashSet<String>>,
    violations: Vec<Violation>,
}

pub struct ConsistencyGuards {
    enabled: bool,
    state: Mutex<GuardState>,
}

impl ConsistencyGuards {
    pub fn new(enabled: bool) -> Arc<Self> {
        Arc::new(Self {
            enabled: enabled && cfg!(debug_assertions),
            state: Mutex::new(GuardState::default()),
        })
    }

    pub fn from_config(config: &Config) -> Arc<Self> {
        Self::new(config.guards)
    }

    pub fn disabled() -> Arc<Self> {
        Self::new(false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn violations(&self) -> Vec<Violation> {
        self.state.lock().violations.clone()
    }

    pub fn clear(&self) {
        *self.state.lock() = GuardState::default();
    }

    pub(crate) fn begin(&self, id: MutationId) {
        if self.enabled {
            self.state.lock().open.insert(id, Phase::Pending);
        }
    }

    pub(crate) fn confirm(&self, id: MutationId) {
        if !self.enabled {
            return;
        }
        if let Some(phase) = self.state.lock().open.get_mut(&id) {
            *phase = Phase::Confirmed;
        }
    }

    pub(crate) fn settle(&self, id: MutationId) {
        if self.enabled {
            self.state.lock().open.remove(&id);
        }
    }

    pub(crate) fn observe_write(&self, store: &str, source: WriteSource) {
        if !self.enabled {
            return;
        }
        let mut state = self.state.lock();
        let ok = match source {
            WriteSource::Optimistic(id) | WriteSource::Rollback(id) => state.open.contains_key(&id),
            WriteSource::Reconcile(id) => state.open.get(&id) == Some(&Phase::Confirmed),
            WriteSource::Pushed | WriteSource::Local => true,
        };
        if ok {
            return;
        }
        let mutation_id = match source {
            WriteSource::Optimistic(id) | WriteSource::Rollback(id) | WriteSource::Reconcile(id) => id,
            WriteSource::Pushed | WriteSource::Local => return,
        };
        warn!(
            target = "lagoon.guards",
            store,
            mutation_id = %mutation_id,
            source = ?source,
            "state written for a mutation without a confirmed remote operation"
        );
        state.violations.push(Violation::UnconfirmedWrite {
            store: store.to_string(),
            mutation_id,
            source,
        });
    }

    pub(crate) fn unreverted_optimistic(&self, id: MutationId, key: &str) {
        if !self.enabled {
            return;
        }
        warn!(
            target = "lagoon.guards",
            mutation_id = %id,
            key,
            "optimistic write left in place after failure (no rollback registered)"
        );
        self.state
            .lock()
            .violations
            .push(Violation::UnrevertedOptimistic {
                mutation_id: id,
                key: key.to_string(),
            });
    }

    pub(crate) fn note_removed(&self, collection: &str, record_id: &str) {
        if !self.enabled {
            return;
        }
        self.state
            .lock()
            .removed
            .entry(collection.to_string())
            .or_default()
            .insert(record_id.to_string());
    }

    /// Flags `record_id` if it was removed from `collection` earlier. Returns true on a violation.
    pub(crate) fn check_arrival(&self, collection: &str, record_id: &str) -> bool {
        if !self.enabled {
            return false;
        }
        let mut state = self.state.lock();
        let resurrected = state
            .removed
            .get(collection)
            .is_some_and(|ids| ids.contains(record_id));
        if resurrected {
            warn!(
                target = "lagoon.guards",
                collection,
                record_id,
                "removed record reappeared"
            );
            state.violations.push(Violation::Resurrected {
                collection: collection.to_string(),
                record_id: record_id.to_string(),
            });
        }
        resurrected
    }
}
