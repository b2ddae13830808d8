use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::warn;

use super::MutationId;

type RestoreFn = Box<dyn FnOnce() + Send>;

/// Deferred restore actions for in-flight mutations, at most one per mutation id.
#[derive(Default)]
pub struct RollbackRegistry {
    entries: Mutex<HashMap<MutationId, RestoreFn>>,
}

impl RollbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `restore` for `id`. An entry that is already live wins; the new one is dropped.
    pub fn register<F>(&self, id: MutationId, restore: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut entries = self.entries.lock();
        if entries.contains_key(&id) {
            warn!(
                target = "lagoon.mutation",
                mutation_id = %id,
                "rollback already registered; keeping the original"
            );
            return false;
        }
        entries.insert(id, Box::new(restore));
        true
    }

    /// Removes and runs the entry for `id`. Returns false when nothing was registered.
    pub fn invoke(&self, id: MutationId) -> bool {
        // Release the lock before running: a restore may touch other registry entries.
        let restore = self.entries.lock().remove(&id);
        match restore {
            Some(restore) => {
                restore();
                true
            }
            None => false,
        }
    }

    /// Drops the entry for `id` without running it.
    pub fn discard(&self, id: MutationId) -> bool {
        self.entries.lock().remove(&id).is_some()
    }

    pub fn contains(&self, id: MutationId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
