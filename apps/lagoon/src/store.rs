//! Observable shared state.
//!
//! A [`Store`] is the single place UI-facing state lives. Readers take
//! snapshots or closures over `&S`; observers watch a version counter that
//! bumps on every write. Writes are crate-private and always tagged with a
//! [`WriteSource`], so only the mutation engine, the stream reconciler and
//! explicit local-only actions can change state.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;

use crate::guards::ConsistencyGuards;
use crate::mutation::MutationId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteSource {
    Optimistic(MutationId),
    Reconcile(MutationId),
    Rollback(MutationId),
    Pushed,
    /// Local-only change with no remote counterpart (e.g. hide-for-self).
    Local,
}

pub struct Store<S> {
    inner: Arc<StoreInner<S>>,
}

struct StoreInner<S> {
    label: String,
    state: RwLock<S>,
    version: watch::Sender<u64>,
    guards: Arc<ConsistencyGuards>,
}

impl<S> Clone for Store<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> Store<S> {
    pub fn new(label: impl Into<String>, initial: S, guards: Arc<ConsistencyGuards>) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Arc::new(StoreInner {
                label: label.into(),
                state: RwLock::new(initial),
                version,
                guards,
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn read<T>(&self, f: impl FnOnce(&S) -> T) -> T {
        f(&self.inner.state.read())
    }

    pub fn snapshot(&self) -> S
    where
        S: Clone,
    {
        self.inner.state.read().clone()
    }

    pub fn version(&self) -> u64 {
        *self.inner.version.borrow()
    }

    /// Change notifications; the value is the store version after the write.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.version.subscribe()
    }

    pub(crate) fn guards(&self) -> &Arc<ConsistencyGuards> {
        &self.inner.guards
    }

    pub(crate) fn write<T>(&self, source: WriteSource, f: impl FnOnce(&mut S) -> T) -> T {
        self.inner.guards.observe_write(&self.inner.label, source);
        let out = {
            let mut state = self.inner.state.write();
            f(&mut state)
        };
        self.inner.version.send_modify(|version| *version += 1);
        out
    }
}
