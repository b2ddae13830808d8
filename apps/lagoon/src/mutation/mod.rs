//! Optimistic mutation execution.
//!
//! A mutation applies a provisional change to a [`Store`](crate::store::Store),
//! calls the remote operation, then either reconciles the store with the
//! authoritative result or restores the pre-mutation state. Results are
//! sequenced per key so a slow, stale response never overwrites the effect of
//! a newer one.

use std::fmt;

use serde::Serialize;
use uuid::Uuid;

pub mod engine;
pub mod rollback;

pub use engine::{MutationBuilder, MutationEngine, Rollback};
pub use rollback::RollbackRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutationId(Uuid);

impl MutationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MutationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Idle,
    Pending,
    Success,
    Error,
}

/// One logical write attempt. A retry is a new `Mutation`, never a reused one.
#[derive(Debug, Clone, Serialize)]
pub struct Mutation {
    #[serde(skip)]
    pub id: MutationId,
    pub key: String,
    pub sequence: u64,
    pub status: MutationStatus,
    pub last_error: Option<String>,
    pub last_result: Option<serde_json::Value>,
    /// Failure of the optimistic step, kept for diagnostics; it does not fail the mutation.
    pub optimistic_error: Option<String>,
    /// Set when a newer mutation on the same key made this one's outcome stale.
    pub superseded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome<R> {
    /// The result was the newest for its key and has been reconciled into state.
    Applied(R),
    /// A newer mutation on the same key is in flight or done; state was left alone.
    Superseded(R),
}

impl<R> MutationOutcome<R> {
    pub fn into_inner(self) -> R {
        match self {
            MutationOutcome::Applied(value) | MutationOutcome::Superseded(value) => value,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, MutationOutcome::Applied(_))
    }
}
