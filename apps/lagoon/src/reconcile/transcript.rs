use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::protocol::PushedRecord;

pub type RecordId = String;
pub type LocalId = String;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "payload", rename_all = "snake_case")]
pub enum RecordContent<P> {
    Live(P),
    /// Removed for everyone; the slot stays so the transcript does not shift.
    Tombstone,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRecord<P> {
    /// Server id; `None` while the record is an optimistic placeholder.
    pub id: Option<RecordId>,
    pub local_id: Option<LocalId>,
    pub actor_id: String,
    pub collection_id: String,
    pub is_optimistic: bool,
    pub created_at: OffsetDateTime,
    pub content: RecordContent<P>,
}

impl<P> StreamRecord<P> {
    pub fn optimistic(
        local_id: impl Into<LocalId>,
        actor_id: impl Into<String>,
        collection_id: impl Into<String>,
        payload: P,
    ) -> Self {
        Self {
            id: None,
            local_id: Some(local_id.into()),
            actor_id: actor_id.into(),
            collection_id: collection_id.into(),
            is_optimistic: true,
            created_at: OffsetDateTime::now_utc(),
            content: RecordContent::Live(payload),
        }
    }

    pub fn authoritative(
        id: impl Into<RecordId>,
        actor_id: impl Into<String>,
        collection_id: impl Into<String>,
        created_at: OffsetDateTime,
        payload: P,
    ) -> Self {
        Self {
            id: Some(id.into()),
            local_id: None,
            actor_id: actor_id.into(),
            collection_id: collection_id.into(),
            is_optimistic: false,
            created_at,
            content: RecordContent::Live(payload),
        }
    }

    pub fn payload(&self) -> Option<&P> {
        match &self.content {
            RecordContent::Live(payload) => Some(payload),
            RecordContent::Tombstone => None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self.content, RecordContent::Tombstone)
    }
}

impl<P> From<PushedRecord<P>> for StreamRecord<P> {
    fn from(pushed: PushedRecord<P>) -> Self {
        let created_at =
            OffsetDateTime::from_unix_timestamp_nanos(i128::from(pushed.created_at_ms) * 1_000_000)
                .unwrap_or(OffsetDateTime::UNIX_EPOCH);
        Self::authoritative(
            pushed.id,
            pushed.actor_id,
            pushed.room_id,
            created_at,
            pushed.payload,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// An optimistic placeholder was swapped for the authoritative record in place.
    Replaced { index: usize, local_id: LocalId },
    /// The id is already present; nothing changed.
    Duplicate,
    Appended { index: usize },
    /// The user hid this id locally; redelivery does not bring it back.
    Hidden,
    ForeignCollection,
    MissingId,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, Self::Replaced { .. } | Self::Appended { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalMode {
    ForAll,
    ForSelf,
}

/// Ordered records of one collection, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript<P> {
    collection_id: String,
    records: Vec<StreamRecord<P>>,
    hidden: HashSet<RecordId>,
}

impl<P> Transcript<P> {
    pub fn new(collection_id: impl Into<String>) -> Self {
        Self {
            collection_id: collection_id.into(),
            records: Vec::new(),
            hidden: HashSet::new(),
        }
    }

    pub fn collection_id(&self) -> &str {
        &self.collection_id
    }

    pub fn records(&self) -> &[StreamRecord<P>] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&StreamRecord<P>> {
        self.position(id).map(|index| &self.records[index])
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.records
            .iter()
            .position(|r| r.id.as_deref() == Some(id))
    }

    pub fn position_local(&self, local_id: &str) -> Option<usize> {
        self.records
            .iter()
            .position(|r| r.is_optimistic && r.local_id.as_deref() == Some(local_id))
    }

    pub fn is_hidden(&self, id: &str) -> bool {
        self.hidden.contains(id)
    }

    /// Placeholders from `actor_id` still waiting for their authoritative twin.
    pub fn outstanding_optimistic(&self, actor_id: &str) -> usize {
        self.records
            .iter()
            .filter(|r| r.is_optimistic && r.actor_id == actor_id)
            .count()
    }

    /// Pagination cursor: the oldest record the server knows about.
    pub fn oldest_id(&self) -> Option<&RecordId> {
        self.records.iter().find_map(|r| r.id.as_ref())
    }

    /// Appends a placeholder at the end. The record is forced optimistic and
    /// loses any server id it carried.
    pub fn append_optimistic(&mut self, mut record: StreamRecord<P>) -> usize {
        record.is_optimistic = true;
        record.id = None;
        self.records.push(record);
        self.records.len() - 1
    }

    /// Folds a pushed authoritative record into the transcript.
    ///
    /// Redelivery of a known id is a no-op. Otherwise the oldest outstanding
    /// placeholder from the same actor is replaced in place; failing that the
    /// record is appended. The duplicate check runs first so a redelivered
    /// record can never claim someone else's pending placeholder.
    pub fn merge_pushed(&mut self, record: StreamRecord<P>) -> MergeOutcome {
        if record.collection_id != self.collection_id {
            return MergeOutcome::ForeignCollection;
        }
        let Some(id) = record.id.as_deref() else {
            return MergeOutcome::MissingId;
        };
        if self.hidden.contains(id) {
            return MergeOutcome::Hidden;
        }
        if self.position(id).is_some() {
            return MergeOutcome::Duplicate;
        }
        let placeholder = self
            .records
            .iter()
            .position(|r| r.is_optimistic && r.actor_id == record.actor_id);
        match placeholder {
            Some(index) => {
                let local_id = self.replace_at(index, record);
                MergeOutcome::Replaced { index, local_id }
            }
            None => {
                self.records.push(settled(record));
                MergeOutcome::Appended {
                    index: self.records.len() - 1,
                }
            }
        }
    }

    /// Applies the direct response for the placeholder `local_id`.
    ///
    /// If the push path already delivered the same id, the placeholder (if any)
    /// is dropped instead of producing a second copy.
    pub fn confirm(&mut self, local_id: &str, record: StreamRecord<P>) -> MergeOutcome {
        let existing = record.id.as_deref().and_then(|id| self.position(id));
        let placeholder = self.position_local(local_id);
        match (existing, placeholder) {
            (Some(_), Some(index)) => {
                self.records.remove(index);
                MergeOutcome::Duplicate
            }
            (Some(_), None) => MergeOutcome::Duplicate,
            (None, Some(index)) => {
                let local_id = self.replace_at(index, record);
                MergeOutcome::Replaced { index, local_id }
            }
            // The placeholder was already claimed by a pushed record.
            (None, None) => self.merge_pushed(record),
        }
    }

    /// Removes a placeholder that never became authoritative.
    pub fn discard_optimistic(&mut self, local_id: &str) -> Option<StreamRecord<P>> {
        self.position_local(local_id)
            .map(|index| self.records.remove(index))
    }

    /// `ForAll` tombstones the record and keeps its slot. `ForSelf` drops it
    /// from this transcript only and suppresses any later redelivery.
    pub fn remove_or_mark(&mut self, id: &str, mode: RemovalMode) -> bool {
        match mode {
            RemovalMode::ForAll => match self.position(id) {
                Some(index) if !self.records[index].is_tombstone() => {
                    self.records[index].content = RecordContent::Tombstone;
                    true
                }
                _ => false,
            },
            RemovalMode::ForSelf => {
                self.hidden.insert(id.to_string());
                match self.position(id) {
                    Some(index) => {
                        self.records.remove(index);
                        true
                    }
                    None => false,
                }
            }
        }
    }

    /// Inserts an older page at the front, keeping the page's own order.
    /// Older pages are assumed not to overlap the loaded window; only locally
    /// hidden ids are filtered. Returns how many records were inserted.
    pub fn prepend_older(&mut self, older: Vec<StreamRecord<P>>) -> usize {
        let page: Vec<StreamRecord<P>> = older
            .into_iter()
            .filter(|r| r.id.as_deref().is_none_or(|id| !self.hidden.contains(id)))
            .map(settled)
            .collect();
        let inserted = page.len();
        self.records.splice(0..0, page);
        inserted
    }

    fn replace_at(&mut self, index: usize, record: StreamRecord<P>) -> LocalId {
        let replaced = std::mem::replace(&mut self.records[index], settled(record));
        replaced.local_id.unwrap_or_default()
    }
}

fn settled<P>(mut record: StreamRecord<P>) -> StreamRecord<P> {
    record.is_optimistic = false;
    record.local_id = None;
    record
}
