//! Realtime reconciliation of pushed records with local optimistic state.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{debug, trace, warn};
use transport_bus::DuplexChannel;

use crate::channel::{ChannelAdapter, SubscriptionGuard, SubscriptionSpec};
use crate::guards::ConsistencyGuards;
use crate::protocol::{
    EVENT_JOIN_ROOM, EVENT_ONLINE_COUNT, EVENT_RECORD_NEW, EVENT_RECORD_REMOVED, OnlineCount,
    PushedRecord, RecordRemoved,
};
use crate::store::{Store, WriteSource};

pub mod room;
pub mod transcript;

pub use room::{ChatMessage, ChatRoom, RoomApi};
pub use transcript::{
    LocalId, MergeOutcome, RecordContent, RecordId, RemovalMode, StreamRecord, Transcript,
};

/// Bounds every record payload carried through the transcript and the wire.
pub trait RecordPayload:
    Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> RecordPayload for T where
    T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Feeds pushed room events into a [`Transcript`] store.
pub struct StreamReconciler<P> {
    collection_id: String,
    store: Store<Transcript<P>>,
    online: watch::Sender<u32>,
}

impl<P: RecordPayload> StreamReconciler<P> {
    pub fn new(collection_id: impl Into<String>, guards: Arc<ConsistencyGuards>) -> Arc<Self> {
        let collection_id = collection_id.into();
        let store = Store::new(
            format!("transcript:{collection_id}"),
            Transcript::new(collection_id.clone()),
            guards,
        );
        let (online, _) = watch::channel(0);
        Arc::new(Self {
            collection_id,
            store,
            online,
        })
    }

    pub fn collection_id(&self) -> &str {
        &self.collection_id
    }

    pub fn store(&self) -> &Store<Transcript<P>> {
        &self.store
    }

    pub fn snapshot(&self) -> Transcript<P> {
        self.store.snapshot()
    }

    pub fn online_count(&self) -> watch::Receiver<u32> {
        self.online.subscribe()
    }

    pub fn subscription_name(&self) -> String {
        format!("room:{}:records", self.collection_id)
    }

    /// Binds the room's record, removal and presence events. The join intent is
    /// replayed by the adapter on every reconnect.
    pub fn attach<C: DuplexChannel + 'static>(
        self: &Arc<Self>,
        adapter: &Arc<ChannelAdapter<C>>,
    ) -> SubscriptionGuard {
        let collection = self.collection_id.clone();
        let spec = SubscriptionSpec::new()
            .on(EVENT_RECORD_NEW, Self::handler(self, Self::handle_new))
            .on(EVENT_RECORD_REMOVED, Self::handler(self, Self::handle_removed))
            .on(EVENT_ONLINE_COUNT, Self::handler(self, Self::handle_online_count))
            .join(EVENT_JOIN_ROOM, json!({ "room_id": self.collection_id }))
            .on_error(move |fault| {
                warn!(
                    target = "lagoon.reconcile",
                    collection = %collection,
                    error = %fault.message,
                    "room stream interrupted"
                );
            });
        adapter.subscribe(self.subscription_name(), spec)
    }

    fn handler(this: &Arc<Self>, f: fn(&Self, &Value)) -> Box<dyn Fn(&Value) + Send + Sync> {
        let weak = Arc::downgrade(this);
        Box::new(move |payload| {
            if let Some(reconciler) = weak.upgrade() {
                f(&reconciler, payload);
            }
        })
    }

    pub fn merge_pushed(&self, record: StreamRecord<P>) -> MergeOutcome {
        let id = record.id.clone();
        let actor = record.actor_id.clone();
        let outcome = self
            .store
            .write(WriteSource::Pushed, |transcript| transcript.merge_pushed(record));
        if let (true, Some(id)) = (outcome.changed(), id.as_deref()) {
            self.store.guards().check_arrival(&self.collection_id, id);
        }
        debug!(
            target = "lagoon.reconcile",
            collection = %self.collection_id,
            record_id = id.as_deref().unwrap_or("-"),
            actor = %actor,
            outcome = ?outcome,
            "pushed record merged"
        );
        outcome
    }

    /// Tombstones a record the server removed for everyone.
    pub fn mark_removed(&self, record_id: &str) -> bool {
        let changed = self.store.write(WriteSource::Pushed, |transcript| {
            transcript.remove_or_mark(record_id, RemovalMode::ForAll)
        });
        self.note_removed(record_id);
        changed
    }

    /// Local-only removal; other observers are unaffected.
    pub fn hide(&self, record_id: &str) -> bool {
        let changed = self.store.write(WriteSource::Local, |transcript| {
            transcript.remove_or_mark(record_id, RemovalMode::ForSelf)
        });
        self.note_removed(record_id);
        debug!(
            target = "lagoon.reconcile",
            collection = %self.collection_id,
            record_id,
            changed,
            "record hidden locally"
        );
        changed
    }

    /// Fetches the page before the oldest loaded record and prepends it.
    pub async fn load_older<F, Fut, E>(&self, fetch: F) -> Result<usize, E>
    where
        F: FnOnce(Option<RecordId>) -> Fut,
        Fut: Future<Output = Result<Vec<StreamRecord<P>>, E>>,
    {
        let cursor = self.store.read(|transcript| transcript.oldest_id().cloned());
        let page = fetch(cursor.clone()).await?;
        let arriving: Vec<String> = self.store.read(|transcript| {
            page.iter()
                .filter_map(|record| record.id.clone())
                .filter(|id| !transcript.is_hidden(id))
                .collect()
        });
        for id in &arriving {
            self.store.guards().check_arrival(&self.collection_id, id);
        }
        let inserted = self
            .store
            .write(WriteSource::Pushed, |transcript| transcript.prepend_older(page));
        debug!(
            target = "lagoon.reconcile",
            collection = %self.collection_id,
            before = cursor.as_deref().unwrap_or("-"),
            inserted,
            "older page loaded"
        );
        Ok(inserted)
    }

    pub(crate) fn note_removed(&self, record_id: &str) {
        self.store.guards().note_removed(&self.collection_id, record_id);
    }

    fn handle_new(&self, payload: &Value) {
        match serde_json::from_value::<PushedRecord<P>>(payload.clone()) {
            Ok(pushed) if pushed.room_id == self.collection_id => {
                self.merge_pushed(pushed.into());
            }
            Ok(pushed) => trace!(
                target = "lagoon.reconcile",
                collection = %self.collection_id,
                room_id = %pushed.room_id,
                "ignoring record for another room"
            ),
            Err(err) => warn!(
                target = "lagoon.reconcile",
                collection = %self.collection_id,
                error = %err,
                "undecodable pushed record"
            ),
        }
    }

    fn handle_removed(&self, payload: &Value) {
        match serde_json::from_value::<RecordRemoved>(payload.clone()) {
            Ok(removed) if removed.room_id == self.collection_id => {
                self.mark_removed(&removed.id);
            }
            Ok(_) => {}
            Err(err) => warn!(
                target = "lagoon.reconcile",
                collection = %self.collection_id,
                error = %err,
                "undecodable removal event"
            ),
        }
    }

    fn handle_online_count(&self, payload: &Value) {
        match serde_json::from_value::<OnlineCount>(payload.clone()) {
            Ok(online) if online.room_id == self.collection_id => {
                self.online.send_replace(online.count);
            }
            Ok(_) => {}
            Err(err) => warn!(
                target = "lagoon.reconcile",
                collection = %self.collection_id,
                error = %err,
                "undecodable online count"
            ),
        }
    }
}
