use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};
use transport_bus::DuplexChannel;
use uuid::Uuid;

use super::{
    LocalId, RecordId, RecordPayload, RemovalMode, StreamReconciler, StreamRecord, Transcript,
};
use crate::channel::{ChannelAdapter, SubscriptionGuard};
use crate::config::Config;
use crate::error::{ChannelError, MutationError};
use crate::guards::ConsistencyGuards;
use crate::mutation::{MutationEngine, MutationOutcome, Rollback};
use crate::protocol::{EVENT_REQUEST_ONLINE, EVENT_SEND_RECORD, RoomRef, SendRecord};
use crate::typing::{TypingAggregator, TypingEmitter};

/// Request/response operations a room needs from the backend.
#[async_trait]
pub trait RoomApi<P: Send + Sync + 'static>: Send + Sync {
    /// Creates the record. `None` means the server acknowledged without echoing
    /// the record; the push channel will deliver it.
    async fn send_record(
        &self,
        room_id: &str,
        local_id: &str,
        payload: &P,
    ) -> anyhow::Result<Option<StreamRecord<P>>>;

    async fn delete_for_all(&self, room_id: &str, record_id: &str) -> anyhow::Result<()>;

    /// Records strictly older than `before`, oldest first.
    async fn fetch_older(
        &self,
        room_id: &str,
        before: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<StreamRecord<P>>>;
}

#[async_trait]
impl<P, T> RoomApi<P> for Arc<T>
where
    P: Send + Sync + 'static,
    T: RoomApi<P> + ?Sized,
{
    async fn send_record(
        &self,
        room_id: &str,
        local_id: &str,
        payload: &P,
    ) -> anyhow::Result<Option<StreamRecord<P>>> {
        (**self).send_record(room_id, local_id, payload).await
    }

    async fn delete_for_all(&self, room_id: &str, record_id: &str) -> anyhow::Result<()> {
        (**self).delete_for_all(room_id, record_id).await
    }

    async fn fetch_older(
        &self,
        room_id: &str,
        before: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<StreamRecord<P>>> {
        (**self).fetch_older(room_id, before, limit).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub body: String,
}

impl ChatMessage {
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }
}

pub type SendResult<P> = Result<MutationOutcome<Option<StreamRecord<P>>>, MutationError<anyhow::Error>>;

const DEFAULT_PAGE_SIZE: usize = 50;

/// One open chat room: transcript, typing indicator and the write paths into them.
pub struct ChatRoom<P, A, C>
where
    P: RecordPayload,
    C: DuplexChannel + 'static,
{
    room_id: String,
    actor_id: String,
    api: A,
    adapter: Arc<ChannelAdapter<C>>,
    reconciler: Arc<StreamReconciler<P>>,
    engine: MutationEngine<Transcript<P>>,
    typing: Arc<TypingAggregator>,
    emitter: TypingEmitter<C>,
    page_size: usize,
    _subscriptions: Vec<SubscriptionGuard>,
}

impl<P, A, C> ChatRoom<P, A, C>
where
    P: RecordPayload,
    A: RoomApi<P>,
    C: DuplexChannel + 'static,
{
    /// Opens the room and subscribes to its events. Must be called from within
    /// a Tokio runtime; typing expiry timers are spawned on it.
    pub fn open(
        room_id: impl Into<String>,
        actor_id: impl Into<String>,
        api: A,
        adapter: Arc<ChannelAdapter<C>>,
        guards: Arc<ConsistencyGuards>,
        config: &Config,
    ) -> Self {
        let room_id = room_id.into();
        let actor_id = actor_id.into();
        let reconciler = StreamReconciler::new(room_id.clone(), guards);
        let engine = MutationEngine::with_config(reconciler.store().clone(), config);
        let typing = TypingAggregator::new(room_id.clone(), actor_id.clone(), config);
        let emitter = TypingEmitter::new(adapter.clone(), room_id.clone(), actor_id.clone(), config);
        let subscriptions = vec![reconciler.attach(&adapter), typing.attach(&adapter)];
        info!(
            target = "lagoon.reconcile",
            room_id = %room_id,
            actor_id = %actor_id,
            connected = adapter.is_connected(),
            "room opened"
        );
        Self {
            room_id,
            actor_id,
            api,
            adapter,
            reconciler,
            engine,
            typing,
            emitter,
            page_size: DEFAULT_PAGE_SIZE,
            _subscriptions: subscriptions,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    pub fn transcript(&self) -> Transcript<P> {
        self.reconciler.snapshot()
    }

    pub fn reconciler(&self) -> &Arc<StreamReconciler<P>> {
        &self.reconciler
    }

    pub fn engine(&self) -> &MutationEngine<Transcript<P>> {
        &self.engine
    }

    pub fn typing(&self) -> watch::Receiver<Vec<String>> {
        self.typing.subscribe()
    }

    pub fn online_count(&self) -> watch::Receiver<u32> {
        self.reconciler.online_count()
    }

    /// Sends through the request/response path. The placeholder is visible at
    /// once; the direct response or the pushed echo, whichever lands first,
    /// turns it into the authoritative record.
    pub async fn send(&self, payload: P) -> SendResult<P> {
        let local_id = new_local_id();
        self.stop_composing();
        let outcome = self
            .engine
            .mutation(format!("send:{local_id}"))
            .optimistic(self.append_placeholder(&local_id, payload.clone()))
            .reconcile({
                let local_id = local_id.clone();
                move |transcript: &mut Transcript<P>, confirmed: &Option<StreamRecord<P>>| {
                    if let Some(record) = confirmed {
                        transcript.confirm(&local_id, record.clone());
                    }
                    Ok(())
                }
            })
            .run(self.api.send_record(&self.room_id, &local_id, &payload))
            .await;
        debug!(
            target = "lagoon.reconcile",
            room_id = %self.room_id,
            local_id = %local_id,
            ok = outcome.is_ok(),
            "send settled"
        );
        outcome
    }

    /// Sends through the push channel. Only the pushed echo confirms the
    /// placeholder; a transport failure removes it.
    pub async fn send_via_channel(&self, payload: P) -> Result<LocalId, MutationError<ChannelError>> {
        let local_id = new_local_id();
        self.stop_composing();
        let message = SendRecord {
            room_id: self.room_id.clone(),
            local_id: local_id.clone(),
            payload: payload.clone(),
        };
        self.engine
            .mutation::<(), ChannelError>(format!("send:{local_id}"))
            .optimistic(self.append_placeholder(&local_id, payload))
            .run(async { self.adapter.send(EVENT_SEND_RECORD, &message) })
            .await?;
        Ok(local_id)
    }

    /// Removes a record for everyone. The tombstone is applied only once the
    /// server confirms; returns false when a newer delete superseded this one.
    pub async fn delete_for_all(&self, record_id: &str) -> Result<bool, MutationError<anyhow::Error>> {
        let target = record_id.to_string();
        let outcome = self
            .engine
            .mutation(format!("delete:{record_id}"))
            .reconcile(move |transcript: &mut Transcript<P>, _: &()| {
                transcript.remove_or_mark(&target, RemovalMode::ForAll);
                Ok(())
            })
            .run(self.api.delete_for_all(&self.room_id, record_id))
            .await?;
        if outcome.is_applied() {
            self.reconciler.note_removed(record_id);
        }
        Ok(outcome.is_applied())
    }

    /// Hides a record from this client only.
    pub fn delete_for_self(&self, record_id: &str) -> bool {
        self.reconciler.hide(record_id)
    }

    pub async fn load_older(&self) -> anyhow::Result<usize> {
        self.reconciler
            .load_older(|before: Option<RecordId>| async move {
                self.api
                    .fetch_older(&self.room_id, before.as_deref(), self.page_size)
                    .await
            })
            .await
    }

    /// Asks the server for presence; the answer arrives as an online-count event.
    pub fn request_online_list(&self) -> Result<(), ChannelError> {
        self.adapter.send(
            EVENT_REQUEST_ONLINE,
            &RoomRef {
                room_id: self.room_id.clone(),
            },
        )
    }

    /// Feeds composer contents to the outbound typing throttle.
    pub fn composer_input(&self, text: &str) -> Result<bool, ChannelError> {
        self.emitter.input_changed(text)
    }

    fn stop_composing(&self) {
        if let Err(err) = self.emitter.stop() {
            debug!(
                target = "lagoon.typing",
                room_id = %self.room_id,
                error = %err,
                "typing stop not delivered"
            );
        }
    }

    fn append_placeholder(&self, local_id: &str, payload: P) -> PlaceholderStep<P> {
        placeholder_step(
            StreamRecord::optimistic(local_id, self.actor_id.clone(), self.room_id.clone(), payload),
            local_id.to_string(),
        )
    }
}

type PlaceholderStep<P> =
    Box<dyn FnOnce(&mut Transcript<P>) -> anyhow::Result<Option<Rollback<Transcript<P>>>> + Send>;

fn placeholder_step<P: RecordPayload>(placeholder: StreamRecord<P>, local_id: LocalId) -> PlaceholderStep<P> {
    Box::new(move |transcript: &mut Transcript<P>| {
        transcript.append_optimistic(placeholder);
        // Targeted removal, so records pushed while the send was in flight survive.
        let rollback: Rollback<Transcript<P>> = Box::new(move |transcript: &mut Transcript<P>| {
            transcript.discard_optimistic(&local_id);
        });
        Ok(Some(rollback))
    })
}

fn new_local_id() -> LocalId {
    format!("tmp-{}", Uuid::new_v4().simple())
}
