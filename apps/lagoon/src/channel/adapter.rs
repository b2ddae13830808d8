use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use transport_bus::{
    DuplexChannel, EVENT_CONNECT, EVENT_DISCONNECT, EVENT_ERROR, Handler, HandlerId,
};

use super::contract;
use crate::config::Config;
use crate::error::ChannelError;

/// Channel-level failure reported to subscribers; not tied to any one caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelFault {
    pub message: String,
}

pub type ErrorHandler = Arc<dyn Fn(&ChannelFault) + Send + Sync>;

/// Handlers and join intent making up one logical subscription.
#[derive(Clone, Default)]
pub struct SubscriptionSpec {
    handlers: Vec<(String, Handler)>,
    join: Option<(String, Value)>,
    on_error: Option<ErrorHandler>,
}

impl SubscriptionSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(mut self, event: &str, handler: F) -> Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.handlers.push((event.to_string(), Arc::new(handler)));
        self
    }

    /// Outbound event sent when the subscription attaches and after every reconnect.
    pub fn join(mut self, event: &str, payload: Value) -> Self {
        self.join = Some((event.to_string(), payload));
        self
    }

    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ChannelFault) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(handler));
        self
    }
}

struct SubscriptionState {
    spec: SubscriptionSpec,
    attached: bool,
    handler_ids: Vec<(String, HandlerId)>,
    holders: usize,
    generation: u64,
}

#[derive(Default)]
struct AdapterState {
    subscriptions: BTreeMap<String, SubscriptionState>,
    next_generation: u64,
}

/// Wraps a [`DuplexChannel`] with idempotent, reference-counted subscriptions,
/// connect-time replay and advisory outbound validation.
pub struct ChannelAdapter<C: DuplexChannel + 'static> {
    channel: C,
    validate: bool,
    state: Mutex<AdapterState>,
    lifecycle: Mutex<Vec<(&'static str, HandlerId)>>,
}

impl<C: DuplexChannel + 'static> ChannelAdapter<C> {
    pub fn new(channel: C, config: &Config) -> Arc<Self> {
        let adapter = Arc::new(Self {
            channel,
            validate: config.validate_outbound && cfg!(debug_assertions),
            state: Mutex::new(AdapterState::default()),
            lifecycle: Mutex::new(Vec::new()),
        });
        adapter.install_lifecycle();
        adapter
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    fn install_lifecycle(self: &Arc<Self>) {
        let mut ids = Vec::with_capacity(3);
        let weak = Arc::downgrade(self);
        ids.push((
            EVENT_CONNECT,
            self.channel
                .on(EVENT_CONNECT, lifecycle_handler(&weak, |adapter, _| adapter.handle_connect())),
        ));
        ids.push((
            EVENT_DISCONNECT,
            self.channel.on(
                EVENT_DISCONNECT,
                lifecycle_handler(&weak, |adapter, payload| adapter.handle_disconnect(payload)),
            ),
        ));
        ids.push((
            EVENT_ERROR,
            self.channel.on(
                EVENT_ERROR,
                lifecycle_handler(&weak, |adapter, payload| adapter.handle_error(payload)),
            ),
        ));
        *self.lifecycle.lock() = ids;
    }

    /// Acquires the subscription `name`. A second acquire of a live name attaches
    /// nothing new and shares the existing handlers; the handlers detach when the
    /// last guard drops. If the channel is down, attachment waits for `connect`.
    pub fn subscribe(self: &Arc<Self>, name: impl Into<String>, spec: SubscriptionSpec) -> SubscriptionGuard {
        let name = name.into();
        let (generation, join) = {
            let mut state = self.state.lock();
            if let Some(existing) = state.subscriptions.get_mut(&name) {
                existing.holders += 1;
                debug!(
                    target = "lagoon.channel",
                    subscription = %name,
                    holders = existing.holders,
                    "subscription already held; reusing"
                );
                let generation = existing.generation;
                drop(state);
                return self.guard(name, generation);
            }
            state.next_generation += 1;
            let generation = state.next_generation;
            let mut subscription = SubscriptionState {
                spec,
                attached: false,
                handler_ids: Vec::new(),
                holders: 1,
                generation,
            };
            let join = if self.channel.is_connected() {
                self.attach(&name, &mut subscription);
                subscription.spec.join.clone()
            } else {
                debug!(
                    target = "lagoon.channel",
                    subscription = %name,
                    "channel offline; deferring attach until connect"
                );
                None
            };
            state.subscriptions.insert(name.clone(), subscription);
            (generation, join)
        };
        if let Some((event, payload)) = join {
            self.emit_join(&name, &event, payload);
        }
        self.guard(name, generation)
    }

    /// Detaches `name` immediately, whatever guards are still outstanding.
    pub fn unsubscribe(&self, name: &str) -> bool {
        let removed = self.state.lock().subscriptions.remove(name);
        match removed {
            Some(mut subscription) => {
                self.detach(name, &mut subscription);
                true
            }
            None => false,
        }
    }

    pub fn is_attached(&self, name: &str) -> bool {
        self.state
            .lock()
            .subscriptions
            .get(name)
            .is_some_and(|s| s.attached)
    }

    pub fn holders(&self, name: &str) -> usize {
        self.state
            .lock()
            .subscriptions
            .get(name)
            .map(|s| s.holders)
            .unwrap_or(0)
    }

    /// Sends an outbound event. Contract checks only log; transport failures are
    /// returned to the caller and never retried here.
    pub fn send<T: Serialize>(&self, event: &str, payload: &T) -> Result<(), ChannelError> {
        let value = serde_json::to_value(payload)?;
        self.emit(event, value)
    }

    fn emit(&self, event: &str, payload: Value) -> Result<(), ChannelError> {
        if self.validate {
            for violation in contract::validate(event, &payload) {
                warn!(
                    target = "lagoon.channel",
                    event,
                    violation = ?violation,
                    "outbound event does not match contract"
                );
            }
        }
        self.channel.emit(event, payload).map_err(|err| {
            warn!(target = "lagoon.channel", event, error = %err, "outbound send failed");
            ChannelError::from(err)
        })
    }

    fn emit_join(&self, name: &str, event: &str, payload: Value) {
        if let Err(err) = self.emit(event, payload) {
            warn!(
                target = "lagoon.channel",
                subscription = %name,
                event,
                error = %err,
                "join intent not delivered; will replay on next connect"
            );
        }
    }

    fn guard(self: &Arc<Self>, name: String, generation: u64) -> SubscriptionGuard {
        let weak = Arc::downgrade(self);
        let release_name = name.clone();
        SubscriptionGuard {
            name,
            release: Some(Box::new(move || {
                if let Some(adapter) = weak.upgrade() {
                    adapter.release(&release_name, generation);
                }
            })),
        }
    }

    fn release(&self, name: &str, generation: u64) {
        let removed = {
            let mut state = self.state.lock();
            let Some(subscription) = state.subscriptions.get_mut(name) else {
                return;
            };
            // A forced unsubscribe followed by a fresh subscribe reuses the name.
            if subscription.generation != generation {
                return;
            }
            subscription.holders = subscription.holders.saturating_sub(1);
            if subscription.holders > 0 {
                return;
            }
            state.subscriptions.remove(name)
        };
        if let Some(mut subscription) = removed {
            self.detach(name, &mut subscription);
        }
    }

    fn attach(&self, name: &str, subscription: &mut SubscriptionState) {
        if subscription.attached {
            return;
        }
        for (event, handler) in &subscription.spec.handlers {
            let id = self.channel.on(event, Arc::clone(handler));
            subscription.handler_ids.push((event.clone(), id));
        }
        subscription.attached = true;
        debug!(
            target = "lagoon.channel",
            subscription = %name,
            handlers = subscription.handler_ids.len(),
            "subscription attached"
        );
    }

    fn detach(&self, name: &str, subscription: &mut SubscriptionState) {
        for (event, id) in subscription.handler_ids.drain(..) {
            self.channel.off(&event, id);
        }
        subscription.attached = false;
        debug!(target = "lagoon.channel", subscription = %name, "subscription detached");
    }

    fn handle_connect(&self) {
        let joins: Vec<(String, String, Value)> = {
            let mut state = self.state.lock();
            let mut joins = Vec::new();
            for (name, subscription) in state.subscriptions.iter_mut() {
                self.attach(name, subscription);
                if let Some((event, payload)) = &subscription.spec.join {
                    joins.push((name.clone(), event.clone(), payload.clone()));
                }
            }
            joins
        };
        info!(
            target = "lagoon.channel",
            replayed = joins.len(),
            "channel connected; replaying subscriptions"
        );
        for (name, event, payload) in joins {
            self.emit_join(&name, &event, payload);
        }
    }

    fn handle_disconnect(&self, payload: &Value) {
        let reason = payload
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        info!(
            target = "lagoon.channel",
            reason,
            subscriptions = self.state.lock().subscriptions.len(),
            "channel disconnected; subscriptions kept for replay"
        );
    }

    fn handle_error(&self, payload: &Value) {
        let fault = ChannelFault {
            message: payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("channel error")
                .to_string(),
        };
        let handlers: Vec<ErrorHandler> = self
            .state
            .lock()
            .subscriptions
            .values()
            .filter(|s| s.attached)
            .filter_map(|s| s.spec.on_error.clone())
            .collect();
        warn!(
            target = "lagoon.channel",
            error = %fault.message,
            handlers = handlers.len(),
            "channel error"
        );
        for handler in handlers {
            handler(&fault);
        }
    }
}

impl<C: DuplexChannel + 'static> Drop for ChannelAdapter<C> {
    fn drop(&mut self) {
        for (event, id) in self.lifecycle.get_mut().drain(..) {
            self.channel.off(event, id);
        }
        let subscriptions = std::mem::take(&mut self.state.get_mut().subscriptions);
        for (name, mut subscription) in subscriptions {
            self.detach(&name, &mut subscription);
        }
    }
}

fn lifecycle_handler<C, F>(adapter: &Weak<ChannelAdapter<C>>, f: F) -> Handler
where
    C: DuplexChannel + 'static,
    F: Fn(&ChannelAdapter<C>, &Value) + Send + Sync + 'static,
{
    let adapter = adapter.clone();
    Arc::new(move |payload| {
        if let Some(adapter) = adapter.upgrade() {
            f(&adapter, payload);
        }
    })
}

/// Scoped hold on a subscription; dropping it releases the hold.
pub struct SubscriptionGuard {
    name: String,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SubscriptionGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionGuard")
            .field("name", &self.name)
            .finish()
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EVENT_JOIN_ROOM, EVENT_RECORD_NEW, EVENT_TYPING};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use transport_bus::{BusError, LocalChannel};

    fn adapter() -> Arc<ChannelAdapter<Arc<LocalChannel>>> {
        ChannelAdapter::new(Arc::new(LocalChannel::new()), &Config::default())
    }

    fn counting_spec(hits: &Arc<AtomicUsize>, event: &str) -> SubscriptionSpec {
        let hits = hits.clone();
        SubscriptionSpec::new().on(event, move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn joins(channel: &LocalChannel) -> usize {
        channel
            .outbound()
            .iter()
            .filter(|m| m.event == EVENT_JOIN_ROOM)
            .count()
    }

    #[test_timeout::timeout]
    fn subscribing_twice_attaches_once() {
        let adapter = adapter();
        adapter.channel().connect();
        let hits = Arc::new(AtomicUsize::new(0));

        let _first = adapter.subscribe("room:r1", counting_spec(&hits, EVENT_RECORD_NEW));
        let _second = adapter.subscribe("room:r1", counting_spec(&hits, EVENT_RECORD_NEW));

        assert_eq!(adapter.channel().handler_count(EVENT_RECORD_NEW), 1);
        adapter.channel().deliver(EVENT_RECORD_NEW, json!({}));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.holders("room:r1"), 2);
    }

    #[test_timeout::timeout]
    fn last_guard_detaches() {
        let adapter = adapter();
        adapter.channel().connect();
        let hits = Arc::new(AtomicUsize::new(0));

        let first = adapter.subscribe("room:r1", counting_spec(&hits, EVENT_RECORD_NEW));
        let second = adapter.subscribe("room:r1", counting_spec(&hits, EVENT_RECORD_NEW));
        drop(first);
        assert!(adapter.is_attached("room:r1"));
        drop(second);
        assert!(!adapter.is_attached("room:r1"));
        assert_eq!(adapter.channel().handler_count(EVENT_RECORD_NEW), 0);
    }

    #[test_timeout::timeout]
    fn attach_waits_for_connect() {
        let adapter = adapter();
        let hits = Arc::new(AtomicUsize::new(0));
        let _guard = adapter.subscribe(
            "room:r1",
            counting_spec(&hits, EVENT_RECORD_NEW).join(EVENT_JOIN_ROOM, json!({"room_id": "r1"})),
        );

        assert!(!adapter.is_attached("room:r1"));
        assert_eq!(adapter.channel().handler_count(EVENT_RECORD_NEW), 0);

        adapter.channel().connect();
        assert!(adapter.is_attached("room:r1"));
        assert_eq!(joins(adapter.channel()), 1);
        adapter.channel().deliver(EVENT_RECORD_NEW, json!({}));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test_timeout::timeout]
    fn reconnect_replays_join_without_duplicate_handlers() {
        let adapter = adapter();
        adapter.channel().connect();
        let hits = Arc::new(AtomicUsize::new(0));
        let _guard = adapter.subscribe(
            "room:r1",
            counting_spec(&hits, EVENT_RECORD_NEW).join(EVENT_JOIN_ROOM, json!({"room_id": "r1"})),
        );
        assert_eq!(joins(adapter.channel()), 1);

        adapter.channel().disconnect("ping timeout");
        adapter.channel().connect();

        assert_eq!(joins(adapter.channel()), 2);
        assert_eq!(adapter.channel().handler_count(EVENT_RECORD_NEW), 1);
    }

    #[test_timeout::timeout]
    fn unsubscribe_leaves_other_subscriptions_on_same_event() {
        let adapter = adapter();
        adapter.channel().connect();
        let records = Arc::new(AtomicUsize::new(0));
        let typing = Arc::new(AtomicUsize::new(0));
        let _records = adapter.subscribe("room:r1:records", counting_spec(&records, EVENT_TYPING));
        let _typing = adapter.subscribe("room:r1:typing", counting_spec(&typing, EVENT_TYPING));

        assert!(adapter.unsubscribe("room:r1:records"));
        adapter.channel().deliver(EVENT_TYPING, json!({}));

        assert_eq!(records.load(Ordering::SeqCst), 0);
        assert_eq!(typing.load(Ordering::SeqCst), 1);
    }

    #[test_timeout::timeout]
    fn stale_guard_does_not_release_resubscribed_name() {
        let adapter = adapter();
        adapter.channel().connect();
        let hits = Arc::new(AtomicUsize::new(0));

        let old = adapter.subscribe("room:r1", counting_spec(&hits, EVENT_RECORD_NEW));
        adapter.unsubscribe("room:r1");
        let _fresh = adapter.subscribe("room:r1", counting_spec(&hits, EVENT_RECORD_NEW));
        drop(old);

        assert!(adapter.is_attached("room:r1"));
        assert_eq!(adapter.holders("room:r1"), 1);
    }

    #[test_timeout::timeout]
    fn send_forwards_even_when_contract_is_violated() {
        let adapter = adapter();
        adapter.channel().connect();

        adapter
            .send("room:leave", &json!({"room_id": "r1"}))
            .expect("advisory validation never blocks");
        adapter
            .send(EVENT_JOIN_ROOM, &json!({}))
            .expect("missing fields never block");

        assert_eq!(adapter.channel().outbound().len(), 2);
    }

    #[test_timeout::timeout]
    fn send_surfaces_transport_errors() {
        let adapter = adapter();
        let err = adapter
            .send(EVENT_JOIN_ROOM, &json!({"room_id": "r1"}))
            .expect_err("offline");
        assert!(matches!(err, ChannelError::Transport(BusError::Closed)));
    }

    #[test_timeout::timeout]
    fn channel_errors_reach_attached_error_handlers() {
        let adapter = adapter();
        adapter.channel().connect();
        let faults = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let _guard = adapter.subscribe("room:r1", {
            let faults = faults.clone();
            SubscriptionSpec::new().on_error(move |fault| faults.lock().push(fault.message.clone()))
        });

        adapter.channel().fail("upgrade rejected");

        assert_eq!(faults.lock().as_slice(), ["upgrade rejected".to_string()]);
    }

    #[test_timeout::timeout]
    fn dropping_adapter_releases_channel_handlers() {
        let channel = Arc::new(LocalChannel::new());
        let adapter = ChannelAdapter::new(channel.clone(), &Config::default());
        channel.connect();
        let hits = Arc::new(AtomicUsize::new(0));
        let guard = adapter.subscribe("room:r1", counting_spec(&hits, EVENT_RECORD_NEW));

        drop(adapter);
        assert_eq!(channel.handler_count(EVENT_RECORD_NEW), 0);
        assert_eq!(channel.handler_count(EVENT_CONNECT), 0);
        drop(guard);
    }
}
