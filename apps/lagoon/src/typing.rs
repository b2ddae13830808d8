//! Typing indicators.
//!
//! [`TypingAggregator`] turns noisy start/stop signals from other actors into a
//! stable "who is typing" list. Every entry is removed by its own timer: the
//! expiry timer after a start, or the debounce timer after a stop. A fresh
//! start during the debounce window cancels the pending removal, so a quick
//! stop/start pair never flickers the actor out of the list.
//!
//! [`TypingEmitter`] is the outbound half for the local actor.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use transport_bus::DuplexChannel;

use crate::channel::{ChannelAdapter, SubscriptionGuard, SubscriptionSpec};
use crate::config::Config;
use crate::error::ChannelError;
use crate::protocol::{EVENT_TYPING, EVENT_TYPING_START, EVENT_TYPING_STOP, TypingPhase, TypingSignal};

struct TypingEntry {
    generation: u64,
    /// When the pending timer removes the actor.
    expires_at: Instant,
    stopping: bool,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct TypingState {
    entries: HashMap<String, TypingEntry>,
    next_generation: u64,
}

pub struct TypingAggregator {
    room_id: String,
    local_actor: String,
    expiry: Duration,
    stop_debounce: Duration,
    runtime: Handle,
    state: Mutex<TypingState>,
    typing: watch::Sender<Vec<String>>,
}

impl TypingAggregator {
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new(room_id: impl Into<String>, local_actor: impl Into<String>, config: &Config) -> Arc<Self> {
        let (typing, _) = watch::channel(Vec::new());
        Arc::new(Self {
            room_id: room_id.into(),
            local_actor: local_actor.into(),
            expiry: config.typing_expiry,
            stop_debounce: config.typing_stop_debounce,
            runtime: Handle::current(),
            state: Mutex::new(TypingState::default()),
            typing,
        })
    }

    pub fn subscription_name(&self) -> String {
        format!("room:{}:typing", self.room_id)
    }

    pub fn attach<C: DuplexChannel + 'static>(
        self: &Arc<Self>,
        adapter: &Arc<ChannelAdapter<C>>,
    ) -> SubscriptionGuard {
        let weak = Arc::downgrade(self);
        let spec = SubscriptionSpec::new().on(EVENT_TYPING, move |payload: &Value| {
            if let Some(aggregator) = weak.upgrade() {
                aggregator.handle_event(payload);
            }
        });
        adapter.subscribe(self.subscription_name(), spec)
    }

    /// Actors currently typing, sorted.
    pub fn typing_actors(&self) -> Vec<String> {
        self.typing.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<String>> {
        self.typing.subscribe()
    }

    pub fn handle_signal(self: &Arc<Self>, signal: &TypingSignal) {
        if signal.room_id != self.room_id {
            return;
        }
        match signal.phase {
            Some(TypingPhase::Stop) => self.stop(&signal.actor_id),
            Some(TypingPhase::Start) | None => self.start(&signal.actor_id),
        }
    }

    /// Marks `actor_id` typing, or pushes its expiry out if it already is.
    pub fn start(self: &Arc<Self>, actor_id: &str) {
        if actor_id == self.local_actor {
            return;
        }
        let mut state = self.state.lock();
        state.next_generation += 1;
        let generation = state.next_generation;
        let expires_at = Instant::now() + self.expiry;
        let timer = self.schedule_removal(actor_id, generation, expires_at);
        let previous = state.entries.insert(
            actor_id.to_string(),
            TypingEntry {
                generation,
                expires_at,
                stopping: false,
                timer,
            },
        );
        match previous {
            Some(previous) => {
                previous.timer.abort();
                trace!(target = "lagoon.typing", room_id = %self.room_id, actor_id, "typing refreshed");
            }
            None => {
                debug!(target = "lagoon.typing", room_id = %self.room_id, actor_id, "typing started");
                self.publish(&state);
            }
        }
    }

    /// Schedules removal after the debounce delay. The actor stays listed until then.
    pub fn stop(self: &Arc<Self>, actor_id: &str) {
        let mut state = self.state.lock();
        state.next_generation += 1;
        let generation = state.next_generation;
        let Some(entry) = state.entries.get_mut(actor_id) else {
            return;
        };
        if entry.stopping {
            return;
        }
        entry.timer.abort();
        entry.generation = generation;
        entry.stopping = true;
        entry.expires_at = Instant::now() + self.stop_debounce;
        entry.timer = self.schedule_removal(actor_id, generation, entry.expires_at);
    }

    /// Deadline of the actor's pending removal, if it is listed.
    pub fn expires_at(&self, actor_id: &str) -> Option<Instant> {
        self.state.lock().entries.get(actor_id).map(|entry| entry.expires_at)
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        for (_, entry) in state.entries.drain() {
            entry.timer.abort();
        }
        self.publish(&state);
    }

    /// The deadline is fixed by the caller, so a late first poll of the timer
    /// task does not push the removal out.
    fn schedule_removal(self: &Arc<Self>, actor_id: &str, generation: u64, deadline: Instant) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let actor_id = actor_id.to_string();
        self.runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(aggregator) = weak.upgrade() {
                aggregator.remove_if_current(&actor_id, generation);
            }
        })
    }

    fn remove_if_current(&self, actor_id: &str, generation: u64) {
        let mut state = self.state.lock();
        let current = state
            .entries
            .get(actor_id)
            .is_some_and(|entry| entry.generation == generation);
        if !current {
            return;
        }
        state.entries.remove(actor_id);
        debug!(target = "lagoon.typing", room_id = %self.room_id, actor_id, "typing ended");
        self.publish(&state);
    }

    fn publish(&self, state: &TypingState) {
        let mut actors: Vec<String> = state.entries.keys().cloned().collect();
        actors.sort();
        self.typing.send_if_modified(|current| {
            if *current == actors {
                return false;
            }
            *current = actors;
            true
        });
    }

    fn handle_event(self: &Arc<Self>, payload: &Value) {
        match serde_json::from_value::<TypingSignal>(payload.clone()) {
            Ok(signal) => self.handle_signal(&signal),
            Err(err) => warn!(
                target = "lagoon.typing",
                room_id = %self.room_id,
                error = %err,
                "undecodable typing signal"
            ),
        }
    }
}

impl Drop for TypingAggregator {
    fn drop(&mut self) {
        for entry in self.state.get_mut().entries.values() {
            entry.timer.abort();
        }
    }
}

#[derive(Debug, Default)]
struct EmitterState {
    last_start: Option<Instant>,
    active: bool,
}

/// Throttles the local actor's outbound typing signals.
pub struct TypingEmitter<C: DuplexChannel + 'static> {
    adapter: Arc<ChannelAdapter<C>>,
    room_id: String,
    actor_id: String,
    interval: Duration,
    state: Mutex<EmitterState>,
}

impl<C: DuplexChannel + 'static> TypingEmitter<C> {
    pub fn new(
        adapter: Arc<ChannelAdapter<C>>,
        room_id: impl Into<String>,
        actor_id: impl Into<String>,
        config: &Config,
    ) -> Self {
        Self {
            adapter,
            room_id: room_id.into(),
            actor_id: actor_id.into(),
            interval: config.typing_emit_interval,
            state: Mutex::new(EmitterState::default()),
        }
    }

    /// Call on every composer change. Sends at most one start per interval while
    /// text is present, and a stop as soon as it is cleared. Returns whether an
    /// event went out.
    pub fn input_changed(&self, text: &str) -> Result<bool, ChannelError> {
        if text.trim().is_empty() {
            return self.stop();
        }
        let now = Instant::now();
        {
            let mut state = self.state.lock();
            if state
                .last_start
                .is_some_and(|at| now.duration_since(at) < self.interval)
            {
                return Ok(false);
            }
            state.last_start = Some(now);
            state.active = true;
        }
        self.emit(EVENT_TYPING_START).inspect_err(|_| {
            // Let the next keystroke retry instead of waiting out the interval.
            self.state.lock().last_start = None;
        })?;
        Ok(true)
    }

    /// Sends a stop if a start went out since the last stop.
    pub fn stop(&self) -> Result<bool, ChannelError> {
        let was_active = {
            let mut state = self.state.lock();
            state.last_start = None;
            std::mem::take(&mut state.active)
        };
        if !was_active {
            return Ok(false);
        }
        self.emit(EVENT_TYPING_STOP)?;
        Ok(true)
    }

    fn emit(&self, event: &str) -> Result<(), ChannelError> {
        let signal = TypingSignal {
            room_id: self.room_id.clone(),
            actor_id: self.actor_id.clone(),
            phase: None,
        };
        self.adapter.send(event, &signal)
    }
}
