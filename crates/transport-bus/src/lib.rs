//! Duplex event channel primitive shared by the lagoon client core.
//!
//! A channel exposes named-event handler registration (`on`/`off`), outbound
//! `emit`, and a `connected` flag. Connection lifecycle is reported through the
//! same registration mechanism using the reserved [`EVENT_CONNECT`],
//! [`EVENT_DISCONNECT`] and [`EVENT_ERROR`] event names.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use thiserror::Error;
use tracing::trace;

pub const EVENT_CONNECT: &str = "connect";
pub const EVENT_DISCONNECT: &str = "disconnect";
pub const EVENT_ERROR: &str = "error";

/// Opaque token returned by [`DuplexChannel::on`]; the only way to detach a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

pub trait DuplexChannel: Send + Sync {
    fn on(&self, event: &str, handler: Handler) -> HandlerId;
    /// Detaches exactly the handler registered under `id`. Returns false when it was not attached.
    fn off(&self, event: &str, id: HandlerId) -> bool;
    fn emit(&self, event: &str, payload: Value) -> BusResult<()>;
    fn is_connected(&self) -> bool;
}

impl<T: DuplexChannel + ?Sized> DuplexChannel for Arc<T> {
    fn on(&self, event: &str, handler: Handler) -> HandlerId {
        (**self).on(event, handler)
    }

    fn off(&self, event: &str, id: HandlerId) -> bool {
        (**self).off(event, id)
    }

    fn emit(&self, event: &str, payload: Value) -> BusResult<()> {
        (**self).emit(event, payload)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub event: String,
    pub payload: Value,
}

/// Simple in-memory channel for tests and simulations.
///
/// Outbound emits are recorded instead of sent anywhere; inbound traffic is
/// injected with [`LocalChannel::deliver`]. Handlers survive disconnects, the
/// same way a socket client keeps its listeners across reconnects.
#[derive(Default)]
pub struct LocalChannel {
    handlers: RwLock<HashMap<String, Vec<(HandlerId, Handler)>>>,
    next_id: AtomicU64,
    connected: AtomicBool,
    outbound: Mutex<Vec<BusMessage>>,
    send_failure: Mutex<Option<String>>,
}

impl LocalChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self) {
        if self.connected.swap(true, Ordering::SeqCst) {
            return;
        }
        self.dispatch(EVENT_CONNECT, &Value::Null);
    }

    pub fn disconnect(&self, reason: &str) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        self.dispatch(EVENT_DISCONNECT, &serde_json::json!({ "reason": reason }));
    }

    /// Raises a channel-level error without changing connection state.
    pub fn fail(&self, message: &str) {
        self.dispatch(EVENT_ERROR, &serde_json::json!({ "message": message }));
    }

    /// Makes subsequent emits fail with a transport error until cleared with `None`.
    pub fn set_send_failure(&self, failure: Option<String>) {
        *self.send_failure.lock() = failure;
    }

    /// Pushes an inbound event to every handler bound to `event`. Returns how many ran.
    pub fn deliver(&self, event: &str, payload: Value) -> usize {
        self.dispatch(event, &payload)
    }

    pub fn outbound(&self) -> Vec<BusMessage> {
        self.outbound.lock().clone()
    }

    pub fn take_outbound(&self) -> Vec<BusMessage> {
        std::mem::take(&mut *self.outbound.lock())
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers
            .read()
            .get(event)
            .map(|list| list.len())
            .unwrap_or(0)
    }

    fn dispatch(&self, event: &str, payload: &Value) -> usize {
        // Snapshot the handler list so handlers may call back into on/off.
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .get(event)
            .map(|list| list.iter().map(|(_, handler)| Arc::clone(handler)).collect())
            .unwrap_or_default();
        trace!(target = "bus.local", event, handlers = handlers.len(), "dispatch");
        for handler in &handlers {
            handler(payload);
        }
        handlers.len()
    }
}

impl DuplexChannel for LocalChannel {
    fn on(&self, event: &str, handler: Handler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(event.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    fn off(&self, event: &str, id: HandlerId) -> bool {
        let mut guard = self.handlers.write();
        let Some(list) = guard.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            guard.remove(event);
        }
        removed
    }

    fn emit(&self, event: &str, payload: Value) -> BusResult<()> {
        if !self.is_connected() {
            return Err(BusError::Closed);
        }
        if let Some(reason) = self.send_failure.lock().clone() {
            return Err(BusError::Transport(reason));
        }
        self.outbound.lock().push(BusMessage {
            event: event.to_string(),
            payload,
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
