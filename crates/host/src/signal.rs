//! Structured-event fan-out to the embedding application.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::trace;

/// Callback receiving one UTF-8 JSON string per event.
pub type SignalHandler = Box<dyn Fn(&str) + Send + Sync>;

/// Process-wide signal sink.
///
/// Events are serialized as `{"type": <kebab-case tag>, ...payload}` and
/// handed to the registered handler synchronously under the bus lock, so
/// fan-out never overtakes the state transition that produced the event.
/// A `None` handler drops events without error. Handlers must not call back
/// into the facades; they run on facade worker threads.
#[derive(Clone, Default)]
pub struct SignalBus {
    handler: Arc<Mutex<Option<SignalHandler>>>,
}

impl std::fmt::Debug for SignalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalBus")
            .field("handler", &self.handler.lock().is_some())
            .finish()
    }
}

impl SignalBus {
    /// Create a bus with no handler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the handler; `None` silently drops subsequent events.
    pub fn set_handler(&self, handler: Option<SignalHandler>) {
        *self.handler.lock() = handler;
    }

    /// Convenience wrapper around [`SignalBus::set_handler`].
    pub fn on<F>(&self, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.set_handler(Some(Box::new(handler)));
    }

    /// Emit one event. `payload` fields are merged next to the `type` tag;
    /// a non-object payload is nested under `"event"`.
    pub fn emit(&self, kind: &str, payload: Value) {
        let mut envelope = Map::new();
        envelope.insert("type".to_string(), Value::String(kind.to_string()));
        match payload {
            Value::Object(fields) => {
                for (key, value) in fields {
                    envelope.insert(key, value);
                }
            }
            Value::Null => {}
            other => {
                envelope.insert("event".to_string(), other);
            }
        }

        let serialized = Value::Object(envelope).to_string();
        trace!(signal = %serialized, "emitting signal");

        let guard = self.handler.lock();
        if let Some(handler) = guard.as_ref() {
            handler(&serialized);
        }
    }
}
