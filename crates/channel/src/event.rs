//! Channel events and subscriber fan-out.

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

/// Events published by a [`crate::Channel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// At least one reader is attached (`true`) or none is (`false`).
    /// Emitted on every transition.
    ReaderAvailabilityChanged(bool),

    /// A card became reachable. Emitted exactly once per transition from
    /// no-card to card-present; re-taps of the same UID while the channel is
    /// still connected are suppressed.
    TargetDetected {
        /// Lowercase hex identifier: the ATR-derived UID on PC/SC, the tag
        /// UID on NFC.
        uid: String,
    },

    /// The card is no longer reachable.
    TargetLost,

    /// Unrecoverable reader-stack failure.
    Error {
        /// Coarse failure class, suitable for the UI layer.
        kind: ErrorKind,
        /// Human-readable detail.
        message: String,
    },
}

/// Failure class carried by [`ChannelEvent::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The reader stack failed (daemon gone, context invalid).
    ReaderStack,
    /// The transport to the card failed.
    Transport,
}

/// Fan-out of [`ChannelEvent`]s to any number of subscribers.
///
/// Senders for dropped receivers are pruned on the next emission.
#[derive(Debug, Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<Sender<ChannelEvent>>>,
}

impl EventHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber; it receives every event emitted after this
    /// call, in emission order.
    pub fn subscribe(&self) -> Receiver<ChannelEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver `event` to all live subscribers.
    pub fn emit(&self, event: ChannelEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
