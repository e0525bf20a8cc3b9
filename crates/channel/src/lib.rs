//! Card channel abstraction for Keycard hosts.
//!
//! A [`Channel`] hides the platform reader stack behind a uniform model:
//! detection is armed once and publishes [`ChannelEvent`]s, while
//! [`Channel::transmit`] exchanges single APDUs synchronously. The desktop
//! backend ([`PcscChannel`]) drives PC/SC readers from a dedicated thread;
//! mobile NFC backends satisfy the same contract from platform callbacks and
//! are provided by the embedding application.

mod error;
mod event;
mod pcsc;

pub use error::ChannelError;
pub use event::{ChannelEvent, ErrorKind, EventHub};
pub use self::pcsc::{PcscChannel, PcscChannelConfig, ShareMode};

use bytes::Bytes;
use crossbeam_channel::Receiver;

/// UI-session state of the channel.
///
/// Only meaningful for backends with a platform card session (mobile NFC,
/// where `Idle` dismisses the system NFC drawer). The PC/SC backend accepts
/// and reports the state but attaches no behavior to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelSessionState {
    /// No platform session; any NFC drawer is closed.
    #[default]
    Idle,
    /// Actively inviting a card tap.
    WaitingForCard,
}

/// Uniform card-channel contract shared by all transport backends.
///
/// Implementations must serialize [`Channel::transmit`] internally so that
/// APDU exchanges never interleave, whatever thread the caller is on.
pub trait Channel: Send + Sync {
    /// Arm target detection. Idempotent; may be re-armed after
    /// [`Channel::stop_detection`].
    fn start_detection(&self) -> Result<(), ChannelError>;

    /// Disarm target detection. Idempotent.
    fn stop_detection(&self);

    /// Register an event subscriber. Every subscriber receives every event
    /// emitted after the call, in emission order.
    fn subscribe(&self) -> Receiver<ChannelEvent>;

    /// Send one APDU and return the raw response including SW1SW2.
    fn transmit(&self, apdu: &[u8]) -> Result<Bytes, ChannelError>;

    /// Whether a target is currently reachable.
    fn is_target_present(&self) -> bool;

    /// UID of the connected target, if any.
    fn connected_uid(&self) -> Option<String>;

    /// Tear down the current target connection without disarming detection.
    fn disconnect(&self);

    /// Drop the current connection and re-arm detection so that
    /// [`ChannelEvent::TargetDetected`] fires again for the same physical
    /// card. Called after state-mutating operations (INIT, factory reset)
    /// that invalidate the session.
    fn force_scan(&self);

    /// Move the platform UI session. No-op on backends without one.
    fn set_session_state(&self, _state: ChannelSessionState) {}

    /// Current platform UI-session state.
    fn session_state(&self) -> ChannelSessionState {
        ChannelSessionState::Idle
    }
}
