//! PC/SC desktop backend.
//!
//! Detection runs in a dedicated thread blocking in `SCardGetStatusChange`
//! with an infinite timeout; short-timer polling is rejected because it
//! desynchronizes with upper-layer timers. `Context::cancel` unblocks the
//! wait for stop and rescan requests.

use std::collections::HashMap;
use std::ffi::CString;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use pcsc::{Card, Context, Disposition, Protocols, ReaderState, Scope, State};
use tracing::{debug, trace, warn};

use crate::event::ErrorKind;
use crate::{Channel, ChannelError, ChannelEvent, ChannelSessionState, EventHub};

/// Card sharing mode for reader connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShareMode {
    /// Allow other applications to share the card.
    #[default]
    Shared,
    /// Take exclusive access to the card.
    Exclusive,
}

impl From<ShareMode> for pcsc::ShareMode {
    fn from(mode: ShareMode) -> Self {
        match mode {
            ShareMode::Shared => Self::Shared,
            ShareMode::Exclusive => Self::Exclusive,
        }
    }
}

/// Configuration for [`PcscChannel`].
#[derive(Debug, Clone, Default)]
pub struct PcscChannelConfig {
    /// Sharing mode used when connecting to a detected card.
    pub share_mode: ShareMode,
}

/// PC/SC implementation of [`Channel`].
pub struct PcscChannel {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PcscChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcscChannel")
            .field("connected_uid", &self.inner.connected_uid.lock())
            .field("running", &self.inner.running.load(Ordering::Relaxed))
            .finish()
    }
}

struct Inner {
    context: Context,
    config: PcscChannelConfig,
    events: EventHub,
    card: Mutex<Option<Card>>,
    connected_uid: Mutex<Option<String>>,
    connected_reader: Mutex<Option<String>>,
    readers_available: AtomicBool,
    running: AtomicBool,
    rescan: AtomicBool,
    session_state: Mutex<ChannelSessionState>,
    detection: Mutex<Option<JoinHandle<()>>>,
}

impl PcscChannel {
    /// Establish a PC/SC context with the default configuration.
    pub fn new() -> Result<Self, ChannelError> {
        Self::with_config(PcscChannelConfig::default())
    }

    /// Establish a PC/SC context with the given configuration.
    pub fn with_config(config: PcscChannelConfig) -> Result<Self, ChannelError> {
        let context = Context::establish(Scope::User)?;
        Ok(Self {
            inner: Arc::new(Inner {
                context,
                config,
                events: EventHub::new(),
                card: Mutex::new(None),
                connected_uid: Mutex::new(None),
                connected_reader: Mutex::new(None),
                readers_available: AtomicBool::new(false),
                running: AtomicBool::new(false),
                rescan: AtomicBool::new(false),
                session_state: Mutex::new(ChannelSessionState::Idle),
                detection: Mutex::new(None),
            }),
        })
    }
}

impl Channel for PcscChannel {
    fn start_detection(&self) -> Result<(), ChannelError> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("keycard-pcsc-detect".into())
            .spawn(move || detection_loop(&inner))
            .map_err(|e| ChannelError::Reader(e.to_string()))?;

        *self.inner.detection.lock() = Some(handle);
        Ok(())
    }

    fn stop_detection(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        // Unblock the status-change wait so the thread observes the flag.
        let _ = self.inner.context.cancel();
        if let Some(handle) = self.inner.detection.lock().take() {
            let _ = handle.join();
        }
    }

    fn subscribe(&self) -> Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    fn transmit(&self, apdu: &[u8]) -> Result<Bytes, ChannelError> {
        // The card lock also serializes concurrent transmits.
        let mut guard = self.inner.card.lock();
        let card = guard.as_mut().ok_or(ChannelError::NotConnected)?;

        let mut response_buffer = [0u8; pcsc::MAX_BUFFER_SIZE_EXTENDED];
        match card.transmit(apdu, &mut response_buffer) {
            Ok(response) if response.len() >= 2 => {
                trace!(len = response.len(), "APDU exchange complete");
                Ok(Bytes::copy_from_slice(response))
            }
            Ok(response) => Err(ChannelError::Protocol(format!(
                "short response: {} bytes",
                response.len()
            ))),
            Err(e @ (pcsc::Error::ResetCard | pcsc::Error::RemovedCard)) => {
                warn!(error = %e, "card vanished mid-exchange");
                *guard = None;
                drop(guard);
                *self.inner.connected_uid.lock() = None;
                *self.inner.connected_reader.lock() = None;
                self.inner.events.emit(ChannelEvent::TargetLost);
                Err(ChannelError::Transport(e.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn is_target_present(&self) -> bool {
        self.inner.card.lock().is_some()
    }

    fn connected_uid(&self) -> Option<String> {
        self.inner.connected_uid.lock().clone()
    }

    fn disconnect(&self) {
        self.inner.teardown_card();
    }

    fn force_scan(&self) {
        debug!("force scan requested");
        self.inner.teardown_card();
        self.inner.rescan.store(true, Ordering::Release);
        // Unblock the status-change wait; the loop re-reports present cards.
        let _ = self.inner.context.cancel();
    }

    fn set_session_state(&self, state: ChannelSessionState) {
        *self.inner.session_state.lock() = state;
    }

    fn session_state(&self) -> ChannelSessionState {
        *self.inner.session_state.lock()
    }
}

impl Drop for PcscChannel {
    fn drop(&mut self) {
        self.stop_detection();
        self.inner.teardown_card();
    }
}

impl Inner {
    fn teardown_card(&self) {
        if let Some(card) = self.card.lock().take() {
            let _ = card.disconnect(Disposition::LeaveCard);
        }
        *self.connected_uid.lock() = None;
        *self.connected_reader.lock() = None;
    }

    fn connect_card(&self, reader: &CString, uid: String) {
        match self.context.connect(
            reader,
            self.config.share_mode.into(),
            Protocols::ANY,
        ) {
            Ok(card) => {
                *self.card.lock() = Some(card);
                *self.connected_uid.lock() = Some(uid.clone());
                *self.connected_reader.lock() =
                    Some(reader.to_string_lossy().into_owned());
                debug!(%uid, "card connected");
                self.events.emit(ChannelEvent::TargetDetected { uid });
            }
            Err(e) => {
                warn!(error = %e, "failed to connect detected card");
                self.events.emit(ChannelEvent::Error {
                    kind: ErrorKind::Transport,
                    message: e.to_string(),
                });
            }
        }
    }
}

/// UID reported for a PC/SC target: last two bytes of the ATR, lowercase hex.
fn uid_from_atr(atr: &[u8]) -> String {
    let tail = if atr.len() >= 2 {
        &atr[atr.len() - 2..]
    } else {
        atr
    };
    hex::encode(tail)
}


fn detection_loop(inner: &Arc<Inner>) {
    // Last observed reader state, keyed by reader name. Entries start
    // UNAWARE so a card already present is reported on the first pass.
    let mut known: HashMap<String, State> = HashMap::new();
    // None until the first evaluation; the initial availability is always
    // reported so the session layer can leave its unknown state.
    let mut last_available: Option<bool> = None;

    while inner.running.load(Ordering::Acquire) {
        if inner.rescan.swap(false, Ordering::AcqRel) {
            known.clear();
        }

        let readers = match inner.context.list_readers_owned() {
            Ok(readers) => readers,
            Err(e) => {
                warn!(error = %e, "failed to enumerate readers");
                inner.readers_available.store(false, Ordering::Release);
                if last_available != Some(false) {
                    last_available = Some(false);
                    inner
                        .events
                        .emit(ChannelEvent::ReaderAvailabilityChanged(false));
                }
                inner.events.emit(ChannelEvent::Error {
                    kind: ErrorKind::ReaderStack,
                    message: e.to_string(),
                });
                thread::sleep(Duration::from_secs(1));
                continue;
            }
        };

        let available = !readers.is_empty();
        inner.readers_available.store(available, Ordering::Release);
        if last_available != Some(available) {
            debug!(available, "reader availability changed");
            last_available = Some(available);
            inner
                .events
                .emit(ChannelEvent::ReaderAvailabilityChanged(available));
        }

        // Plug-and-play pseudo reader wakes the wait on reader add/remove.
        // Its state is tracked like any reader's, or the wait would return
        // immediately on every iteration.
        let pnp_name = pcsc::PNP_NOTIFICATION().to_string_lossy().into_owned();
        let pnp_last = known.get(&pnp_name).copied().unwrap_or(State::UNAWARE);
        let mut states = vec![ReaderState::new(pcsc::PNP_NOTIFICATION(), pnp_last)];
        for reader in &readers {
            let name = reader.to_string_lossy().into_owned();
            let last = known.get(&name).copied().unwrap_or(State::UNAWARE);
            states.push(ReaderState::new(reader.clone(), last));
        }

        match inner
            .context
            .get_status_change(None::<Duration>, &mut states)
        {
            Ok(()) => {}
            Err(pcsc::Error::Cancelled) => continue,
            Err(pcsc::Error::UnknownReader | pcsc::Error::NoReadersAvailable) => {
                // Reader set changed under us; re-enumerate.
                known.clear();
                continue;
            }
            Err(e) => {
                warn!(error = %e, "status-change wait failed");
                inner.events.emit(ChannelEvent::Error {
                    kind: ErrorKind::ReaderStack,
                    message: e.to_string(),
                });
                thread::sleep(Duration::from_secs(1));
                continue;
            }
        }

        if !inner.running.load(Ordering::Acquire) {
            break;
        }

        for rs in &states {
            let name = rs.name().to_string_lossy().into_owned();
            let event_state = rs.event_state();
            if name == pnp_name {
                known.insert(name, event_state & !State::CHANGED);
                continue;
            }
            let was_present = known
                .get(&name)
                .is_some_and(|s| s.contains(State::PRESENT));
            let is_present =
                event_state.contains(State::PRESENT) && !event_state.contains(State::MUTE);

            if is_present && !was_present {
                let uid = uid_from_atr(rs.atr());
                let already_connected = inner.card.lock().is_some()
                    && inner.connected_uid.lock().as_deref() == Some(uid.as_str());
                if already_connected {
                    // Auto-resume of the same card must not look like a swap.
                    trace!(%uid, "suppressing re-tap of connected card");
                } else if let Ok(reader) = CString::new(name.clone()) {
                    inner.connect_card(&reader, uid);
                }
            } else if !is_present && was_present {
                let holds_card =
                    inner.connected_reader.lock().as_deref() == Some(name.as_str());
                if holds_card {
                    debug!(reader = %name, "card removed");
                    inner.teardown_card();
                    inner.events.emit(ChannelEvent::TargetLost);
                }
            }

            known.insert(name, event_state & !State::CHANGED);
        }

        known.retain(|name, _| {
            name == &pnp_name
                || readers
                    .iter()
                    .any(|r| r.to_string_lossy() == name.as_str())
        });
    }
}
