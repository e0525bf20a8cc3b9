//! Session facade: single-card lifecycle and flat procedural API.
//!
//! The manager owns one channel, at most one command set (created fresh per
//! card insertion) and the pairing store, and drives the session state
//! machine from channel events. Card-touching operations serialize on a
//! single operation mutex; the heavy connect sequence runs on a background
//! thread so channel event dispatch is never blocked on card I/O.

mod state;

pub use state::SessionState;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::{debug, warn};

use keycard_channel::{Channel, ChannelEvent, ChannelSessionState, ErrorKind};

use crate::command_set::{CommandSet, ExportOption, parse_path};
use crate::constants::{DEFAULT_PAIRING_PASSWORD, data, paths};
use crate::pairing_store::PairingStore;
use crate::secrets::Secrets;
use crate::signal::SignalBus;
use crate::types::{ApplicationInfo, ApplicationStatus, Keypair, Metadata, PairingInfo};
use crate::{Error, Result, crypto};

/// Keys exported for a login.
#[derive(Debug, Clone)]
pub struct LoginKeys {
    /// Whisper (chat) keypair, with private key.
    pub whisper: Keypair,
    /// Database encryption keypair, with private key.
    pub encryption: Keypair,
}

/// Keys exported for a full account recovery.
#[derive(Debug, Clone)]
pub struct RecoveryKeys {
    /// Database encryption keypair, with private key.
    pub encryption: Keypair,
    /// Whisper (chat) keypair, with private key.
    pub whisper: Keypair,
    /// EIP-1581 root, public only.
    pub eip1581: Keypair,
    /// Wallet root, extended public when the applet supports it.
    pub wallet_root: Keypair,
    /// Default wallet account, public only.
    pub wallet: Keypair,
    /// Master key, public only.
    pub master: Keypair,
}

#[derive(Default)]
struct Caches {
    info: Option<ApplicationInfo>,
    status: Option<ApplicationStatus>,
    metadata: Option<Metadata>,
}

struct SessionInner {
    channel: Arc<dyn Channel>,
    signals: SignalBus,
    state: Mutex<SessionState>,
    card: Mutex<Option<CommandSet>>,
    caches: Mutex<Caches>,
    store: Mutex<Option<PairingStore>>,
    storage_path: Mutex<Option<PathBuf>>,
    current_uid: Mutex<Option<String>>,
    pending_pairing_password: Mutex<Option<String>>,
    authorized: AtomicBool,
    last_error: Mutex<String>,
    // Serializes every card-touching operation, including teardown.
    op: Mutex<()>,
    started: AtomicBool,
    event_thread: Mutex<Option<JoinHandle<()>>>,
    stop_tx: Mutex<Option<Sender<()>>>,
}

/// The session facade.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Bind the manager to a channel and signal bus.
    ///
    /// The channel must already live on whatever thread its backend
    /// requires (the mobile NFC stack wants the platform UI dispatcher);
    /// the manager never constructs one itself.
    pub fn new(channel: Arc<dyn Channel>, signals: SignalBus) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                channel,
                signals,
                state: Mutex::new(SessionState::UnknownReaderState),
                card: Mutex::new(None),
                caches: Mutex::new(Caches::default()),
                store: Mutex::new(None),
                storage_path: Mutex::new(None),
                current_uid: Mutex::new(None),
                pending_pairing_password: Mutex::new(None),
                authorized: AtomicBool::new(false),
                last_error: Mutex::new(String::new()),
                op: Mutex::new(()),
                started: AtomicBool::new(false),
                event_thread: Mutex::new(None),
                stop_tx: Mutex::new(None),
            }),
        }
    }

    /// Wire channel events and arm detection. `storage_path` is the pairing
    /// store file. A second call without an intervening [`Self::stop`]
    /// returns [`Error::AlreadyStarted`].
    pub fn start(&self, storage_path: impl AsRef<Path>) -> Result<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyStarted);
        }

        *self.inner.storage_path.lock() = Some(storage_path.as_ref().to_path_buf());

        let events = self.inner.channel.subscribe();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        *self.inner.stop_tx.lock() = Some(stop_tx);

        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("keycard-session-events".into())
            .spawn(move || event_loop(&inner, &events, &stop_rx))
            .map_err(|e| Error::message(e.to_string()))?;
        *self.inner.event_thread.lock() = Some(handle);

        if let Err(e) = self.inner.channel.start_detection() {
            self.stop();
            return Err(e.into());
        }
        debug!("session manager started");
        Ok(())
    }

    /// Tear everything down. Waits for in-flight card operations, so no
    /// background task can observe a freed command set.
    pub fn stop(&self) {
        if !self.inner.started.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(tx) = self.inner.stop_tx.lock().take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.event_thread.lock().take() {
            let _ = handle.join();
        }

        let _op = self.inner.op.lock();
        *self.inner.card.lock() = None;
        *self.inner.current_uid.lock() = None;
        *self.inner.caches.lock() = Caches::default();
        *self.inner.store.lock() = None;
        *self.inner.pending_pairing_password.lock() = None;
        self.inner.authorized.store(false, Ordering::Release);
        self.inner.channel.stop_detection();
        self.inner.set_state(SessionState::UnknownReaderState);
        debug!("session manager stopped");
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    /// Last recorded error message.
    pub fn last_error(&self) -> String {
        self.inner.last_error.lock().clone()
    }

    /// Structured snapshot of the session: state plus the cached card info,
    /// status and metadata. Never issues an APDU.
    pub fn status(&self) -> Value {
        let state = self.state();
        let caches = self.inner.caches.lock();
        json!({
            "state": state.as_str(),
            "keycardInfo": caches.info.as_ref().map(ApplicationInfo::to_json),
            "keycardStatus": caches.status.as_ref().map(ApplicationStatus::to_json),
            "metadata": caches.metadata.as_ref().map(Metadata::to_json),
        })
    }

    /// Verify the PIN and move to `Authorized`. Requires `Ready`.
    pub fn authorize(&self, pin: &str) -> Result<()> {
        let _op = self.inner.op.lock();
        if self.state() != SessionState::Ready {
            return Err(Error::InvalidState("authorize requires the ready state"));
        }

        let mut guard = self.inner.card.lock();
        let card = guard.as_mut().ok_or(Error::InvalidState("no card connected"))?;

        match card.verify_pin(pin) {
            Ok(()) => {
                let status = card.get_status()?;
                drop(guard);
                self.inner.caches.lock().status = Some(status);
                self.inner.authorized.store(true, Ordering::Release);
                self.inner.set_state(SessionState::Authorized);
                Ok(())
            }
            Err(e @ Error::WrongPin { remaining }) => {
                drop(guard);
                if let Some(status) = &mut self.inner.caches.lock().status {
                    status.pin_retry_count = remaining as i8;
                }
                self.inner.record_error(&e);
                Err(e)
            }
            Err(e @ Error::PinBlocked) => {
                drop(guard);
                self.inner.record_error(&e);
                self.inner.set_state(SessionState::BlockedPIN);
                Err(e)
            }
            Err(e) => {
                drop(guard);
                self.inner.record_error(&e);
                Err(e)
            }
        }
    }

    /// INIT an empty (pre-initialized) card. An empty pairing password
    /// selects the default. On success the session is structurally invalid:
    /// the card is torn down and re-detected from scratch.
    pub fn initialize(&self, pin: &str, puk: &str, pairing_password: &str) -> Result<()> {
        let password = if pairing_password.is_empty() {
            DEFAULT_PAIRING_PASSWORD
        } else {
            pairing_password
        };
        let secrets = Secrets::new(pin, puk, password)?;

        let _op = self.inner.op.lock();
        if self.state() != SessionState::EmptyKeycard {
            return Err(Error::InvalidState("initialize requires an empty keycard"));
        }

        {
            let mut guard = self.inner.card.lock();
            let card = guard.as_mut().ok_or(Error::InvalidState("no card connected"))?;
            card.init(&secrets).inspect_err(|e| self.inner.record_error(e))?;
        }

        self.inner.invalidate_session();
        Ok(())
    }

    /// Factory-reset the card. On success the session is torn down and the
    /// card re-detected from scratch.
    pub fn factory_reset(&self) -> Result<()> {
        let _op = self.inner.op.lock();
        self.inner.set_state(SessionState::FactoryResetting);

        let result = {
            let mut guard = self.inner.card.lock();
            let card = guard.as_mut().ok_or(Error::InvalidState("no card connected"))?;
            card.factory_reset()
        };

        match result {
            Ok(()) => {
                self.inner.invalidate_session();
                Ok(())
            }
            Err(e) => {
                self.inner.record_error(&e);
                self.inner.set_state(SessionState::ConnectionError);
                Err(e)
            }
        }
    }

    /// Retry the connect sequence with a user-supplied pairing password.
    /// Meaningful after the session landed in `PairingError` because the
    /// default password was rejected.
    pub fn pair_with_password(&self, password: &str) -> Result<()> {
        if self.state() != SessionState::PairingError {
            return Err(Error::InvalidState("no pairing retry pending"));
        }
        *self.inner.pending_pairing_password.lock() = Some(password.to_string());
        self.inner.set_state(SessionState::ConnectingCard);
        connect_sequence(&self.inner);
        match self.state() {
            SessionState::Ready => Ok(()),
            SessionState::PairingError => Err(Error::WrongPairingPassword),
            _ => Err(Error::message(self.last_error())),
        }
    }

    /// Drop the stored pairing for a card instance.
    pub fn remove_pairing(&self, instance_uid_hex: &str) -> Result<()> {
        self.inner.with_store(|store| {
            store.remove(instance_uid_hex)?;
            Ok(())
        })
    }

    /// Change the PIN. Requires `Authorized`.
    pub fn change_pin(&self, new_pin: &str) -> Result<()> {
        self.require_authorized()?;
        self.with_card(|card| card.change_pin(new_pin))
    }

    /// Change the PUK. Requires `Authorized`.
    pub fn change_puk(&self, new_puk: &str) -> Result<()> {
        self.require_authorized()?;
        self.with_card(|card| card.change_puk(new_puk))
    }

    /// Change the pairing password. Requires `Authorized`.
    pub fn change_pairing_password(&self, new_password: &str) -> Result<()> {
        self.require_authorized()?;
        self.with_card(|card| card.change_pairing_secret(new_password))
    }

    /// Set a new PIN using the PUK. Recovers from `BlockedPIN`.
    pub fn unblock_pin(&self, puk: &str, new_pin: &str) -> Result<()> {
        let _op = self.inner.op.lock();
        let result = {
            let mut guard = self.inner.card.lock();
            let card = guard.as_mut().ok_or(Error::InvalidState("no card connected"))?;
            card.unblock_pin(puk, new_pin).and_then(|()| card.get_status())
        };

        match result {
            Ok(status) => {
                self.inner.caches.lock().status = Some(status);
                self.inner.authorized.store(false, Ordering::Release);
                self.inner.set_state(SessionState::Ready);
                Ok(())
            }
            Err(e) => {
                self.inner.record_error(&e);
                if matches!(e, Error::PukBlocked) {
                    self.inner.set_state(SessionState::BlockedPUK);
                }
                Err(e)
            }
        }
    }

    /// Derive the BIP39 seed from a mnemonic and load it into the card.
    /// Returns the new key UID, hex-encoded. Requires `Authorized`.
    pub fn load_mnemonic(&self, mnemonic: &str, passphrase: &str) -> Result<String> {
        self.require_authorized()?;
        let seed = crypto::bip39_seed(mnemonic, passphrase);
        let key_uid = self.with_card(|card| card.load_seed(&seed))?;

        let mut caches = self.inner.caches.lock();
        if let Some(info) = &mut caches.info {
            info.key_uid = Some(key_uid);
        }
        if let Some(status) = &mut caches.status {
            status.key_initialized = true;
        }
        Ok(hex::encode(key_uid))
    }

    /// Export the Whisper and encryption keys. Requires `Authorized`.
    pub fn export_login_keys(&self) -> Result<LoginKeys> {
        self.require_authorized()?;
        self.with_card(|card| {
            let whisper = card
                .export_derived(&parse_path(paths::WHISPER)?, ExportOption::PrivateAndPublic)?;
            let encryption = card
                .export_derived(&parse_path(paths::ENCRYPTION)?, ExportOption::PrivateAndPublic)?;
            Ok(LoginKeys {
                whisper,
                encryption,
            })
        })
    }

    /// Export the full key set used to recover an account. Requires
    /// `Authorized`.
    pub fn export_recovery_keys(&self) -> Result<RecoveryKeys> {
        self.require_authorized()?;
        let extended = self
            .inner
            .caches
            .lock()
            .info
            .as_ref()
            .is_some_and(|i| i.version.supports_extended_export());

        self.with_card(|card| {
            let encryption = card
                .export_derived(&parse_path(paths::ENCRYPTION)?, ExportOption::PrivateAndPublic)?;
            let whisper = card
                .export_derived(&parse_path(paths::WHISPER)?, ExportOption::PrivateAndPublic)?;
            let eip1581 =
                card.export_derived(&parse_path(paths::EIP1581)?, ExportOption::PublicOnly)?;
            let wallet_root_option = if extended {
                ExportOption::ExtendedPublic
            } else {
                ExportOption::PublicOnly
            };
            let wallet_root =
                card.export_derived(&parse_path(paths::WALLET_ROOT)?, wallet_root_option)?;
            let wallet =
                card.export_derived(&parse_path(paths::WALLET)?, ExportOption::PublicOnly)?;
            let master =
                card.export_derived(&parse_path(paths::MASTER)?, ExportOption::PublicOnly)?;
            Ok(RecoveryKeys {
                encryption,
                whisper,
                eip1581,
                wallet_root,
                wallet,
                master,
            })
        })
    }

    /// Read the metadata blob from the public data slot.
    pub fn get_metadata(&self) -> Result<Option<Metadata>> {
        let blob = self.with_card(|card| card.get_data(data::SLOT_PUBLIC))?;
        if blob.is_empty() {
            return Ok(None);
        }
        let metadata = Metadata::decode(&blob)?;
        self.inner.caches.lock().metadata = Some(metadata.clone());
        Ok(Some(metadata))
    }

    /// Write the metadata blob to the public data slot. Requires
    /// `Authorized`.
    pub fn store_metadata(&self, metadata: &Metadata) -> Result<()> {
        self.require_authorized()?;
        self.with_card(|card| card.store_data(data::SLOT_PUBLIC, &metadata.encode()))?;
        self.inner.caches.lock().metadata = Some(metadata.clone());
        Ok(())
    }

    fn require_authorized(&self) -> Result<()> {
        if self.state() == SessionState::Authorized && self.inner.authorized.load(Ordering::Acquire)
        {
            Ok(())
        } else {
            Err(Error::InvalidState("operation requires an authorized session"))
        }
    }

    fn with_card<T>(&self, f: impl FnOnce(&mut CommandSet) -> Result<T>) -> Result<T> {
        let _op = self.inner.op.lock();
        let mut guard = self.inner.card.lock();
        let card = guard.as_mut().ok_or(Error::InvalidState("no card connected"))?;
        let result = f(card);
        if let Err(e) = &result {
            self.inner.record_error(e);
        }
        result
    }
}

impl SessionInner {
    fn state_now(&self) -> SessionState {
        *self.state.lock()
    }

    // State transitions and their signals are ordered by the state mutex.
    fn set_state(&self, new: SessionState) {
        let mut state = self.state.lock();
        if *state == new {
            return;
        }
        debug!(from = %*state, to = %new, "session state change");
        *state = new;

        let caches = self.caches.lock();
        let payload = json!({
            "state": new.as_str(),
            "keycardInfo": caches.info.as_ref().map(ApplicationInfo::to_json),
            "keycardStatus": caches.status.as_ref().map(ApplicationStatus::to_json),
            "metadata": caches.metadata.as_ref().map(Metadata::to_json),
        });
        drop(caches);
        self.signals.emit("status-changed", payload);
    }

    fn record_error(&self, error: &Error) {
        *self.last_error.lock() = error.to_string();
    }

    // Teardown after INIT / factory reset: credentials changed or card
    // wiped, so the whole connect sequence must run again.
    fn invalidate_session(&self) {
        *self.card.lock() = None;
        *self.current_uid.lock() = None;
        *self.caches.lock() = Caches::default();
        self.authorized.store(false, Ordering::Release);
        self.channel.disconnect();
        // State first: the forced re-scan fires target detection, which
        // must observe the waiting state, not the stale session.
        self.set_state(SessionState::WaitingForCard);
        self.channel.force_scan();
    }

    fn with_store<T>(&self, f: impl FnOnce(&mut PairingStore) -> Result<T>) -> Result<T> {
        let mut guard = self.store.lock();
        if guard.is_none() {
            let path = self
                .storage_path
                .lock()
                .clone()
                .ok_or(Error::InvalidState("session manager not started"))?;
            *guard = Some(PairingStore::load(path)?);
        }
        f(guard.as_mut().unwrap())
    }

    fn lookup_pairing(&self, uid_hex: &str) -> Option<PairingInfo> {
        self.with_store(|store| Ok(store.get(uid_hex).cloned()))
            .ok()
            .flatten()
    }
}

fn event_loop(inner: &Arc<SessionInner>, events: &Receiver<ChannelEvent>, stop: &Receiver<()>) {
    loop {
        crossbeam_channel::select! {
            recv(events) -> event => match event {
                Ok(event) => handle_event(inner, event),
                Err(_) => break,
            },
            recv(stop) -> _ => break,
        }
    }
}

fn handle_event(inner: &Arc<SessionInner>, event: ChannelEvent) {
    match event {
        ChannelEvent::ReaderAvailabilityChanged(true) => {
            let state = inner.state_now();
            if matches!(
                state,
                SessionState::UnknownReaderState
                    | SessionState::WaitingForReader
                    | SessionState::NoReadersFound
            ) {
                // No command set may outlive a reader cycle.
                *inner.card.lock() = None;
                inner.set_state(SessionState::WaitingForCard);
                // The single point where the NFC drawer may open on its own.
                inner
                    .channel
                    .set_session_state(ChannelSessionState::WaitingForCard);
            }
        }
        ChannelEvent::ReaderAvailabilityChanged(false) => {
            *inner.card.lock() = None;
            *inner.current_uid.lock() = None;
            inner.authorized.store(false, Ordering::Release);
            inner.set_state(SessionState::NoReadersFound);
        }
        ChannelEvent::TargetDetected { uid } => {
            let state = inner.state_now();
            let same_card = inner.current_uid.lock().as_deref() == Some(uid.as_str());
            if same_card
                && matches!(
                    state,
                    SessionState::Ready | SessionState::Authorized | SessionState::ConnectingCard
                )
            {
                // Auto-resume re-tap; treating it as a swap would reset the
                // secure channel under the caller.
                debug!(%uid, "ignoring re-tap of current card");
                return;
            }

            *inner.current_uid.lock() = Some(uid);
            inner.set_state(SessionState::ConnectingCard);

            let inner = Arc::clone(inner);
            thread::spawn(move || connect_sequence(&inner));
        }
        ChannelEvent::TargetLost => {
            *inner.card.lock() = None;
            *inner.current_uid.lock() = None;
            *inner.caches.lock() = Caches::default();
            inner.authorized.store(false, Ordering::Release);
            if inner.state_now() != SessionState::NoReadersFound {
                inner.set_state(SessionState::WaitingForCard);
            }
        }
        ChannelEvent::Error { kind, message } => {
            *inner.last_error.lock() = message;
            if kind == ErrorKind::ReaderStack {
                inner.set_state(SessionState::ReaderConnectionError);
            }
        }
    }
}

// The connect sequence: fresh command set, SELECT, pair if needed, open the
// secure channel, the mandatory GET STATUS, best-effort metadata, Ready.
fn connect_sequence(inner: &Arc<SessionInner>) {
    let _op = inner.op.lock();
    if !inner.started.load(Ordering::Acquire) {
        return;
    }

    // A fresh command set per insertion; reusing one carries stale
    // secure-channel state that corrupts later commands.
    let mut card = CommandSet::new(Arc::clone(&inner.channel));

    let info = match card.select() {
        Ok(info) if info.is_valid() => info,
        Ok(_) | Err(Error::NotAKeycard) => {
            inner.set_state(SessionState::NotKeycard);
            return;
        }
        Err(e) => {
            inner.record_error(&e);
            inner.set_state(SessionState::ConnectionError);
            return;
        }
    };
    inner.caches.lock().info = Some(info.clone());

    if !info.initialized {
        // Usable only through `initialize`.
        *inner.card.lock() = Some(card);
        inner.set_state(SessionState::EmptyKeycard);
        return;
    }

    let Some(uid_hex) = info.instance_uid_hex() else {
        inner.set_state(SessionState::NotKeycard);
        return;
    };

    let pairing = match inner.lookup_pairing(&uid_hex) {
        Some(pairing) => pairing,
        None => {
            let password = inner
                .pending_pairing_password
                .lock()
                .take()
                .unwrap_or_else(|| DEFAULT_PAIRING_PASSWORD.to_string());
            match card.pair(&password) {
                Ok(pairing) => {
                    if let Err(e) =
                        inner.with_store(|store| store.insert(&uid_hex, pairing.clone()))
                    {
                        warn!(error = %e, "failed to persist pairing");
                    }
                    pairing
                }
                Err(e @ (Error::NoPairingSlots | Error::WrongPairingPassword)) => {
                    inner.record_error(&e);
                    *inner.card.lock() = Some(card);
                    inner.set_state(SessionState::PairingError);
                    return;
                }
                Err(e) => {
                    inner.record_error(&e);
                    inner.set_state(SessionState::ConnectionError);
                    return;
                }
            }
        }
    };

    if let Err(e) = card.open_secure_channel(&pairing) {
        inner.record_error(&e);
        inner.set_state(SessionState::ConnectionError);
        return;
    }

    // Mandatory immediately after opening the channel: skipping it leaves
    // the applet state machine mis-initialized and VERIFY PIN fails with
    // opaque internal errors. The result also backs the status snapshot.
    match card.get_status() {
        Ok(status) => inner.caches.lock().status = Some(status),
        Err(e) => {
            inner.record_error(&e);
            inner.set_state(SessionState::ConnectionError);
            return;
        }
    }

    // Best-effort: a card without metadata is not an error.
    match card.get_data(data::SLOT_PUBLIC) {
        Ok(blob) if !blob.is_empty() => match Metadata::decode(&blob) {
            Ok(metadata) => inner.caches.lock().metadata = Some(metadata),
            Err(e) => warn!(error = %e, "ignoring malformed on-card metadata"),
        },
        Ok(_) => {}
        Err(e) => warn!(error = %e, "metadata fetch failed"),
    }

    *inner.card.lock() = Some(card);
    inner.authorized.store(false, Ordering::Release);
    inner.set_state(SessionState::Ready);
    // Let the NFC drawer close while the user reads the card info.
    inner.channel.set_session_state(ChannelSessionState::Idle);
}
