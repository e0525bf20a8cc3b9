//! Flow execution context: card snapshot, parameters and pause points.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::command_set::CommandSet;
use crate::constants::{DEFAULT_PAIRING_PASSWORD, MAX_PIN_RETRIES};
use crate::types::{ApplicationInfo, ApplicationStatus, PairingInfo};
use crate::{Error, Result};

use super::{EngineInner, FlowState};

/// Signal tags for flow events (action names).
pub mod actions {
    /// Waiting for a card.
    pub const INSERT_CARD: &str = "insert-card";
    /// A card arrived while a flow was waiting.
    pub const CARD_INSERTED: &str = "card-inserted";
    /// Waiting for a pairing password.
    pub const ENTER_PAIRING: &str = "enter-pairing";
    /// Waiting for the PIN.
    pub const ENTER_PIN: &str = "enter-pin";
    /// Waiting for a new PIN.
    pub const ENTER_NEW_PIN: &str = "enter-new-pin";
    /// Waiting for a new PUK.
    pub const ENTER_NEW_PUK: &str = "enter-new-puk";
    /// Waiting for a new pairing password.
    pub const ENTER_NEW_PAIRING: &str = "enter-new-pairing";
    /// Waiting for a derivation path or transaction input.
    pub const ENTER_PATH: &str = "enter-path";
    /// Waiting for a mnemonic.
    pub const ENTER_MNEMONIC: &str = "enter-mnemonic";
    /// Waiting for a card name.
    pub const ENTER_NAME: &str = "enter-name";
    /// Waiting for a different card.
    pub const SWAP_CARD: &str = "swap-card";
    /// Terminal result of a flow.
    pub const FLOW_RESULT: &str = "flow-result";
}

/// Error tags carried inside pause events and flow results.
pub mod errors {
    pub const OK: &str = "ok";
    pub const CONNECTION_ERROR: &str = "connection-error";
    pub const ENTER_PIN: &str = "enter-pin";
    pub const WRONG_PIN: &str = "wrong-pin";
    pub const PIN_BLOCKED: &str = "pin-blocked";
    pub const ENTER_PAIRING: &str = "enter-pairing";
    pub const NO_KEYS: &str = "no-keys";
    pub const HAS_KEYS: &str = "has-keys";
    pub const REQUIRE_INIT: &str = "require-init";
    pub const LOADING_KEYS: &str = "loading-keys";
    pub const CANCELLED: &str = "cancelled";
    pub const CARD_ERROR: &str = "card-error";
    pub const SELECT_FAILED: &str = "select-failed";
    pub const AUTH_FAILED: &str = "auth-failed";
    pub const CHANGE_FAILED: &str = "change-failed";
    pub const EXPORT_FAILED: &str = "export-failed";
    pub const GENERATE_FAILED: &str = "generate-failed";
    pub const LOAD_FAILED: &str = "load-failed";
    pub const MISSING_CREDENTIALS: &str = "missing-credentials";
    pub const FACTORY_RESET_FAILED: &str = "factory-reset-failed";
}

/// Parameter keys read from flow params.
pub(crate) mod keys {
    pub(crate) const PIN: &str = "pin";
    pub(crate) const NEW_PIN: &str = "new-pin";
    pub(crate) const NEW_PUK: &str = "new-puk";
    pub(crate) const NEW_PAIRING: &str = "new-pairing";
    pub(crate) const PAIRING_PASS: &str = "pairing-pass";
    pub(crate) const FACTORY_RESET: &str = "factory reset";
    pub(crate) const OVERWRITE: &str = "overwrite";
    pub(crate) const MNEMONIC: &str = "mnemonic";
    pub(crate) const MNEMONIC_LEN: &str = "mnemonic-length";
    pub(crate) const TX_HASH: &str = "tx-hash";
    pub(crate) const BIP44_PATH: &str = "bip44-path";
    pub(crate) const PATH: &str = "path";
    pub(crate) const CARD_NAME: &str = "card-name";
    pub(crate) const PATHS: &str = "paths";
}

/// Result/event keys.
pub(crate) mod out {
    pub(crate) const ERROR: &str = "error";
    pub(crate) const INSTANCE_UID: &str = "instance-uid";
    pub(crate) const KEY_UID: &str = "key-uid";
    pub(crate) const FREE_SLOTS: &str = "free-pairing-slots";
    pub(crate) const PIN_RETRIES: &str = "pin-retries";
    pub(crate) const PUK_RETRIES: &str = "puk-retries";
    pub(crate) const PAIRED: &str = "paired";
    pub(crate) const MNEMONIC_INDEXES: &str = "mnemonic-indexes";
    pub(crate) const TX_SIGNATURE: &str = "tx-signature";
    pub(crate) const WHISPER_KEY: &str = "whisper-key";
    pub(crate) const ENCRYPTION_KEY: &str = "encryption-key";
    pub(crate) const EIP1581_KEY: &str = "eip1581-key";
    pub(crate) const WALLET_ROOT_KEY: &str = "wallet-root-key";
    pub(crate) const WALLET_KEY: &str = "wallet-key";
    pub(crate) const MASTER_KEY: &str = "master-key";
    pub(crate) const EXPORTED_KEY: &str = "exported-key";
    pub(crate) const CARD_METADATA: &str = "card-metadata";
}

/// How a flow body was interrupted.
pub(crate) enum FlowInterrupt {
    /// `cancel_flow` observed; unwind without emitting anything.
    Cancelled,
    /// Re-run `execute()` from the top with a cleared snapshot.
    Restart,
    /// Terminal failure: becomes a `flow-result` with this error tag.
    Failed {
        tag: &'static str,
        message: String,
        snapshot: Map<String, Value>,
    },
}

/// Flow-body step result.
pub(crate) type Step<T> = std::result::Result<T, FlowInterrupt>;

/// Card facts accumulated while a flow runs, included in every pause event
/// and in the final result.
#[derive(Debug, Clone, Default)]
pub(crate) struct CardSnapshot {
    pub(crate) instance_uid: Option<String>,
    pub(crate) key_uid: Option<String>,
    pub(crate) free_slots: Option<u8>,
    pub(crate) pin_retries: Option<i8>,
    pub(crate) puk_retries: Option<i8>,
}

impl CardSnapshot {
    pub(crate) fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert(
            out::INSTANCE_UID.to_string(),
            Value::String(self.instance_uid.clone().unwrap_or_default()),
        );
        map.insert(
            out::KEY_UID.to_string(),
            Value::String(self.key_uid.clone().unwrap_or_default()),
        );
        if let Some(slots) = self.free_slots {
            map.insert(out::FREE_SLOTS.to_string(), slots.into());
        }
        map.insert(out::PIN_RETRIES.to_string(), self.pin_retries.unwrap_or(-1).into());
        map.insert(out::PUK_RETRIES.to_string(), self.puk_retries.unwrap_or(-1).into());
        map
    }
}

/// Mutable state of one flow execution.
pub(crate) struct FlowContext<'e> {
    inner: &'e Arc<EngineInner>,
    pub(crate) params: Map<String, Value>,
    pub(crate) snapshot: CardSnapshot,
}

impl<'e> FlowContext<'e> {
    pub(crate) fn new(inner: &'e Arc<EngineInner>) -> Self {
        let params = inner.control.lock().params.clone();
        Self {
            inner,
            params,
            snapshot: CardSnapshot::default(),
        }
    }

    //
    // Parameters
    //

    pub(crate) fn param_str(&self, key: &str) -> Option<String> {
        self.params.get(key)?.as_str().map(str::to_string)
    }

    pub(crate) fn param_bool(&self, key: &str) -> bool {
        self.params.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub(crate) fn param_u64(&self, key: &str) -> Option<u64> {
        self.params.get(key)?.as_u64()
    }

    /// Set a parameter for the rest of the flow (and any restart).
    pub(crate) fn set_param(&mut self, key: &str, value: Value) {
        self.params.insert(key.to_string(), value.clone());
        self.inner.control.lock().params.insert(key.to_string(), value);
    }

    //
    // Engine plumbing
    //

    pub(crate) fn cancelled(&self) -> bool {
        self.inner.control.lock().cancelled
    }

    pub(crate) fn with_card<T>(&self, f: impl FnOnce(&mut CommandSet) -> Result<T>) -> Result<T> {
        let mut guard = self.inner.card.lock();
        let card = guard
            .as_mut()
            .ok_or(Error::InvalidState("flow engine not initialized"))?;
        f(card)
    }

    pub(crate) fn emit(&self, action: &str, payload: Map<String, Value>) {
        self.inner.signals.emit(action, Value::Object(payload));
    }

    /// Re-arm detection so the same physical card is detected again.
    pub(crate) fn force_scan(&self) {
        self.inner.channel.force_scan();
    }

    /// Tear down the connection and re-arm detection, as required after
    /// INIT invalidates the session.
    pub(crate) fn reconnect_card(&self) {
        self.inner.channel.disconnect();
        self.inner.channel.force_scan();
    }

    pub(crate) fn fail(&self, tag: &'static str, error: Error) -> FlowInterrupt {
        warn!(tag, error = %error, "flow step failed");
        FlowInterrupt::Failed {
            tag,
            message: error.to_string(),
            snapshot: self.snapshot.to_map(),
        }
    }

    pub(crate) fn fail_tag(&self, tag: &'static str) -> FlowInterrupt {
        FlowInterrupt::Failed {
            tag,
            message: tag.to_string(),
            snapshot: self.snapshot.to_map(),
        }
    }

    //
    // Pause points
    //

    /// Emit `(action, event)` and block until resume or cancellation.
    /// The event carries the error tag and the current card snapshot.
    pub(crate) fn pause_and_wait(&mut self, action: &str, error_tag: &str) -> Step<()> {
        self.pause_with(action, error_tag, None, false)
    }

    /// [`Self::pause_and_wait`] with extra status fields in the event.
    pub(crate) fn pause_and_wait_with_status(
        &mut self,
        action: &str,
        error_tag: &str,
        status: Map<String, Value>,
    ) -> Step<()> {
        self.pause_with(action, error_tag, Some(status), false)
    }

    /// Pause waiting for a card swap, then restart the flow from the top.
    pub(crate) fn pause_and_restart(&mut self, action: &str, error_tag: &str) -> Step<()> {
        self.pause_with(action, error_tag, None, true)?;
        Err(FlowInterrupt::Restart)
    }

    fn pause_with(
        &mut self,
        action: &str,
        error_tag: &str,
        status: Option<Map<String, Value>>,
        waiting_for_card: bool,
    ) -> Step<()> {
        let mut event = self.snapshot.to_map();
        event.insert(out::ERROR.to_string(), Value::String(error_tag.to_string()));
        if let Some(status) = status {
            event.extend(status);
        }

        let mut control = self.inner.control.lock();
        if control.cancelled {
            return Err(FlowInterrupt::Cancelled);
        }

        // Transition first, then emit: the receiver may react to the event
        // by resuming immediately, which requires the paused state to be
        // observable already.
        {
            let mut state = self.inner.state.lock();
            if *state == FlowState::Cancelling {
                return Err(FlowInterrupt::Cancelled);
            }
            *state = FlowState::Paused;
        }
        control.waiting_for_card = waiting_for_card;
        debug!(action, error_tag, "flow paused");
        self.inner.signals.emit(action, Value::Object(event));

        loop {
            if control.cancelled {
                return Err(FlowInterrupt::Cancelled);
            }
            if control.resumed {
                control.resumed = false;
                break;
            }
            self.inner.resume.wait(&mut control);
        }
        control.waiting_for_card = false;

        {
            let mut state = self.inner.state.lock();
            if *state != FlowState::Cancelling {
                *state = FlowState::Running;
            }
        }

        // The resume may have merged new parameters.
        self.params = control.params.clone();
        debug!(action, "flow resumed");
        Ok(())
    }

    //
    // Common prelude
    //

    /// Wait until a card is reachable. A 150 ms optimistic wait suppresses
    /// a spurious insert-card blink when the tap lands together with the
    /// flow start.
    pub(crate) fn wait_for_card(&mut self) -> Step<()> {
        if self.inner.channel.is_target_present() {
            return Ok(());
        }
        thread::sleep(Duration::from_millis(150));

        let mut paused = false;
        loop {
            if self.cancelled() {
                return Err(FlowInterrupt::Cancelled);
            }
            if self.inner.channel.is_target_present() {
                break;
            }
            self.pause_with(actions::INSERT_CARD, errors::CONNECTION_ERROR, None, true)?;
            paused = true;
        }
        if paused {
            self.emit(actions::CARD_INSERTED, self.snapshot.to_map());
        }
        Ok(())
    }

    /// SELECT the applet and refresh the snapshot.
    ///
    /// When the engine's secure channel is still open from an earlier flow
    /// the cached info is reused instead: re-selecting would reset the
    /// applet session and defeat the channel surviving across flows.
    pub(crate) fn select_keycard(&mut self) -> Step<ApplicationInfo> {
        let cached = self
            .with_card(|card| {
                Ok(card
                    .is_secure_channel_open()
                    .then(|| card.application_info().cloned())
                    .flatten())
            })
            .unwrap_or(None);
        if let Some(info) = cached {
            self.absorb_info(&info);
            return Ok(info);
        }

        match self.with_card(CommandSet::select) {
            Ok(info) => {
                self.absorb_info(&info);
                Ok(info)
            }
            Err(e) => Err(self.fail(errors::SELECT_FAILED, e)),
        }
    }

    /// Open the secure channel (pairing with the default or supplied
    /// password as needed) and, when requested, verify the PIN.
    pub(crate) fn open_secure_channel_and_authenticate(
        &mut self,
        pin_required: bool,
    ) -> Step<()> {
        if self.cancelled() {
            return Err(FlowInterrupt::Cancelled);
        }

        let info = match self.with_card(|card| Ok(card.application_info().cloned())) {
            Ok(Some(info)) => info,
            Ok(None) => return Err(self.fail_tag(errors::SELECT_FAILED)),
            Err(e) => return Err(self.fail(errors::SELECT_FAILED, e)),
        };
        let Some(uid_hex) = info.instance_uid_hex() else {
            return Err(self.fail_tag(errors::SELECT_FAILED));
        };

        let already_open = self
            .with_card(|card| Ok(card.is_secure_channel_open()))
            .unwrap_or(false);
        if !already_open {
            let pairing = self.obtain_pairing(&uid_hex)?;
            if let Err(e) = self.with_card(|card| card.open_secure_channel(&pairing)) {
                return Err(self.fail(errors::CONNECTION_ERROR, e));
            }
        }

        // GET STATUS must directly follow the channel open; it also feeds
        // the retry counters of every subsequent pause event.
        match self.with_card(CommandSet::get_status) {
            Ok(status) => self.absorb_status(&status),
            Err(e) => return Err(self.fail(errors::CARD_ERROR, e)),
        }

        if pin_required {
            self.verify_pin()?;
        }
        Ok(())
    }

    fn obtain_pairing(&mut self, uid_hex: &str) -> Step<PairingInfo> {
        if let Some(pairing) = self.stored_pairing(uid_hex) {
            return Ok(pairing);
        }

        loop {
            if self.cancelled() {
                return Err(FlowInterrupt::Cancelled);
            }
            let password = self
                .param_str(keys::PAIRING_PASS)
                .unwrap_or_else(|| DEFAULT_PAIRING_PASSWORD.to_string());
            match self.with_card(|card| card.pair(&password)) {
                Ok(pairing) => {
                    self.store_pairing(uid_hex, &pairing);
                    return Ok(pairing);
                }
                Err(Error::WrongPairingPassword) => {
                    self.params.remove(keys::PAIRING_PASS);
                    self.inner.control.lock().params.remove(keys::PAIRING_PASS);
                    self.pause_and_wait(actions::ENTER_PAIRING, errors::ENTER_PAIRING)?;
                }
                Err(e) => return Err(self.fail(errors::CARD_ERROR, e)),
            }
        }
    }

    fn verify_pin(&mut self) -> Step<()> {
        loop {
            if self.cancelled() {
                return Err(FlowInterrupt::Cancelled);
            }
            let Some(pin) = self.param_str(keys::PIN) else {
                self.pause_and_wait(actions::ENTER_PIN, errors::ENTER_PIN)?;
                continue;
            };
            match self.with_card(|card| card.verify_pin(&pin)) {
                Ok(()) => {
                    self.snapshot.pin_retries = Some(MAX_PIN_RETRIES as i8);
                    return Ok(());
                }
                Err(Error::WrongPin { remaining }) => {
                    self.snapshot.pin_retries = Some(remaining as i8);
                    self.params.remove(keys::PIN);
                    self.inner.control.lock().params.remove(keys::PIN);
                    self.pause_and_wait(actions::ENTER_PIN, errors::WRONG_PIN)?;
                }
                Err(Error::PinBlocked) => {
                    self.snapshot.pin_retries = Some(0);
                    return Err(self.fail_tag(errors::PIN_BLOCKED));
                }
                Err(e) => return Err(self.fail(errors::AUTH_FAILED, e)),
            }
        }
    }

    /// Fail over to a different card unless this one carries keys.
    pub(crate) fn require_keys(&mut self) -> Step<()> {
        if self.snapshot.key_uid.is_none() {
            self.pause_and_restart(actions::SWAP_CARD, errors::NO_KEYS)?;
        }
        Ok(())
    }

    //
    // Snapshot upkeep
    //

    pub(crate) fn absorb_info(&mut self, info: &ApplicationInfo) {
        self.snapshot.instance_uid = info.instance_uid_hex();
        self.snapshot.key_uid = info.key_uid_hex();
        self.snapshot.free_slots = Some(info.available_slots);
    }

    pub(crate) fn absorb_status(&mut self, status: &ApplicationStatus) {
        self.snapshot.pin_retries = Some(status.pin_retry_count);
        self.snapshot.puk_retries = Some(status.puk_retry_count);
    }

    //
    // Pairing store access
    //

    fn stored_pairing(&self, uid_hex: &str) -> Option<PairingInfo> {
        self.inner.store.lock().as_ref()?.get(uid_hex).cloned()
    }

    fn store_pairing(&self, uid_hex: &str, pairing: &PairingInfo) {
        if let Some(store) = self.inner.store.lock().as_mut() {
            if let Err(e) = store.insert(uid_hex, pairing.clone()) {
                warn!(error = %e, "failed to persist pairing");
            }
        }
    }

    /// Base of every flow result: the card snapshot.
    pub(crate) fn result_base(&self) -> Map<String, Value> {
        self.snapshot.to_map()
    }
}
