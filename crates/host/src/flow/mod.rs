//! Flow facade: pausable scripts for multi-step, user-guided procedures.
//!
//! One flow is active at a time. A flow runs as straight-line code on a
//! worker thread, blocking on card I/O and, at its pause points, on a
//! condvar until the application resumes it with more parameters or
//! cancels it. Pauses and results are broadcast over the signal bus.

mod context;
mod flows;
mod state;

pub use context::{actions, errors};
pub use state::{FlowState, FlowType, valid_transition};

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use keycard_channel::{Channel, ChannelEvent};

use crate::command_set::CommandSet;
use crate::pairing_store::PairingStore;
use crate::signal::SignalBus;
use crate::{Error, Result};

use context::{FlowContext, FlowInterrupt};

pub(crate) struct Control {
    pub(crate) params: Map<String, Value>,
    pub(crate) cancelled: bool,
    pub(crate) resumed: bool,
    // Set while the worker pauses waiting for a card, so target detection
    // can resume it without user involvement.
    pub(crate) waiting_for_card: bool,
}

pub(crate) struct EngineInner {
    pub(crate) channel: Arc<dyn Channel>,
    pub(crate) signals: SignalBus,
    // Engine-lifetime command set: its secure channel survives across
    // flows, but not across card removals.
    pub(crate) card: Mutex<Option<CommandSet>>,
    pub(crate) store: Mutex<Option<PairingStore>>,
    pub(crate) state: Mutex<FlowState>,
    pub(crate) control: Mutex<Control>,
    pub(crate) resume: Condvar,
    initialized: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    watcher_stop: Mutex<Option<Sender<()>>>,
}

impl EngineInner {
    // Engine-internal transition; same-state is a no-op, anything not in
    // the adjacency matrix is rejected.
    pub(crate) fn transition(&self, to: FlowState) -> Result<()> {
        let mut state = self.state.lock();
        if *state == to {
            return Ok(());
        }
        if !valid_transition(*state, to) {
            return Err(Error::InvalidState("flow state transition rejected"));
        }
        debug!(from = %*state, to = %to, "flow state change");
        *state = to;
        Ok(())
    }
}

/// The flow facade.
#[derive(Clone)]
pub struct FlowEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for FlowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowEngine")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl FlowEngine {
    /// Bind the engine to a channel and signal bus.
    pub fn new(channel: Arc<dyn Channel>, signals: SignalBus) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                channel,
                signals,
                card: Mutex::new(None),
                store: Mutex::new(None),
                state: Mutex::new(FlowState::Idle),
                control: Mutex::new(Control {
                    params: Map::new(),
                    cancelled: false,
                    resumed: false,
                    waiting_for_card: false,
                }),
                resume: Condvar::new(),
                initialized: AtomicBool::new(false),
                worker: Mutex::new(None),
                watcher: Mutex::new(None),
                watcher_stop: Mutex::new(None),
            }),
        }
    }

    /// Bind the pairing store and start the engine-lifetime command set.
    /// `storage_path` is the pairing store file.
    pub fn init(&self, storage_path: impl AsRef<Path>) -> Result<()> {
        if self.inner.initialized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        *self.inner.store.lock() = Some(PairingStore::load(storage_path.as_ref())?);
        *self.inner.card.lock() = Some(CommandSet::new(Arc::clone(&self.inner.channel)));

        // Card events drive two things: waking a flow paused on
        // insert-card, and dropping secure-channel state on removal.
        let events = self.inner.channel.subscribe();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        *self.inner.watcher_stop.lock() = Some(stop_tx);
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("keycard-flow-watcher".into())
            .spawn(move || {
                loop {
                    crossbeam_channel::select! {
                        recv(events) -> event => match event {
                            Ok(event) => watch_event(&inner, event),
                            Err(_) => break,
                        },
                        recv(stop_rx) -> _ => break,
                    }
                }
            })
            .map_err(|e| Error::message(e.to_string()))?;
        *self.inner.watcher.lock() = Some(handle);

        debug!("flow engine initialized");
        Ok(())
    }

    /// Shut the engine down: cancel any active flow and stop the watcher.
    pub fn shutdown(&self) {
        if !self.inner.initialized.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.cancel_flow();
        if let Some(tx) = self.inner.watcher_stop.lock().take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.watcher.lock().take() {
            let _ = handle.join();
        }
        *self.inner.card.lock() = None;
    }

    /// Arm channel detection; kept continuous across flows.
    pub fn start_continuous_detection(&self) -> Result<()> {
        self.inner.channel.start_detection().map_err(Error::from)
    }

    /// Disarm channel detection.
    pub fn stop_continuous_detection(&self) {
        self.inner.channel.stop_detection();
    }

    /// Current engine state.
    pub fn state(&self) -> FlowState {
        *self.inner.state.lock()
    }

    /// Start a flow by wire code.
    pub fn start_flow_code(&self, code: u32, params: Value) -> Result<()> {
        self.start_flow(FlowType::try_from(code)?, params)
    }

    /// Start a flow. Exactly one flow runs at a time; a second start
    /// returns [`Error::FlowAlreadyRunning`].
    pub fn start_flow(&self, flow_type: FlowType, params: Value) -> Result<()> {
        if !self.inner.initialized.load(Ordering::Acquire) {
            return Err(Error::InvalidState("flow engine not initialized"));
        }
        let params = match params {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => return Err(Error::InvalidData("flow parameters must be an object")),
        };

        // The Idle -> Running transition is the admission check; doing it
        // under the state lock makes concurrent starts race-free.
        {
            let mut state = self.inner.state.lock();
            if *state != FlowState::Idle {
                return Err(Error::FlowAlreadyRunning);
            }
            *state = FlowState::Running;
        }

        {
            let mut control = self.inner.control.lock();
            control.params = params;
            control.cancelled = false;
            control.resumed = false;
            control.waiting_for_card = false;
        }

        // The previous worker is long finished (state was Idle); reap it.
        if let Some(handle) = self.inner.worker.lock().take() {
            let _ = handle.join();
        }

        debug!(flow = ?flow_type, "starting flow");
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("keycard-flow-worker".into())
            .spawn(move || run_worker(&inner, flow_type))
            .map_err(|e| Error::message(e.to_string()))?;
        *self.inner.worker.lock() = Some(handle);
        Ok(())
    }

    /// Resume a paused flow, merging `params` into the flow's parameters.
    pub fn resume_flow(&self, params: Value) -> Result<()> {
        self.inner.transition(FlowState::Resuming).map_err(|_| {
            Error::InvalidState("resume requires a paused flow")
        })?;

        {
            let mut control = self.inner.control.lock();
            if let Value::Object(map) = params {
                for (key, value) in map {
                    control.params.insert(key, value);
                }
            }
            control.resumed = true;
        }
        self.inner.resume.notify_all();
        Ok(())
    }

    /// Cancel the active flow and wait for its worker to unwind. The
    /// current card round-trip, if any, is never interrupted.
    pub fn cancel_flow(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                FlowState::Idle => return Ok(()),
                FlowState::Cancelling => {}
                _ => *state = FlowState::Cancelling,
            }
        }
        {
            let mut control = self.inner.control.lock();
            control.cancelled = true;
        }
        self.inner.resume.notify_all();

        let handle = self.inner.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        Ok(())
    }
}

fn run_worker(inner: &Arc<EngineInner>, flow_type: FlowType) {
    let outcome = loop {
        // A fresh context per (re)entry: the restart contract clears the
        // accumulated card snapshot.
        let mut ctx = FlowContext::new(inner);
        match flows::execute(flow_type, &mut ctx) {
            Err(FlowInterrupt::Restart) => {
                debug!(flow = ?flow_type, "restarting flow from the top");
                continue;
            }
            other => break other,
        }
    };

    let cancelled = inner.control.lock().cancelled;
    match outcome {
        Ok(_) | Err(_) if cancelled => {
            // A cancelled flow emits nothing further.
            debug!(flow = ?flow_type, "flow cancelled");
        }
        Ok(mut result) => {
            result
                .entry("error".to_string())
                .or_insert_with(|| Value::String(errors::OK.to_string()));
            inner.signals.emit(actions::FLOW_RESULT, Value::Object(result));
        }
        Err(FlowInterrupt::Cancelled) => {
            debug!(flow = ?flow_type, "flow cancelled");
        }
        Err(FlowInterrupt::Failed { tag, message, snapshot }) => {
            warn!(flow = ?flow_type, tag, %message, "flow failed");
            let mut payload = snapshot;
            payload.insert("error".to_string(), Value::String(tag.to_string()));
            inner.signals.emit(actions::FLOW_RESULT, Value::Object(payload));
        }
        Err(FlowInterrupt::Restart) => unreachable!("restart handled by the loop"),
    }

    *inner.state.lock() = FlowState::Idle;
}

fn watch_event(inner: &Arc<EngineInner>, event: ChannelEvent) {
    match event {
        ChannelEvent::TargetDetected { .. } => {
            // Wake a flow paused on insert-card/swap-card.
            let mut control = inner.control.lock();
            if control.waiting_for_card {
                let mut state = inner.state.lock();
                if *state == FlowState::Paused {
                    *state = FlowState::Resuming;
                    control.resumed = true;
                    drop(state);
                    drop(control);
                    inner.resume.notify_all();
                }
            }
        }
        ChannelEvent::TargetLost => {
            // The persistent command set survives flows, not removals.
            if let Some(card) = inner.card.lock().as_mut() {
                card.reset_secure_channel();
            }
        }
        _ => {}
    }
}
