//! Session manager integration tests against the virtual card.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::Receiver;
use serde_json::Value;
use tempfile::TempDir;

use keycard_channel::Channel;
use keycard_host::{Error, Metadata, SessionManager, SessionState};

use common::{
    INS_GET_STATUS, INS_MUTUALLY_AUTHENTICATE, INS_OPEN_SECURE_CHANNEL, INS_PAIR, INS_SELECT,
    INS_VERIFY_PIN, MockChannel, VirtualCard, recording_bus, wait_until,
};

const PIN: &str = "123456";
const PUK: &str = "123456123456";
const DEFAULT_PAIRING: &str = "KeycardDefaultPairing";

struct Harness {
    manager: SessionManager,
    channel: Arc<MockChannel>,
    signals: Receiver<Value>,
    storage: TempDir,
}

fn start_manager() -> Harness {
    let channel = MockChannel::new();
    let (bus, signals) = recording_bus();
    let manager = SessionManager::new(channel.clone() as Arc<dyn Channel>, bus);
    let storage = tempfile::tempdir().unwrap();
    manager.start(storage.path().join("pairings.json")).unwrap();
    Harness {
        manager,
        channel,
        signals,
        storage,
    }
}

fn start_with_card(card: VirtualCard, expected: SessionState) -> Harness {
    let harness = start_manager();
    harness.channel.insert_card(card);
    let manager = harness.manager.clone();
    wait_until(|| manager.state() == expected);
    harness
}

fn positions(transcript: &[u8], ins: u8) -> Vec<usize> {
    transcript
        .iter()
        .enumerate()
        .filter_map(|(i, &b)| (b == ins).then_some(i))
        .collect()
}

#[test]
fn start_is_idempotent_rejecting() {
    let harness = start_manager();
    assert!(matches!(
        harness.manager.start(harness.storage.path().join("other.json")),
        Err(Error::AlreadyStarted)
    ));
    harness.manager.stop();
    // After stop, start is allowed again.
    harness
        .manager
        .start(harness.storage.path().join("pairings.json"))
        .unwrap();
    harness.manager.stop();
}

#[test]
fn connect_sequence_runs_protocol_once_per_insertion() {
    let harness = start_with_card(
        VirtualCard::with_keys(PIN, PUK, DEFAULT_PAIRING),
        SessionState::Ready,
    );

    // One SELECT, one two-stage PAIR, one channel open with mutual
    // authentication, and GET STATUS before anything PIN-related.
    let transcript = harness.channel.transcript();
    assert_eq!(positions(&transcript, INS_SELECT).len(), 1);
    assert_eq!(positions(&transcript, INS_PAIR).len(), 2);
    assert_eq!(positions(&transcript, INS_OPEN_SECURE_CHANNEL).len(), 1);
    assert_eq!(positions(&transcript, INS_MUTUALLY_AUTHENTICATE).len(), 1);

    let open = positions(&transcript, INS_OPEN_SECURE_CHANNEL)[0];
    let auth = positions(&transcript, INS_MUTUALLY_AUTHENTICATE)[0];
    let status = positions(&transcript, INS_GET_STATUS);
    assert!(!status.is_empty(), "GET STATUS must follow channel open");
    assert!(auth > open);
    assert!(status[0] > auth);
    assert!(positions(&transcript, INS_VERIFY_PIN).is_empty());

    // Session operations afterwards never re-run the connect protocol.
    harness.manager.authorize(PIN).unwrap();
    harness.manager.export_login_keys().unwrap();
    let transcript = harness.channel.transcript();
    assert_eq!(positions(&transcript, INS_SELECT).len(), 1);
    assert_eq!(positions(&transcript, INS_PAIR).len(), 2);
    assert_eq!(positions(&transcript, INS_OPEN_SECURE_CHANNEL).len(), 1);

    // The first VERIFY PIN comes after the first GET STATUS.
    let verify = positions(&transcript, INS_VERIFY_PIN);
    assert!(!verify.is_empty());
    assert!(verify[0] > status[0]);
}

#[test]
fn same_uid_retap_is_suppressed() {
    let harness = start_with_card(
        VirtualCard::with_keys(PIN, PUK, DEFAULT_PAIRING),
        SessionState::Ready,
    );
    while harness.signals.try_recv().is_ok() {}
    harness.channel.clear_transcript();

    harness.channel.tap_again();
    thread::sleep(Duration::from_millis(150));

    assert_eq!(harness.manager.state(), SessionState::Ready);
    assert!(
        harness.channel.transcript().is_empty(),
        "a suppressed re-tap must not touch the card"
    );
    // No connecting-card transition was re-emitted.
    while let Ok(signal) = harness.signals.try_recv() {
        assert_ne!(signal["state"], "connecting-card");
    }
}

#[test]
fn authorize_with_wrong_pin_reports_remaining_attempts() {
    let harness = start_with_card(
        VirtualCard::with_keys(PIN, PUK, DEFAULT_PAIRING),
        SessionState::Ready,
    );

    let err = harness.manager.authorize("000000").unwrap_err();
    assert!(matches!(err, Error::WrongPin { remaining: 2 }));
    assert!(harness.manager.last_error().contains('2'));
    assert_eq!(harness.manager.state(), SessionState::Ready);

    // The right PIN still works and restores the retry counter.
    harness.manager.authorize(PIN).unwrap();
    assert_eq!(harness.manager.state(), SessionState::Authorized);
}

#[test]
fn pin_blocks_after_three_failures_and_puk_recovers() {
    let harness = start_with_card(
        VirtualCard::with_keys(PIN, PUK, DEFAULT_PAIRING),
        SessionState::Ready,
    );

    assert!(matches!(
        harness.manager.authorize("000000"),
        Err(Error::WrongPin { remaining: 2 })
    ));
    assert!(matches!(
        harness.manager.authorize("000000"),
        Err(Error::WrongPin { remaining: 1 })
    ));
    assert!(matches!(
        harness.manager.authorize("000000"),
        Err(Error::PinBlocked)
    ));
    assert_eq!(harness.manager.state(), SessionState::BlockedPIN);

    harness.manager.unblock_pin(PUK, "654321").unwrap();
    assert_eq!(harness.manager.state(), SessionState::Ready);
    harness.manager.authorize("654321").unwrap();
}

#[test]
fn card_operations_never_interleave_on_the_channel() {
    let harness = start_with_card(
        VirtualCard::with_keys(PIN, PUK, DEFAULT_PAIRING),
        SessionState::Ready,
    );
    harness.manager.authorize(PIN).unwrap();

    let handles: Vec<_> = (0..3)
        .map(|i| {
            let manager = harness.manager.clone();
            thread::spawn(move || match i {
                0 => manager.export_login_keys().map(|_| ()),
                1 => manager.get_metadata().map(|_| ()),
                _ => manager.export_recovery_keys().map(|_| ()),
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    assert!(
        !harness.channel.saw_overlap(),
        "APDU round-trips interleaved on the channel"
    );
}

#[test]
fn initialize_empty_card_ends_ready() {
    let harness = start_with_card(VirtualCard::pre_initialized(), SessionState::EmptyKeycard);

    harness.manager.initialize(PIN, PUK, "").unwrap();

    // Teardown plus re-detection drives the full connect sequence again.
    let manager = harness.manager.clone();
    wait_until(|| manager.state() == SessionState::Ready);
    assert!(harness.channel.with_card(|card| card.is_initialized()));
}

#[test]
fn initialize_rejects_malformed_credentials() {
    let harness = start_with_card(VirtualCard::pre_initialized(), SessionState::EmptyKeycard);
    assert!(harness.manager.initialize("12345", PUK, "").is_err());
    assert!(harness.manager.initialize(PIN, "123", "").is_err());
    assert_eq!(harness.manager.state(), SessionState::EmptyKeycard);
}

#[test]
fn pairing_survives_restart_and_is_reused() {
    let harness = start_with_card(
        VirtualCard::with_keys(PIN, PUK, DEFAULT_PAIRING),
        SessionState::Ready,
    );
    let storage = harness.storage;
    let card = harness.channel.remove_card().unwrap();
    harness.manager.stop();

    // A new process: fresh channel and manager over the same store.
    let channel = MockChannel::new();
    let (bus, _signals) = recording_bus();
    let manager = SessionManager::new(channel.clone() as Arc<dyn Channel>, bus);
    manager.start(storage.path().join("pairings.json")).unwrap();
    channel.insert_card(card);
    {
        let manager = manager.clone();
        wait_until(|| manager.state() == SessionState::Ready);
    }

    assert!(
        positions(&channel.transcript(), INS_PAIR).is_empty(),
        "a stored pairing must be reused instead of re-pairing"
    );
    manager.stop();
}

#[test]
fn factory_reset_invalidates_the_session() {
    let harness = start_with_card(
        VirtualCard::with_keys(PIN, PUK, DEFAULT_PAIRING),
        SessionState::Ready,
    );

    harness.manager.factory_reset().unwrap();

    // The wiped card is re-detected as pre-initialized.
    let manager = harness.manager.clone();
    wait_until(|| manager.state() == SessionState::EmptyKeycard);
    assert!(!harness.channel.with_card(|card| card.is_initialized()));
}

#[test]
fn load_mnemonic_loads_a_key_onto_the_card() {
    let harness = start_with_card(
        VirtualCard::initialized(PIN, PUK, DEFAULT_PAIRING),
        SessionState::Ready,
    );
    harness.manager.authorize(PIN).unwrap();

    let mnemonic =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
    let key_uid = harness.manager.load_mnemonic(mnemonic, "").unwrap();
    assert_eq!(key_uid.len(), 64);
    assert!(harness.channel.with_card(|card| card.has_keys()));
}

#[test]
fn metadata_round_trips_through_the_card() {
    let harness = start_with_card(
        VirtualCard::with_keys(PIN, PUK, DEFAULT_PAIRING),
        SessionState::Ready,
    );
    harness.manager.authorize(PIN).unwrap();

    let metadata = Metadata::new("my keycard", [0u32, 1, 2, 7]).unwrap();
    harness.manager.store_metadata(&metadata).unwrap();

    let read_back = harness.manager.get_metadata().unwrap().unwrap();
    assert_eq!(read_back, metadata);
}

#[test]
fn status_snapshot_is_built_from_caches() {
    let harness = start_with_card(
        VirtualCard::with_keys(PIN, PUK, DEFAULT_PAIRING),
        SessionState::Ready,
    );
    harness.channel.clear_transcript();

    let status = harness.manager.status();
    assert_eq!(status["state"], "ready");
    assert!(status["keycardInfo"]["instanceUID"].as_str().unwrap().len() == 32);
    assert_eq!(status["keycardStatus"]["remainingAttemptsPIN"], 3);
    assert!(
        harness.channel.transcript().is_empty(),
        "the status snapshot must not issue APDUs"
    );
}

#[test]
fn operations_require_matching_state() {
    let harness = start_with_card(
        VirtualCard::with_keys(PIN, PUK, DEFAULT_PAIRING),
        SessionState::Ready,
    );

    // Key export before authorize is a state error, not a card error.
    assert!(matches!(
        harness.manager.export_login_keys(),
        Err(Error::InvalidState(_))
    ));
    assert!(matches!(
        harness.manager.initialize(PIN, PUK, ""),
        Err(Error::InvalidState(_))
    ));
}

#[test]
fn card_removal_returns_to_waiting_for_card() {
    let harness = start_with_card(
        VirtualCard::with_keys(PIN, PUK, DEFAULT_PAIRING),
        SessionState::Ready,
    );

    harness.channel.remove_card();
    let manager = harness.manager.clone();
    wait_until(|| manager.state() == SessionState::WaitingForCard);

    // Operations now fail cleanly.
    assert!(harness.manager.authorize(PIN).is_err());
}
