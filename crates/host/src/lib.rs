//! Keycard host library.
//!
//! Drives a Keycard-class smart card over ISO 7816 APDUs through a
//! [`keycard_channel::Channel`] and exposes two coordinated facades:
//!
//! - [`SessionManager`]: long-lived per-command access. One card at a
//!   time, a session state machine, and a flat procedural API (authorize,
//!   initialize, key export, metadata, ...).
//! - [`FlowEngine`]: pausable, user-guided multi-step procedures (login,
//!   account load, recover, sign, credential changes, metadata), resumed
//!   with user input and broadcast over the [`SignalBus`].
//!
//! Pairings persist across runs in a [`PairingStore`]; all traffic after
//! the channel opens travels through an AES-256 secure channel keyed by
//! ECDH plus the pairing secret.

mod apdu;
mod command_set;
pub mod constants;
pub mod crypto;
mod error;
mod flow;
mod pairing_store;
mod secrets;
mod secure_channel;
mod session;
mod signal;
mod types;

pub use apdu::{Command, Response, status};
pub use command_set::{CommandSet, ExportOption, StatusTarget};
pub use error::{Error, Result};
pub use flow::{FlowEngine, FlowState, FlowType, actions, errors, valid_transition};
pub use pairing_store::PairingStore;
pub use secrets::Secrets;
pub use secure_channel::SecureChannel;
pub use session::{LoginKeys, RecoveryKeys, SessionManager, SessionState};
pub use signal::{SignalBus, SignalHandler};
pub use types::{
    ApplicationInfo, ApplicationStatus, Keypair, Metadata, PairingInfo, Signature, Version,
};

/// Render BIP39 word indices as a phrase using the English wordlist.
pub fn mnemonic_from_indices(indices: &[u16]) -> Result<String> {
    use coins_bip39::Wordlist;

    let mut words = Vec::with_capacity(indices.len());
    for &index in indices {
        let word = coins_bip39::English::get(index as usize)
            .map_err(|_| Error::InvalidData("mnemonic index out of wordlist range"))?;
        words.push(word);
    }
    Ok(words.join(" "))
}
