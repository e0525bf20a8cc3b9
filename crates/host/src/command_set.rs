//! Typed wrapper over the Keycard APDU surface.
//!
//! A `CommandSet` owns the live secure-channel state for one card session
//! and is the only place status words are mapped into the error taxonomy.
//! The session manager creates a fresh one per card insertion; the flow
//! engine keeps one alive for its whole lifetime.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use coins_bip32::path::DerivationPath;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use keycard_channel::Channel;

use crate::apdu::{Command, Response, status};
use crate::constants::{CLA_KEYCARD, KEYCARD_AID, ins};
use crate::crypto::{self, Challenge, Cryptogram};
use crate::secrets::Secrets;
use crate::secure_channel::SecureChannel;
use crate::types::{ApplicationInfo, ApplicationStatus, Keypair, PairingInfo, Signature};
use crate::{Error, Result};

/// What EXPORT KEY should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportOption {
    /// Private and public key.
    PrivateAndPublic = 0x00,
    /// Public key only.
    PublicOnly = 0x01,
    /// Public key plus chain code.
    ExtendedPublic = 0x02,
}

/// GET STATUS target selected by P1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusTarget {
    /// Application status: retry counters and key-initialized flag.
    Application = 0x00,
    /// Current derivation path.
    KeyPath = 0x01,
}

/// Typed APDU surface bound to one channel.
pub struct CommandSet {
    channel: Arc<dyn Channel>,
    secure_channel: Option<SecureChannel>,
    application_info: Option<ApplicationInfo>,
    application_status: Option<ApplicationStatus>,
    pairing: Option<PairingInfo>,
    // The card's current-key pointer is unset right after the channel
    // opens; the first derived export must make its key current.
    key_pointer_seeded: bool,
}

impl std::fmt::Debug for CommandSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSet")
            .field("secure_channel_open", &self.secure_channel.is_some())
            .field("application_info", &self.application_info)
            .finish_non_exhaustive()
    }
}

impl CommandSet {
    /// Bind a fresh command set (no secure-channel state) to `channel`.
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self {
            channel,
            secure_channel: None,
            application_info: None,
            application_status: None,
            pairing: None,
            key_pointer_seeded: false,
        }
    }

    /// SELECT the Keycard applet and parse its application info.
    ///
    /// Any previous secure-channel state is forgotten: SELECT resets the
    /// applet state machine card-side.
    pub fn select(&mut self) -> Result<ApplicationInfo> {
        self.reset_secure_channel();

        let cmd = Command::new_with_data(0x00, ins::SELECT, 0x04, 0x00, KEYCARD_AID.to_vec());
        let response = self.transmit_plain(&cmd)?;
        if response.status() == status::SW_FILE_NOT_FOUND {
            return Err(Error::NotAKeycard);
        }
        let payload = response.require_success(false)?;

        let info = ApplicationInfo::parse(payload)?;
        debug!(
            initialized = info.initialized,
            version = %info.version,
            "keycard selected"
        );
        self.application_info = Some(info.clone());
        Ok(info)
    }

    /// INIT a pre-initialized card with the given secrets.
    pub fn init(&mut self, secrets: &Secrets) -> Result<()> {
        let info = self
            .application_info
            .as_ref()
            .ok_or(Error::InvalidState("SELECT required before INIT"))?;
        let card_key = info
            .public_key
            .ok_or(Error::CardProtocol("card reports no secure channel key"))?;

        let host_private = k256::SecretKey::random(&mut rand_v8::thread_rng());
        let secret = crypto::ecdh_shared_secret(&host_private, &card_key);
        let mut plaintext = BytesMut::from(secrets.to_bytes().as_ref());
        let payload = crypto::one_shot_encrypt(&host_private.public_key(), &secret, &mut plaintext);

        let cmd = Command::new_with_data(CLA_KEYCARD, ins::INIT, 0x00, 0x00, payload);
        self.transmit_plain(&cmd)?.require_success(false)?;
        debug!("card initialized");
        Ok(())
    }

    /// Run the two-stage PAIR handshake with `password`.
    pub fn pair(&mut self, password: &str) -> Result<PairingInfo> {
        debug!("pairing with card");
        let token = crypto::generate_pairing_token(password);

        let mut challenge = Challenge::default();
        rand::rng().fill_bytes(&mut challenge);

        let cmd = Command::new_with_data(CLA_KEYCARD, ins::PAIR, 0x00, 0x00, challenge.to_vec());
        let response = self.transmit_plain(&cmd)?;
        let payload = response.require_success(false)?;
        if payload.len() != 64 {
            return Err(Error::CardProtocol("pair first-stage payload length"));
        }

        let card_cryptogram = Cryptogram::clone_from_slice(&payload[..32]);
        let card_challenge = Challenge::clone_from_slice(&payload[32..]);

        // The card proves knowledge of the pairing password first.
        if card_cryptogram != crypto::calculate_cryptogram(&token, &challenge) {
            return Err(Error::WrongPairingPassword);
        }

        let client_cryptogram = crypto::calculate_cryptogram(&token, &card_challenge);
        let cmd = Command::new_with_data(
            CLA_KEYCARD,
            ins::PAIR,
            0x01,
            0x00,
            client_cryptogram.to_vec(),
        );
        let response = self.transmit_plain(&cmd)?;
        if response.status() == status::SW_SECURITY_STATUS_NOT_SATISFIED {
            return Err(Error::WrongPairingPassword);
        }
        let payload = response.require_success(false)?;
        if payload.len() != 33 {
            return Err(Error::CardProtocol("pair final-stage payload length"));
        }

        let index = payload[0];
        let key: [u8; 32] = {
            let mut hasher = Sha256::new();
            hasher.update(token);
            hasher.update(&payload[1..]);
            hasher.finalize().into()
        };

        debug!(index, "pairing established");
        let pairing = PairingInfo { key, index };
        self.pairing = Some(pairing.clone());
        Ok(pairing)
    }

    /// Open the secure channel with a stored pairing.
    pub fn open_secure_channel(&mut self, pairing: &PairingInfo) -> Result<()> {
        let info = self
            .application_info
            .as_ref()
            .ok_or(Error::InvalidState("SELECT required before opening channel"))?;
        let card_key = info
            .public_key
            .ok_or(Error::CardProtocol("card reports no secure channel key"))?;

        let secure_channel = SecureChannel::open(self.channel.as_ref(), &card_key, pairing)?;
        self.secure_channel = Some(secure_channel);
        self.pairing = Some(pairing.clone());
        self.key_pointer_seeded = false;
        Ok(())
    }

    /// Whether a secure channel is currently open on the host side.
    pub const fn is_secure_channel_open(&self) -> bool {
        self.secure_channel.is_some()
    }

    /// Forget the secure-channel keys without touching the card.
    pub fn reset_secure_channel(&mut self) {
        self.secure_channel = None;
        self.application_status = None;
        self.key_pointer_seeded = false;
    }

    /// VERIFY PIN.
    pub fn verify_pin(&mut self, pin: &str) -> Result<()> {
        let cmd = Command::new_with_data(
            CLA_KEYCARD,
            ins::VERIFY_PIN,
            0x00,
            0x00,
            pin.as_bytes().to_vec(),
        );
        self.transmit_secure(cmd)?.require_success(false)?;
        Ok(())
    }

    /// CHANGE PIN (user credential).
    pub fn change_pin(&mut self, new_pin: &str) -> Result<()> {
        self.change_credential(0x00, new_pin.as_bytes().to_vec(), false)
    }

    /// CHANGE PUK (unblocking credential).
    pub fn change_puk(&mut self, new_puk: &str) -> Result<()> {
        self.change_credential(0x01, new_puk.as_bytes().to_vec(), false)
    }

    /// Change the pairing secret; existing pairings of other clients become
    /// invalid at the next channel open.
    pub fn change_pairing_secret(&mut self, new_password: &str) -> Result<()> {
        let token = crypto::generate_pairing_token(new_password);
        self.change_credential(0x02, token.to_vec(), false)
    }

    fn change_credential(&mut self, p1: u8, data: Vec<u8>, puk_context: bool) -> Result<()> {
        let cmd = Command::new_with_data(CLA_KEYCARD, ins::CHANGE_PIN, p1, 0x00, data);
        self.transmit_secure(cmd)?.require_success(puk_context)?;
        Ok(())
    }

    /// UNBLOCK PIN with the PUK, setting a new PIN.
    pub fn unblock_pin(&mut self, puk: &str, new_pin: &str) -> Result<()> {
        let mut data = BytesMut::with_capacity(puk.len() + new_pin.len());
        data.put_slice(puk.as_bytes());
        data.put_slice(new_pin.as_bytes());
        let cmd = Command::new_with_data(
            CLA_KEYCARD,
            ins::UNBLOCK_PIN,
            0x00,
            0x00,
            data.freeze(),
        );
        self.transmit_secure(cmd)?.require_success(true)?;
        Ok(())
    }

    /// GET STATUS (application) and cache the result.
    pub fn get_status(&mut self) -> Result<ApplicationStatus> {
        let cmd = Command::new(CLA_KEYCARD, ins::GET_STATUS, StatusTarget::Application as u8, 0x00)
            .with_le(0);
        let response = self.transmit_secure(cmd)?;
        let status = ApplicationStatus::parse(response.require_success(false)?)?;
        self.application_status = Some(status.clone());
        Ok(status)
    }

    /// GET STATUS (key path): the card's current derivation path.
    pub fn get_key_path(&mut self) -> Result<Vec<u32>> {
        let cmd = Command::new(CLA_KEYCARD, ins::GET_STATUS, StatusTarget::KeyPath as u8, 0x00)
            .with_le(0);
        let response = self.transmit_secure(cmd)?;
        let path = ApplicationStatus::parse_key_path(response.require_success(false)?)?;
        if let Some(cached) = &mut self.application_status {
            cached.derivation_path = Some(path.clone());
        }
        Ok(path)
    }

    /// Last fetched application status; no APDU issued.
    pub const fn cached_application_status(&self) -> Option<&ApplicationStatus> {
        self.application_status.as_ref()
    }

    /// Application info from the last SELECT.
    pub const fn application_info(&self) -> Option<&ApplicationInfo> {
        self.application_info.as_ref()
    }

    /// Pairing in use, if any.
    pub const fn pairing(&self) -> Option<&PairingInfo> {
        self.pairing.as_ref()
    }

    /// GENERATE MNEMONIC: returns `checksum_words * 3` indices into the
    /// BIP39 wordlist.
    pub fn generate_mnemonic(&mut self, checksum_words: u8) -> Result<Vec<u16>> {
        if !(4..=8).contains(&checksum_words) {
            return Err(Error::InvalidData("mnemonic checksum size out of range"));
        }
        let cmd = Command::new(CLA_KEYCARD, ins::GENERATE_MNEMONIC, checksum_words, 0x00)
            .with_le(0);
        let response = self.transmit_secure(cmd)?;
        let payload = response.require_success(false)?;
        if payload.len() % 2 != 0 {
            return Err(Error::CardProtocol("mnemonic payload length"));
        }
        Ok(payload
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect())
    }

    /// LOAD KEY with a 64-byte BIP39 seed; returns the new key UID.
    pub fn load_seed(&mut self, seed: &[u8; 64]) -> Result<[u8; 32]> {
        let cmd = Command::new_with_data(
            CLA_KEYCARD,
            ins::LOAD_KEY,
            0x03,
            0x00,
            seed.to_vec(),
        );
        let response = self.transmit_secure(cmd)?;
        let payload = response.require_success(false)?;
        payload
            .try_into()
            .map_err(|_| Error::CardProtocol("key UID length"))
    }

    /// FACTORY RESET: wipe the card back to the pre-initialized state.
    pub fn factory_reset(&mut self) -> Result<()> {
        let cmd = Command::new(CLA_KEYCARD, ins::FACTORY_RESET, 0xAA, 0x55);
        self.transmit_plain(&cmd)?.require_success(false)?;
        self.reset_secure_channel();
        self.application_info = None;
        self.pairing = None;
        debug!("card factory reset");
        Ok(())
    }

    /// EXPORT KEY.
    ///
    /// With `derive` the key at `path` is derived from the master key;
    /// `make_current` additionally moves the card's current-key pointer.
    pub fn export_key(
        &mut self,
        derive: bool,
        make_current: bool,
        path: &DerivationPath,
        what: ExportOption,
    ) -> Result<Keypair> {
        let p1 = match (derive, make_current) {
            (false, _) => 0x00,
            (true, false) => 0x01,
            (true, true) => 0x02,
        };
        let mut cmd = Command::new(CLA_KEYCARD, ins::EXPORT_KEY, p1, what as u8).with_le(0);
        if derive {
            cmd = cmd.with_data(derivation_path_to_bytes(path));
        }
        let response = self.transmit_secure(cmd)?;
        let keypair = Keypair::parse(response.require_success(false)?)?;
        if derive && make_current {
            self.key_pointer_seeded = true;
        }
        Ok(keypair)
    }

    /// Derived export that seeds the card's current-key pointer on the
    /// first call after channel open and leaves it alone afterwards.
    pub fn export_derived(&mut self, path: &DerivationPath, what: ExportOption) -> Result<Keypair> {
        let make_current = !self.key_pointer_seeded;
        self.export_key(true, make_current, path, what)
    }

    /// SIGN a 32-byte hash, deriving from the master key when a path is
    /// given, with the current key otherwise.
    pub fn sign(&mut self, hash: &[u8; 32], path: Option<&DerivationPath>) -> Result<Signature> {
        let mut data = BytesMut::with_capacity(32 + path.map_or(0, |p| p.iter().count() * 4));
        data.put_slice(hash);
        let p1 = match path {
            Some(path) => {
                data.put_slice(&derivation_path_to_bytes(path));
                0x01
            }
            None => 0x00,
        };
        let cmd =
            Command::new_with_data(CLA_KEYCARD, ins::SIGN, p1, 0x00, data.freeze()).with_le(0);
        let response = self.transmit_secure(cmd)?;
        Signature::parse(response.require_success(false)?, hash)
    }

    /// GET DATA from a persistent slot.
    pub fn get_data(&mut self, slot: u8) -> Result<Vec<u8>> {
        let cmd = Command::new(CLA_KEYCARD, ins::GET_DATA, slot, 0x00).with_le(0);
        let response = self.transmit_routed(cmd)?;
        Ok(response.require_success(false)?.to_vec())
    }

    /// STORE DATA into a persistent slot.
    pub fn store_data(&mut self, slot: u8, data: &[u8]) -> Result<()> {
        let cmd = Command::new_with_data(CLA_KEYCARD, ins::STORE_DATA, slot, 0x00, data.to_vec());
        self.transmit_routed(cmd)?.require_success(false)?;
        Ok(())
    }

    fn transmit_plain(&self, command: &Command) -> Result<Response> {
        trace!(ins = format_args!("{:02X}", command.instruction()), "transmit");
        let raw = self.channel.transmit(&command.to_bytes())?;
        Response::from_bytes(&raw)
    }

    fn transmit_secure(&mut self, command: Command) -> Result<Response> {
        let secure_channel = self
            .secure_channel
            .as_mut()
            .ok_or(Error::SecureChannelNotOpen)?;
        trace!(
            ins = format_args!("{:02X}", command.instruction()),
            "transmit (secure)"
        );
        let wrapped = secure_channel.wrap(command);
        let raw = self.channel.transmit(&wrapped.to_bytes())?;
        let response = Response::from_bytes(&raw)?;
        if response.is_success() {
            secure_channel.unwrap_response(response)
        } else {
            // Errors escape the channel in clear.
            Ok(response)
        }
    }

    // Commands that work with or without a secure channel travel through it
    // whenever one is open, in clear otherwise.
    fn transmit_routed(&mut self, command: Command) -> Result<Response> {
        if self.secure_channel.is_some() {
            self.transmit_secure(command)
        } else {
            self.transmit_plain(&command)
        }
    }
}

fn derivation_path_to_bytes(path: &DerivationPath) -> Bytes {
    path.iter()
        .fold(BytesMut::new(), |mut bytes, component| {
            bytes.extend_from_slice(&component.to_be_bytes());
            bytes
        })
        .freeze()
}

/// Parse a derivation path, accepting the bare master designator `m`.
pub(crate) fn parse_path(path: &str) -> Result<DerivationPath> {
    if path == "m" {
        return Ok(DerivationPath::default());
    }
    path.parse().map_err(Error::from)
}
