//! Shared test plumbing: a virtual Keycard and a mock channel.
//!
//! The virtual card implements the card side of the protocols with the
//! crate's own crypto helpers (the protocol is symmetric), so the host
//! stack is exercised end to end: pairing cryptograms, the ECDH channel
//! open, frame encryption and MAC chaining, and the applet's state
//! quirks (GET STATUS required between channel open and VERIFY PIN).

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::thread;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use crossbeam_channel::Receiver;
use iso7816_tlv::ber::{Tag, Tlv, Value};
use k256::ecdsa::SigningKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use keycard_channel::{Channel, ChannelError, ChannelEvent, EventHub};
use keycard_host::crypto::{
    ApduMeta, Challenge, PairingToken, ScpIv, ScpKey, calculate_cryptogram, calculate_mac,
    decrypt_data, ecdh_shared_secret, encrypt_data, generate_pairing_token,
};

// Instruction bytes, mirrored from the applet protocol.
pub const INS_SELECT: u8 = 0xA4;
pub const INS_INIT: u8 = 0xFE;
pub const INS_OPEN_SECURE_CHANNEL: u8 = 0x10;
pub const INS_MUTUALLY_AUTHENTICATE: u8 = 0x11;
pub const INS_PAIR: u8 = 0x12;
pub const INS_VERIFY_PIN: u8 = 0x20;
pub const INS_CHANGE_PIN: u8 = 0x21;
pub const INS_UNBLOCK_PIN: u8 = 0x22;
pub const INS_SIGN: u8 = 0xC0;
pub const INS_EXPORT_KEY: u8 = 0xC2;
pub const INS_GET_DATA: u8 = 0xCA;
pub const INS_LOAD_KEY: u8 = 0xD0;
pub const INS_GENERATE_MNEMONIC: u8 = 0xD2;
pub const INS_STORE_DATA: u8 = 0xE2;
pub const INS_GET_STATUS: u8 = 0xF2;
pub const INS_FACTORY_RESET: u8 = 0xFD;

const SW_OK: u16 = 0x9000;
const SW_SECURITY: u16 = 0x6982;
const SW_CONDITIONS: u16 = 0x6985;
const SW_FILE_FULL: u16 = 0x6A84;
const SW_BAD_P1P2: u16 = 0x6A86;
const SW_INTERNAL: u16 = 0x6F00;

struct CardScp {
    enc: ScpKey,
    mac: ScpKey,
    iv: ScpIv,
}

/// A software rendition of the Keycard applet.
pub struct VirtualCard {
    secret: k256::SecretKey,
    instance_uid: [u8; 16],
    version: (u8, u8),
    max_slots: u8,
    initialized: bool,
    pin: String,
    puk: String,
    pairing_token: PairingToken,
    pin_retries: u8,
    puk_retries: u8,
    pairings: HashMap<u8, [u8; 32]>,
    master_seed: Option<[u8; 64]>,
    data_slots: HashMap<u8, Vec<u8>>,

    scp: Option<CardScp>,
    pin_verified: bool,
    status_fetched: bool,
    pair_card_challenge: Option<Challenge>,
    current_key: Option<k256::SecretKey>,
    counter: u64,
}

impl VirtualCard {
    /// A pre-initialized card: applet installed, no credentials yet.
    /// Every card gets a distinct instance UID.
    pub fn pre_initialized() -> Self {
        static CARD_SEQ: AtomicU16 = AtomicU16::new(1);
        let seq = CARD_SEQ.fetch_add(1, Ordering::Relaxed);
        let mut instance_uid = *b"\x01\x02\x03\x04\x05\x06\x07\x08\x09\x0A\x0B\x0C\x0D\x0E\x00\x00";
        instance_uid[14..].copy_from_slice(&seq.to_be_bytes());
        Self {
            secret: k256::SecretKey::random(&mut rand_v8::thread_rng()),
            instance_uid,
            version: (3, 1),
            max_slots: 5,
            initialized: false,
            pin: String::new(),
            puk: String::new(),
            pairing_token: PairingToken::default(),
            pin_retries: 3,
            puk_retries: 5,
            pairings: HashMap::new(),
            master_seed: None,
            data_slots: HashMap::new(),
            scp: None,
            pin_verified: false,
            status_fetched: false,
            pair_card_challenge: None,
            current_key: None,
            counter: 0,
        }
    }

    /// An initialized card with the given credentials and no keys loaded.
    pub fn initialized(pin: &str, puk: &str, pairing_password: &str) -> Self {
        let mut card = Self::pre_initialized();
        card.initialized = true;
        card.pin = pin.to_string();
        card.puk = puk.to_string();
        card.pairing_token = generate_pairing_token(pairing_password);
        card
    }

    /// An initialized card that already carries a master key.
    pub fn with_keys(pin: &str, puk: &str, pairing_password: &str) -> Self {
        let mut card = Self::initialized(pin, puk, pairing_password);
        card.master_seed = Some([0x5E; 64]);
        card
    }

    /// UID the channel reports for this card.
    pub fn uid(&self) -> String {
        hex::encode(&self.instance_uid[14..])
    }

    /// Lowercase hex instance UID (pairing store key).
    pub fn instance_uid_hex(&self) -> String {
        hex::encode(self.instance_uid)
    }

    /// Grant a pairing directly, as if a previous run had paired.
    pub fn grant_pairing(&mut self, password: &str) -> ([u8; 32], u8) {
        let token = generate_pairing_token(password);
        let salt = self.random_block();
        let key: [u8; 32] = {
            let mut hasher = Sha256::new();
            hasher.update(token);
            hasher.update(salt);
            hasher.finalize().into()
        };
        let index = self.free_slot().expect("no free pairing slot");
        self.pairings.insert(index, key);
        (key, index)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn has_keys(&self) -> bool {
        self.master_seed.is_some()
    }

    pub fn data_slot(&self, slot: u8) -> Option<&Vec<u8>> {
        self.data_slots.get(&slot)
    }

    pub fn set_data_slot(&mut self, slot: u8, blob: Vec<u8>) {
        self.data_slots.insert(slot, blob);
    }

    fn free_slot(&self) -> Option<u8> {
        (0..self.max_slots).find(|i| !self.pairings.contains_key(i))
    }

    // Deterministic per-card "randomness" keeps failures reproducible.
    fn random_block(&mut self) -> [u8; 32] {
        self.counter += 1;
        let mut hasher = Sha256::new();
        hasher.update(self.instance_uid);
        hasher.update(self.counter.to_be_bytes());
        hasher.finalize().into()
    }

    fn key_uid(&self) -> Option<[u8; 32]> {
        let master = self.master_key()?;
        let point = master.public_key().to_encoded_point(false);
        Some(Sha256::digest(point.as_bytes()).into())
    }

    fn master_key(&self) -> Option<k256::SecretKey> {
        self.master_seed.map(|seed| scalar_key(&seed))
    }

    fn derive_key(&self, path: &[u8]) -> Option<k256::SecretKey> {
        let seed = self.master_seed?;
        if path.is_empty() {
            return Some(scalar_key(&seed));
        }
        let mut data = seed.to_vec();
        data.extend_from_slice(path);
        Some(scalar_key(&data))
    }

    /// Process one raw APDU and produce the raw response.
    pub fn process(&mut self, apdu: &[u8]) -> Vec<u8> {
        if apdu.len() < 4 {
            return sw_bytes(SW_INTERNAL);
        }
        let (cla, ins, p1, p2) = (apdu[0], apdu[1], apdu[2], apdu[3]);
        let data: &[u8] = if apdu.len() > 5 {
            let lc = apdu[4] as usize;
            if apdu.len() < 5 + lc {
                return sw_bytes(SW_INTERNAL);
            }
            &apdu[5..5 + lc]
        } else {
            &[]
        };
        let data = data.to_vec();

        // Commands outside the secure channel.
        match (cla, ins) {
            (0x00, INS_SELECT) => return self.select(),
            (0x80, INS_FACTORY_RESET) => return self.factory_reset(p1, p2),
            (0x80, INS_INIT) => return self.init(&data),
            (0x80, INS_PAIR) => return self.pair(p1, &data),
            (0x80, INS_OPEN_SECURE_CHANNEL) => return self.open_secure_channel(p1, &data),
            _ => {}
        }

        // The public data slot is world-readable; GET DATA works in clear
        // when no channel is open.
        if self.scp.is_none() && cla == 0x80 && ins == INS_GET_DATA {
            return respond(
                self.data_slots.get(&p1).cloned().unwrap_or_default(),
                SW_OK,
            );
        }

        // Everything else must travel through the secure channel.
        if self.scp.is_none() {
            return sw_bytes(SW_SECURITY);
        }
        let plaintext = match self.unwrap_command(cla, ins, p1, p2, &data) {
            Ok(plaintext) => plaintext,
            Err(sw) => return sw_bytes(sw),
        };

        let (payload, sw) = self.dispatch_secure(ins, p1, p2, &plaintext);
        self.wrap_response(&payload, sw)
    }

    fn dispatch_secure(&mut self, ins: u8, p1: u8, _p2: u8, data: &[u8]) -> (Vec<u8>, u16) {
        match ins {
            INS_MUTUALLY_AUTHENTICATE => {
                if data.len() == 32 {
                    (self.random_block().to_vec(), SW_OK)
                } else {
                    (Vec::new(), SW_SECURITY)
                }
            }
            INS_GET_STATUS => match p1 {
                0x00 => {
                    self.status_fetched = true;
                    (self.status_template(), SW_OK)
                }
                0x01 => (Vec::new(), SW_OK),
                _ => (Vec::new(), SW_BAD_P1P2),
            },
            INS_VERIFY_PIN => {
                // The applet state machine is mis-initialized until a
                // GET STATUS ran on this channel; verifying first fails
                // with an opaque internal error.
                if !self.status_fetched {
                    return (Vec::new(), SW_INTERNAL);
                }
                if self.pin_retries == 0 {
                    return (Vec::new(), 0x63C0);
                }
                if data == self.pin.as_bytes() {
                    self.pin_verified = true;
                    self.pin_retries = 3;
                    (Vec::new(), SW_OK)
                } else {
                    self.pin_retries -= 1;
                    (Vec::new(), 0x63C0 | self.pin_retries as u16)
                }
            }
            INS_CHANGE_PIN => {
                if !self.pin_verified {
                    return (Vec::new(), SW_CONDITIONS);
                }
                match p1 {
                    0x00 => self.pin = String::from_utf8_lossy(data).into_owned(),
                    0x01 => self.puk = String::from_utf8_lossy(data).into_owned(),
                    0x02 => {
                        if data.len() != 32 {
                            return (Vec::new(), SW_SECURITY);
                        }
                        self.pairing_token = *PairingToken::from_slice(data);
                    }
                    _ => return (Vec::new(), SW_BAD_P1P2),
                }
                (Vec::new(), SW_OK)
            }
            INS_UNBLOCK_PIN => {
                if self.puk_retries == 0 {
                    return (Vec::new(), 0x63C0);
                }
                if data.len() != 18 {
                    return (Vec::new(), SW_SECURITY);
                }
                let (puk, new_pin) = data.split_at(12);
                if puk == self.puk.as_bytes() {
                    self.pin = String::from_utf8_lossy(new_pin).into_owned();
                    self.pin_retries = 3;
                    self.puk_retries = 5;
                    (Vec::new(), SW_OK)
                } else {
                    self.puk_retries -= 1;
                    (Vec::new(), 0x63C0 | self.puk_retries as u16)
                }
            }
            INS_GENERATE_MNEMONIC => {
                if !(4..=8).contains(&p1) {
                    return (Vec::new(), SW_BAD_P1P2);
                }
                let words = p1 as usize * 3;
                let mut payload = Vec::with_capacity(words * 2);
                for _ in 0..words {
                    let block = self.random_block();
                    let index = u16::from_be_bytes([block[0], block[1]]) % 2048;
                    payload.extend_from_slice(&index.to_be_bytes());
                }
                (payload, SW_OK)
            }
            INS_LOAD_KEY => {
                if !self.pin_verified {
                    return (Vec::new(), SW_CONDITIONS);
                }
                if p1 != 0x03 || data.len() != 64 {
                    return (Vec::new(), SW_BAD_P1P2);
                }
                self.master_seed = Some(data.try_into().unwrap());
                (self.key_uid().unwrap().to_vec(), SW_OK)
            }
            INS_EXPORT_KEY => self.export_key(p1, _p2, data),
            INS_SIGN => self.sign(p1, data),
            INS_GET_DATA => (
                self.data_slots.get(&p1).cloned().unwrap_or_default(),
                SW_OK,
            ),
            INS_STORE_DATA => {
                if !self.pin_verified {
                    return (Vec::new(), SW_CONDITIONS);
                }
                self.data_slots.insert(p1, data.to_vec());
                (Vec::new(), SW_OK)
            }
            _ => (Vec::new(), 0x6D00),
        }
    }

    fn select(&mut self) -> Vec<u8> {
        // SELECT resets the applet session state.
        self.scp = None;
        self.pin_verified = false;
        self.status_fetched = false;
        self.current_key = None;

        let public_key = self.secret.public_key().to_encoded_point(false);
        let body = if self.initialized {
            let free = self.max_slots - self.pairings.len() as u8;
            tlv_constructed(
                0xA4,
                vec![
                    tlv(0x8F, self.instance_uid.to_vec()),
                    tlv(0x80, public_key.as_bytes().to_vec()),
                    tlv(0x02, vec![self.version.0, self.version.1]),
                    tlv(0x02, vec![free]),
                    tlv(0x8E, self.key_uid().map(|u| u.to_vec()).unwrap_or_default()),
                    tlv(0x8D, vec![0x0F]),
                ],
            )
        } else {
            tlv(0x80, public_key.as_bytes().to_vec()).to_vec()
        };

        respond(body, SW_OK)
    }

    fn factory_reset(&mut self, p1: u8, p2: u8) -> Vec<u8> {
        if p1 != 0xAA || p2 != 0x55 {
            return sw_bytes(SW_BAD_P1P2);
        }
        self.secret = k256::SecretKey::random(&mut rand_v8::thread_rng());
        self.initialized = false;
        self.pin.clear();
        self.puk.clear();
        self.pairing_token = PairingToken::default();
        self.pin_retries = 3;
        self.puk_retries = 5;
        self.pairings.clear();
        self.master_seed = None;
        self.data_slots.clear();
        self.scp = None;
        self.pin_verified = false;
        self.status_fetched = false;
        self.current_key = None;
        sw_bytes(SW_OK)
    }

    fn init(&mut self, data: &[u8]) -> Vec<u8> {
        if self.initialized {
            return sw_bytes(SW_CONDITIONS);
        }
        if data.len() < 1 + 65 + 16 + 16 {
            return sw_bytes(SW_SECURITY);
        }
        let key_len = data[0] as usize;
        let host_public = match k256::PublicKey::from_sec1_bytes(&data[1..1 + key_len]) {
            Ok(key) => key,
            Err(_) => return sw_bytes(SW_SECURITY),
        };
        let iv = &data[1 + key_len..1 + key_len + 16];
        let ciphertext = &data[1 + key_len + 16..];

        let secret = ecdh_shared_secret(&self.secret, &host_public);
        let mut buf = BytesMut::from(ciphertext);
        let plaintext = match decrypt_data(
            &mut buf,
            ScpKey::from_slice(secret.raw_secret_bytes()),
            ScpIv::from_slice(iv),
        ) {
            Ok(plaintext) => plaintext,
            Err(_) => return sw_bytes(SW_SECURITY),
        };
        if plaintext.len() != 6 + 12 + 32 {
            return sw_bytes(SW_SECURITY);
        }

        self.pin = String::from_utf8_lossy(&plaintext[..6]).into_owned();
        self.puk = String::from_utf8_lossy(&plaintext[6..18]).into_owned();
        self.pairing_token = *PairingToken::from_slice(&plaintext[18..]);
        self.initialized = true;
        sw_bytes(SW_OK)
    }

    fn pair(&mut self, p1: u8, data: &[u8]) -> Vec<u8> {
        match p1 {
            0x00 => {
                if self.free_slot().is_none() {
                    return sw_bytes(SW_FILE_FULL);
                }
                if data.len() != 32 {
                    return sw_bytes(SW_SECURITY);
                }
                let client_challenge = Challenge::clone_from_slice(data);
                let cryptogram = calculate_cryptogram(&self.pairing_token, &client_challenge);
                let card_challenge = Challenge::clone_from_slice(&self.random_block());
                self.pair_card_challenge = Some(card_challenge);

                let mut payload = cryptogram.to_vec();
                payload.extend_from_slice(&card_challenge);
                respond(payload, SW_OK)
            }
            0x01 => {
                let Some(card_challenge) = self.pair_card_challenge.take() else {
                    return sw_bytes(SW_BAD_P1P2);
                };
                let expected = calculate_cryptogram(&self.pairing_token, &card_challenge);
                if data != expected.as_slice() {
                    return sw_bytes(SW_SECURITY);
                }
                let Some(index) = self.free_slot() else {
                    return sw_bytes(SW_FILE_FULL);
                };
                let salt = self.random_block();
                let key: [u8; 32] = {
                    let mut hasher = Sha256::new();
                    hasher.update(self.pairing_token);
                    hasher.update(salt);
                    hasher.finalize().into()
                };
                self.pairings.insert(index, key);

                let mut payload = vec![index];
                payload.extend_from_slice(&salt);
                respond(payload, SW_OK)
            }
            _ => sw_bytes(SW_BAD_P1P2),
        }
    }

    fn open_secure_channel(&mut self, p1: u8, data: &[u8]) -> Vec<u8> {
        let Some(pairing_key) = self.pairings.get(&p1).copied() else {
            return sw_bytes(SW_BAD_P1P2);
        };
        let host_public = match k256::PublicKey::from_sec1_bytes(data) {
            Ok(key) => key,
            Err(_) => return sw_bytes(SW_SECURITY),
        };

        let challenge = Challenge::clone_from_slice(&self.random_block());
        let iv_block = self.random_block();
        let iv = ScpIv::clone_from_slice(&iv_block[..16]);

        let secret = ecdh_shared_secret(&self.secret, &host_public);
        let (enc, mac) =
            keycard_host::crypto::derive_session_keys(&secret, ScpKey::from_slice(&pairing_key), &challenge);
        self.scp = Some(CardScp { enc, mac, iv });
        self.pin_verified = false;
        self.status_fetched = false;
        self.current_key = None;

        let mut payload = challenge.to_vec();
        payload.extend_from_slice(&iv);
        respond(payload, SW_OK)
    }

    fn export_key(&mut self, p1: u8, p2: u8, data: &[u8]) -> (Vec<u8>, u16) {
        if !self.pin_verified {
            return (Vec::new(), SW_CONDITIONS);
        }
        if self.master_seed.is_none() {
            return (Vec::new(), SW_CONDITIONS);
        }

        let key = match p1 {
            0x00 => match &self.current_key {
                Some(key) => key.clone(),
                None => return (Vec::new(), SW_CONDITIONS),
            },
            0x01 | 0x02 => {
                let Some(key) = self.derive_key(data) else {
                    return (Vec::new(), SW_CONDITIONS);
                };
                if p1 == 0x02 {
                    self.current_key = Some(key.clone());
                }
                key
            }
            _ => return (Vec::new(), SW_BAD_P1P2),
        };

        let public = key.public_key().to_encoded_point(false);
        let mut fields = Vec::new();
        match p2 {
            0x00 => {
                fields.push(tlv(0x80, public.as_bytes().to_vec()));
                fields.push(tlv(0x81, key.to_bytes().to_vec()));
            }
            0x01 => {
                fields.push(tlv(0x80, public.as_bytes().to_vec()));
            }
            0x02 => {
                let chain: [u8; 32] = {
                    let mut hasher = Sha256::new();
                    hasher.update(b"chain");
                    hasher.update(data);
                    hasher.finalize().into()
                };
                fields.push(tlv(0x80, public.as_bytes().to_vec()));
                fields.push(tlv(0x82, chain.to_vec()));
            }
            _ => return (Vec::new(), SW_BAD_P1P2),
        }

        (tlv_constructed(0xA1, fields), SW_OK)
    }

    fn sign(&mut self, p1: u8, data: &[u8]) -> (Vec<u8>, u16) {
        if !self.pin_verified {
            return (Vec::new(), SW_CONDITIONS);
        }
        if data.len() < 32 {
            return (Vec::new(), SW_SECURITY);
        }
        let (hash, path) = data.split_at(32);

        let key = match p1 {
            0x00 => match &self.current_key {
                Some(key) => key.clone(),
                None => return (Vec::new(), SW_CONDITIONS),
            },
            0x01 => match self.derive_key(path) {
                Some(key) => key,
                None => return (Vec::new(), SW_CONDITIONS),
            },
            _ => return (Vec::new(), SW_BAD_P1P2),
        };

        let (signature, _) = SigningKey::from(&key)
            .sign_prehash_recoverable(hash)
            .expect("signing cannot fail on a 32-byte hash");
        let bytes = signature.to_bytes();
        let (r, s) = bytes.split_at(32);

        let public = key.public_key().to_encoded_point(false);
        let template = tlv_constructed(
            0xA0,
            vec![
                tlv(0x80, public.as_bytes().to_vec()),
                tlv_constructed_tlv(
                    0x30,
                    vec![tlv(0x02, r.to_vec()), tlv(0x02, s.to_vec())],
                ),
            ],
        );
        (template, SW_OK)
    }

    fn status_template(&self) -> Vec<u8> {
        tlv_constructed(
            0xA3,
            vec![
                tlv(0x02, vec![self.pin_retries]),
                tlv(0x02, vec![self.puk_retries]),
                tlv(
                    0x01,
                    vec![if self.master_seed.is_some() { 0xFF } else { 0x00 }],
                ),
            ],
        )
    }

    fn unwrap_command(
        &mut self,
        cla: u8,
        ins: u8,
        p1: u8,
        p2: u8,
        data: &[u8],
    ) -> Result<Vec<u8>, u16> {
        let scp = self.scp.as_mut().ok_or(SW_SECURITY)?;
        if data.len() < 32 {
            return Err(SW_SECURITY);
        }
        let (mac, ciphertext) = data.split_at(16);

        let mut meta = ApduMeta::default();
        meta[0] = cla;
        meta[1] = ins;
        meta[2] = p1;
        meta[3] = p2;
        meta[4] = data.len() as u8;
        let expected = calculate_mac(&meta, ciphertext, &scp.mac);
        if expected.as_slice() != mac {
            return Err(SW_SECURITY);
        }

        let mut buf = BytesMut::from(ciphertext);
        let plaintext = decrypt_data(&mut buf, &scp.enc, &scp.iv).map_err(|_| SW_SECURITY)?;
        scp.iv = expected;
        Ok(plaintext.to_vec())
    }

    fn wrap_response(&mut self, payload: &[u8], sw: u16) -> Vec<u8> {
        let scp = self.scp.as_mut().expect("secure channel must be open");

        let mut plaintext = BytesMut::from(payload);
        plaintext.extend_from_slice(&sw.to_be_bytes());
        let ciphertext = encrypt_data(&mut plaintext, &scp.enc, &scp.iv);

        let mut meta = ApduMeta::default();
        meta[0] = (ciphertext.len() + 16) as u8;
        let mac = calculate_mac(&meta, &ciphertext, &scp.mac);
        scp.iv = mac;

        let mut out = mac.to_vec();
        out.extend_from_slice(&ciphertext);
        out.extend_from_slice(&SW_OK.to_be_bytes());
        out
    }
}

fn scalar_key(bytes: &[u8]) -> k256::SecretKey {
    let mut digest: [u8; 32] = Sha256::digest(bytes).into();
    loop {
        if let Ok(key) = k256::SecretKey::from_slice(&digest) {
            return key;
        }
        digest = Sha256::digest(digest).into();
    }
}

fn tlv(tag: u8, value: Vec<u8>) -> Tlv {
    Tlv::new(Tag::try_from(tag).unwrap(), Value::Primitive(value)).unwrap()
}

fn tlv_constructed_tlv(tag: u8, fields: Vec<Tlv>) -> Tlv {
    Tlv::new(Tag::try_from(tag).unwrap(), Value::Constructed(fields)).unwrap()
}

fn tlv_constructed(tag: u8, fields: Vec<Tlv>) -> Vec<u8> {
    tlv_constructed_tlv(tag, fields).to_vec()
}

fn sw_bytes(sw: u16) -> Vec<u8> {
    sw.to_be_bytes().to_vec()
}

fn respond(mut payload: Vec<u8>, sw: u16) -> Vec<u8> {
    payload.extend_from_slice(&sw.to_be_bytes());
    payload
}

/// Mock channel hosting a [`VirtualCard`], with a transcript of the
/// plaintext APDU headers and an APDU-interleaving detector.
pub struct MockChannel {
    card: Mutex<Option<VirtualCard>>,
    events: EventHub,
    transcript: Mutex<Vec<u8>>,
    present: AtomicBool,
    connected: Mutex<Option<String>>,
    detecting: AtomicBool,
    in_flight: AtomicBool,
    overlap: AtomicBool,
}

impl MockChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            card: Mutex::new(None),
            events: EventHub::new(),
            transcript: Mutex::new(Vec::new()),
            present: AtomicBool::new(false),
            connected: Mutex::new(None),
            detecting: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
            overlap: AtomicBool::new(false),
        })
    }

    /// Put a card on the reader and report it.
    pub fn insert_card(&self, card: VirtualCard) {
        let uid = card.uid();
        *self.card.lock() = Some(card);
        self.present.store(true, Ordering::Release);
        *self.connected.lock() = Some(uid.clone());
        if self.detecting.load(Ordering::Acquire) {
            self.events.emit(ChannelEvent::TargetDetected { uid });
        }
    }

    /// Remove the card, reporting the loss.
    pub fn remove_card(&self) -> Option<VirtualCard> {
        self.present.store(false, Ordering::Release);
        *self.connected.lock() = None;
        let card = self.card.lock().take();
        if self.detecting.load(Ordering::Acquire) {
            self.events.emit(ChannelEvent::TargetLost);
        }
        card
    }

    /// Report the same card again, as an NFC auto-resume would.
    pub fn tap_again(&self) {
        let uid = self.connected.lock().clone();
        if let Some(uid) = uid {
            self.events.emit(ChannelEvent::TargetDetected { uid });
        }
    }

    /// Inspect the card in place.
    pub fn with_card<T>(&self, f: impl FnOnce(&mut VirtualCard) -> T) -> T {
        f(self.card.lock().as_mut().expect("no card inserted"))
    }

    /// Instruction bytes of every transmitted APDU, in order.
    pub fn transcript(&self) -> Vec<u8> {
        self.transcript.lock().clone()
    }

    pub fn clear_transcript(&self) {
        self.transcript.lock().clear();
    }

    /// Whether two APDU exchanges ever overlapped.
    pub fn saw_overlap(&self) -> bool {
        self.overlap.load(Ordering::Acquire)
    }
}

impl Channel for MockChannel {
    fn start_detection(&self) -> Result<(), ChannelError> {
        if self.detecting.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.events.emit(ChannelEvent::ReaderAvailabilityChanged(true));
        if self.present.load(Ordering::Acquire) {
            if let Some(uid) = self.connected.lock().clone() {
                self.events.emit(ChannelEvent::TargetDetected { uid });
            }
        }
        Ok(())
    }

    fn stop_detection(&self) {
        self.detecting.store(false, Ordering::Release);
    }

    fn subscribe(&self) -> Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    fn transmit(&self, apdu: &[u8]) -> Result<Bytes, ChannelError> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            self.overlap.store(true, Ordering::Release);
        }
        // Widen the window so interleaving callers would be caught.
        thread::sleep(Duration::from_micros(200));

        let result = {
            let mut guard = self.card.lock();
            match (self.connected.lock().is_some(), guard.as_mut()) {
                (true, Some(card)) => {
                    if apdu.len() >= 2 {
                        self.transcript.lock().push(apdu[1]);
                    }
                    Ok(Bytes::from(card.process(apdu)))
                }
                _ => Err(ChannelError::NotConnected),
            }
        };

        self.in_flight.store(false, Ordering::Release);
        result
    }

    fn is_target_present(&self) -> bool {
        self.present.load(Ordering::Acquire)
    }

    fn connected_uid(&self) -> Option<String> {
        self.connected.lock().clone()
    }

    fn disconnect(&self) {
        *self.connected.lock() = None;
    }

    fn force_scan(&self) {
        if !self.present.load(Ordering::Acquire) {
            return;
        }
        let uid = self
            .card
            .lock()
            .as_ref()
            .map(VirtualCard::uid)
            .expect("present without card");
        *self.connected.lock() = Some(uid.clone());
        if self.detecting.load(Ordering::Acquire) {
            self.events.emit(ChannelEvent::TargetDetected { uid });
        }
    }
}

/// Collect signals into a channel for assertions.
pub fn recording_bus() -> (keycard_host::SignalBus, Receiver<serde_json::Value>) {
    let bus = keycard_host::SignalBus::new();
    let (tx, rx) = crossbeam_channel::unbounded();
    bus.on(move |signal| {
        let value: serde_json::Value = serde_json::from_str(signal).expect("signals are JSON");
        // The receiver may be gone when a test tears down first.
        let _ = tx.send(value);
    });
    (bus, rx)
}

/// Wait until `predicate` holds or panic after ten seconds (the pairing
/// KDF is slow in unoptimized builds).
pub fn wait_until(mut predicate: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if predicate() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("condition not reached within ten seconds");
}
