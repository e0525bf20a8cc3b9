//! Cryptographic helpers for the Keycard protocols.
//!
//! Covers the pairing handshake, secure-channel session keys and framing
//! primitives (AES-256-CBC with ISO 7816 padding, chained CBC-MAC), the
//! one-shot INIT encryption, BIP39 seed derivation and Ethereum address
//! derivation. The functions are public: the card side of the protocol is
//! the exact mirror of the host side, which the test suite exploits to run a
//! virtual card.

use aes::cipher::{
    BlockDecryptMut, BlockEncryptMut, Iv, IvSizeUser, Key, KeyIvInit, KeySizeUser,
    block_padding::Iso7816,
    typenum::{U16, U32},
};
use alloy_primitives::{Address, keccak256};
use bytes::{Bytes, BytesMut};
use cipher::block_padding::UnpadError;
use generic_array::GenericArray;
use k256::{PublicKey, SecretKey, ecdh::SharedSecret, elliptic_curve::sec1::ToEncodedPoint};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use unicode_normalization::UnicodeNormalization;

/// Salt mixed into the pairing-password KDF, per the Keycard specification.
pub const PAIRING_TOKEN_SALT: &str = "Keycard Pairing Password Salt";

const PAIRING_TOKEN_ITERATIONS: u32 = 50_000;
const BIP39_ITERATIONS: u32 = 2048;

/// 32-byte shared secret derived from the pairing password.
pub type PairingToken = GenericArray<u8, U32>;
/// 32-byte pairing cryptogram.
pub type Cryptogram = GenericArray<u8, U32>;
/// 32-byte random challenge.
pub type Challenge = GenericArray<u8, U32>;
/// 16-byte pseudo-header authenticated alongside each secure-channel frame.
pub type ApduMeta = GenericArray<u8, U16>;
/// 32-byte secure-channel session key.
pub type ScpKey = Key<Scp>;
/// 16-byte secure-channel IV / MAC.
pub type ScpIv = Iv<Scp>;

/// Key/IV size marker for the Keycard secure channel (AES-256, 16-byte IV).
#[derive(Debug, Clone, Copy)]
pub struct Scp;

impl KeySizeUser for Scp {
    type KeySize = U32;
}

impl IvSizeUser for Scp {
    type IvSize = U16;
}

type Encryptor = cbc::Encryptor<aes::Aes256>;
type Decryptor = cbc::Decryptor<aes::Aes256>;

/// ECDH over secp256k1 between a host key and the card key.
pub fn ecdh_shared_secret(private: &SecretKey, public: &PublicKey) -> SharedSecret {
    k256::elliptic_curve::ecdh::diffie_hellman(private.to_nonzero_scalar(), public.as_affine())
}

/// Pairing cryptogram: SHA-256 over the shared pairing token and a challenge.
///
/// Both sides compute this; equality proves knowledge of the pairing
/// password without transmitting it.
pub fn calculate_cryptogram(shared_secret: &PairingToken, challenge: &Challenge) -> Cryptogram {
    let mut hasher = Sha256::new();
    hasher.update(shared_secret);
    hasher.update(challenge);
    hasher.finalize()
}

/// Derive the pairing token from the pairing password.
///
/// PBKDF2-HMAC-SHA256 over the NFKD-normalized password with the Keycard
/// pairing salt, 50 000 iterations, 32-byte output.
pub fn generate_pairing_token(password: &str) -> PairingToken {
    let password = password.nfkd().collect::<String>();
    let salt = PAIRING_TOKEN_SALT.nfkd().collect::<String>();

    let mut token = PairingToken::default();
    pbkdf2_hmac::<Sha256>(
        password.as_bytes(),
        salt.as_bytes(),
        PAIRING_TOKEN_ITERATIONS,
        &mut token,
    );

    token
}

/// Derive the secure-channel session keys.
///
/// (K_enc ‖ K_mac) = SHA-512(ECDH secret ‖ pairing key ‖ card challenge),
/// split into two 32-byte halves.
pub fn derive_session_keys(
    secret: &SharedSecret,
    pairing_key: &Key<Scp>,
    challenge: &Challenge,
) -> (Key<Scp>, Key<Scp>) {
    let mut hasher = Sha512::new();
    hasher.update(secret.raw_secret_bytes());
    hasher.update(pairing_key);
    hasher.update(challenge);
    let data = hasher.finalize();

    let enc_key = Key::<Scp>::clone_from_slice(&data[0..32]);
    let mac_key = Key::<Scp>::clone_from_slice(&data[32..64]);

    (enc_key, mac_key)
}

/// AES-256-CBC encrypt `data` in place with ISO 7816 padding.
pub fn encrypt_data(data: &mut BytesMut, enc_key: &Key<Scp>, iv: &Iv<Scp>) -> Bytes {
    let msg_len = prepare_padding(data);
    // SAFETY: the buffer was grown to a multiple of the block size, so
    // padded encryption cannot fail.
    let encrypted = Encryptor::new(enc_key, iv)
        .encrypt_padded_mut::<Iso7816>(data, msg_len)
        .unwrap();
    Bytes::copy_from_slice(encrypted)
}

/// AES-256-CBC decrypt ISO 7816-padded `data` in place.
pub fn decrypt_data(
    data: &mut BytesMut,
    enc_key: &Key<Scp>,
    iv: &Iv<Scp>,
) -> Result<Bytes, UnpadError> {
    let decrypted = Decryptor::new(enc_key, iv).decrypt_padded_mut::<Iso7816>(data)?;
    Ok(Bytes::copy_from_slice(decrypted))
}

/// CBC-MAC over the frame pseudo-header and ciphertext.
///
/// The result doubles as the chaining IV for the next encryption in the
/// session, which is what binds consecutive frames together.
pub fn calculate_mac(meta: &ApduMeta, data: &[u8], mac_key: &Key<Scp>) -> Iv<Scp> {
    let iv = Iv::<Scp>::default();

    let mut buf = BytesMut::new();
    buf.extend_from_slice(meta.as_slice());
    buf.extend_from_slice(data);

    let msg_len = prepare_padding(&mut buf);
    // SAFETY: the buffer was grown to a multiple of the block size, so
    // padded encryption cannot fail.
    let ciphertext = Encryptor::new(mac_key, &iv)
        .encrypt_padded_mut::<Iso7816>(&mut buf, msg_len)
        .unwrap();

    // meta ‖ data is block-aligned, so the padding occupies exactly one
    // trailing block; the CBC-MAC is the block before it.
    *Iv::<Scp>::from_slice(&ciphertext[ciphertext.len() - 32..ciphertext.len() - 16])
}

/// One-shot encryption of the INIT payload to the card's secure-channel
/// public key: ephemeral ECDH, random IV, AES-256-CBC.
///
/// Output layout: pubkey length ‖ ephemeral public key ‖ IV ‖ ciphertext.
pub fn one_shot_encrypt(
    host_public_key: &PublicKey,
    ecdh_secret: &SharedSecret,
    data: &mut BytesMut,
) -> Bytes {
    let mut iv = Iv::<Scp>::default();
    rand::rng().fill_bytes(&mut iv);

    let msg_len = prepare_padding(data);
    // SAFETY: the buffer was grown to a multiple of the block size, so
    // padded encryption cannot fail.
    let ciphertext = Encryptor::new(ecdh_secret.raw_secret_bytes(), &iv)
        .encrypt_padded_mut::<Iso7816>(data, msg_len)
        .unwrap();

    let pub_key_data = host_public_key.to_encoded_point(false);
    let mut buf = BytesMut::new();
    buf.extend(&[pub_key_data.len() as u8]);
    buf.extend(pub_key_data.as_bytes());
    buf.extend(&iv);
    buf.extend(ciphertext);

    buf.freeze()
}

/// BIP39 seed: PBKDF2-HMAC-SHA512 over the NFKD-normalized mnemonic with
/// salt `"mnemonic" ‖ NFKD(passphrase)`, 2048 iterations, 64-byte output.
pub fn bip39_seed(mnemonic: &str, passphrase: &str) -> [u8; 64] {
    let mnemonic = mnemonic.nfkd().collect::<String>();
    let salt = format!("mnemonic{}", passphrase.nfkd().collect::<String>());

    let mut seed = [0u8; 64];
    pbkdf2_hmac::<Sha512>(
        mnemonic.as_bytes(),
        salt.as_bytes(),
        BIP39_ITERATIONS,
        &mut seed,
    );
    seed
}

/// Ethereum address: low 20 bytes of Keccak-256 over the 64-byte
/// uncompressed public-key body.
pub fn ethereum_address(public_key: &PublicKey) -> Address {
    let point = public_key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}

/// secp256k1 public key for a private key.
pub fn public_from_private(private: &SecretKey) -> PublicKey {
    private.public_key()
}

// Grow the buffer to the next block boundary (always at least one byte of
// padding) and return the original message length.
fn prepare_padding(data: &mut BytesMut) -> usize {
    let len = data.len();
    data.resize(len + 16 - len % 16, 0);

    len
}
