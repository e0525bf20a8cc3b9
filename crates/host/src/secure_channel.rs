//! Live secure-channel state.
//!
//! Opening the channel runs OPEN SECURE CHANNEL (ECDH key agreement against
//! the card's secure-channel key and the stored pairing key) followed by an
//! encrypted MUTUALLY AUTHENTICATE. Afterwards every frame is AES-256-CBC
//! encrypted and authenticated by a chained CBC-MAC: the MAC of each frame
//! becomes the encryption IV of the next, in both directions.

use aes::cipher::{Iv, Key};
use bytes::BytesMut;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand::RngCore;
use tracing::{debug, warn};
use zeroize::Zeroize;

use keycard_channel::Channel;

use crate::apdu::{Command, Response};
use crate::constants::{CLA_KEYCARD, ins};
use crate::crypto::{
    ApduMeta, Challenge, Scp, calculate_mac, decrypt_data, derive_session_keys,
    ecdh_shared_secret, encrypt_data,
};
use crate::types::PairingInfo;
use crate::{Error, Result};

struct SessionKeys {
    enc: Key<Scp>,
    mac: Key<Scp>,
}

impl Drop for SessionKeys {
    fn drop(&mut self) {
        self.enc.as_mut_slice().zeroize();
        self.mac.as_mut_slice().zeroize();
    }
}

/// An open secure channel: session keys plus the chained MAC/IV state.
///
/// Constructed only by [`SecureChannel::open`]; dropping it is the only way
/// to forget the session keys.
pub struct SecureChannel {
    keys: SessionKeys,
    iv: Iv<Scp>,
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel").finish_non_exhaustive()
    }
}

impl SecureChannel {
    /// Open the secure channel over `channel` and complete mutual
    /// authentication.
    pub fn open(
        channel: &dyn Channel,
        card_public_key: &k256::PublicKey,
        pairing: &PairingInfo,
    ) -> Result<Self> {
        debug!(index = pairing.index, "opening secure channel");

        let host_private = k256::SecretKey::random(&mut rand_v8::thread_rng());
        let host_public = host_private.public_key().to_encoded_point(false);

        let cmd = Command::new_with_data(
            CLA_KEYCARD,
            ins::OPEN_SECURE_CHANNEL,
            pairing.index,
            0x00,
            host_public.as_bytes().to_vec(),
        );
        let raw = channel.transmit(&cmd.to_bytes())?;
        let response = Response::from_bytes(&raw)?;
        let payload = response.require_success(false)?;
        if payload.len() != 48 {
            return Err(Error::CardProtocol("open secure channel payload length"));
        }

        let secret = ecdh_shared_secret(&host_private, card_public_key);
        let challenge = Challenge::from_slice(&payload[..32]);
        let iv = Iv::<Scp>::clone_from_slice(&payload[32..48]);
        let (enc, mac) =
            derive_session_keys(&secret, Key::<Scp>::from_slice(&pairing.key), challenge);

        let mut this = Self {
            keys: SessionKeys { enc, mac },
            iv,
        };
        this.mutually_authenticate(channel)?;

        debug!("secure channel established");
        Ok(this)
    }

    /// Encrypt and authenticate a command for the channel. The header stays
    /// in clear; the data field becomes MAC ‖ ciphertext.
    pub fn wrap(&mut self, command: Command) -> Command {
        let mut data = BytesMut::from(command.data().unwrap_or(&[]));
        let encrypted = encrypt_data(&mut data, &self.keys.enc, &self.iv);

        let mut meta = ApduMeta::default();
        meta[0] = command.class();
        meta[1] = command.instruction();
        meta[2] = command.p1();
        meta[3] = command.p2();
        meta[4] = (encrypted.len() + 16) as u8;

        self.iv = calculate_mac(&meta, &encrypted, &self.keys.mac);

        let mut payload = BytesMut::with_capacity(16 + encrypted.len());
        payload.extend_from_slice(&self.iv);
        payload.extend_from_slice(&encrypted);

        command.with_data(payload.freeze())
    }

    /// Verify and decrypt a response frame. The decrypted plaintext is
    /// itself an APDU response (payload ‖ SW1SW2).
    pub fn unwrap_response(&mut self, response: Response) -> Result<Response> {
        let payload = response.payload();
        if payload.len() < 32 {
            return Err(Error::CardProtocol("secure channel frame too short"));
        }

        let (rmac, rdata) = payload.split_at(16);

        let mut meta = ApduMeta::default();
        meta[0] = payload.len() as u8;

        // The encryption IV of the response is the MAC of the command.
        let mut buf = BytesMut::from(rdata);
        let plaintext = decrypt_data(&mut buf, &self.keys.enc, &self.iv)?;

        self.iv = calculate_mac(&meta, rdata, &self.keys.mac);
        if rmac != self.iv.as_slice() {
            warn!("secure channel response MAC mismatch");
            return Err(Error::CardProtocol("response MAC mismatch"));
        }

        Response::from_bytes(&plaintext)
    }

    fn mutually_authenticate(&mut self, channel: &dyn Channel) -> Result<()> {
        let mut challenge = [0u8; 32];
        rand::rng().fill_bytes(&mut challenge);

        let cmd = Command::new_with_data(
            CLA_KEYCARD,
            ins::MUTUALLY_AUTHENTICATE,
            0x00,
            0x00,
            challenge.to_vec(),
        );
        let wrapped = self.wrap(cmd);
        let raw = channel.transmit(&wrapped.to_bytes())?;
        let response = Response::from_bytes(&raw)?;
        if !response.is_success() {
            return Err(Error::MutualAuthenticationFailed);
        }

        let inner = self
            .unwrap_response(response)
            .map_err(|_| Error::MutualAuthenticationFailed)?;
        if !inner.is_success() || inner.payload().len() != 32 {
            return Err(Error::MutualAuthenticationFailed);
        }

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn from_raw(enc: &Key<Scp>, mac: &Key<Scp>, iv: &Iv<Scp>) -> Self {
        Self {
            keys: SessionKeys {
                enc: *enc,
                mac: *mac,
            },
            iv: *iv,
        }
    }

    #[cfg(test)]
    pub(crate) fn iv(&self) -> &Iv<Scp> {
        &self.iv
    }
}
