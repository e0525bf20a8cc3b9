use bytes::{BufMut, Bytes, BytesMut};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{PIN_LENGTH, PUK_LENGTH};
use crate::crypto::generate_pairing_token;
use crate::{Error, Result};

/// Transient PIN/PUK/pairing-password bundle handed to INIT.
///
/// Never persisted; zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Secrets {
    pin: String,
    puk: String,
    pairing_pass: String,
    pairing_token: [u8; 32],
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets").finish_non_exhaustive()
    }
}

impl Secrets {
    /// Build the INIT secrets. The PIN must be exactly 6 ASCII digits and
    /// the PUK exactly 12; INIT is rejected otherwise.
    pub fn new(pin: &str, puk: &str, pairing_pass: &str) -> Result<Self> {
        if pin.len() != PIN_LENGTH || !pin.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidData("PIN must be exactly 6 digits"));
        }
        if puk.len() != PUK_LENGTH || !puk.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidData("PUK must be exactly 12 digits"));
        }

        Ok(Self {
            pin: pin.to_string(),
            puk: puk.to_string(),
            pairing_pass: pairing_pass.to_string(),
            pairing_token: generate_pairing_token(pairing_pass).into(),
        })
    }

    /// The PIN.
    pub fn pin(&self) -> &str {
        &self.pin
    }

    /// The PUK.
    pub fn puk(&self) -> &str {
        &self.puk
    }

    /// The pairing password.
    pub fn pairing_pass(&self) -> &str {
        &self.pairing_pass
    }

    /// INIT plaintext: PIN ‖ PUK ‖ pairing token.
    pub fn to_bytes(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(PIN_LENGTH + PUK_LENGTH + 32);
        buffer.put_slice(self.pin.as_bytes());
        buffer.put_slice(self.puk.as_bytes());
        buffer.put_slice(&self.pairing_token);
        buffer.freeze()
    }
}
