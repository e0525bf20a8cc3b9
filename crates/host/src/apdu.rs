//! Minimal ISO 7816 APDU command/response framing.
//!
//! Only short APDUs are produced; the Keycard applet never needs extended
//! length on the command side.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// Status word constants used by the applet.
pub mod status {
    /// Success.
    pub const SW_NO_ERROR: u16 = 0x9000;
    /// Security status not satisfied (secure channel required, or the
    /// pairing cryptogram check failed).
    pub const SW_SECURITY_STATUS_NOT_SATISFIED: u16 = 0x6982;
    /// Conditions of use not satisfied (typically PIN not verified).
    pub const SW_CONDITIONS_NOT_SATISFIED: u16 = 0x6985;
    /// Wrong data.
    pub const SW_WRONG_DATA: u16 = 0x6A80;
    /// File not found (applet missing).
    pub const SW_FILE_NOT_FOUND: u16 = 0x6A82;
    /// File full (all pairing slots taken).
    pub const SW_FILE_FULL: u16 = 0x6A84;
    /// Incorrect P1/P2.
    pub const SW_INCORRECT_P1P2: u16 = 0x6A86;
    /// Internal error.
    pub const SW_INTERNAL_ERROR: u16 = 0x6F00;
    /// Internal error raised by a mis-initialized applet state machine.
    pub const SW_INTERNAL_STATE_ERROR: u16 = 0x6F05;
    /// Base of the "wrong credential, x attempts remaining" range (0x63Cx).
    pub const SW_WRONG_PIN_BASE: u16 = 0x63C0;

    /// Whether `sw` is in the 0x63Cx retry-counter range.
    pub const fn is_wrong_pin(sw: u16) -> bool {
        sw & 0xFFF0 == SW_WRONG_PIN_BASE
    }

    /// Remaining attempts encoded in a 0x63Cx status word.
    pub const fn wrong_pin_remaining(sw: u16) -> u8 {
        (sw & 0x000F) as u8
    }
}

/// An APDU command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    cla: u8,
    ins: u8,
    p1: u8,
    p2: u8,
    data: Option<Bytes>,
    le: Option<u8>,
}

impl Command {
    /// Create a command without a data field.
    pub const fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: None,
            le: None,
        }
    }

    /// Create a command with a data field.
    pub fn new_with_data(cla: u8, ins: u8, p1: u8, p2: u8, data: impl Into<Bytes>) -> Self {
        Self::new(cla, ins, p1, p2).with_data(data)
    }

    /// Replace the data field.
    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        self.data = if data.is_empty() { None } else { Some(data) };
        self
    }

    /// Set the expected response length byte.
    pub const fn with_le(mut self, le: u8) -> Self {
        self.le = Some(le);
        self
    }

    /// Class byte.
    pub const fn class(&self) -> u8 {
        self.cla
    }

    /// Instruction byte.
    pub const fn instruction(&self) -> u8 {
        self.ins
    }

    /// First parameter byte.
    pub const fn p1(&self) -> u8 {
        self.p1
    }

    /// Second parameter byte.
    pub const fn p2(&self) -> u8 {
        self.p2
    }

    /// Data field, if any.
    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    /// Serialize to wire format: header, Lc + data when present, Le when set.
    pub fn to_bytes(&self) -> Bytes {
        let data_len = self.data.as_ref().map_or(0, |d| d.len());
        debug_assert!(data_len <= 255, "short APDU data field overflow");

        let mut buf = BytesMut::with_capacity(4 + 1 + data_len + 1);
        buf.put_u8(self.cla);
        buf.put_u8(self.ins);
        buf.put_u8(self.p1);
        buf.put_u8(self.p2);
        if let Some(data) = &self.data {
            buf.put_u8(data.len() as u8);
            buf.put_slice(data);
        }
        if let Some(le) = self.le {
            buf.put_u8(le);
        }
        buf.freeze()
    }
}

/// An APDU response: payload plus trailing SW1SW2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    payload: Bytes,
    sw1: u8,
    sw2: u8,
}

impl Response {
    /// Parse a raw response frame. Requires at least the two status bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 2 {
            return Err(Error::CardProtocol("response shorter than SW1SW2"));
        }
        let (payload, sw) = bytes.split_at(bytes.len() - 2);
        Ok(Self {
            payload: Bytes::copy_from_slice(payload),
            sw1: sw[0],
            sw2: sw[1],
        })
    }

    /// Build a response from payload and status word (used by the secure
    /// channel when re-framing decrypted plaintext).
    pub fn from_parts(payload: impl Into<Bytes>, sw: u16) -> Self {
        Self {
            payload: payload.into(),
            sw1: (sw >> 8) as u8,
            sw2: (sw & 0xFF) as u8,
        }
    }

    /// SW1SW2 as a big-endian u16.
    pub const fn status(&self) -> u16 {
        ((self.sw1 as u16) << 8) | self.sw2 as u16
    }

    /// Whether the status word is 0x9000.
    pub const fn is_success(&self) -> bool {
        self.status() == status::SW_NO_ERROR
    }

    /// Response payload (possibly empty).
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Map a non-success status word to the crate error taxonomy.
    ///
    /// The 0x63Cx range reports remaining attempts for whichever credential
    /// the command verified; `puk_context` selects the PUK interpretation.
    pub fn status_error(&self, puk_context: bool) -> Error {
        let sw = self.status();
        if status::is_wrong_pin(sw) {
            let remaining = status::wrong_pin_remaining(sw);
            return match (puk_context, remaining) {
                (false, 0) => Error::PinBlocked,
                (false, n) => Error::WrongPin { remaining: n },
                (true, 0) => Error::PukBlocked,
                (true, n) => Error::WrongPuk { remaining: n },
            };
        }
        match sw {
            status::SW_SECURITY_STATUS_NOT_SATISFIED => Error::SecureChannelRequired,
            status::SW_CONDITIONS_NOT_SATISFIED => Error::ConditionsNotSatisfied,
            status::SW_FILE_FULL => Error::NoPairingSlots,
            status::SW_INTERNAL_ERROR | status::SW_INTERNAL_STATE_ERROR => {
                Error::CardInternal { sw }
            }
            _ => Error::UnexpectedStatus { sw },
        }
    }

    /// Return the payload on success, the mapped error otherwise.
    pub fn require_success(&self, puk_context: bool) -> Result<&[u8]> {
        if self.is_success() {
            Ok(self.payload())
        } else {
            Err(self.status_error(puk_context))
        }
    }
}
