//! Error types for Keycard host operations.
//!
//! Centralizes all error variants so that card, store and facade failures
//! propagate through one `Result` type across the crate.

use iso7816_tlv::TlvError;
use thiserror::Error;

use keycard_channel::ChannelError;

/// Result type for Keycard host operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for Keycard host operations.
#[derive(Debug, Error)]
pub enum Error {
    //
    // Transport and protocol
    //
    /// Channel-level failure (reader vanished, short read, reader stack).
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Response violated the card protocol (malformed frame or TLV).
    #[error("card protocol error: {0}")]
    CardProtocol(&'static str),

    /// TLV encoding/decoding error.
    #[error("TLV error: {0:?}")]
    Tlv(TlvError),

    /// Card returned an unexpected status word.
    #[error("unexpected status word {sw:04X}")]
    UnexpectedStatus {
        /// SW1SW2 as a big-endian u16.
        sw: u16,
    },

    /// Card reported an internal error, typically a mis-initialized applet
    /// state machine (GET STATUS skipped after channel open).
    #[error("card internal error (status {sw:04X})")]
    CardInternal {
        /// SW1SW2 as a big-endian u16.
        sw: u16,
    },

    //
    // Authentication
    //
    /// PIN rejected; the card reports how many attempts remain.
    #[error("wrong PIN, {remaining} attempts remaining")]
    WrongPin {
        /// Attempts left before the PIN blocks.
        remaining: u8,
    },

    /// PUK rejected; the card reports how many attempts remain.
    #[error("wrong PUK, {remaining} attempts remaining")]
    WrongPuk {
        /// Attempts left before the PUK blocks.
        remaining: u8,
    },

    /// PIN is blocked; only UNBLOCK PIN with the PUK can recover.
    #[error("PIN blocked")]
    PinBlocked,

    /// PUK is blocked; the card instance is unusable without a factory reset.
    #[error("PUK blocked")]
    PukBlocked,

    //
    // Pairing
    //
    /// All pairing slots on the card are taken.
    #[error("no available pairing slots")]
    NoPairingSlots,

    /// The pairing password did not match the card's pairing secret.
    #[error("wrong pairing password")]
    WrongPairingPassword,

    /// Pairing information is required for this operation.
    #[error("pairing information required")]
    PairingRequired,

    /// Mutual authentication after opening the secure channel failed.
    #[error("mutual authentication failed")]
    MutualAuthenticationFailed,

    //
    // Secure channel
    //
    /// The card requires a secure channel for this command.
    #[error("secure channel required")]
    SecureChannelRequired,

    /// No secure channel is open on the host side.
    #[error("secure channel not open")]
    SecureChannelNotOpen,

    /// Conditions of use not satisfied (typically PIN not verified).
    #[error("conditions of use not satisfied")]
    ConditionsNotSatisfied,

    //
    // State
    //
    /// The selected application is not a Keycard.
    #[error("not a Keycard")]
    NotAKeycard,

    /// Operation invoked in a state that forbids it.
    #[error("invalid state for operation: {0}")]
    InvalidState(&'static str),

    /// `start` called twice without an intervening `stop`.
    #[error("session manager already started")]
    AlreadyStarted,

    /// A flow is already active.
    #[error("a flow is already running")]
    FlowAlreadyRunning,

    /// Flow code outside the known enumeration.
    #[error("unknown flow code {0}")]
    UnknownFlow(u32),

    /// Flow interrupted by `cancel_flow`.
    #[error("flow cancelled")]
    Cancelled,

    //
    // Data
    //
    /// Malformed or out-of-contract data.
    #[error("invalid data: {0}")]
    InvalidData(&'static str),

    /// A required flow parameter is missing.
    #[error("missing parameter: {0}")]
    MissingParameter(&'static str),

    //
    // External
    //
    /// Elliptic curve error.
    #[error(transparent)]
    EllipticCurve(#[from] k256::elliptic_curve::Error),

    /// ECDSA error.
    #[error(transparent)]
    Ecdsa(#[from] k256::ecdsa::Error),

    /// BIP32 path error.
    #[error(transparent)]
    Bip32(#[from] coins_bip32::Bip32Error),

    /// Unpadding error when decrypting.
    #[error("unpadding error when decrypting")]
    Unpad(#[from] cipher::block_padding::UnpadError),

    /// Store I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Store serialization error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Other error with a dynamic message.
    #[error("{0}")]
    Message(String),
}

impl Error {
    /// Create a new error with a dynamic message.
    pub fn message<S: Into<String>>(message: S) -> Self {
        Self::Message(message.into())
    }
}

impl From<TlvError> for Error {
    fn from(error: TlvError) -> Self {
        Self::Tlv(error)
    }
}
