//! Channel error classification.

use thiserror::Error;

/// Errors surfaced by a [`crate::Channel`].
///
/// Transmit failures are classified as transport (reader vanished, card
/// reset, timeout) or protocol (short read, malformed frame): the former
/// invalidates the connection and is accompanied by a synthetic
/// [`crate::ChannelEvent::TargetLost`], the latter is surfaced to the caller
/// with the connection intact.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The card or reader became unreachable mid-exchange.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The exchange completed but the frame was unusable.
    #[error("protocol failure: {0}")]
    Protocol(String),

    /// The reader stack itself failed (daemon gone, context invalid).
    #[error("reader stack failure: {0}")]
    Reader(String),

    /// No target is connected.
    #[error("no card connected")]
    NotConnected,

    /// No reader is attached.
    #[error("no reader available")]
    NoReader,
}

impl ChannelError {
    /// Whether this failure invalidated the target connection.
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::NotConnected)
    }
}

impl From<pcsc::Error> for ChannelError {
    fn from(err: pcsc::Error) -> Self {
        match err {
            pcsc::Error::ResetCard
            | pcsc::Error::RemovedCard
            | pcsc::Error::NoSmartcard
            | pcsc::Error::Timeout
            | pcsc::Error::CommError => Self::Transport(err.to_string()),
            pcsc::Error::UnknownReader
            | pcsc::Error::ReaderUnavailable
            | pcsc::Error::NoReadersAvailable => Self::NoReader,
            pcsc::Error::InvalidAtr | pcsc::Error::ProtoMismatch => {
                Self::Protocol(err.to_string())
            }
            other => Self::Reader(other.to_string()),
        }
    }
}
