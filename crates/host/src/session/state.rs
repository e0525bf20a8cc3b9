use std::fmt;

/// Externally visible state of the card session.
///
/// The external representation uses the kebab-case names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing known yet; detection not armed or no report received.
    UnknownReaderState,
    /// Detection is armed but no reader is attached.
    NoReadersFound,
    /// Waiting for a reader to appear.
    WaitingForReader,
    /// The reader stack failed.
    ReaderConnectionError,
    /// A reader is attached; waiting for a card.
    WaitingForCard,
    /// A card was detected; the connect sequence is running.
    ConnectingCard,
    /// The card is a pre-initialized Keycard; INIT required.
    EmptyKeycard,
    /// The card does not host the Keycard applet.
    NotKeycard,
    /// The connect sequence failed.
    ConnectionError,
    /// Pairing failed (no free slots or wrong password).
    PairingError,
    /// The PIN is blocked; only the PUK can recover.
    BlockedPIN,
    /// The PUK is blocked; the card instance is unusable.
    BlockedPUK,
    /// Connected and paired; PIN not verified.
    Ready,
    /// PIN verified.
    Authorized,
    /// A factory reset is in progress.
    FactoryResetting,
}

impl SessionState {
    /// Kebab-case name used in signal payloads.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownReaderState => "unknown-reader-state",
            Self::NoReadersFound => "no-readers-found",
            Self::WaitingForReader => "waiting-for-reader",
            Self::ReaderConnectionError => "reader-connection-error",
            Self::WaitingForCard => "waiting-for-card",
            Self::ConnectingCard => "connecting-card",
            Self::EmptyKeycard => "empty-keycard",
            Self::NotKeycard => "not-keycard",
            Self::ConnectionError => "connection-error",
            Self::PairingError => "pairing-error",
            Self::BlockedPIN => "blocked-pin",
            Self::BlockedPUK => "blocked-puk",
            Self::Ready => "ready",
            Self::Authorized => "authorized",
            Self::FactoryResetting => "factory-resetting",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_kebab_case() {
        assert_eq!(SessionState::UnknownReaderState.as_str(), "unknown-reader-state");
        assert_eq!(SessionState::BlockedPIN.as_str(), "blocked-pin");
        assert_eq!(SessionState::Ready.to_string(), "ready");
    }
}
