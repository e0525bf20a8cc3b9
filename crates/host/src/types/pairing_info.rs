/// One pairing with a card instance: the 32-byte pairing key derived during
/// the PAIR handshake and the slot index allocated by the card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingInfo {
    /// Pairing master key.
    pub key: [u8; 32],
    /// Slot index on the card.
    pub index: u8,
}
