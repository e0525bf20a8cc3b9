/// Keycard applet AID.
pub const KEYCARD_AID: &[u8] = b"\xA0\x00\x00\x08\x04\x00\x01\x01";

/// Class byte of every Keycard command except SELECT.
pub const CLA_KEYCARD: u8 = 0x80;

/// Default pairing password assumed when none is supplied.
pub const DEFAULT_PAIRING_PASSWORD: &str = "KeycardDefaultPairing";

/// Required PIN length (ASCII digits).
pub const PIN_LENGTH: usize = 6;
/// Required PUK length (ASCII digits).
pub const PUK_LENGTH: usize = 12;

/// Maximum PIN retry count reported by the applet.
pub const MAX_PIN_RETRIES: u8 = 3;
/// Maximum PUK retry count reported by the applet.
pub const MAX_PUK_RETRIES: u8 = 5;

/// Keycard instruction bytes.
pub mod ins {
    pub const SELECT: u8 = 0xA4;
    pub const INIT: u8 = 0xFE;
    pub const OPEN_SECURE_CHANNEL: u8 = 0x10;
    pub const MUTUALLY_AUTHENTICATE: u8 = 0x11;
    pub const PAIR: u8 = 0x12;
    pub const VERIFY_PIN: u8 = 0x20;
    pub const CHANGE_PIN: u8 = 0x21;
    pub const UNBLOCK_PIN: u8 = 0x22;
    pub const SIGN: u8 = 0xC0;
    pub const EXPORT_KEY: u8 = 0xC2;
    pub const GET_DATA: u8 = 0xCA;
    pub const LOAD_KEY: u8 = 0xD0;
    pub const GENERATE_MNEMONIC: u8 = 0xD2;
    pub const STORE_DATA: u8 = 0xE2;
    pub const GET_STATUS: u8 = 0xF2;
    pub const FACTORY_RESET: u8 = 0xFD;
}

/// BER-TLV tags used by the applet.
pub mod tags {
    /// Signature template containing the public key and the ECDSA signature.
    pub const TEMPLATE_SIGNATURE: u8 = 0xA0;
    /// Keypair template containing private key, public key and chain code.
    pub const TEMPLATE_KEYPAIR: u8 = 0xA1;
    /// Application status template (PIN/PUK retries, key-initialized flag).
    pub const TEMPLATE_APPLICATION_STATUS: u8 = 0xA3;
    /// Application info template returned by SELECT.
    pub const TEMPLATE_APPLICATION_INFO: u8 = 0xA4;

    /// Instance UID (16 bytes).
    pub const INSTANCE_UID: u8 = 0x8F;
    /// ECC public key (uncompressed 65 bytes, or empty when unavailable).
    pub const ECC_PUBLIC_KEY: u8 = 0x80;
    /// ECC private key (32 bytes).
    pub const ECC_PRIVATE_KEY: u8 = 0x81;
    /// BIP32 chain code (32 bytes).
    pub const CHAIN_CODE: u8 = 0x82;
    /// Application version (2 bytes) / remaining pairing slots (1 byte).
    pub const OTHER: u8 = 0x02;
    /// Key UID (32 bytes).
    pub const KEY_UID: u8 = 0x8E;
    /// Capabilities bitmask (1 byte).
    pub const CAPABILITIES: u8 = 0x8D;
    /// ECDSA signature (DER sequence of R and S).
    pub const ECDSA_SIGNATURE: u8 = 0x30;
    /// Key initialized flag (0xFF when a key is loaded).
    pub const KEY_INITIALIZED: u8 = 0x01;
}

/// Data slots addressed by GET DATA / STORE DATA.
pub mod data {
    /// Public slot holding the wallet metadata blob.
    pub const SLOT_PUBLIC: u8 = 0x00;
}

/// Contract derivation paths.
pub mod paths {
    /// BIP32 master key.
    pub const MASTER: &str = "m";
    /// Root of the wallet accounts.
    pub const WALLET_ROOT: &str = "m/44'/60'/0'/0";
    /// Default wallet account.
    pub const WALLET: &str = "m/44'/60'/0'/0/0";
    /// EIP-1581 root for non-wallet keys.
    pub const EIP1581: &str = "m/43'/60'/1581'";
    /// Whisper (chat) key.
    pub const WHISPER: &str = "m/43'/60'/1581'/0'/0";
    /// Local database encryption key.
    pub const ENCRYPTION: &str = "m/43'/60'/1581'/1'/0";
}
