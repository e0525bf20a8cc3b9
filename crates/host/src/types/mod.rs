//! Data model shared by the command set and both facades.

mod application_info;
mod application_status;
mod keypair;
mod metadata;
mod pairing_info;

pub use application_info::ApplicationInfo;
pub use application_status::ApplicationStatus;
pub use keypair::{Keypair, Signature};
pub use metadata::Metadata;
pub use pairing_info::PairingInfo;

use std::fmt;

use iso7816_tlv::ber::{Tag, Tlv, Value};

use crate::{Error, Result};

/// Applet version as reported by SELECT.
///
/// Ordering is lexicographic over (major, minor), which is what feature
/// gating compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Version {
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
}

impl Version {
    /// First version with extended public-key export.
    pub const EXTENDED_EXPORT: Self = Self { major: 3, minor: 1 };

    /// Whether the applet supports the extended public-key export variant.
    pub fn supports_extended_export(&self) -> bool {
        *self >= Self::EXTENDED_EXPORT
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Extract the primitive value of `tlv`, checking its tag.
pub(crate) fn get_primitive_value(tag: u8, tlv: &Tlv) -> Result<Vec<u8>> {
    if tlv.tag() != &Tag::try_from(tag)? {
        return Err(Error::CardProtocol("unexpected TLV tag"));
    }
    match tlv.value() {
        Value::Primitive(data) => Ok(data.clone()),
        Value::Constructed(_) => Err(Error::CardProtocol("expected primitive TLV value")),
    }
}
