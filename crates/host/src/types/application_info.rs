use iso7816_tlv::ber::{Tag, Tlv, Value};
use serde_json::json;

use super::{Version, get_primitive_value};
use crate::constants::tags;
use crate::{Error, Result};

/// Application info returned by SELECT.
///
/// An initialized card answers with the full info template; a
/// pre-initialized card answers with just its secure-channel public key.
/// Anything else is not a Keycard.
#[derive(Debug, Clone)]
pub struct ApplicationInfo {
    /// The applet responded to SELECT.
    pub installed: bool,
    /// PIN/PUK/pairing secret have been set.
    pub initialized: bool,
    /// Instance UID (16 bytes); absent on pre-initialized cards.
    pub instance_uid: Option<[u8; 16]>,
    /// Secure-channel public key (uncompressed secp256k1 point).
    pub public_key: Option<k256::PublicKey>,
    /// Applet version.
    pub version: Version,
    /// Remaining pairing slots.
    pub available_slots: u8,
    /// SHA-256 of the loaded master public key; absent when no key is loaded.
    pub key_uid: Option<[u8; 32]>,
}

impl ApplicationInfo {
    /// Parse the SELECT response payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (tlv, _) = Tlv::parse(payload);
        let tlv = tlv?;

        if tlv.tag() == &Tag::try_from(tags::TEMPLATE_APPLICATION_INFO)? {
            Self::from_template(&tlv)
        } else if tlv.tag() == &Tag::try_from(tags::ECC_PUBLIC_KEY)? {
            // Pre-initialized card: bare public key, INIT required.
            let public_key = match tlv.value() {
                Value::Primitive(data) if !data.is_empty() => {
                    Some(k256::PublicKey::from_sec1_bytes(data)?)
                }
                _ => None,
            };
            Ok(Self {
                installed: true,
                initialized: false,
                instance_uid: None,
                public_key,
                version: Version::default(),
                available_slots: 0,
                key_uid: None,
            })
        } else {
            Err(Error::NotAKeycard)
        }
    }

    fn from_template(tlv: &Tlv) -> Result<Self> {
        let Value::Constructed(tlvs) = tlv.value() else {
            return Err(Error::CardProtocol("application info not constructed"));
        };
        if tlvs.len() < 5 {
            return Err(Error::CardProtocol("application info template too short"));
        }

        let instance_uid: [u8; 16] = get_primitive_value(tags::INSTANCE_UID, &tlvs[0])?
            .try_into()
            .map_err(|_| Error::CardProtocol("invalid instance UID length"))?;

        let raw_public_key = get_primitive_value(tags::ECC_PUBLIC_KEY, &tlvs[1])?;
        let public_key = if raw_public_key.is_empty() {
            None
        } else {
            Some(k256::PublicKey::from_sec1_bytes(&raw_public_key)?)
        };

        let raw_version = get_primitive_value(tags::OTHER, &tlvs[2])?;
        if raw_version.len() != 2 {
            return Err(Error::CardProtocol("invalid version length"));
        }
        let version = Version {
            major: raw_version[0],
            minor: raw_version[1],
        };

        let raw_slots = get_primitive_value(tags::OTHER, &tlvs[3])?;
        let available_slots = *raw_slots
            .first()
            .ok_or(Error::CardProtocol("missing pairing slot count"))?;

        let raw_key_uid = get_primitive_value(tags::KEY_UID, &tlvs[4])?;
        let key_uid = match raw_key_uid.len() {
            0 => None,
            32 => Some(raw_key_uid.try_into().unwrap()),
            _ => return Err(Error::CardProtocol("invalid key UID length")),
        };

        Ok(Self {
            installed: true,
            initialized: true,
            instance_uid: Some(instance_uid),
            public_key,
            version,
            available_slots,
            key_uid,
        })
    }

    /// SELECT succeeded iff at least one identity field is present.
    pub const fn is_valid(&self) -> bool {
        self.instance_uid.is_some() || self.public_key.is_some()
    }

    /// Lowercase hex of the instance UID.
    pub fn instance_uid_hex(&self) -> Option<String> {
        self.instance_uid.map(hex::encode)
    }

    /// Lowercase hex of the key UID.
    pub fn key_uid_hex(&self) -> Option<String> {
        self.key_uid.map(hex::encode)
    }

    /// JSON representation used in `status-changed` payloads.
    pub fn to_json(&self) -> serde_json::Value {
        use k256::elliptic_curve::sec1::ToEncodedPoint;
        json!({
            "installed": self.installed,
            "initialized": self.initialized,
            "instanceUID": self.instance_uid_hex().unwrap_or_default(),
            "secureChannelPublicKey": self
                .public_key
                .map(|pk| hex::encode(pk.to_encoded_point(false).as_bytes()))
                .unwrap_or_default(),
            "version": self.version.to_string(),
            "availableSlots": self.available_slots,
            "keyUID": self.key_uid_hex().unwrap_or_default(),
        })
    }
}
