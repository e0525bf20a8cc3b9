use iso7816_tlv::ber::{Tag, Tlv, Value};
use serde_json::json;

use super::get_primitive_value;
use crate::constants::tags;
use crate::{Error, Result};

/// Application status returned by GET STATUS with P1=0x00.
///
/// Retry counters use -1 as the "not fetched" sentinel so a snapshot built
/// before the first GET STATUS is distinguishable from a blocked credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationStatus {
    /// Remaining PIN attempts, or -1 when unknown.
    pub pin_retry_count: i8,
    /// Remaining PUK attempts, or -1 when unknown.
    pub puk_retry_count: i8,
    /// Whether a master key is loaded.
    pub key_initialized: bool,
    /// Current derivation path, when fetched via GET STATUS P1=0x01.
    pub derivation_path: Option<Vec<u32>>,
}

impl Default for ApplicationStatus {
    fn default() -> Self {
        Self {
            pin_retry_count: -1,
            puk_retry_count: -1,
            key_initialized: false,
            derivation_path: None,
        }
    }
}

impl ApplicationStatus {
    /// Parse the GET STATUS (application) response payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (tlv, _) = Tlv::parse(payload);
        let tlv = tlv?;

        if tlv.tag() != &Tag::try_from(tags::TEMPLATE_APPLICATION_STATUS)? {
            return Err(Error::CardProtocol("not an application status template"));
        }
        let Value::Constructed(tlvs) = tlv.value() else {
            return Err(Error::CardProtocol("application status not constructed"));
        };
        if tlvs.len() < 3 {
            return Err(Error::CardProtocol("application status template too short"));
        }

        let pin = get_primitive_value(tags::OTHER, &tlvs[0])?;
        let puk = get_primitive_value(tags::OTHER, &tlvs[1])?;
        let key_initialized = get_primitive_value(tags::KEY_INITIALIZED, &tlvs[2])?;

        Ok(Self {
            pin_retry_count: *pin.first().ok_or(Error::CardProtocol("missing PIN retries"))?
                as i8,
            puk_retry_count: *puk.first().ok_or(Error::CardProtocol("missing PUK retries"))?
                as i8,
            key_initialized: key_initialized.first() == Some(&0xFF),
            derivation_path: None,
        })
    }

    /// Parse the GET STATUS (key path) response payload: a raw sequence of
    /// big-endian u32 components.
    pub fn parse_key_path(payload: &[u8]) -> Result<Vec<u32>> {
        if payload.len() % 4 != 0 {
            return Err(Error::CardProtocol("key path length not a multiple of 4"));
        }
        Ok(payload
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// JSON representation used in `status-changed` payloads.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "remainingAttemptsPIN": self.pin_retry_count,
            "remainingAttemptsPUK": self.puk_retry_count,
            "keyInitialized": self.key_initialized,
            "path": self.derivation_path.as_ref().map(|p| path_to_string(p)).unwrap_or_default(),
        })
    }
}

fn path_to_string(components: &[u32]) -> String {
    let mut out = String::from("m");
    for &c in components {
        if c & 0x8000_0000 != 0 {
            out.push_str(&format!("/{}'", c & 0x7FFF_FFFF));
        } else {
            out.push_str(&format!("/{c}"));
        }
    }
    out
}
