use alloy_primitives::Address;
use iso7816_tlv::ber::{Tag, Tlv, Value};
use k256::ecdsa::RecoveryId;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use serde_json::json;

use crate::constants::tags;
use crate::crypto::{ethereum_address, public_from_private};
use crate::{Error, Result};

/// Key material parsed from the card's EXPORT KEY template.
///
/// Which fields are present depends on the export option: private exports
/// carry the private key, public-only exports just the public key, extended
/// exports add the chain code.
#[derive(Clone)]
pub struct Keypair {
    /// Uncompressed secp256k1 public key.
    pub public_key: Option<k256::PublicKey>,
    /// Private key, present only for private exports.
    pub private_key: Option<k256::SecretKey>,
    /// BIP32 chain code, present only for extended exports.
    pub chain_code: Option<[u8; 32]>,
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key)
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("chain_code", &self.chain_code.map(|_| "<redacted>"))
            .finish()
    }
}

impl Keypair {
    /// Parse the EXPORT KEY response payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (tlv, _) = Tlv::parse(payload);
        let tlv = tlv?;

        if tlv.tag() != &Tag::try_from(tags::TEMPLATE_KEYPAIR)? {
            return Err(Error::CardProtocol("not a keypair template"));
        }
        let Value::Constructed(tlvs) = tlv.value() else {
            return Err(Error::CardProtocol("keypair template not constructed"));
        };

        let public_tag = Tag::try_from(tags::ECC_PUBLIC_KEY)?;
        let private_tag = Tag::try_from(tags::ECC_PRIVATE_KEY)?;
        let chain_tag = Tag::try_from(tags::CHAIN_CODE)?;

        let mut public_key = None;
        let mut private_key = None;
        let mut chain_code = None;

        for inner in tlvs {
            let Value::Primitive(data) = inner.value() else {
                continue;
            };
            if inner.tag() == &public_tag {
                if !data.is_empty() {
                    public_key = Some(k256::PublicKey::from_sec1_bytes(data)?);
                }
            } else if inner.tag() == &private_tag {
                private_key = Some(k256::SecretKey::from_slice(data)?);
            } else if inner.tag() == &chain_tag {
                chain_code = Some(
                    data.as_slice()
                        .try_into()
                        .map_err(|_| Error::CardProtocol("invalid chain code length"))?,
                );
            }
        }

        // Private exports may omit the public key; recover it locally.
        if public_key.is_none() {
            match &private_key {
                Some(private) => public_key = Some(public_from_private(private)),
                None => return Err(Error::CardProtocol("keypair template carries no key")),
            }
        }

        Ok(Self {
            public_key,
            private_key,
            chain_code,
        })
    }

    /// Ethereum address of the public key.
    pub fn address(&self) -> Option<Address> {
        self.public_key.as_ref().map(ethereum_address)
    }

    /// JSON representation used in flow results.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "address": self
                .address()
                .map(|a| format!("0x{}", hex::encode(a.as_slice())))
                .unwrap_or_default(),
            "public-key": self
                .public_key
                .map(|pk| format!("0x{}", hex::encode(pk.to_encoded_point(false).as_bytes())))
                .unwrap_or_default(),
            "private-key": self
                .private_key
                .as_ref()
                .map(|sk| format!("0x{}", hex::encode(sk.to_bytes())))
                .unwrap_or_default(),
            "chain-code": self
                .chain_code
                .map(|cc| format!("0x{}", hex::encode(cc)))
                .unwrap_or_default(),
        })
    }
}

/// Recoverable ECDSA signature parsed from the card's SIGN template.
#[derive(Debug, Clone)]
pub struct Signature {
    /// Public key the card signed with.
    pub public_key: k256::PublicKey,
    /// The (r, s) signature, low-s normalized.
    pub signature: k256::ecdsa::Signature,
    /// Recovery id for address recovery.
    pub recovery_id: RecoveryId,
}

impl Signature {
    /// Parse the SIGN response payload against the signed hash.
    pub fn parse(payload: &[u8], hash: &[u8; 32]) -> Result<Self> {
        let (tlv, _) = Tlv::parse(payload);
        let tlv = tlv?;

        if tlv.tag() != &Tag::try_from(tags::TEMPLATE_SIGNATURE)? {
            return Err(Error::CardProtocol("not a signature template"));
        }
        let Value::Constructed(tlvs) = tlv.value() else {
            return Err(Error::CardProtocol("signature template not constructed"));
        };

        let public_tag = Tag::try_from(tags::ECC_PUBLIC_KEY)?;
        let sig_tag = Tag::try_from(tags::ECDSA_SIGNATURE)?;

        let mut public_key = None;
        let mut signature = None;

        for inner in tlvs {
            if inner.tag() == &public_tag {
                if let Value::Primitive(data) = inner.value() {
                    public_key = Some(k256::PublicKey::from_sec1_bytes(data)?);
                }
            } else if inner.tag() == &sig_tag {
                if let Value::Constructed(ints) = inner.value() {
                    signature = Some(parse_signature_integers(ints)?);
                }
            }
        }

        let public_key = public_key.ok_or(Error::CardProtocol("signature missing public key"))?;
        let mut signature = signature.ok_or(Error::CardProtocol("signature missing R/S"))?;
        if let Some(normalized) = signature.normalize_s() {
            signature = normalized;
        }

        let recovery_id =
            RecoveryId::trial_recovery_from_prehash(&public_key.into(), hash, &signature)?;

        Ok(Self {
            public_key,
            signature,
            recovery_id,
        })
    }

    /// r ‖ s ‖ v, the 65-byte wire form.
    pub fn to_rsv_bytes(&self) -> [u8; 65] {
        let mut out = [0u8; 65];
        out[..64].copy_from_slice(&self.signature.to_bytes());
        out[64] = self.recovery_id.to_byte();
        out
    }

    /// 0x-prefixed hex of the 65-byte signature.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.to_rsv_bytes()))
    }
}

fn parse_signature_integers(ints: &[Tlv]) -> Result<k256::ecdsa::Signature> {
    if ints.len() != 2 {
        return Err(Error::CardProtocol("malformed ECDSA signature"));
    }
    let r = integer_to_scalar(ints[0].value())?;
    let s = integer_to_scalar(ints[1].value())?;
    k256::ecdsa::Signature::from_scalars(r, s).map_err(Error::from)
}

fn integer_to_scalar(value: &Value) -> Result<[u8; 32]> {
    let Value::Primitive(data) = value else {
        return Err(Error::CardProtocol("malformed signature integer"));
    };
    // DER integers may carry a leading zero for sign; strip then left-pad.
    let mut trimmed = data.as_slice();
    while trimmed.len() > 1 && trimmed[0] == 0 {
        trimmed = &trimmed[1..];
    }
    if trimmed.len() > 32 {
        return Err(Error::CardProtocol("signature integer too large"));
    }
    let mut out = [0u8; 32];
    out[32 - trimmed.len()..].copy_from_slice(trimmed);
    Ok(out)
}
