//! On-card wallet metadata blob.
//!
//! Layout: one header byte `0x20 | name_len` (top three bits are the format
//! version, currently 1; low five bits the UTF-8 name length, at most 20),
//! the name bytes, then zero or more (start, count) pairs of LEB128 u32s.
//! Each pair expands to the consecutive wallet indices start..=start+count,
//! so a count of zero encodes a single index.

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::json;

use crate::constants::paths::WALLET_ROOT;
use crate::{Error, Result};

const METADATA_VERSION: u8 = 1;
const MAX_NAME_LENGTH: usize = 20;

/// Wallet names and paths stored in the card's public data slot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Metadata {
    name: String,
    wallets: Vec<u32>,
}

impl Metadata {
    /// Build metadata from a card name and wallet indices (the last path
    /// component of each wallet under the wallet root). Indices are sorted
    /// and deduplicated.
    pub fn new(name: impl Into<String>, wallets: impl IntoIterator<Item = u32>) -> Result<Self> {
        let name = name.into();
        if name.len() > MAX_NAME_LENGTH {
            return Err(Error::InvalidData("card name longer than 20 bytes"));
        }
        let mut wallets: Vec<u32> = wallets.into_iter().collect();
        wallets.sort_unstable();
        wallets.dedup();
        Ok(Self { name, wallets })
    }

    /// Card name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sorted wallet indices.
    pub fn wallets(&self) -> &[u32] {
        &self.wallets
    }

    /// Full BIP44 path of each wallet, rooted at the wallet root.
    pub fn paths(&self) -> Vec<String> {
        self.wallets
            .iter()
            .map(|i| format!("{WALLET_ROOT}/{i}"))
            .collect()
    }

    /// Serialize to the on-card format.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.name.len() + self.wallets.len() * 2);
        buf.put_u8((METADATA_VERSION << 5) | self.name.len() as u8);
        buf.put_slice(self.name.as_bytes());

        let mut i = 0;
        while i < self.wallets.len() {
            let start = self.wallets[i];
            let mut end = start;
            while i + 1 < self.wallets.len() && self.wallets[i + 1] == end + 1 {
                end += 1;
                i += 1;
            }
            leb128_encode(&mut buf, start);
            leb128_encode(&mut buf, end - start);
            i += 1;
        }

        buf.freeze()
    }

    /// Parse the on-card format.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = *data.first().ok_or(Error::InvalidData("empty metadata blob"))?;
        if header >> 5 != METADATA_VERSION {
            return Err(Error::InvalidData("unsupported metadata version"));
        }
        let name_len = (header & 0x1F) as usize;
        if data.len() < 1 + name_len {
            return Err(Error::InvalidData("metadata name truncated"));
        }
        let name = std::str::from_utf8(&data[1..1 + name_len])
            .map_err(|_| Error::InvalidData("metadata name not UTF-8"))?
            .to_string();

        let mut wallets = Vec::new();
        let mut offset = 1 + name_len;
        while offset < data.len() {
            let start = leb128_decode(data, &mut offset)?;
            let count = leb128_decode(data, &mut offset)?;
            for i in 0..=count {
                wallets.push(start + i);
            }
        }

        Self::new(name, wallets)
    }

    /// JSON representation used in status and flow payloads.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "name": self.name,
            "paths": self.paths(),
        })
    }
}

fn leb128_encode(buf: &mut BytesMut, mut value: u32) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

fn leb128_decode(data: &[u8], offset: &mut usize) -> Result<u32> {
    let mut value: u32 = 0;
    let mut shift = 0;
    loop {
        let byte = *data
            .get(*offset)
            .ok_or(Error::InvalidData("truncated LEB128 value"))?;
        *offset += 1;
        if shift > 28 {
            return Err(Error::InvalidData("LEB128 value overflows u32"));
        }
        value |= u32::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leb128_round_trip() {
        for value in [0u32, 1, 127, 128, 300, 16_383, 16_384, u32::MAX] {
            let mut buf = BytesMut::new();
            leb128_encode(&mut buf, value);
            let mut offset = 0;
            assert_eq!(leb128_decode(&buf, &mut offset).unwrap(), value);
            assert_eq!(offset, buf.len());
        }
    }

    #[test]
    fn header_byte_carries_version_and_name_length() {
        let metadata = Metadata::new("wallet", []).unwrap();
        let encoded = metadata.encode();
        assert_eq!(encoded[0], 0x20 | 6);
        assert_eq!(&encoded[1..7], b"wallet");
    }

    #[test]
    fn consecutive_indices_collapse_into_runs() {
        let metadata = Metadata::new("w", [0, 1, 2, 5, 9, 10]).unwrap();
        let encoded = metadata.encode();
        // name (2 bytes) then pairs (0,2) (5,0) (9,1)
        assert_eq!(&encoded[2..], &[0, 2, 5, 0, 9, 1]);
    }

    #[test]
    fn round_trip_preserves_name_and_indices() {
        let cases: &[(&str, Vec<u32>)] = &[
            ("", vec![]),
            ("status", vec![0]),
            ("my keycard", vec![0, 1, 2, 3]),
            ("x", vec![7, 300, 301, 302, 1000]),
            ("exactly twenty chars", vec![4, 2, 2, 4]),
        ];
        for (name, wallets) in cases {
            let metadata = Metadata::new(*name, wallets.iter().copied()).unwrap();
            let decoded = Metadata::decode(&metadata.encode()).unwrap();
            assert_eq!(&decoded, &metadata);
        }
    }

    #[test]
    fn rejects_oversized_name() {
        assert!(Metadata::new("twenty-one characters", []).is_err());
    }

    #[test]
    fn rejects_unknown_version() {
        // Version bits 2 instead of 1.
        assert!(Metadata::decode(&[0x40]).is_err());
    }

    #[test]
    fn paths_are_rooted_at_wallet_root() {
        let metadata = Metadata::new("w", [0, 5]).unwrap();
        assert_eq!(
            metadata.paths(),
            vec!["m/44'/60'/0'/0/0".to_string(), "m/44'/60'/0'/0/5".to_string()]
        );
    }
}
