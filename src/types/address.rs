//! 32-byte account and contract addresses.

use crate::types::hash::Hash;
use rvchain_derive::BinaryCodec;
use std::fmt;

/// Address length in bytes (SHA-256 output).
pub const ADDRESS_LEN: usize = 32;

/// A 32-byte address: the SHA-256 of an Ed25519 public key for externally
/// owned accounts, or a deterministic creation hash for contracts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BinaryCodec, Default, Hash, Ord, PartialOrd)]
pub struct Address(pub [u8; ADDRESS_LEN]);

impl Address {
    pub const fn zero() -> Address {
        Address([0u8; ADDRESS_LEN])
    }

    pub const fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn from_slice(slice: &[u8]) -> Option<Address> {
        if slice.len() != ADDRESS_LEN {
            return None;
        }
        let mut bytes = [0u8; ADDRESS_LEN];
        bytes.copy_from_slice(slice);
        Some(Address(bytes))
    }
}

impl From<Hash> for Address {
    fn from(hash: Hash) -> Self {
        Address(hash.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::encoding::{Decode, Encode};

    #[test]
    fn codec_roundtrip() {
        let addr = Address([7u8; ADDRESS_LEN]);
        let bytes = addr.to_bytes();
        assert_eq!(bytes.len(), ADDRESS_LEN);
        assert_eq!(Address::from_bytes(&bytes).unwrap(), addr);
    }

    #[test]
    fn display_is_hex() {
        let mut addr = Address::zero();
        addr.0[0] = 0xAB;
        assert!(addr.to_string().starts_with("ab00"));
        assert_eq!(addr.to_string().len(), 64);
    }
}
