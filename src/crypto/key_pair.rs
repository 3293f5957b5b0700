//! Ed25519 key pairs for transaction signing.

use crate::types::address::Address;
use crate::types::hash::Hash;
use ed25519_dalek::{Signer, Verifier, SigningKey, VerifyingKey};
use rand_core::OsRng;
use rvchain_derive::BinaryCodec;
use zeroize::Zeroizing;

/// Ed25519 public key length in bytes.
pub const PUBKEY_LEN: usize = 32;

/// Ed25519 signature length in bytes.
pub const SIG_LEN: usize = 64;

/// Ed25519 expanded private key length in bytes (seed followed by the public
/// key).
pub const PRIVKEY_LEN: usize = 64;

/// Private key for signing transactions.
///
/// Generated from OS entropy; the inner key material is zeroized on drop.
/// Never serialized onto the wire.
#[derive(Clone)]
pub struct PrivateKey {
    key: SigningKey,
}

/// Raw Ed25519 public key used for signature verification and address
/// derivation.
///
/// Kept as raw bytes so it can travel through the wire codec unchanged; the
/// curve point is only parsed when a signature is actually checked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BinaryCodec, Default, Hash)]
pub struct PublicKey(pub [u8; PUBKEY_LEN]);

/// Detached Ed25519 signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BinaryCodec)]
pub struct Signature(pub [u8; SIG_LEN]);

impl Default for Signature {
    fn default() -> Self {
        Signature([0u8; SIG_LEN])
    }
}

impl PrivateKey {
    /// Generates a new random private key using OS-provided entropy.
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Reconstructs a private key from its 64-byte expanded form.
    ///
    /// Returns `None` if the trailing public half does not match the seed.
    pub fn from_keypair_bytes(bytes: &[u8; PRIVKEY_LEN]) -> Option<Self> {
        SigningKey::from_keypair_bytes(bytes)
            .ok()
            .map(|key| Self { key })
    }

    /// Returns the 64-byte expanded form (seed followed by public key).
    ///
    /// The buffer is zeroized when dropped; never log or transmit it.
    pub fn to_keypair_bytes(&self) -> Zeroizing<[u8; PRIVKEY_LEN]> {
        Zeroizing::new(self.key.to_keypair_bytes())
    }

    /// Derives the corresponding public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.key.verifying_key().to_bytes())
    }

    /// Signs arbitrary data.
    pub fn sign(&self, data: &[u8]) -> Signature {
        Signature(self.key.sign(data).to_bytes())
    }
}

impl PublicKey {
    /// Verifies a signature against the given data.
    ///
    /// Returns `false` for invalid signatures and for byte strings that are
    /// not a valid curve point.
    pub fn verify(&self, data: &[u8], signature: &Signature) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        key.verify(data, &ed25519_dalek::Signature::from_bytes(&signature.0))
            .is_ok()
    }

    /// Derives the account address: SHA-256 of the raw public key bytes.
    pub fn address(&self) -> Address {
        Address::from(Hash::digest(&self.0))
    }
}
