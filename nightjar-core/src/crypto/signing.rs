// SPDX-FileCopyrightText: 2026 Nightjar Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Ed25519 Signing
//!
//! Key pairs for authenticating key-exchange blobs and spool reads.
//! Keys are seed-based so they survive serialization.

use ring::signature::{self, Ed25519KeyPair, KeyPair};
use thiserror::Error;
use zeroize::Zeroize;

/// Signing error types.
#[derive(Error, Debug)]
pub enum SigningError {
    #[error("Invalid seed")]
    InvalidSeed,
    #[error("Invalid signature length")]
    InvalidSignatureLength,
}

/// Ed25519 signature length in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// An Ed25519 public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// Creates a public key from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }

    /// Returns the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Verifies a signature over a message.
    pub fn verify(&self, message: &[u8], sig: &Signature) -> bool {
        let key = signature::UnparsedPublicKey::new(&signature::ED25519, &self.0);
        key.verify(message, &sig.0).is_ok()
    }
}

/// An Ed25519 signature.
#[derive(Clone)]
pub struct Signature([u8; SIGNATURE_LEN]);

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({})", hex::encode(&self.0[..8]))
    }
}

impl Signature {
    /// Creates a signature from raw bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SigningError> {
        if bytes.len() != SIGNATURE_LEN {
            return Err(SigningError::InvalidSignatureLength);
        }
        let mut out = [0u8; SIGNATURE_LEN];
        out.copy_from_slice(bytes);
        Ok(Signature(out))
    }

    /// Returns the raw signature bytes.
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LEN] {
        &self.0
    }
}

/// An Ed25519 signing key pair.
pub struct SigningKeyPair {
    seed: [u8; 32],
    public: PublicKey,
}

impl std::fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeyPair")
            .field("seed", &"[REDACTED]")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish()
    }
}

impl Drop for SigningKeyPair {
    fn drop(&mut self) {
        self.seed.zeroize();
    }
}

impl SigningKeyPair {
    /// Generates a new random key pair.
    pub fn generate() -> Self {
        let rng = ring::rand::SystemRandom::new();
        let seed = ring::rand::generate::<[u8; 32]>(&rng)
            .expect("System RNG should not fail")
            .expose();
        Self::from_seed(seed)
    }

    /// Creates a key pair from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let keypair = Ed25519KeyPair::from_seed_unchecked(&seed)
            .expect("32-byte seed is always a valid Ed25519 seed");
        let mut public = [0u8; 32];
        public.copy_from_slice(keypair.public_key().as_ref());
        SigningKeyPair {
            seed,
            public: PublicKey(public),
        }
    }

    /// Returns the seed bytes (for serialization).
    pub fn seed(&self) -> &[u8; 32] {
        &self.seed
    }

    /// Returns the public key.
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Signs a message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        let keypair = Ed25519KeyPair::from_seed_unchecked(&self.seed)
            .expect("seed was validated at construction");
        let sig = keypair.sign(message);
        let mut out = [0u8; SIGNATURE_LEN];
        out.copy_from_slice(sig.as_ref());
        Signature(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_roundtrip() {
        let keypair = SigningKeyPair::generate();
        let sig = keypair.sign(b"message");
        assert!(keypair.public_key().verify(b"message", &sig));
    }

    #[test]
    fn test_verify_rejects_tampered_message() {
        let keypair = SigningKeyPair::generate();
        let sig = keypair.sign(b"message");
        assert!(!keypair.public_key().verify(b"messagf", &sig));
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let keypair = SigningKeyPair::generate();
        let other = SigningKeyPair::generate();
        let sig = keypair.sign(b"message");
        assert!(!other.public_key().verify(b"message", &sig));
    }

    #[test]
    fn test_from_seed_is_deterministic() {
        let a = SigningKeyPair::from_seed([7u8; 32]);
        let b = SigningKeyPair::from_seed([7u8; 32]);
        assert_eq!(a.public_key(), b.public_key());
    }

    #[test]
    fn test_signature_from_slice_rejects_bad_length() {
        assert!(Signature::from_slice(&[0u8; 63]).is_err());
        assert!(Signature::from_slice(&[0u8; 64]).is_ok());
    }
}
