// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Node identities
//!
//! Every node owns one Ed25519 keypair. The public key addresses the node
//! (peers route by the leading bytes of its SHA-256), signs adverts, and
//! doubles as the ECDH identity: the signing scalar and the Montgomery
//! form of the public key feed X25519, so a single 32-byte key serves
//! both roles on the wire.

use crate::error::CryptoError;
use crate::rng::CryptoRng;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use lm_common::constants::{PUB_KEY_SIZE, SEED_SIZE, SIGNATURE_SIZE};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A peer identity: public key plus its cached routing hash
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    /// Ed25519 public key
    pub pub_key: [u8; PUB_KEY_SIZE],
    hash: [u8; 32],
}

impl Identity {
    /// Build an identity from public key bytes
    #[must_use]
    pub fn new(pub_key: [u8; PUB_KEY_SIZE]) -> Self {
        let mut hash = [0u8; 32];
        crate::hash::sha256(&mut hash, &pub_key);
        Self { pub_key, hash }
    }

    /// Build from a slice; `None` if not exactly 32 bytes
    #[must_use]
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() != PUB_KEY_SIZE {
            return None;
        }
        let mut pub_key = [0u8; PUB_KEY_SIZE];
        pub_key.copy_from_slice(slice);
        Some(Self::new(pub_key))
    }

    /// First byte of SHA-256(pub_key) — the 1-byte routing hash
    #[must_use]
    pub const fn node_hash(&self) -> u8 {
        self.hash[0]
    }

    /// Copy the first `dest.len()` bytes of the routing hash
    pub fn copy_hash_to(&self, dest: &mut [u8]) {
        dest.copy_from_slice(&self.hash[..dest.len()]);
    }

    /// Check whether the leading routing-hash bytes match `hash`
    #[must_use]
    pub fn is_hash_match(&self, hash: &[u8]) -> bool {
        self.hash[..hash.len()] == *hash
    }

    /// Check whether this identity owns `pub_key`
    #[must_use]
    pub fn matches(&self, pub_key: &[u8]) -> bool {
        self.pub_key[..] == *pub_key
    }

    /// Verify an Ed25519 signature over `msg`
    #[must_use]
    pub fn verify(&self, signature: &[u8; SIGNATURE_SIZE], msg: &[u8]) -> bool {
        let Ok(vk) = VerifyingKey::from_bytes(&self.pub_key) else {
            return false;
        };
        let sig = Signature::from_bytes(signature);
        vk.verify(msg, &sig).is_ok()
    }
}

impl core::fmt::Debug for Identity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Identity({:02x}{:02x}{:02x}{:02x}..)",
            self.pub_key[0], self.pub_key[1], self.pub_key[2], self.pub_key[3]
        )
    }
}

/// A 32-byte ECDH shared secret, zeroized on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    /// Wrap raw secret bytes
    #[must_use]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the secret bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// The local node's identity: seed, signing key, public half
pub struct LocalIdentity {
    seed: [u8; SEED_SIZE],
    signing: SigningKey,
    /// Public identity derived from the keypair
    pub id: Identity,
}

impl LocalIdentity {
    /// Deterministically construct from a stored seed
    #[must_use]
    pub fn from_seed(seed: [u8; SEED_SIZE]) -> Self {
        let signing = SigningKey::from_bytes(&seed);
        let id = Identity::new(signing.verifying_key().to_bytes());
        Self { seed, signing, id }
    }

    /// Generate a fresh identity.
    ///
    /// All-zero and all-0xFF public keys are reserved on the wire; the
    /// generator draws again if one comes up.
    pub fn generate<R: CryptoRng>(rng: &mut R) -> Result<Self, CryptoError> {
        loop {
            let mut seed = [0u8; SEED_SIZE];
            rng.fill_bytes(&mut seed)?;
            let candidate = Self::from_seed(seed);
            let pk = &candidate.id.pub_key;
            let reserved = pk.iter().all(|&b| b == 0) || pk.iter().all(|&b| b == 0xFF);
            if !reserved {
                return Ok(candidate);
            }
        }
    }

    /// The persisted seed (handle with care; grants the full identity)
    #[must_use]
    pub const fn seed(&self) -> &[u8; SEED_SIZE] {
        &self.seed
    }

    /// Sign `msg` with the node key
    #[must_use]
    pub fn sign(&self, msg: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing.sign(msg).to_bytes()
    }

    /// Compute the X25519 shared secret with `peer`.
    ///
    /// Both sides run their own signing scalar against the other's
    /// Montgomery-form public key, so the results agree.
    pub fn shared_secret(&self, peer: &Identity) -> Result<SharedSecret, CryptoError> {
        let vk = VerifyingKey::from_bytes(&peer.pub_key).map_err(|_| CryptoError::InvalidKey)?;
        let montgomery = vk.to_montgomery();
        let secret = x25519_dalek::x25519(self.signing.to_scalar_bytes(), montgomery.to_bytes());
        Ok(SharedSecret::new(secret))
    }
}

impl Drop for LocalIdentity {
    fn drop(&mut self) {
        self.seed.zeroize();
    }
}

impl core::fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "LocalIdentity({:?})", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::XorShiftRng;

    fn make_pair() -> (LocalIdentity, LocalIdentity) {
        let mut rng = XorShiftRng::new(1234);
        let a = LocalIdentity::generate(&mut rng).unwrap();
        let b = LocalIdentity::generate(&mut rng).unwrap();
        (a, b)
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let (a, _) = make_pair();
        let msg = b"advert payload";
        let sig = a.sign(msg);
        assert!(a.id.verify(&sig, msg));
        assert!(!a.id.verify(&sig, b"tampered"));
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let (a, b) = make_pair();
        let sig = a.sign(b"hello");
        assert!(!b.id.verify(&sig, b"hello"));
    }

    #[test]
    fn test_shared_secret_agreement() {
        let (a, b) = make_pair();
        let ab = a.shared_secret(&b.id).unwrap();
        let ba = b.shared_secret(&a.id).unwrap();
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn test_shared_secret_distinct_pairs() {
        let mut rng = XorShiftRng::new(99);
        let a = LocalIdentity::generate(&mut rng).unwrap();
        let b = LocalIdentity::generate(&mut rng).unwrap();
        let c = LocalIdentity::generate(&mut rng).unwrap();
        let ab = a.shared_secret(&b.id).unwrap();
        let ac = a.shared_secret(&c.id).unwrap();
        assert_ne!(ab.as_bytes(), ac.as_bytes());
    }

    #[test]
    fn test_seed_roundtrip() {
        let (a, _) = make_pair();
        let restored = LocalIdentity::from_seed(*a.seed());
        assert_eq!(restored.id.pub_key, a.id.pub_key);
    }

    #[test]
    fn test_hash_match() {
        let (a, _) = make_pair();
        let h = a.id.node_hash();
        assert!(a.id.is_hash_match(&[h]));
        assert!(!a.id.is_hash_match(&[h.wrapping_add(1)]));
    }
}
