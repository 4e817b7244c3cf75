// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! LinkMesh Cryptography
//!
//! The primitive suite of the LinkMesh wire protocol:
//!
//! - **Identity**: Ed25519 keypairs addressing nodes, with an X25519
//!   bridge so the same keypair computes ECDH shared secrets
//! - **Hash**: SHA-256 and HMAC-SHA256 helpers
//! - **Cipher**: the legacy AES-128-ECB envelope with a 2-byte HMAC tag
//! - **AEAD**: the AEAD-4 ChaCha20-Poly1305 envelope with per-message
//!   key derivation and a 4-byte tag
//! - **RNG**: the entropy trait injected by the host
//!
//! # Security
//!
//! All secret-bearing types are zeroized on drop. Tag comparisons are
//! constant-time. Decryption failures zero the output buffer.

#![no_std]
#![deny(unsafe_code)]
#![warn(missing_docs)]

#[cfg(feature = "std")]
extern crate std;

pub mod aead;
pub mod cipher;
pub mod error;
pub mod hash;
pub mod identity;
pub mod rng;

pub use error::CryptoError;
pub use identity::{Identity, LocalIdentity, SharedSecret};
pub use rng::CryptoRng;
