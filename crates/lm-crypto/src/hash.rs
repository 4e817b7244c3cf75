// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! SHA-256 and HMAC-SHA256 helpers
//!
//! Thin wrappers over the RustCrypto implementations, shaped for the
//! truncated-output uses in this protocol (packet hashes, ack hashes,
//! envelope tags, key derivation).

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Compute SHA-256 of `msg`, writing the first `dest.len()` bytes (≤ 32)
pub fn sha256(dest: &mut [u8], msg: &[u8]) {
    debug_assert!(dest.len() <= 32);
    let digest = Sha256::digest(msg);
    dest.copy_from_slice(&digest[..dest.len()]);
}

/// Compute SHA-256 over two fragments, writing the first `dest.len()` bytes
pub fn sha256_pair(dest: &mut [u8], frag1: &[u8], frag2: &[u8]) {
    debug_assert!(dest.len() <= 32);
    let mut hasher = Sha256::new();
    hasher.update(frag1);
    hasher.update(frag2);
    let digest = hasher.finalize();
    dest.copy_from_slice(&digest[..dest.len()]);
}

/// Compute HMAC-SHA256(key, data)
#[must_use]
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    // new_from_slice accepts any key length
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    let out = mac.finalize().into_bytes();
    let mut dest = [0u8; 32];
    dest.copy_from_slice(&out);
    dest
}
