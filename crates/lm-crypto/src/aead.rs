// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! AEAD-4 envelope
//!
//! ChaCha20-Poly1305 authenticated encryption with a 4-byte tag:
//!
//! ```text
//! [nonce:2] [ciphertext:M] [tag:4]      (M = exact plaintext length)
//! ```
//!
//! Per-message key derivation eliminates the nonce-reuse catastrophe:
//!
//! ```text
//! msg_key[32] = HMAC-SHA256(shared_secret, nonce_hi || nonce_lo || dest_hash || src_hash)
//! ```
//!
//! Including the hashes makes keys direction-dependent: A→B and B→A derive
//! different keys even with the same nonce (for 255/256 peer pairs; the
//! 1/256 where dest_hash == src_hash remains a residual risk inherent to
//! 1-byte hashes).
//!
//! IV construction (12 bytes, from on-wire fields):
//!
//! ```text
//! iv[12] = { nonce_hi, nonce_lo, dest_hash, src_hash, 0 x 8 }
//! ```
//!
//! Associated data is authenticated but not encrypted: peer messages use
//! `header || dest_hash || src_hash`, anonymous requests `header || dest_hash`,
//! group messages `header || channel_hash`.
//!
//! The 4-byte tag is short on purpose to preserve the tiny payload budget;
//! the per-message key derivation is the second line of defense.

use crate::error::CryptoError;
use crate::hash::hmac_sha256;
use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::ChaCha20;
use lm_common::constants::{AEAD_NONCE_SIZE, AEAD_TAG_SIZE};
use poly1305::universal_hash::{KeyInit, UniversalHash};
use poly1305::Poly1305;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// Envelope length for a plaintext of `len` bytes
#[must_use]
pub const fn sealed_len(len: usize) -> usize {
    AEAD_NONCE_SIZE + len + AEAD_TAG_SIZE
}

fn derive_msg_key(
    shared_secret: &[u8; 32],
    nonce_hi: u8,
    nonce_lo: u8,
    dest_hash: u8,
    src_hash: u8,
) -> [u8; 32] {
    let kdf_input = [nonce_hi, nonce_lo, dest_hash, src_hash];
    hmac_sha256(shared_secret, &kdf_input)
}

fn build_iv(nonce_hi: u8, nonce_lo: u8, dest_hash: u8, src_hash: u8) -> [u8; 12] {
    let mut iv = [0u8; 12];
    iv[0] = nonce_hi;
    iv[1] = nonce_lo;
    iv[2] = dest_hash;
    iv[3] = src_hash;
    iv
}

/// RFC 8439 tag over `aad` and `ct`, truncated to 4 bytes by the caller
fn poly1305_tag(cipher: &mut ChaCha20, aad: &[u8], ct: &[u8]) -> [u8; 16] {
    // Poly1305 key = first 32 bytes of keystream block 0; ciphertext
    // starts at block 1.
    let mut poly_key = [0u8; 32];
    cipher.apply_keystream(&mut poly_key);
    cipher.seek(64u32);

    let mut mac = Poly1305::new(poly1305::Key::from_slice(&poly_key));
    mac.update_padded(aad);
    mac.update_padded(ct);

    let mut len_block = [0u8; 16];
    len_block[..8].copy_from_slice(&(aad.len() as u64).to_le_bytes());
    len_block[8..].copy_from_slice(&(ct.len() as u64).to_le_bytes());
    mac.update_padded(&len_block);

    poly_key.zeroize();
    let tag = mac.finalize();
    tag.into()
}

/// Seal `src` into `dest` under the AEAD-4 envelope.
///
/// Returns the envelope length (`sealed_len(src.len())`).
///
/// # Errors
///
/// `CryptoError::InvalidInput` on an empty plaintext,
/// `CryptoError::BufferTooSmall` if `dest` cannot hold the envelope.
pub fn aead_encrypt(
    shared_secret: &[u8; 32],
    dest: &mut [u8],
    src: &[u8],
    assoc_data: &[u8],
    nonce_counter: u16,
    dest_hash: u8,
    src_hash: u8,
) -> Result<usize, CryptoError> {
    if src.is_empty() {
        return Err(CryptoError::InvalidInput);
    }
    if dest.len() < sealed_len(src.len()) {
        return Err(CryptoError::BufferTooSmall);
    }

    let nonce_hi = (nonce_counter >> 8) as u8;
    let nonce_lo = (nonce_counter & 0xFF) as u8;
    dest[0] = nonce_hi;
    dest[1] = nonce_lo;

    let mut msg_key = derive_msg_key(shared_secret, nonce_hi, nonce_lo, dest_hash, src_hash);
    let iv = build_iv(nonce_hi, nonce_lo, dest_hash, src_hash);

    let mut cipher = ChaCha20::new(
        chacha20::Key::from_slice(&msg_key),
        chacha20::Nonce::from_slice(&iv),
    );
    // reserve block 0 for the Poly1305 key, then encrypt from block 1
    let mut poly_key = [0u8; 32];
    cipher.apply_keystream(&mut poly_key);
    cipher.seek(64u32);

    let ct_end = AEAD_NONCE_SIZE + src.len();
    dest[AEAD_NONCE_SIZE..ct_end].copy_from_slice(src);
    cipher.apply_keystream(&mut dest[AEAD_NONCE_SIZE..ct_end]);

    let mut mac = Poly1305::new(poly1305::Key::from_slice(&poly_key));
    mac.update_padded(assoc_data);
    mac.update_padded(&dest[AEAD_NONCE_SIZE..ct_end]);
    let mut len_block = [0u8; 16];
    len_block[..8].copy_from_slice(&(assoc_data.len() as u64).to_le_bytes());
    len_block[8..].copy_from_slice(&(src.len() as u64).to_le_bytes());
    mac.update_padded(&len_block);
    let tag: [u8; 16] = mac.finalize().into();

    dest[ct_end..ct_end + AEAD_TAG_SIZE].copy_from_slice(&tag[..AEAD_TAG_SIZE]);

    poly_key.zeroize();
    msg_key.zeroize();
    Ok(sealed_len(src.len()))
}

/// Open an AEAD-4 envelope from `src` into `dest`.
///
/// Returns the plaintext length, or 0 when the tag does not verify or the
/// envelope is malformed (the output buffer is zeroed in that case) —
/// the receive path then tries the next candidate key.
pub fn aead_decrypt(
    shared_secret: &[u8; 32],
    dest: &mut [u8],
    src: &[u8],
    assoc_data: &[u8],
    dest_hash: u8,
    src_hash: u8,
) -> usize {
    // minimum: nonce(2) + 1 byte ciphertext + tag(4)
    if src.len() < AEAD_NONCE_SIZE + 1 + AEAD_TAG_SIZE {
        return 0;
    }
    let ct_len = src.len() - AEAD_NONCE_SIZE - AEAD_TAG_SIZE;
    if dest.len() < ct_len {
        return 0;
    }

    let nonce_hi = src[0];
    let nonce_lo = src[1];
    let mut msg_key = derive_msg_key(shared_secret, nonce_hi, nonce_lo, dest_hash, src_hash);
    let iv = build_iv(nonce_hi, nonce_lo, dest_hash, src_hash);

    let ct = &src[AEAD_NONCE_SIZE..AEAD_NONCE_SIZE + ct_len];
    let wire_tag = &src[AEAD_NONCE_SIZE + ct_len..];

    let mut cipher = ChaCha20::new(
        chacha20::Key::from_slice(&msg_key),
        chacha20::Nonce::from_slice(&iv),
    );
    let tag = poly1305_tag(&mut cipher, assoc_data, ct);
    msg_key.zeroize();

    let valid: bool = tag[..AEAD_TAG_SIZE].ct_eq(wire_tag).into();
    if !valid {
        dest[..ct_len].fill(0);
        return 0;
    }

    dest[..ct_len].copy_from_slice(ct);
    cipher.apply_keystream(&mut dest[..ct_len]);
    ct_len
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: [u8; 32] = [0x42; 32];
    const AAD: &[u8] = &[0x24, 0x11, 0x73]; // header || dest_hash || src_hash

    #[test]
    fn test_roundtrip() {
        let msg = b"over the mesh";
        let mut sealed = [0u8; 64];
        let n = aead_encrypt(&SECRET, &mut sealed, msg, AAD, 1234, 0x11, 0x73).unwrap();
        assert_eq!(n, sealed_len(msg.len()));
        // wire nonce is big-endian-ish hi/lo
        assert_eq!(sealed[0], (1234u16 >> 8) as u8);
        assert_eq!(sealed[1], (1234u16 & 0xFF) as u8);

        let mut out = [0u8; 64];
        let len = aead_decrypt(&SECRET, &mut out, &sealed[..n], AAD, 0x11, 0x73);
        assert_eq!(len, msg.len());
        assert_eq!(&out[..len], msg);
    }

    #[test]
    fn test_exact_plaintext_length_no_padding() {
        let msg = [9u8; 21];
        let mut sealed = [0u8; 64];
        let n = aead_encrypt(&SECRET, &mut sealed, &msg, AAD, 7, 1, 2).unwrap();
        assert_eq!(n, 2 + 21 + 4);
    }

    #[test]
    fn test_wrong_key_rejected_and_zeroed() {
        let mut sealed = [0u8; 64];
        let n = aead_encrypt(&SECRET, &mut sealed, b"topsecret", AAD, 5, 1, 2).unwrap();

        let other = [0x24u8; 32];
        let mut out = [0xEEu8; 64];
        assert_eq!(aead_decrypt(&other, &mut out, &sealed[..n], AAD, 1, 2), 0);
        assert!(out[..9].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_aad_mismatch_rejected() {
        let mut sealed = [0u8; 64];
        let n = aead_encrypt(&SECRET, &mut sealed, b"payload", AAD, 5, 1, 2).unwrap();

        let mut out = [0u8; 64];
        assert_eq!(aead_decrypt(&SECRET, &mut out, &sealed[..n], &[0xFF], 1, 2), 0);
    }

    #[test]
    fn test_direction_dependent_keys() {
        // same nonce, swapped hashes: ciphertexts must differ
        let msg = b"same nonce both ways";
        let mut ab = [0u8; 64];
        let mut ba = [0u8; 64];
        let n1 = aead_encrypt(&SECRET, &mut ab, msg, b"", 100, 0x11, 0x73).unwrap();
        let n2 = aead_encrypt(&SECRET, &mut ba, msg, b"", 100, 0x73, 0x11).unwrap();
        assert_eq!(n1, n2);
        assert_ne!(ab[2..n1 - 4], ba[2..n2 - 4]);
    }

    #[test]
    fn test_corrupted_tag_rejected() {
        let mut sealed = [0u8; 64];
        let n = aead_encrypt(&SECRET, &mut sealed, b"payload", AAD, 5, 1, 2).unwrap();
        sealed[n - 1] ^= 0x80;

        let mut out = [0u8; 64];
        assert_eq!(aead_decrypt(&SECRET, &mut out, &sealed[..n], AAD, 1, 2), 0);
    }

    #[test]
    fn test_minimum_length_enforced() {
        let mut out = [0u8; 16];
        assert_eq!(aead_decrypt(&SECRET, &mut out, &[0u8; 6], AAD, 1, 2), 0);
    }
}
