// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Legacy ECB envelope
//!
//! `[hmac_tag:2][AES-128-ECB(plaintext padded to 16)]`
//!
//! The tag is HMAC-SHA256(shared_secret, ciphertext) truncated to 2 bytes.
//! The AES key is the leading 16 bytes of the 32-byte shared secret. An
//! older protocol generation still in the field speaks only this format;
//! new deployments use the AEAD-4 envelope.

use crate::error::CryptoError;
use crate::hash::hmac_sha256;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use lm_common::constants::{CIPHER_BLOCK_SIZE, CIPHER_KEY_SIZE, CIPHER_MAC_SIZE};
use subtle::ConstantTimeEq;

/// Ciphertext length for a plaintext of `len` bytes (padded to block size)
#[must_use]
pub const fn padded_len(len: usize) -> usize {
    len.div_ceil(CIPHER_BLOCK_SIZE) * CIPHER_BLOCK_SIZE
}

fn ecb_encrypt(secret: &[u8; 32], dest: &mut [u8], src: &[u8]) -> usize {
    let aes = Aes128::new(GenericArray::from_slice(&secret[..CIPHER_KEY_SIZE]));

    let mut written = 0;
    let mut chunks = src.chunks_exact(CIPHER_BLOCK_SIZE);
    for chunk in &mut chunks {
        let block = GenericArray::from_mut_slice(&mut dest[written..written + CIPHER_BLOCK_SIZE]);
        block.copy_from_slice(chunk);
        aes.encrypt_block(block);
        written += CIPHER_BLOCK_SIZE;
    }

    let rem = chunks.remainder();
    if !rem.is_empty() {
        let mut tmp = [0u8; CIPHER_BLOCK_SIZE];
        tmp[..rem.len()].copy_from_slice(rem);
        let block = GenericArray::from_mut_slice(&mut dest[written..written + CIPHER_BLOCK_SIZE]);
        block.copy_from_slice(&tmp);
        aes.encrypt_block(block);
        written += CIPHER_BLOCK_SIZE;
    }
    written
}

fn ecb_decrypt(secret: &[u8; 32], dest: &mut [u8], src: &[u8]) -> usize {
    let aes = Aes128::new(GenericArray::from_slice(&secret[..CIPHER_KEY_SIZE]));

    let mut written = 0;
    for chunk in src.chunks_exact(CIPHER_BLOCK_SIZE) {
        let block = GenericArray::from_mut_slice(&mut dest[written..written + CIPHER_BLOCK_SIZE]);
        block.copy_from_slice(chunk);
        aes.decrypt_block(block);
        written += CIPHER_BLOCK_SIZE;
    }
    written
}

/// Encrypt `src` and prepend the 2-byte HMAC tag.
///
/// Returns the total envelope length written to `dest`
/// (`CIPHER_MAC_SIZE + padded_len(src.len())`).
///
/// # Errors
///
/// Returns `CryptoError::BufferTooSmall` if `dest` cannot hold the
/// envelope, `CryptoError::InvalidInput` on an empty plaintext.
pub fn encrypt_then_mac(
    secret: &[u8; 32],
    dest: &mut [u8],
    src: &[u8],
) -> Result<usize, CryptoError> {
    if src.is_empty() {
        return Err(CryptoError::InvalidInput);
    }
    let enc_len = padded_len(src.len());
    if dest.len() < CIPHER_MAC_SIZE + enc_len {
        return Err(CryptoError::BufferTooSmall);
    }

    ecb_encrypt(secret, &mut dest[CIPHER_MAC_SIZE..], src);

    let tag = hmac_sha256(secret, &dest[CIPHER_MAC_SIZE..CIPHER_MAC_SIZE + enc_len]);
    dest[..CIPHER_MAC_SIZE].copy_from_slice(&tag[..CIPHER_MAC_SIZE]);

    Ok(CIPHER_MAC_SIZE + enc_len)
}

/// Verify the tag and decrypt.
///
/// Returns the decrypted length (a multiple of the block size; trailing
/// padding zeroes are the caller's to interpret), or 0 when the tag does
/// not match or the envelope is malformed — mirroring the receive path's
/// "try the next candidate key" contract.
pub fn mac_then_decrypt(secret: &[u8; 32], dest: &mut [u8], src: &[u8]) -> usize {
    if src.len() <= CIPHER_MAC_SIZE {
        return 0;
    }
    let ct = &src[CIPHER_MAC_SIZE..];
    if ct.len() % CIPHER_BLOCK_SIZE != 0 || dest.len() < ct.len() {
        return 0;
    }

    let tag = hmac_sha256(secret, ct);
    if tag[..CIPHER_MAC_SIZE].ct_eq(&src[..CIPHER_MAC_SIZE]).into() {
        ecb_decrypt(secret, dest, ct)
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: [u8; 32] = [0x5A; 32];

    #[test]
    fn test_roundtrip_partial_block() {
        let msg = b"hello mesh";
        let mut envelope = [0u8; 64];
        let n = encrypt_then_mac(&SECRET, &mut envelope, msg).unwrap();
        assert_eq!(n, CIPHER_MAC_SIZE + CIPHER_BLOCK_SIZE);

        let mut out = [0u8; 64];
        let len = mac_then_decrypt(&SECRET, &mut out, &envelope[..n]);
        assert_eq!(len, CIPHER_BLOCK_SIZE);
        assert_eq!(&out[..msg.len()], msg);
        // zero padding
        assert!(out[msg.len()..len].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_roundtrip_exact_blocks() {
        let msg = [7u8; 32];
        let mut envelope = [0u8; 64];
        let n = encrypt_then_mac(&SECRET, &mut envelope, &msg).unwrap();
        assert_eq!(n, CIPHER_MAC_SIZE + 32);

        let mut out = [0u8; 64];
        assert_eq!(mac_then_decrypt(&SECRET, &mut out, &envelope[..n]), 32);
        assert_eq!(out[..32], msg);
    }

    #[test]
    fn test_wrong_key_rejected() {
        let mut envelope = [0u8; 64];
        let n = encrypt_then_mac(&SECRET, &mut envelope, b"secret text").unwrap();

        let other = [0xA5u8; 32];
        let mut out = [0u8; 64];
        assert_eq!(mac_then_decrypt(&other, &mut out, &envelope[..n]), 0);
    }

    #[test]
    fn test_corrupted_tag_rejected() {
        let mut envelope = [0u8; 64];
        let n = encrypt_then_mac(&SECRET, &mut envelope, b"payload").unwrap();
        envelope[0] ^= 0x01;

        let mut out = [0u8; 64];
        assert_eq!(mac_then_decrypt(&SECRET, &mut out, &envelope[..n]), 0);
    }

    #[test]
    fn test_truncated_input_rejected() {
        let mut out = [0u8; 64];
        assert_eq!(mac_then_decrypt(&SECRET, &mut out, &[0u8; 2]), 0);
        assert_eq!(mac_then_decrypt(&SECRET, &mut out, &[0u8; 9]), 0);
    }
}
