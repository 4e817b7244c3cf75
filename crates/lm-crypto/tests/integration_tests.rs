// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Integration tests for lm-crypto

use lm_crypto::aead::{aead_decrypt, aead_encrypt};
use lm_crypto::cipher::{encrypt_then_mac, mac_then_decrypt};
use lm_crypto::hash::{hmac_sha256, sha256_pair};
use lm_crypto::rng::XorShiftRng;
use lm_crypto::{CryptoRng, LocalIdentity};

#[test]
fn test_end_to_end_envelope_over_ecdh() {
    // Alice and Bob derive the static secret and exchange both envelope
    // formats over it, the way the datagram path does.
    let mut rng = XorShiftRng::new(2024);
    let alice = LocalIdentity::generate(&mut rng).unwrap();
    let bob = LocalIdentity::generate(&mut rng).unwrap();

    let secret_a = alice.shared_secret(&bob.id).unwrap();
    let secret_b = bob.shared_secret(&alice.id).unwrap();

    let dest_hash = bob.id.node_hash();
    let src_hash = alice.id.node_hash();
    let aad = [0x20u8, dest_hash, src_hash];

    // AEAD-4
    let mut sealed = [0u8; 190];
    let n = aead_encrypt(
        secret_a.as_bytes(),
        &mut sealed,
        b"hi bob",
        &aad,
        4321,
        dest_hash,
        src_hash,
    )
    .unwrap();
    let mut out = [0u8; 190];
    let len = aead_decrypt(secret_b.as_bytes(), &mut out, &sealed[..n], &aad, dest_hash, src_hash);
    assert_eq!(&out[..len], b"hi bob");

    // legacy ECB
    let mut envelope = [0u8; 190];
    let n = encrypt_then_mac(secret_a.as_bytes(), &mut envelope, b"hi bob (legacy)").unwrap();
    let mut out = [0u8; 190];
    let len = mac_then_decrypt(secret_b.as_bytes(), &mut out, &envelope[..n]);
    assert!(len > 0);
    assert_eq!(&out[..15], b"hi bob (legacy)");
}

#[test]
fn test_session_key_derivation_agreement() {
    // session_key = HMAC-SHA256(static_secret, X25519(ephemeral))
    let mut rng = XorShiftRng::new(7);
    let alice = LocalIdentity::generate(&mut rng).unwrap();
    let bob = LocalIdentity::generate(&mut rng).unwrap();
    let eph_a = LocalIdentity::generate(&mut rng).unwrap();
    let eph_b = LocalIdentity::generate(&mut rng).unwrap();

    let static_ab = alice.shared_secret(&bob.id).unwrap();
    let static_ba = bob.shared_secret(&alice.id).unwrap();

    let eph_ab = eph_a.shared_secret(&eph_b.id).unwrap();
    let eph_ba = eph_b.shared_secret(&eph_a.id).unwrap();

    let key_a = hmac_sha256(static_ab.as_bytes(), eph_ab.as_bytes());
    let key_b = hmac_sha256(static_ba.as_bytes(), eph_ba.as_bytes());
    assert_eq!(key_a, key_b);
}

#[test]
fn test_ack_hash_shape() {
    // ack = SHA-256(msg || pub_key)[0..4]
    let mut rng = XorShiftRng::new(11);
    let id = LocalIdentity::generate(&mut rng).unwrap();
    let mut ack = [0u8; 4];
    sha256_pair(&mut ack, b"\x01\x02\x03\x04\x00hello", &id.id.pub_key);
    let mut again = [0u8; 4];
    sha256_pair(&mut again, b"\x01\x02\x03\x04\x00hello", &id.id.pub_key);
    assert_eq!(ack, again);
}

#[test]
fn test_identity_generation_avoids_reserved_keys() {
    let mut rng = XorShiftRng::new(31337);
    for _ in 0..8 {
        let id = LocalIdentity::generate(&mut rng).unwrap();
        assert!(!id.id.pub_key.iter().all(|&b| b == 0));
        assert!(!id.id.pub_key.iter().all(|&b| b == 0xFF));
    }
}

#[test]
fn test_rng_jitter_draws() {
    // the dispatcher draws rand(0..5) and rand(1..4); both must stay in range
    let mut rng = XorShiftRng::new(55);
    for _ in 0..200 {
        assert!(rng.next_in_range(0, 5) < 5);
        let v = rng.next_in_range(1, 4);
        assert!((1..4).contains(&v));
    }
}
