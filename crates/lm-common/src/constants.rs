// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Protocol-wide constants for LinkMesh
//!
//! These limits define the wire format and must not change without a
//! protocol version bump.

/// Ed25519 public key size in bytes
pub const PUB_KEY_SIZE: usize = 32;

/// Ed25519 expanded private key size in bytes
pub const PRV_KEY_SIZE: usize = 64;

/// Identity seed size in bytes
pub const SEED_SIZE: usize = 32;

/// Ed25519 signature size in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// Maximum per-packet payload in bytes
pub const MAX_PACKET_PAYLOAD: usize = 184;

/// Maximum total path bytes in a packet
pub const MAX_PATH_SIZE: usize = 64;

/// Maximum raw transmission unit in bytes
pub const MAX_TRANS_UNIT: usize = 255;

/// Truncated packet-hash size in bytes (for duplicate detection)
pub const MAX_HASH_SIZE: usize = 8;

/// Path-hash size on the current deployed network
pub const PATH_HASH_SIZE: usize = 1;

/// AES-128 key size in bytes (legacy envelope)
pub const CIPHER_KEY_SIZE: usize = 16;

/// AES block size in bytes (legacy envelope)
pub const CIPHER_BLOCK_SIZE: usize = 16;

/// Legacy envelope HMAC tag size in bytes
pub const CIPHER_MAC_SIZE: usize = 2;

/// AEAD-4 wire nonce size in bytes
pub const AEAD_NONCE_SIZE: usize = 2;

/// AEAD-4 authentication tag size in bytes
pub const AEAD_TAG_SIZE: usize = 4;

/// Session key size in bytes
pub const SESSION_KEY_SIZE: usize = 32;

/// Maximum advert app-data size in bytes
pub const MAX_ADVERT_DATA_SIZE: usize = 32;

/// Maximum peer-hash collision matches consulted per lookup
pub const MAX_HASH_MATCHES: usize = 4;

// =============================================================================
// Nonce lifecycle
// =============================================================================

/// Lowest value for a freshly seeded AEAD nonce counter
pub const NONCE_INITIAL_MIN: u16 = 1000;

/// Highest value for a freshly seeded AEAD nonce counter
pub const NONCE_INITIAL_MAX: u16 = 50_000;

/// Increments between nonce persists (the "dirty" threshold)
pub const NONCE_PERSIST_INTERVAL: u16 = 50;

/// Amount added to every loaded nonce after a dirty reboot
pub const NONCE_BOOT_BUMP: u16 = 50;

/// Session nonce value above which a rekey is considered
pub const NONCE_REKEY_THRESHOLD: u16 = 60_000;

// =============================================================================
// Session key lifecycle
// =============================================================================

/// Session key entries held in RAM
pub const MAX_SESSION_KEYS_RAM: usize = 8;

/// Session key records held in the flash-backed file
pub const MAX_SESSION_KEYS_FLASH: usize = 48;

/// Sends without a reply before falling back to the static secret
pub const SESSION_KEY_STALE_THRESHOLD: u8 = 50;

/// Sends without a reply before falling back to ECB
pub const SESSION_KEY_ECB_THRESHOLD: u8 = 100;

/// Sends without a reply before abandoning the session key entirely
pub const SESSION_KEY_ABANDON_THRESHOLD: u8 = 255;

/// INIT handshake timeout per attempt in milliseconds
pub const SESSION_KEY_TIMEOUT_MS: u32 = 180_000;

/// INIT handshake attempts before giving up
pub const SESSION_KEY_MAX_RETRIES: u8 = 3;

/// Persistence record flag: previous session key is valid (dual-decode)
pub const SESSION_FLAG_PREV_VALID: u8 = 0x01;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_limits() {
        // path plus payload plus header/path_len/transport codes fit the MTU
        assert!(2 + 4 + MAX_PATH_SIZE + MAX_PACKET_PAYLOAD <= MAX_TRANS_UNIT);
    }

    #[test]
    fn test_nonce_seed_range_above_exhaustion_zone() {
        assert!(NONCE_INITIAL_MIN > NONCE_BOOT_BUMP as u16);
        assert!(NONCE_INITIAL_MAX < NONCE_REKEY_THRESHOLD);
    }
}
