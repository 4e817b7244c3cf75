// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Persistence contracts
//!
//! The core only needs a key→blob interface; the backing store (LittleFS,
//! NVS, a host filesystem) is external. This module defines the trait,
//! the well-known blob names and the record codecs for the fixed-layout
//! files (identity, contacts, nonces). Session-key and region records
//! have their codecs next to their owners.

use crate::advert::{NodeType, MAX_NAME_LEN};
use crate::contact::Contact;
use heapless::String;
use lm_common::constants::{MAX_PATH_SIZE, PUB_KEY_SIZE, SEED_SIZE};
use lm_common::{Error, Result};
use lm_crypto::{Identity, LocalIdentity};

/// Blob key: local identity (seed-bearing)
pub const KEY_IDENTITY: &[u8] = b"identity";
/// Blob key: contact records
pub const KEY_CONTACTS: &[u8] = b"contacts";
/// Blob key: per-contact nonce counters
pub const KEY_NONCES: &[u8] = b"nonces";
/// Blob key: session-key records
pub const KEY_SESSION_KEYS: &[u8] = b"session_keys";
/// Blob key: region map
pub const KEY_REGIONS: &[u8] = b"regions";
/// Blob key: mesh tables snapshot
pub const KEY_MESH_TABLES: &[u8] = b"mesh_tables";
/// Blob key: node preferences
pub const KEY_PREFS: &[u8] = b"prefs";

/// Key→blob store provided by the host
pub trait BlobStore {
    /// Read the blob under `key` into `dest`; returns the byte count.
    ///
    /// # Errors
    ///
    /// `Error::StorageNotFound` when absent, `Error::BufferTooSmall`
    /// when `dest` cannot hold it.
    fn get(&mut self, key: &[u8], dest: &mut [u8]) -> Result<usize>;

    /// Write (replace) the blob under `key`
    ///
    /// # Errors
    ///
    /// `Error::StorageWriteFailed` when the store rejects the write.
    fn put(&mut self, key: &[u8], data: &[u8]) -> Result<()>;

    /// Remove the blob under `key` (absent is not an error)
    ///
    /// # Errors
    ///
    /// `Error::StorageWriteFailed` when the store rejects the removal.
    fn remove(&mut self, key: &[u8]) -> Result<()>;
}

impl<T: BlobStore + ?Sized> BlobStore for &mut T {
    fn get(&mut self, key: &[u8], dest: &mut [u8]) -> Result<usize> {
        (**self).get(key, dest)
    }
    fn put(&mut self, key: &[u8], data: &[u8]) -> Result<()> {
        (**self).put(key, data)
    }
    fn remove(&mut self, key: &[u8]) -> Result<()> {
        (**self).remove(key)
    }
}

// =============================================================================
// Identity record
// =============================================================================

/// Identity record size: seed + public key
pub const IDENTITY_RECORD_SIZE: usize = SEED_SIZE + PUB_KEY_SIZE;

/// Serialize the local identity
pub fn write_identity_record(dest: &mut [u8; IDENTITY_RECORD_SIZE], id: &LocalIdentity) {
    dest[..SEED_SIZE].copy_from_slice(id.seed());
    dest[SEED_SIZE..].copy_from_slice(&id.id.pub_key);
}

/// Restore the local identity; the stored public key must match the
/// seed-derived one.
///
/// # Errors
///
/// `Error::StorageCorrupted` on a size or key mismatch.
pub fn read_identity_record(src: &[u8]) -> Result<LocalIdentity> {
    if src.len() < IDENTITY_RECORD_SIZE {
        return Err(Error::StorageCorrupted);
    }
    let mut seed = [0u8; SEED_SIZE];
    seed.copy_from_slice(&src[..SEED_SIZE]);
    let id = LocalIdentity::from_seed(seed);
    if id.id.pub_key[..] != src[SEED_SIZE..IDENTITY_RECORD_SIZE] {
        return Err(Error::StorageCorrupted);
    }
    Ok(id)
}

// =============================================================================
// Contact records
// =============================================================================

/// Fixed contact record size
pub const CONTACT_RECORD_SIZE: usize =
    PUB_KEY_SIZE + MAX_NAME_LEN + 1 + 1 + 1 + 1 + MAX_PATH_SIZE + 4 + 4 + 4 + 4 + 4;

/// Serialize one contact record
pub fn write_contact_record(dest: &mut [u8], contact: &Contact) -> Result<usize> {
    if dest.len() < CONTACT_RECORD_SIZE {
        return Err(Error::BufferTooSmall);
    }
    let mut i = 0;
    dest[i..i + PUB_KEY_SIZE].copy_from_slice(&contact.id.pub_key);
    i += PUB_KEY_SIZE;
    dest[i..i + MAX_NAME_LEN].fill(0);
    dest[i..i + contact.name.len()].copy_from_slice(contact.name.as_bytes());
    i += MAX_NAME_LEN;
    dest[i] = contact.name.len() as u8;
    i += 1;
    dest[i] = contact.node_type as u8;
    i += 1;
    dest[i] = contact.flags;
    i += 1;
    dest[i] = contact.out_path_len;
    i += 1;
    dest[i..i + MAX_PATH_SIZE].copy_from_slice(&contact.out_path);
    i += MAX_PATH_SIZE;
    dest[i..i + 4].copy_from_slice(&contact.last_advert_timestamp.to_le_bytes());
    i += 4;
    dest[i..i + 4].copy_from_slice(&contact.lastmod.to_le_bytes());
    i += 4;
    dest[i..i + 4].copy_from_slice(&contact.gps_lat.to_le_bytes());
    i += 4;
    dest[i..i + 4].copy_from_slice(&contact.gps_lon.to_le_bytes());
    i += 4;
    dest[i..i + 4].copy_from_slice(&contact.sync_since.to_le_bytes());
    i += 4;
    Ok(i)
}

/// Parse one contact record (the AEAD nonce is loaded separately from
/// the nonce file; the shared-secret cache is recomputed on demand).
///
/// # Errors
///
/// `Error::StorageCorrupted` on a malformed record.
pub fn read_contact_record(src: &[u8]) -> Result<Contact> {
    if src.len() < CONTACT_RECORD_SIZE {
        return Err(Error::StorageCorrupted);
    }
    let mut i = 0;
    let id = Identity::from_slice(&src[i..i + PUB_KEY_SIZE]).ok_or(Error::StorageCorrupted)?;
    i += PUB_KEY_SIZE;
    let name_area = &src[i..i + MAX_NAME_LEN];
    i += MAX_NAME_LEN;
    let name_len = (src[i] as usize).min(MAX_NAME_LEN);
    i += 1;

    let mut contact = Contact::new(id);
    let name_str =
        core::str::from_utf8(&name_area[..name_len]).map_err(|_| Error::StorageCorrupted)?;
    let mut name = String::new();
    let _ = name.push_str(name_str);
    contact.name = name;

    contact.node_type = NodeType::from_u8(src[i]);
    i += 1;
    contact.flags = src[i];
    i += 1;
    contact.out_path_len = src[i];
    i += 1;
    contact.out_path.copy_from_slice(&src[i..i + MAX_PATH_SIZE]);
    i += MAX_PATH_SIZE;
    contact.last_advert_timestamp = u32::from_le_bytes([src[i], src[i + 1], src[i + 2], src[i + 3]]);
    i += 4;
    contact.lastmod = u32::from_le_bytes([src[i], src[i + 1], src[i + 2], src[i + 3]]);
    i += 4;
    contact.gps_lat = i32::from_le_bytes([src[i], src[i + 1], src[i + 2], src[i + 3]]);
    i += 4;
    contact.gps_lon = i32::from_le_bytes([src[i], src[i + 1], src[i + 2], src[i + 3]]);
    i += 4;
    contact.sync_since = u32::from_le_bytes([src[i], src[i + 1], src[i + 2], src[i + 3]]);
    Ok(contact)
}

// =============================================================================
// Nonce records
// =============================================================================

/// Nonce record size: 4-byte key prefix + 2-byte counter
pub const NONCE_RECORD_SIZE: usize = 6;

/// Serialize one nonce record
pub fn write_nonce_record(dest: &mut [u8], prefix: &[u8; 4], nonce: u16) -> Result<usize> {
    if dest.len() < NONCE_RECORD_SIZE {
        return Err(Error::BufferTooSmall);
    }
    dest[..4].copy_from_slice(prefix);
    dest[4..6].copy_from_slice(&nonce.to_le_bytes());
    Ok(NONCE_RECORD_SIZE)
}

/// Parse one nonce record
#[must_use]
pub fn read_nonce_record(src: &[u8]) -> Option<([u8; 4], u16)> {
    if src.len() < NONCE_RECORD_SIZE {
        return None;
    }
    let mut prefix = [0u8; 4];
    prefix.copy_from_slice(&src[..4]);
    Some((prefix, u16::from_le_bytes([src[4], src[5]])))
}

// =============================================================================
// In-memory store (tests, simulations)
// =============================================================================

/// Maximum key length in the in-memory store
pub const MEM_KEY_SIZE: usize = 32;
/// Maximum blob length in the in-memory store
pub const MEM_BLOB_SIZE: usize = 5120;
/// Slot count in the in-memory store
pub const MEM_BLOB_SLOTS: usize = 12;

/// Fixed-slot in-memory blob store for tests and simulations
pub struct MemoryBlobStore {
    keys: [([u8; MEM_KEY_SIZE], usize); MEM_BLOB_SLOTS],
    values: [([u8; MEM_BLOB_SIZE], usize); MEM_BLOB_SLOTS],
    used: [bool; MEM_BLOB_SLOTS],
}

impl MemoryBlobStore {
    /// Create an empty store
    #[must_use]
    pub const fn new() -> Self {
        Self {
            keys: [([0; MEM_KEY_SIZE], 0); MEM_BLOB_SLOTS],
            values: [([0; MEM_BLOB_SIZE], 0); MEM_BLOB_SLOTS],
            used: [false; MEM_BLOB_SLOTS],
        }
    }

    fn find(&self, key: &[u8]) -> Option<usize> {
        (0..MEM_BLOB_SLOTS).find(|&i| {
            self.used[i] && self.keys[i].1 == key.len() && self.keys[i].0[..key.len()] == *key
        })
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&mut self, key: &[u8], dest: &mut [u8]) -> Result<usize> {
        let i = self.find(key).ok_or(Error::StorageNotFound)?;
        let len = self.values[i].1;
        if dest.len() < len {
            return Err(Error::BufferTooSmall);
        }
        dest[..len].copy_from_slice(&self.values[i].0[..len]);
        Ok(len)
    }

    fn put(&mut self, key: &[u8], data: &[u8]) -> Result<()> {
        if key.len() > MEM_KEY_SIZE || data.len() > MEM_BLOB_SIZE {
            return Err(Error::StorageWriteFailed);
        }
        let i = match self.find(key) {
            Some(i) => i,
            None => (0..MEM_BLOB_SLOTS)
                .find(|&i| !self.used[i])
                .ok_or(Error::StorageWriteFailed)?,
        };
        self.used[i] = true;
        self.keys[i].0[..key.len()].copy_from_slice(key);
        self.keys[i].1 = key.len();
        self.values[i].0[..data.len()].copy_from_slice(data);
        self.values[i].1 = data.len();
        Ok(())
    }

    fn remove(&mut self, key: &[u8]) -> Result<()> {
        if let Some(i) = self.find(key) {
            self.used[i] = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::{CONTACT_FLAG_AEAD, OUT_PATH_UNKNOWN};
    use lm_crypto::rng::XorShiftRng;

    #[test]
    fn test_memory_store_basics() {
        let mut store = MemoryBlobStore::new();
        let mut buf = [0u8; 16];
        assert_eq!(store.get(b"missing", &mut buf).unwrap_err(), Error::StorageNotFound);

        store.put(b"k", b"value").unwrap();
        assert_eq!(store.get(b"k", &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"value");

        store.put(b"k", b"v2").unwrap();
        assert_eq!(store.get(b"k", &mut buf).unwrap(), 2);

        store.remove(b"k").unwrap();
        assert!(store.get(b"k", &mut buf).is_err());
    }

    #[test]
    fn test_identity_record_roundtrip() {
        let mut rng = XorShiftRng::new(5);
        let id = LocalIdentity::generate(&mut rng).unwrap();
        let mut rec = [0u8; IDENTITY_RECORD_SIZE];
        write_identity_record(&mut rec, &id);

        let restored = read_identity_record(&rec).unwrap();
        assert_eq!(restored.id.pub_key, id.id.pub_key);

        // tampered public key is rejected
        let mut bad = rec;
        bad[SEED_SIZE] ^= 1;
        assert!(read_identity_record(&bad).is_err());
    }

    #[test]
    fn test_contact_record_roundtrip() {
        let mut rng = XorShiftRng::new(6);
        let peer = LocalIdentity::generate(&mut rng).unwrap().id;
        let mut c = Contact::new(peer);
        let _ = c.name.push_str("beacon-12");
        c.node_type = NodeType::Repeater;
        c.flags = CONTACT_FLAG_AEAD;
        c.out_path_len = 2;
        c.out_path[..2].copy_from_slice(&[0x15, 0x29]);
        c.last_advert_timestamp = 1_700_000_000;
        c.lastmod = 1_700_000_100;
        c.gps_lat = 43_650_000;
        c.gps_lon = -79_380_000;
        c.sync_since = 12345;

        let mut rec = [0u8; CONTACT_RECORD_SIZE];
        let n = write_contact_record(&mut rec, &c).unwrap();
        assert_eq!(n, CONTACT_RECORD_SIZE);

        let restored = read_contact_record(&rec).unwrap();
        assert_eq!(restored.id.pub_key, peer.pub_key);
        assert_eq!(restored.name.as_str(), "beacon-12");
        assert_eq!(restored.node_type, NodeType::Repeater);
        assert_eq!(restored.flags, CONTACT_FLAG_AEAD);
        assert_eq!(restored.out_path_len, 2);
        assert_eq!(restored.out_path[..2], [0x15, 0x29]);
        assert_eq!(restored.last_advert_timestamp, 1_700_000_000);
        assert_eq!(restored.sync_since, 12345);
        // the path persists; only the secret cache resets
        assert_ne!(restored.out_path_len, OUT_PATH_UNKNOWN);
    }

    #[test]
    fn test_nonce_record_roundtrip() {
        let mut rec = [0u8; NONCE_RECORD_SIZE];
        write_nonce_record(&mut rec, &[1, 2, 3, 4], 40_000).unwrap();
        let (prefix, nonce) = read_nonce_record(&rec).unwrap();
        assert_eq!(prefix, [1, 2, 3, 4]);
        assert_eq!(nonce, 40_000);
    }
}
