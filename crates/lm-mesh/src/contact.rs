// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Contact records
//!
//! A contact is a peer we have heard a valid advert from (or imported).
//! It owns the peer's last known outbound path, the lazily cached static
//! ECDH secret and the per-peer AEAD nonce counter.

use crate::advert::{NodeType, MAX_NAME_LEN};
use heapless::String;
use lm_common::constants::{MAX_HASH_MATCHES, MAX_PATH_SIZE, PUB_KEY_SIZE};
use lm_common::{Error, Result};
use lm_crypto::{Identity, LocalIdentity};
use zeroize::Zeroize;

/// Sentinel out-path length: no direct path known
pub const OUT_PATH_UNKNOWN: u8 = 0xFF;

/// Contact flag: pinned by the user, never auto-evicted
pub const CONTACT_FLAG_FAVOURITE: u8 = 0x01;
/// Contact flag: peer advertises AEAD envelope support
pub const CONTACT_FLAG_AEAD: u8 = 0x02;

/// Maximum contacts per node
pub const MAX_CONTACTS: usize = 32;

/// A known peer
#[derive(Clone)]
pub struct Contact {
    /// Peer identity
    pub id: Identity,
    /// Display name from the last advert
    pub name: String<MAX_NAME_LEN>,
    /// Advertised role
    pub node_type: NodeType,
    /// CONTACT_FLAG_* bits
    pub flags: u8,
    /// Outbound path length (`OUT_PATH_UNKNOWN` = none)
    pub out_path_len: u8,
    /// Outbound path bytes
    pub out_path: [u8; MAX_PATH_SIZE],
    /// Timestamp of the freshest advert, by THEIR clock
    pub last_advert_timestamp: u32,
    /// Last modification, by OUR clock
    pub lastmod: u32,
    /// Position (degrees ×1e6), zero when unknown
    pub gps_lat: i32,
    /// Position (degrees ×1e6), zero when unknown
    pub gps_lon: i32,
    /// Signed-message sync cursor
    pub sync_since: u32,
    /// Timestamp of the freshest request (their clock, transient);
    /// replay defense is a strict `>` comparison against this
    pub last_req_timestamp: u32,
    /// Per-peer AEAD nonce counter
    pub aead_nonce: u16,
    shared_secret: [u8; PUB_KEY_SIZE],
    shared_secret_valid: bool,
}

impl Contact {
    /// Create a bare contact for `id`; callers fill in advert fields
    #[must_use]
    pub fn new(id: Identity) -> Self {
        Self {
            id,
            name: String::new(),
            node_type: NodeType::Unknown,
            flags: 0,
            out_path_len: OUT_PATH_UNKNOWN,
            out_path: [0; MAX_PATH_SIZE],
            last_advert_timestamp: 0,
            lastmod: 0,
            gps_lat: 0,
            gps_lon: 0,
            sync_since: 0,
            last_req_timestamp: 0,
            aead_nonce: 0,
            shared_secret: [0; PUB_KEY_SIZE],
            shared_secret_valid: false,
        }
    }

    /// Is a direct outbound path known?
    #[must_use]
    pub const fn has_out_path(&self) -> bool {
        self.out_path_len != OUT_PATH_UNKNOWN
    }

    /// Forget the outbound path
    pub fn reset_path(&mut self) {
        self.out_path_len = OUT_PATH_UNKNOWN;
    }

    /// Does the peer advertise AEAD support?
    #[must_use]
    pub const fn supports_aead(&self) -> bool {
        self.flags & CONTACT_FLAG_AEAD != 0
    }

    /// The static ECDH secret with this peer, computed once and cached.
    ///
    /// A contact always holds a verified Ed25519 key (adverts are
    /// signature-checked before contact creation), so derivation cannot
    /// fail for honestly created records; a corrupt key yields a zeroed
    /// secret, which simply never decrypts anything.
    pub fn shared_secret(&mut self, self_id: &LocalIdentity) -> &[u8; PUB_KEY_SIZE] {
        if !self.shared_secret_valid {
            if let Ok(secret) = self_id.shared_secret(&self.id) {
                self.shared_secret = *secret.as_bytes();
            }
            self.shared_secret_valid = true;
        }
        &self.shared_secret
    }

    /// Drop the cached secret (e.g. after importing over this record)
    pub fn invalidate_shared_secret(&mut self) {
        self.shared_secret.zeroize();
        self.shared_secret_valid = false;
    }
}

impl Drop for Contact {
    fn drop(&mut self) {
        self.shared_secret.zeroize();
    }
}

/// Fixed-size contact table with parallel nonce-persist tracking
pub struct ContactTable {
    contacts: heapless::Vec<Contact, MAX_CONTACTS>,
    nonce_at_last_persist: [u16; MAX_CONTACTS],
}

impl ContactTable {
    /// Create an empty table
    #[must_use]
    pub const fn new() -> Self {
        Self {
            contacts: heapless::Vec::new(),
            nonce_at_last_persist: [0; MAX_CONTACTS],
        }
    }

    /// Contact count
    #[must_use]
    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    /// Is the table empty?
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    /// Contact by index
    #[must_use]
    pub fn get(&self, idx: usize) -> Option<&Contact> {
        self.contacts.get(idx)
    }

    /// Mutable contact by index
    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Contact> {
        self.contacts.get_mut(idx)
    }

    /// Find by public-key prefix
    #[must_use]
    pub fn find_by_pub_key(&self, pub_key: &[u8]) -> Option<usize> {
        self.contacts
            .iter()
            .position(|c| c.id.pub_key[..pub_key.len()] == *pub_key)
    }

    /// Find by display-name prefix
    #[must_use]
    pub fn find_by_name_prefix(&self, prefix: &str) -> Option<usize> {
        self.contacts
            .iter()
            .position(|c| c.name.as_str().starts_with(prefix))
    }

    /// Collect up to `MAX_HASH_MATCHES` indexes whose routing hash matches
    pub fn search_by_hash(&self, hash: u8, dest: &mut [usize; MAX_HASH_MATCHES]) -> usize {
        let mut n = 0;
        for (i, c) in self.contacts.iter().enumerate() {
            if n >= MAX_HASH_MATCHES {
                break;
            }
            if c.id.is_hash_match(&[hash]) {
                dest[n] = i;
                n += 1;
            }
        }
        n
    }

    /// Add a contact; returns its index.
    ///
    /// When full and `overwrite_when_full`, the oldest non-favourite
    /// contact (by `lastmod`) is replaced.
    ///
    /// # Errors
    ///
    /// `Error::PoolExhausted` when no slot can be made available.
    pub fn add(&mut self, contact: Contact, overwrite_when_full: bool) -> Result<usize> {
        if self.contacts.len() < MAX_CONTACTS {
            let idx = self.contacts.len();
            let nonce = contact.aead_nonce;
            let _ = self.contacts.push(contact);
            self.nonce_at_last_persist[idx] = nonce;
            return Ok(idx);
        }
        if !overwrite_when_full {
            return Err(Error::PoolExhausted);
        }
        let mut oldest: Option<usize> = None;
        for (i, c) in self.contacts.iter().enumerate() {
            if c.flags & CONTACT_FLAG_FAVOURITE != 0 {
                continue;
            }
            match oldest {
                None => oldest = Some(i),
                Some(o) if c.lastmod < self.contacts[o].lastmod => oldest = Some(i),
                _ => {}
            }
        }
        let idx = oldest.ok_or(Error::PoolExhausted)?;
        self.nonce_at_last_persist[idx] = contact.aead_nonce;
        self.contacts[idx] = contact;
        Ok(idx)
    }

    /// Remove the contact owning `pub_key`; returns whether one existed.
    ///
    /// Later slots shift down, as does the parallel nonce tracking.
    pub fn remove(&mut self, pub_key: &[u8; PUB_KEY_SIZE]) -> bool {
        let Some(idx) = self.find_by_pub_key(pub_key) else {
            return false;
        };
        self.contacts.remove(idx);
        for i in idx..self.contacts.len() {
            self.nonce_at_last_persist[i] = self.nonce_at_last_persist[i + 1];
        }
        true
    }

    /// Iterate contacts
    pub fn iter(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.iter()
    }

    /// Nonce value at the last persist for slot `idx`
    #[must_use]
    pub fn nonce_at_last_persist(&self, idx: usize) -> u16 {
        self.nonce_at_last_persist[idx]
    }

    /// Record slot `idx` as persisted at its current nonce
    pub fn mark_nonce_persisted(&mut self, idx: usize) {
        if let Some(c) = self.contacts.get(idx) {
            self.nonce_at_last_persist[idx] = c.aead_nonce;
        }
    }
}

impl Default for ContactTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lm_crypto::rng::XorShiftRng;

    fn identity(seed: u64) -> Identity {
        let mut rng = XorShiftRng::new(seed);
        LocalIdentity::generate(&mut rng).unwrap().id
    }

    #[test]
    fn test_add_find_remove() {
        let mut table = ContactTable::new();
        let id = identity(1);
        let idx = table.add(Contact::new(id), false).unwrap();
        assert_eq!(table.find_by_pub_key(&id.pub_key), Some(idx));

        assert!(table.remove(&id.pub_key));
        assert!(table.find_by_pub_key(&id.pub_key).is_none());
        assert!(!table.remove(&id.pub_key));
    }

    #[test]
    fn test_overwrite_oldest_non_favourite() {
        let mut table = ContactTable::new();
        for i in 0..MAX_CONTACTS as u64 {
            let mut c = Contact::new(identity(i + 1));
            c.lastmod = 1000 + i as u32;
            if i == 0 {
                c.flags |= CONTACT_FLAG_FAVOURITE;
                c.lastmod = 1; // oldest, but pinned
            }
            table.add(c, false).unwrap();
        }
        // full, no overwrite
        assert!(table.add(Contact::new(identity(99)), false).is_err());

        // with overwrite, the oldest non-favourite goes (slot 1, lastmod 1001)
        let new_id = identity(100);
        let idx = table.add(Contact::new(new_id), true).unwrap();
        assert_eq!(idx, 1);
        assert_eq!(table.len(), MAX_CONTACTS);
        assert!(table.find_by_pub_key(&new_id.pub_key).is_some());
    }

    #[test]
    fn test_search_by_hash_caps_at_four() {
        let mut table = ContactTable::new();
        // use the same identity hash by inserting the same id repeatedly
        let id = identity(7);
        for _ in 0..6 {
            table.add(Contact::new(id), false).unwrap();
        }
        let mut matches = [0usize; MAX_HASH_MATCHES];
        let n = table.search_by_hash(id.node_hash(), &mut matches);
        assert_eq!(n, MAX_HASH_MATCHES);
    }

    #[test]
    fn test_shared_secret_cached() {
        let mut rng = XorShiftRng::new(42);
        let me = LocalIdentity::generate(&mut rng).unwrap();
        let peer = LocalIdentity::generate(&mut rng).unwrap();

        let mut c = Contact::new(peer.id);
        let s1 = *c.shared_secret(&me);
        let s2 = *c.shared_secret(&me);
        assert_eq!(s1, s2);
        assert_ne!(s1, [0u8; 32]);

        let expected = me.shared_secret(&peer.id).unwrap();
        assert_eq!(&s1, expected.as_bytes());
    }
}
