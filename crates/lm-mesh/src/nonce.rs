// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Per-peer nonce lifecycle
//!
//! Each contact carries a 16-bit AEAD nonce counter. Nonce 0 is the wire
//! sentinel for "this message is ECB", so the counter skips it. The zone
//! below `NONCE_INITIAL_MIN` is the exhaustion zone: a counter that wraps
//! into it stays clamped at 1 and every send falls back to ECB until a
//! session rekey or reseed — a repeated (key, nonce) pair is never
//! emitted.
//!
//! Counters persist every `NONCE_PERSIST_INTERVAL` increments. After a
//! dirty reboot (power loss, watchdog, brownout) every loaded counter is
//! bumped by `NONCE_BOOT_BUMP` to leap over any increments that were lost
//! with the unsaved state.

use crate::contact::ContactTable;
use lm_common::constants::{
    NONCE_BOOT_BUMP, NONCE_INITIAL_MAX, NONCE_INITIAL_MIN, NONCE_PERSIST_INTERVAL,
};
use lm_crypto::CryptoRng;

/// Draw the initial nonce for a fresh contact: random in
/// `[NONCE_INITIAL_MIN, NONCE_INITIAL_MAX]` so fresh contacts don't
/// collide on the low end.
pub fn seed_nonce<G: CryptoRng>(rng: &mut G) -> u16 {
    rng.next_in_range(u32::from(NONCE_INITIAL_MIN), u32::from(NONCE_INITIAL_MAX) + 1) as u16
}

/// Tracks which counters have advanced past the persist threshold
pub struct NonceTracker {
    dirty: bool,
}

impl NonceTracker {
    /// Create a clean tracker
    #[must_use]
    pub const fn new() -> Self {
        Self { dirty: false }
    }

    /// Advance and return the AEAD nonce for contact `idx`.
    ///
    /// Returns 0 (meaning: use ECB) when the peer lacks AEAD support or
    /// the counter sits in the exhaustion zone.
    pub fn next_for(&mut self, table: &mut ContactTable, idx: usize) -> u16 {
        let Some(contact) = table.get_mut(idx) else {
            return 0;
        };
        if !contact.supports_aead() {
            return 0;
        }

        contact.aead_nonce = contact.aead_nonce.wrapping_add(1);
        if contact.aead_nonce == 0 {
            contact.aead_nonce = 1; // skip the ECB sentinel
        }
        if contact.aead_nonce < NONCE_INITIAL_MIN {
            // wrapped into the exhaustion zone: clamp and force ECB
            contact.aead_nonce = 1;
            return 0;
        }

        let nonce = contact.aead_nonce;
        if nonce.wrapping_sub(table.nonce_at_last_persist(idx)) >= NONCE_PERSIST_INTERVAL {
            self.dirty = true;
        }
        nonce
    }

    /// Install a loaded counter onto the contact with this key prefix
    pub fn apply_loaded(&mut self, table: &mut ContactTable, pub_key_prefix: &[u8; 4], nonce: u16) -> bool {
        let Some(idx) = table.find_by_pub_key(pub_key_prefix) else {
            return false;
        };
        if let Some(c) = table.get_mut(idx) {
            c.aead_nonce = nonce;
        }
        true
    }

    /// Finish loading: apply the boot bump when the previous shutdown was
    /// dirty, then baseline the persist tracking.
    pub fn finalize_load(&mut self, table: &mut ContactTable, needs_bump: bool) {
        for idx in 0..table.len() {
            if needs_bump {
                if let Some(c) = table.get_mut(idx) {
                    let old = c.aead_nonce;
                    c.aead_nonce = c.aead_nonce.wrapping_add(NONCE_BOOT_BUMP);
                    if c.aead_nonce == 0 {
                        c.aead_nonce = 1;
                    }
                    if c.aead_nonce < old {
                        // wrapped into the exhaustion zone; next_for clamps
                        c.aead_nonce = 1;
                    }
                }
            }
            table.mark_nonce_persisted(idx);
        }
        self.dirty = false;
    }

    /// Per-slot record for the nonce save file
    #[must_use]
    pub fn entry(&self, table: &ContactTable, idx: usize) -> Option<([u8; 4], u16)> {
        let c = table.get(idx)?;
        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&c.id.pub_key[..4]);
        Some((prefix, c.aead_nonce))
    }

    /// Have any counters advanced past the persist threshold?
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Baseline all counters as persisted
    pub fn clear_dirty(&mut self, table: &mut ContactTable) {
        for idx in 0..table.len() {
            table.mark_nonce_persisted(idx);
        }
        self.dirty = false;
    }
}

impl Default for NonceTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::{Contact, CONTACT_FLAG_AEAD};
    use lm_crypto::rng::XorShiftRng;
    use lm_crypto::LocalIdentity;

    fn table_with_one(aead: bool, nonce: u16) -> ContactTable {
        let mut rng = XorShiftRng::new(3);
        let id = LocalIdentity::generate(&mut rng).unwrap().id;
        let mut c = Contact::new(id);
        if aead {
            c.flags |= CONTACT_FLAG_AEAD;
        }
        c.aead_nonce = nonce;
        let mut t = ContactTable::new();
        t.add(c, false).unwrap();
        t
    }

    #[test]
    fn test_sequential_nonces() {
        let mut table = table_with_one(true, 2000);
        let mut tracker = NonceTracker::new();
        assert_eq!(tracker.next_for(&mut table, 0), 2001);
        assert_eq!(tracker.next_for(&mut table, 0), 2002);
    }

    #[test]
    fn test_no_aead_means_ecb() {
        let mut table = table_with_one(false, 2000);
        let mut tracker = NonceTracker::new();
        assert_eq!(tracker.next_for(&mut table, 0), 0);
        // counter untouched
        assert_eq!(table.get(0).unwrap().aead_nonce, 2000);
    }

    #[test]
    fn test_wrap_forces_ecb_and_clamps() {
        let mut table = table_with_one(true, u16::MAX);
        let mut tracker = NonceTracker::new();
        // wraps through 0 into the exhaustion zone
        assert_eq!(tracker.next_for(&mut table, 0), 0);
        assert_eq!(table.get(0).unwrap().aead_nonce, 1);
        // and stays there
        assert_eq!(tracker.next_for(&mut table, 0), 0);
        assert_eq!(table.get(0).unwrap().aead_nonce, 1);
    }

    #[test]
    fn test_zero_never_emitted() {
        let mut table = table_with_one(true, NONCE_INITIAL_MIN);
        let mut tracker = NonceTracker::new();
        for _ in 0..200 {
            let n = tracker.next_for(&mut table, 0);
            // either a live AEAD nonce or the ECB signal, never a zero
            // nonce on the wire
            if n != 0 {
                assert!(n >= NONCE_INITIAL_MIN);
            }
        }
    }

    #[test]
    fn test_dirty_after_interval() {
        let mut table = table_with_one(true, 2000);
        let mut tracker = NonceTracker::new();
        tracker.finalize_load(&mut table, false);
        for _ in 0..NONCE_PERSIST_INTERVAL - 1 {
            tracker.next_for(&mut table, 0);
        }
        assert!(!tracker.is_dirty());
        tracker.next_for(&mut table, 0);
        assert!(tracker.is_dirty());

        tracker.clear_dirty(&mut table);
        assert!(!tracker.is_dirty());
    }

    #[test]
    fn test_boot_bump() {
        let mut table = table_with_one(true, 3000);
        let mut tracker = NonceTracker::new();
        tracker.finalize_load(&mut table, true);
        assert_eq!(table.get(0).unwrap().aead_nonce, 3000 + NONCE_BOOT_BUMP);
    }

    #[test]
    fn test_seed_range() {
        let mut rng = XorShiftRng::new(17);
        for _ in 0..100 {
            let n = seed_nonce(&mut rng);
            assert!((NONCE_INITIAL_MIN..=NONCE_INITIAL_MAX).contains(&n));
        }
    }
}
