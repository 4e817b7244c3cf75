// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Mesh tables: duplicate suppression
//!
//! Two fixed-size structures:
//!
//! - a set of recent 8-byte packet hashes with per-slot last-seen
//!   millisecond timestamps (LRU eviction, LRU touch on match)
//! - a cyclic set of recent 32-bit ACK CRCs (ACK payloads are too small
//!   to hash usefully; the CRC itself is the identity)
//!
//! `has_seen` is O(N) worst case and never allocates.

use crate::packet::{Packet, PayloadType};
use lm_common::constants::MAX_HASH_SIZE;
use lm_common::{Error, Result};

/// Capacity of the packet-hash set
pub const MAX_PACKET_HASHES: usize = 128;

/// Capacity of the recent-ack set
pub const MAX_PACKET_ACKS: usize = 64;

/// Serialized snapshot size in bytes
pub const TABLES_BLOB_SIZE: usize = MAX_PACKET_HASHES * MAX_HASH_SIZE + MAX_PACKET_ACKS * 4 + 2;

/// Duplicate-suppression tables
pub struct MeshTables {
    hashes: [[u8; MAX_HASH_SIZE]; MAX_PACKET_HASHES],
    last_seen: [u32; MAX_PACKET_HASHES],
    acks: [u32; MAX_PACKET_ACKS],
    next_ack_idx: usize,
    direct_dups: u32,
    flood_dups: u32,
}

impl MeshTables {
    /// Create empty tables
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hashes: [[0; MAX_HASH_SIZE]; MAX_PACKET_HASHES],
            last_seen: [0; MAX_PACKET_HASHES],
            acks: [0; MAX_PACKET_ACKS],
            next_ack_idx: 0,
            direct_dups: 0,
            flood_dups: 0,
        }
    }

    fn count_dup(&mut self, packet: &Packet) {
        if packet.is_route_direct() {
            self.direct_dups += 1;
        } else {
            self.flood_dups += 1;
        }
    }

    /// Check whether `packet` has been seen recently; record it if not.
    ///
    /// ACK packets are tracked by their 4-byte CRC in the cyclic set; all
    /// other types by truncated packet hash with LRU timestamps. A match
    /// refreshes the slot's timestamp.
    pub fn has_seen(&mut self, packet: &Packet, now_ms: u32) -> bool {
        if packet.payload_type() == Some(PayloadType::Ack) && packet.payload_len >= 4 {
            let crc = u32::from_le_bytes([
                packet.payload[0],
                packet.payload[1],
                packet.payload[2],
                packet.payload[3],
            ]);
            if self.acks.contains(&crc) {
                self.count_dup(packet);
                return true;
            }
            self.acks[self.next_ack_idx] = crc;
            self.next_ack_idx = (self.next_ack_idx + 1) % MAX_PACKET_ACKS;
            return false;
        }

        let hash = packet.packet_hash();

        let mut oldest_idx = 0;
        let mut oldest_age = 0u32;
        for i in 0..MAX_PACKET_HASHES {
            let age = now_ms.wrapping_sub(self.last_seen[i]);

            if self.hashes[i] == hash && self.last_seen[i] != 0 {
                self.last_seen[i] = now_ms; // LRU touch
                self.count_dup(packet);
                return true;
            }

            if age > oldest_age {
                oldest_age = age;
                oldest_idx = i;
            }
        }

        self.hashes[oldest_idx] = hash;
        self.last_seen[oldest_idx] = now_ms;
        false
    }

    /// Remove a specific entry.
    ///
    /// Used when the upper layer deliberately re-injects a locally
    /// constructed packet as if freshly received (contact import).
    pub fn clear(&mut self, packet: &Packet) {
        if packet.payload_type() == Some(PayloadType::Ack) && packet.payload_len >= 4 {
            let crc = u32::from_le_bytes([
                packet.payload[0],
                packet.payload[1],
                packet.payload[2],
                packet.payload[3],
            ]);
            if let Some(slot) = self.acks.iter_mut().find(|a| **a == crc) {
                *slot = 0;
            }
            return;
        }

        let hash = packet.packet_hash();
        for i in 0..MAX_PACKET_HASHES {
            if self.hashes[i] == hash {
                self.hashes[i] = [0; MAX_HASH_SIZE];
                self.last_seen[i] = 0;
                break;
            }
        }
    }

    /// Duplicates suppressed on direct routes
    #[must_use]
    pub const fn num_direct_dups(&self) -> u32 {
        self.direct_dups
    }

    /// Duplicates suppressed on flood routes
    #[must_use]
    pub const fn num_flood_dups(&self) -> u32 {
        self.flood_dups
    }

    /// Reset the duplicate counters
    pub fn reset_stats(&mut self) {
        self.direct_dups = 0;
        self.flood_dups = 0;
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Serialize the tables (hashes + acks + ack cursor) into `dest`.
    ///
    /// # Errors
    ///
    /// `Error::BufferTooSmall` when `dest` is under `TABLES_BLOB_SIZE`.
    pub fn save_to(&self, dest: &mut [u8]) -> Result<usize> {
        if dest.len() < TABLES_BLOB_SIZE {
            return Err(Error::BufferTooSmall);
        }
        let mut i = 0;
        for h in &self.hashes {
            dest[i..i + MAX_HASH_SIZE].copy_from_slice(h);
            i += MAX_HASH_SIZE;
        }
        for a in &self.acks {
            dest[i..i + 4].copy_from_slice(&a.to_le_bytes());
            i += 4;
        }
        dest[i..i + 2].copy_from_slice(&(self.next_ack_idx as u16).to_le_bytes());
        i += 2;
        Ok(i)
    }

    /// Restore the tables from a snapshot.
    ///
    /// Restored hashes are treated as just seen (fresh timestamps) so
    /// recently forwarded packets stay suppressed across a reboot.
    ///
    /// # Errors
    ///
    /// `Error::StorageCorrupted` when the blob is the wrong size.
    pub fn restore_from(&mut self, src: &[u8], now_ms: u32) -> Result<()> {
        if src.len() < TABLES_BLOB_SIZE {
            return Err(Error::StorageCorrupted);
        }
        let mut i = 0;
        for slot in 0..MAX_PACKET_HASHES {
            self.hashes[slot].copy_from_slice(&src[i..i + MAX_HASH_SIZE]);
            i += MAX_HASH_SIZE;
            let empty = self.hashes[slot].iter().all(|&b| b == 0);
            self.last_seen[slot] = if empty { 0 } else { now_ms };
        }
        for slot in 0..MAX_PACKET_ACKS {
            self.acks[slot] = u32::from_le_bytes([src[i], src[i + 1], src[i + 2], src[i + 3]]);
            i += 4;
        }
        self.next_ack_idx = u16::from_le_bytes([src[i], src[i + 1]]) as usize % MAX_PACKET_ACKS;
        Ok(())
    }
}

impl Default for MeshTables {
    fn default() -> Self {
        Self::new()
    }
}
