// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Session key pool
//!
//! Session keys give forward secrecy over the static ECDH secret: a
//! one-shot X25519 exchange mixed into the static secret via HMAC. The
//! pool holds up to 8 entries in RAM backed by up to 48 records in a
//! flash file; evictions are LRU but skip INIT_SENT entries, whose
//! ephemeral keypair exists only in RAM.
//!
//! Per-peer state machine:
//!
//! ```text
//! NONE ──initiate──▶ INIT_SENT ──peer ACCEPT──▶ ACTIVE
//!                       │
//!                       └── timeout × retries ──▶ NONE (cleared)
//!
//! NONE ──peer INIT──▶ DUAL_DECODE ──inbound decrypt with new key──▶ ACTIVE
//! ACTIVE ──peer INIT──▶ DUAL_DECODE (prev = old session key)
//! ```

use lm_common::constants::{
    MAX_SESSION_KEYS_RAM, NONCE_BOOT_BUMP, SESSION_FLAG_PREV_VALID, SESSION_KEY_SIZE,
};
use lm_crypto::LocalIdentity;
use zeroize::Zeroize;

/// Session key negotiation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// No session key
    None = 0,
    /// Initiator: INIT sent, waiting for ACCEPT
    InitSent = 1,
    /// Responder: new key active, old key still valid
    DualDecode = 2,
    /// Session key confirmed and in use
    Active = 3,
}

/// One peer's session key material
pub struct SessionKeyEntry {
    /// First 4 bytes of the peer's public key
    pub peer_pub_prefix: [u8; 4],
    /// Current session key
    pub session_key: [u8; SESSION_KEY_SIZE],
    /// Previous session key (valid only in DUAL_DECODE)
    pub prev_session_key: [u8; SESSION_KEY_SIZE],
    /// Session nonce counter (starts at 1)
    pub nonce: u16,
    /// Negotiation state
    pub state: SessionState,
    /// Sends without an inbound session-key decrypt (saturates at 255)
    pub sends_since_last_recv: u8,
    /// Remaining INIT retries this round
    pub retries_left: u8,
    /// Millisecond deadline for the INIT timeout (0 = unarmed)
    pub timeout_at: u32,
    /// Initiator-only ephemeral keypair, dropped (and zeroized) after use
    pub ephemeral: Option<LocalIdentity>,
    last_used: u32,
}

impl SessionKeyEntry {
    fn new(peer_pub_prefix: [u8; 4]) -> Self {
        Self {
            peer_pub_prefix,
            session_key: [0; SESSION_KEY_SIZE],
            prev_session_key: [0; SESSION_KEY_SIZE],
            nonce: 0,
            state: SessionState::None,
            sends_since_last_recv: 0,
            retries_left: 0,
            timeout_at: 0,
            ephemeral: None,
            last_used: 0,
        }
    }

    /// Wipe all key material and reset to NONE
    pub fn clear(&mut self) {
        self.session_key.zeroize();
        self.prev_session_key.zeroize();
        self.ephemeral = None;
        self.nonce = 0;
        self.state = SessionState::None;
        self.sends_since_last_recv = 0;
        self.retries_left = 0;
        self.timeout_at = 0;
    }
}

impl Drop for SessionKeyEntry {
    fn drop(&mut self) {
        self.session_key.zeroize();
        self.prev_session_key.zeroize();
    }
}

/// Fixed-size LRU pool of session key entries
pub struct SessionKeyPool {
    entries: heapless::Vec<SessionKeyEntry, MAX_SESSION_KEYS_RAM>,
    lru_counter: u32,
    // prefixes removed since the last save, so a merge-save doesn't
    // resurrect them from the flash file
    removed_prefixes: heapless::Vec<[u8; 4], MAX_SESSION_KEYS_RAM>,
}

impl SessionKeyPool {
    /// Create an empty pool
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: heapless::Vec::new(),
            lru_counter: 0,
            removed_prefixes: heapless::Vec::new(),
        }
    }

    fn touch(lru_counter: &mut u32, entry: &mut SessionKeyEntry) {
        *lru_counter += 1;
        entry.last_used = *lru_counter;
    }

    /// Is every RAM slot occupied?
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.entries.len() >= MAX_SESSION_KEYS_RAM
    }

    /// Entry count
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Is the pool empty?
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find by key prefix, refreshing the entry's LRU stamp
    pub fn find_by_prefix(&mut self, pub_key: &[u8]) -> Option<&mut SessionKeyEntry> {
        let lru = &mut self.lru_counter;
        self.entries
            .iter_mut()
            .find(|e| e.peer_pub_prefix == pub_key[..4])
            .map(|e| {
                Self::touch(lru, e);
                e
            })
    }

    /// Membership test without perturbing the LRU order (used during
    /// save/merge)
    #[must_use]
    pub fn has_prefix(&self, pub_key: &[u8]) -> bool {
        self.entries.iter().any(|e| e.peer_pub_prefix == pub_key[..4])
    }

    /// Find the pool index for a key prefix, refreshing its LRU stamp
    pub fn find_index(&mut self, pub_key: &[u8]) -> Option<usize> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.peer_pub_prefix == pub_key[..4])?;
        let lru = &mut self.lru_counter;
        Self::touch(lru, &mut self.entries[idx]);
        Some(idx)
    }

    /// Find or allocate an entry for this key prefix.
    ///
    /// When the pool is full the least recently used entry is evicted,
    /// skipping INIT_SENT entries (their ephemeral keys are RAM-only).
    pub fn allocate(&mut self, pub_key: &[u8]) -> &mut SessionKeyEntry {
        if let Some(idx) = self
            .entries
            .iter()
            .position(|e| e.peer_pub_prefix == pub_key[..4])
        {
            let lru = &mut self.lru_counter;
            Self::touch(lru, &mut self.entries[idx]);
            return &mut self.entries[idx];
        }

        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&pub_key[..4]);

        if !self.is_full() {
            let mut entry = SessionKeyEntry::new(prefix);
            Self::touch(&mut self.lru_counter, &mut entry);
            let _ = self.entries.push(entry);
            let last = self.entries.len() - 1;
            return &mut self.entries[last];
        }

        let mut evict_idx = 0;
        let mut min_used = u32::MAX;
        for (i, e) in self.entries.iter().enumerate() {
            if e.state == SessionState::InitSent {
                continue;
            }
            if e.last_used < min_used {
                min_used = e.last_used;
                evict_idx = i;
            }
        }
        // all INIT_SENT: shouldn't happen, fall back to slot 0
        let entry = &mut self.entries[evict_idx];
        entry.clear();
        entry.peer_pub_prefix = prefix;
        Self::touch(&mut self.lru_counter, entry);
        entry
    }

    /// Remove the entry for this key prefix, tracking it for merge-save
    pub fn remove(&mut self, pub_key: &[u8]) {
        let Some(idx) = self
            .entries
            .iter()
            .position(|e| e.peer_pub_prefix == pub_key[..4])
        else {
            return;
        };
        let entry = self.entries.remove(idx);
        let _ = self.removed_prefixes.push(entry.peer_pub_prefix);
    }

    /// Was this prefix removed since the last save?
    #[must_use]
    pub fn is_removed(&self, pub_key_prefix: &[u8; 4]) -> bool {
        self.removed_prefixes.contains(pub_key_prefix)
    }

    /// Forget the removed-prefix tracking (after a save)
    pub fn clear_removed(&mut self) {
        self.removed_prefixes.clear();
    }

    /// Entry by index
    #[must_use]
    pub fn get(&self, idx: usize) -> Option<&SessionKeyEntry> {
        self.entries.get(idx)
    }

    /// Mutable entry by index
    pub fn get_mut(&mut self, idx: usize) -> Option<&mut SessionKeyEntry> {
        self.entries.get_mut(idx)
    }

    /// Apply the boot bump to every confirmed entry's nonce; a wrap
    /// clamps to 65535 to force renegotiation.
    pub fn boot_bump(&mut self) {
        for e in self.entries.iter_mut() {
            if matches!(e.state, SessionState::Active | SessionState::DualDecode) {
                let old = e.nonce;
                e.nonce = e.nonce.wrapping_add(NONCE_BOOT_BUMP);
                if e.nonce <= old {
                    e.nonce = u16::MAX;
                }
            }
        }
    }

    // =========================================================================
    // Persistence records
    // =========================================================================

    /// Serialize entry `idx` as a flash record into `dest`.
    ///
    /// Returns `None` past the end or for non-persistable states (NONE
    /// and INIT_SENT never hit flash).
    pub fn entry_for_save(&self, idx: usize, dest: &mut [u8]) -> Option<usize> {
        let e = self.entries.get(idx)?;
        if matches!(e.state, SessionState::None | SessionState::InitSent) {
            return None;
        }
        let flags = if e.state == SessionState::DualDecode {
            SESSION_FLAG_PREV_VALID
        } else {
            0
        };
        write_session_record(
            dest,
            &e.peer_pub_prefix,
            flags,
            e.nonce,
            &e.session_key,
            &e.prev_session_key,
        )
    }

    /// Install a loaded flash record
    pub fn apply_loaded(
        &mut self,
        pub_key_prefix: &[u8; 4],
        flags: u8,
        nonce: u16,
        session_key: &[u8; SESSION_KEY_SIZE],
        prev_session_key: &[u8; SESSION_KEY_SIZE],
    ) {
        let e = self.allocate(pub_key_prefix);
        e.nonce = nonce;
        e.state = if flags & SESSION_FLAG_PREV_VALID != 0 {
            SessionState::DualDecode
        } else {
            SessionState::Active
        };
        e.sends_since_last_recv = 0;
        e.retries_left = 0;
        e.timeout_at = 0;
        e.session_key = *session_key;
        e.prev_session_key = *prev_session_key;
        e.ephemeral = None;
    }
}

impl Default for SessionKeyPool {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Record codec
// =============================================================================

/// Largest session record size
pub const SESSION_RECORD_MAX: usize = 4 + 1 + 2 + SESSION_KEY_SIZE * 2;

/// Write a variable-length session record:
/// `prefix[4] ‖ flags[1] ‖ nonce[2] ‖ key[32] ‖ [prev[32] if PREV_VALID]`
pub fn write_session_record(
    dest: &mut [u8],
    prefix: &[u8; 4],
    flags: u8,
    nonce: u16,
    session_key: &[u8; SESSION_KEY_SIZE],
    prev_session_key: &[u8; SESSION_KEY_SIZE],
) -> Option<usize> {
    let need = if flags & SESSION_FLAG_PREV_VALID != 0 {
        SESSION_RECORD_MAX
    } else {
        SESSION_RECORD_MAX - SESSION_KEY_SIZE
    };
    if dest.len() < need {
        return None;
    }
    dest[..4].copy_from_slice(prefix);
    dest[4] = flags;
    dest[5..7].copy_from_slice(&nonce.to_le_bytes());
    dest[7..7 + SESSION_KEY_SIZE].copy_from_slice(session_key);
    if flags & SESSION_FLAG_PREV_VALID != 0 {
        dest[7 + SESSION_KEY_SIZE..need].copy_from_slice(prev_session_key);
    }
    Some(need)
}

/// Parsed session record
pub struct SessionRecord {
    /// Peer public-key prefix
    pub prefix: [u8; 4],
    /// Record flags (`SESSION_FLAG_PREV_VALID`)
    pub flags: u8,
    /// Session nonce
    pub nonce: u16,
    /// Current session key
    pub session_key: [u8; SESSION_KEY_SIZE],
    /// Previous session key (zeroed unless PREV_VALID)
    pub prev_session_key: [u8; SESSION_KEY_SIZE],
    /// Bytes consumed from the input
    pub consumed: usize,
}

/// Parse one session record from the head of `src`
#[must_use]
pub fn read_session_record(src: &[u8]) -> Option<SessionRecord> {
    let base = 4 + 1 + 2 + SESSION_KEY_SIZE;
    if src.len() < base {
        return None;
    }
    let mut prefix = [0u8; 4];
    prefix.copy_from_slice(&src[..4]);
    let flags = src[4];
    let nonce = u16::from_le_bytes([src[5], src[6]]);
    let mut session_key = [0u8; SESSION_KEY_SIZE];
    session_key.copy_from_slice(&src[7..7 + SESSION_KEY_SIZE]);

    let mut prev_session_key = [0u8; SESSION_KEY_SIZE];
    let consumed = if flags & SESSION_FLAG_PREV_VALID != 0 {
        if src.len() < base + SESSION_KEY_SIZE {
            return None;
        }
        prev_session_key.copy_from_slice(&src[base..base + SESSION_KEY_SIZE]);
        base + SESSION_KEY_SIZE
    } else {
        base
    };

    Some(SessionRecord {
        prefix,
        flags,
        nonce,
        session_key,
        prev_session_key,
        consumed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefix(b: u8) -> [u8; 4] {
        [b, b, b, b]
    }

    #[test]
    fn test_allocate_and_find() {
        let mut pool = SessionKeyPool::new();
        let e = pool.allocate(&prefix(1));
        e.state = SessionState::Active;
        e.nonce = 5;

        let found = pool.find_by_prefix(&prefix(1)).unwrap();
        assert_eq!(found.nonce, 5);
        assert!(pool.find_by_prefix(&prefix(9)).is_none());
    }

    #[test]
    fn test_allocate_existing_returns_same() {
        let mut pool = SessionKeyPool::new();
        pool.allocate(&prefix(1)).nonce = 42;
        assert_eq!(pool.allocate(&prefix(1)).nonce, 42);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_lru_eviction_skips_init_sent() {
        let mut pool = SessionKeyPool::new();
        for i in 0..MAX_SESSION_KEYS_RAM as u8 {
            let e = pool.allocate(&prefix(i));
            e.state = if i == 0 {
                SessionState::InitSent // oldest, but protected
            } else {
                SessionState::Active
            };
        }
        assert!(pool.is_full());

        // evicts the LRU non-INIT_SENT entry (prefix 1)
        pool.allocate(&prefix(0xEE)).state = SessionState::Active;
        assert!(pool.has_prefix(&prefix(0)));
        assert!(!pool.has_prefix(&prefix(1)));
        assert!(pool.has_prefix(&prefix(0xEE)));
    }

    #[test]
    fn test_remove_tracks_prefix() {
        let mut pool = SessionKeyPool::new();
        pool.allocate(&prefix(1)).state = SessionState::Active;
        pool.remove(&prefix(1));
        assert!(pool.is_removed(&prefix(1)));
        assert!(!pool.has_prefix(&prefix(1)));

        pool.clear_removed();
        assert!(!pool.is_removed(&prefix(1)));
    }

    #[test]
    fn test_record_roundtrip_with_prev() {
        let mut buf = [0u8; SESSION_RECORD_MAX];
        let n = write_session_record(
            &mut buf,
            &prefix(7),
            SESSION_FLAG_PREV_VALID,
            1234,
            &[0xAA; SESSION_KEY_SIZE],
            &[0xBB; SESSION_KEY_SIZE],
        )
        .unwrap();
        assert_eq!(n, SESSION_RECORD_MAX);

        let rec = read_session_record(&buf[..n]).unwrap();
        assert_eq!(rec.prefix, prefix(7));
        assert_eq!(rec.nonce, 1234);
        assert_eq!(rec.session_key, [0xAA; SESSION_KEY_SIZE]);
        assert_eq!(rec.prev_session_key, [0xBB; SESSION_KEY_SIZE]);
        assert_eq!(rec.consumed, n);
    }

    #[test]
    fn test_record_roundtrip_without_prev() {
        let mut buf = [0u8; SESSION_RECORD_MAX];
        let n = write_session_record(
            &mut buf,
            &prefix(8),
            0,
            99,
            &[0xCC; SESSION_KEY_SIZE],
            &[0; SESSION_KEY_SIZE],
        )
        .unwrap();
        assert_eq!(n, SESSION_RECORD_MAX - SESSION_KEY_SIZE);

        let rec = read_session_record(&buf[..n]).unwrap();
        assert_eq!(rec.nonce, 99);
        assert_eq!(rec.prev_session_key, [0; SESSION_KEY_SIZE]);
    }

    #[test]
    fn test_pending_states_not_persisted() {
        let mut pool = SessionKeyPool::new();
        pool.allocate(&prefix(1)).state = SessionState::InitSent;
        pool.allocate(&prefix(2)).state = SessionState::Active;

        let mut buf = [0u8; SESSION_RECORD_MAX];
        assert!(pool.entry_for_save(0, &mut buf).is_none());
        assert!(pool.entry_for_save(1, &mut buf).is_some());
        assert!(pool.entry_for_save(2, &mut buf).is_none());
    }

    #[test]
    fn test_boot_bump_clamps_on_wrap() {
        let mut pool = SessionKeyPool::new();
        let e = pool.allocate(&prefix(1));
        e.state = SessionState::Active;
        e.nonce = u16::MAX - 10;
        pool.boot_bump();
        assert_eq!(pool.get(0).unwrap().nonce, u16::MAX);
    }

    #[test]
    fn test_apply_loaded_restores_state() {
        let mut pool = SessionKeyPool::new();
        pool.apply_loaded(
            &prefix(3),
            SESSION_FLAG_PREV_VALID,
            77,
            &[1; SESSION_KEY_SIZE],
            &[2; SESSION_KEY_SIZE],
        );
        let e = pool.find_by_prefix(&prefix(3)).unwrap();
        assert_eq!(e.state, SessionState::DualDecode);
        assert_eq!(e.nonce, 77);
    }
}
