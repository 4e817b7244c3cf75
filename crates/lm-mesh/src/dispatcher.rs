// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Dispatcher: packet pool and transmit scheduling
//!
//! The dispatcher owns the fixed packet pool and the priority transmit
//! queue. One cooperative tick serves at most one radio operation; all
//! waits (retransmit delays, channel-busy backoff) are deadlines checked
//! on later ticks, never blocking calls.
//!
//! Queue discipline: lower priority value wins; ties go to the earlier
//! enqueue. An entry becomes eligible once its minimum delay has passed
//! and is silently dropped once its pool lifetime expires (observable to
//! the sender as an ACK that never arrives).

use crate::packet::Packet;
use crate::radio::Radio;
use lm_common::constants::MAX_TRANS_UNIT;
use lm_common::time::{future_millis, millis_has_passed};
use lm_common::{Error, Result};
use lm_crypto::CryptoRng;

/// Number of packets in the pool
pub const PACKET_POOL_SIZE: usize = 16;

/// Maximum queued transmissions (bounded by the pool)
pub const TX_QUEUE_SIZE: usize = PACKET_POOL_SIZE;

/// How long a queued packet may wait before being dropped
pub const PACKET_LIFETIME_MS: u32 = 60_000;

/// What the routing engine decided for a received packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherAction {
    /// Drop the packet; nothing further to do
    Release,
    /// The packet was consumed by this node (callbacks already fired)
    Deliver,
    /// Re-emit the (possibly rewritten) packet after a delay
    RetransmitDelayed {
        /// Queue priority (lower = sooner)
        priority: u8,
        /// Minimum wait before eligibility, in milliseconds
        delay_ms: u32,
    },
}

// =============================================================================
// Packet pool
// =============================================================================

/// Fixed-capacity packet arena with a free-index stack.
///
/// `obtain` may fail under pressure; the caller treats that as
/// `Error::PoolExhausted` and the operation becomes a no-op.
pub struct PacketPool {
    slots: [Packet; PACKET_POOL_SIZE],
    free: heapless::Vec<u8, PACKET_POOL_SIZE>,
}

impl PacketPool {
    /// Create a pool with all slots free
    #[must_use]
    pub fn new() -> Self {
        let mut free = heapless::Vec::new();
        for i in (0..PACKET_POOL_SIZE as u8).rev() {
            let _ = free.push(i);
        }
        Self {
            slots: core::array::from_fn(|_| Packet::new()),
            free,
        }
    }

    /// Take a free slot, if any
    pub fn obtain(&mut self) -> Option<u8> {
        self.free.pop()
    }

    /// Return a slot to the pool
    pub fn release(&mut self, slot: u8) {
        debug_assert!(!self.free.contains(&slot));
        let _ = self.free.push(slot);
    }

    /// Borrow a pooled packet
    #[must_use]
    pub fn get(&self, slot: u8) -> &Packet {
        &self.slots[slot as usize]
    }

    /// Mutably borrow a pooled packet
    pub fn get_mut(&mut self, slot: u8) -> &mut Packet {
        &mut self.slots[slot as usize]
    }

    /// Slots currently in use
    #[must_use]
    pub fn in_use(&self) -> usize {
        PACKET_POOL_SIZE - self.free.len()
    }
}

impl Default for PacketPool {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Transmit queue
// =============================================================================

#[derive(Clone, Copy)]
struct TxEntry {
    slot: u8,
    priority: u8,
    ready_at: u32,
    expires_at: u32,
    seq: u16,
}

/// Priority transmit queue over pool slots
pub struct TxQueue {
    entries: heapless::Vec<TxEntry, TX_QUEUE_SIZE>,
    next_seq: u16,
}

impl TxQueue {
    /// Create an empty queue
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: heapless::Vec::new(),
            next_seq: 0,
        }
    }

    /// Enqueue a pooled packet for transmission
    ///
    /// # Errors
    ///
    /// `Error::PoolExhausted` when the queue is full.
    pub fn push(&mut self, slot: u8, priority: u8, now: u32, delay_ms: u32) -> Result<()> {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.entries
            .push(TxEntry {
                slot,
                priority,
                ready_at: future_millis(now, delay_ms),
                expires_at: future_millis(now, PACKET_LIFETIME_MS),
                seq,
            })
            .map_err(|_| Error::PoolExhausted)
    }

    /// Remove and return one expired entry's slot, if any
    pub fn pop_expired(&mut self, now: u32) -> Option<u8> {
        let idx = self
            .entries
            .iter()
            .position(|e| millis_has_passed(now, e.expires_at))?;
        Some(self.entries.swap_remove(idx).slot)
    }

    /// Remove and return the best eligible entry's slot, if any.
    ///
    /// Best = lowest priority value; ties broken by enqueue order.
    pub fn pop_eligible(&mut self, now: u32) -> Option<u8> {
        let mut best: Option<usize> = None;
        for (i, e) in self.entries.iter().enumerate() {
            if !millis_has_passed(now, e.ready_at) {
                continue;
            }
            match best {
                None => best = Some(i),
                Some(b) => {
                    let cur = &self.entries[b];
                    let earlier = (e.seq.wrapping_sub(cur.seq) as i16) < 0;
                    if e.priority < cur.priority || (e.priority == cur.priority && earlier) {
                        best = Some(i);
                    }
                }
            }
        }
        best.map(|i| self.entries.swap_remove(i).slot)
    }

    /// Is any entry eligible at `now`?
    #[must_use]
    pub fn has_eligible(&self, now: u32) -> bool {
        self.entries.iter().any(|e| millis_has_passed(now, e.ready_at))
    }

    /// Queued entry count
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Is the queue empty?
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TxQueue {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Transmit statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchStats {
    /// Frames handed to the radio
    pub sent: u32,
    /// Frames successfully decoded off the radio
    pub recv_ok: u32,
    /// Frames dropped by codec validation
    pub recv_malformed: u32,
    /// Queued packets dropped after their pool lifetime
    pub expired: u32,
}

/// Pool + queue + transmit pacing.
///
/// The routing engine composes this with a radio and drives it from the
/// single event loop; all callbacks fire on that loop's thread.
pub struct Dispatcher {
    /// The packet pool (owned here, borrowed by the routing engine)
    pub pool: PacketPool,
    queue: TxQueue,
    outbound: Option<u8>,
    next_tx_check: u32,
    /// Running statistics
    pub stats: DispatchStats,
}

impl Dispatcher {
    /// Create a dispatcher with an empty pool and queue
    #[must_use]
    pub fn new() -> Self {
        Self {
            pool: PacketPool::new(),
            queue: TxQueue::new(),
            outbound: None,
            next_tx_check: 0,
            stats: DispatchStats::default(),
        }
    }

    /// Move `pkt` into the pool and schedule it.
    ///
    /// # Errors
    ///
    /// `Error::PoolExhausted` when no pool slot or queue entry is free;
    /// the packet is dropped and the operation is a no-op.
    pub fn send(&mut self, pkt: &Packet, priority: u8, delay_ms: u32, now: u32) -> Result<()> {
        let slot = self.pool.obtain().ok_or(Error::PoolExhausted)?;
        *self.pool.get_mut(slot) = pkt.clone();
        if let Err(e) = self.queue.push(slot, priority, now, delay_ms) {
            self.pool.release(slot);
            return Err(e);
        }
        Ok(())
    }

    /// Re-schedule an already pooled slot (forwarding path)
    ///
    /// # Errors
    ///
    /// `Error::PoolExhausted` when the queue is full; the slot is released.
    pub fn send_slot(&mut self, slot: u8, priority: u8, delay_ms: u32, now: u32) -> Result<()> {
        if let Err(e) = self.queue.push(slot, priority, now, delay_ms) {
            self.pool.release(slot);
            return Err(e);
        }
        Ok(())
    }

    /// Is a transmission currently in flight?
    #[must_use]
    pub const fn is_transmitting(&self) -> bool {
        self.outbound.is_some()
    }

    /// Queued (not yet transmitted) packet count
    #[must_use]
    pub fn pending_tx(&self) -> usize {
        self.queue.len()
    }

    /// Run the transmit half of one tick.
    ///
    /// Completes an in-flight send, expires stale entries, then — if the
    /// channel is clear — hands the best eligible packet to the radio.
    /// When the radio reports a receive in progress, backs off a random
    /// CAD-retry delay before looking again.
    pub fn transmit_tick<R: Radio, G: CryptoRng>(&mut self, radio: &mut R, rng: &mut G, now: u32) {
        if let Some(slot) = self.outbound {
            if radio.is_send_complete() {
                radio.on_send_finished();
                self.pool.release(slot);
                self.outbound = None;
            } else {
                return; // still on air
            }
        }

        while let Some(slot) = self.queue.pop_expired(now) {
            self.pool.release(slot);
            self.stats.expired += 1;
        }

        if !millis_has_passed(now, self.next_tx_check) {
            return; // backing off after a busy channel
        }
        if !self.queue.has_eligible(now) {
            return;
        }
        if radio.is_receiving() {
            self.next_tx_check = future_millis(now, rng.next_in_range(1, 4) * 120);
            return;
        }

        if let Some(slot) = self.queue.pop_eligible(now) {
            let mut raw = [0u8; MAX_TRANS_UNIT];
            let pkt = self.pool.get(slot);
            match pkt.write_to(&mut raw) {
                Ok(len) => {
                    if radio.start_send_raw(&raw[..len]).is_ok() {
                        self.stats.sent += 1;
                        self.outbound = Some(slot);
                    } else {
                        self.pool.release(slot);
                    }
                }
                Err(_) => self.pool.release(slot),
            }
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{PayloadType, RouteKind};

    fn pkt(fill: u8) -> Packet {
        let mut p = Packet::with_type(PayloadType::TxtMsg);
        p.set_route(RouteKind::Flood);
        p.payload[..4].fill(fill);
        p.payload_len = 4;
        p
    }

    #[test]
    fn test_pool_obtain_release() {
        let mut pool = PacketPool::new();
        let mut taken = heapless::Vec::<u8, PACKET_POOL_SIZE>::new();
        while let Some(s) = pool.obtain() {
            taken.push(s).unwrap();
        }
        assert_eq!(taken.len(), PACKET_POOL_SIZE);
        assert!(pool.obtain().is_none());

        pool.release(taken.pop().unwrap());
        assert!(pool.obtain().is_some());
    }

    #[test]
    fn test_queue_priority_order() {
        let mut q = TxQueue::new();
        q.push(0, 3, 0, 0).unwrap();
        q.push(1, 0, 0, 0).unwrap();
        q.push(2, 1, 0, 0).unwrap();

        assert_eq!(q.pop_eligible(10), Some(1));
        assert_eq!(q.pop_eligible(10), Some(2));
        assert_eq!(q.pop_eligible(10), Some(0));
    }

    #[test]
    fn test_queue_fifo_within_priority() {
        let mut q = TxQueue::new();
        q.push(5, 2, 0, 0).unwrap();
        q.push(6, 2, 0, 0).unwrap();
        assert_eq!(q.pop_eligible(1), Some(5));
        assert_eq!(q.pop_eligible(1), Some(6));
    }

    #[test]
    fn test_queue_delay_gates_eligibility() {
        let mut q = TxQueue::new();
        q.push(0, 0, 1000, 500).unwrap();
        assert_eq!(q.pop_eligible(1000), None);
        assert_eq!(q.pop_eligible(1499), None);
        assert_eq!(q.pop_eligible(1500), Some(0));
    }

    #[test]
    fn test_queue_expiry() {
        let mut q = TxQueue::new();
        q.push(0, 0, 0, 10).unwrap();
        assert_eq!(q.pop_expired(PACKET_LIFETIME_MS - 1), None);
        assert_eq!(q.pop_expired(PACKET_LIFETIME_MS), Some(0));
        assert!(q.is_empty());
    }

    #[test]
    fn test_dispatcher_pool_exhaustion_is_noop() {
        let mut d = Dispatcher::new();
        for _ in 0..PACKET_POOL_SIZE {
            d.send(&pkt(1), 1, 0, 0).unwrap();
        }
        assert_eq!(d.send(&pkt(2), 1, 0, 0).unwrap_err(), Error::PoolExhausted);
        assert_eq!(d.pending_tx(), PACKET_POOL_SIZE);
    }
}
