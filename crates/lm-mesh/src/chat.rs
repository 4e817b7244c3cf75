// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Chat node
//!
//! The application layer over the routing engine: contacts, channels,
//! the outgoing-encryption funnel with its session-key ladder, acks and
//! path returns, and the persistence orchestration.
//!
//! The C++-style virtual self-call (routing callback composes and sends
//! a reply inline) becomes a two-phase tick here: the routing engine
//! calls into [`ChatState`] (the [`MeshApp`] implementation), which
//! records pending replies and UI events; [`ChatNode::loop_once`] then
//! drains the pending queue with both the engine and the state in scope.

use crate::advert::{
    AdvertDataBuilder, AdvertDataParser, NodeType, FEAT1_AEAD_SUPPORT,
};
use crate::channel::{ChannelTable, GroupChannel};
use crate::contact::{
    Contact, ContactTable, CONTACT_FLAG_AEAD, OUT_PATH_UNKNOWN,
};
use crate::mesh::{Mesh, MeshApp};
use crate::nonce::{seed_nonce, NonceTracker};
use crate::packet::{Packet, PayloadType, RouteKind};
use crate::radio::Radio;
use crate::region::{RegionMap, REGION_DENY_FLOOD};
use crate::session::{
    read_session_record, SessionKeyPool, SessionState, SESSION_RECORD_MAX,
};
use crate::storage::{
    read_contact_record, read_nonce_record, write_contact_record, write_nonce_record, BlobStore,
    CONTACT_RECORD_SIZE, KEY_CONTACTS, KEY_NONCES, KEY_REGIONS, KEY_SESSION_KEYS,
    NONCE_RECORD_SIZE,
};
use heapless::{Deque, String, Vec};
use lm_common::constants::{
    MAX_ADVERT_DATA_SIZE, MAX_HASH_MATCHES, MAX_PACKET_PAYLOAD, MAX_PATH_SIZE,
    MAX_SESSION_KEYS_FLASH, MAX_TRANS_UNIT, PUB_KEY_SIZE, SESSION_KEY_ABANDON_THRESHOLD,
    SESSION_KEY_ECB_THRESHOLD, SESSION_KEY_MAX_RETRIES, SESSION_KEY_SIZE,
    SESSION_KEY_STALE_THRESHOLD, SESSION_KEY_TIMEOUT_MS, NONCE_REKEY_THRESHOLD,
};
use lm_common::time::{future_millis, millis_has_passed, MillisClock, RtcClock};
use lm_common::{Error, Result};
use lm_crypto::{hash, CryptoRng, Identity, LocalIdentity};

/// Maximum text length in a message
pub const MAX_TEXT_LEN: usize = 160;

/// Delay before sending an ack for a received text, ms
pub const TXT_ACK_DELAY: u32 = 200;

/// Delay before sending a response to a request, ms
pub const SERVER_RESPONSE_DELAY: u32 = 300;

/// Text message kind: plain chat text
pub const TXT_TYPE_PLAIN: u8 = 0;
/// Text message kind: CLI command data
pub const TXT_TYPE_CLI_DATA: u8 = 1;
/// Text message kind: signed plain text (room relays)
pub const TXT_TYPE_SIGNED_PLAIN: u8 = 2;

/// Request type: status query
pub const REQ_TYPE_GET_STATUS: u8 = 0x01;
/// Request type: connection keep-alive
pub const REQ_TYPE_KEEP_ALIVE: u8 = 0x02;
/// Request type: session key negotiation INIT
pub const REQ_TYPE_SESSION_KEY_INIT: u8 = 0x06;
/// Response type: session key negotiation ACCEPT
pub const RESP_TYPE_SESSION_KEY_ACCEPT: u8 = 0x08;

/// Outcome of a send operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Sent by flood (no known path)
    Flood,
    /// Sent directly along a known path
    Direct,
}

/// Caller-visible result of queuing an outbound message
#[derive(Debug, Clone, Copy)]
pub struct SendInfo {
    /// How it went out
    pub mode: SendMode,
    /// CRC the peer's ack will carry
    pub expected_ack: u32,
    /// Suggested wait before declaring a timeout, ms
    pub est_timeout_ms: u32,
}

/// Session-key file capacity in bytes
const SESSION_FILE_MAX: usize = MAX_SESSION_KEYS_FLASH * SESSION_RECORD_MAX;

const MAX_EVENTS: usize = 8;
const MAX_PENDING: usize = 8;

/// Events surfaced to the UI/application, drained via
/// [`ChatNode::next_event`]
#[derive(Clone)]
pub enum ChatEvent {
    /// A contact was created or refreshed from an advert
    ContactDiscovered {
        /// Contact index
        idx: usize,
        /// First sighting?
        is_new: bool,
    },
    /// A contact's outbound path changed
    ContactPathUpdated {
        /// Contact index
        idx: usize,
    },
    /// A plain text message arrived
    MessageReceived {
        /// Contact index
        idx: usize,
        /// Sender timestamp (their clock)
        timestamp: u32,
        /// Message text
        text: String<MAX_TEXT_LEN>,
    },
    /// CLI command data arrived
    CommandDataReceived {
        /// Contact index
        idx: usize,
        /// Sender timestamp
        timestamp: u32,
        /// Command text
        text: String<MAX_TEXT_LEN>,
    },
    /// A signed (room-relayed) message arrived
    SignedMessageReceived {
        /// Contact index of the relaying room
        idx: usize,
        /// Sender timestamp
        timestamp: u32,
        /// Original sender's key prefix
        sender_prefix: [u8; 4],
        /// Message text
        text: String<MAX_TEXT_LEN>,
    },
    /// A group channel message arrived
    ChannelMessageReceived {
        /// Channel hash
        channel_hash: u8,
        /// Sender timestamp
        timestamp: u32,
        /// Message text (sender-prefixed)
        text: String<MAX_TEXT_LEN>,
    },
    /// A request arrived (other than session-key negotiation)
    RequestReceived {
        /// Contact index
        idx: usize,
        /// Sender timestamp
        timestamp: u32,
        /// Request bytes after the timestamp
        data: Vec<u8, 144>,
    },
    /// A response arrived
    ContactResponse {
        /// Contact index
        idx: usize,
        /// Response bytes
        data: Vec<u8, 144>,
    },
    /// An anonymous request arrived (sender not in contacts)
    AnonDataReceived {
        /// Sender's public key
        sender: [u8; PUB_KEY_SIZE],
        /// Decrypted request bytes
        data: Vec<u8, 144>,
    },
    /// The ack we were waiting for arrived
    AckConfirmed {
        /// Ack CRC
        crc: u32,
    },
    /// No ack arrived within the estimated timeout
    SendTimeout,
}

enum PendingReply {
    Ack {
        contact_idx: usize,
        ack_hash: u32,
    },
    PathReturn {
        contact_idx: usize,
        in_path: [u8; MAX_PATH_SIZE],
        in_path_len: u8,
        extra_type: u8,
        extra: Vec<u8, 48>,
        delay_ms: u32,
    },
    Response {
        contact_idx: usize,
        data: Vec<u8, 144>,
        use_static: bool,
        flood_origin: bool,
        in_path: [u8; MAX_PATH_SIZE],
        in_path_len: u8,
    },
    ReturnPathRetry {
        contact_idx: usize,
        in_path: [u8; MAX_PATH_SIZE],
        in_path_len: u8,
    },
}

// =============================================================================
// Chat state (the MeshApp implementation)
// =============================================================================

/// Application-side state: contacts, channels, session keys, nonces,
/// persistence and the pending-reply queue
pub struct ChatState<S: BlobStore, G: CryptoRng, T: RtcClock> {
    /// Our full identity (signing + ECDH)
    pub local_id: LocalIdentity,
    /// Known peers
    pub contacts: ContactTable,
    /// Configured group channels
    pub channels: ChannelTable,
    /// Region scoping for transport floods
    pub region: RegionMap,
    session_keys: SessionKeyPool,
    session_keys_dirty: bool,
    nonces: NonceTracker,
    store: S,
    rng: G,
    rtc: T,

    matching: [usize; MAX_HASH_MATCHES],
    pending: Deque<PendingReply, MAX_PENDING>,
    events: Deque<ChatEvent, MAX_EVENTS>,
    pending_rekey: Option<usize>,

    expected_ack: u32,
    expecting_idx: usize,
    txt_send_deadline: u32, // 0 = unarmed

    /// Auto-add contacts from adverts
    pub auto_add: bool,
    /// Replace the oldest non-favourite contact when the table is full
    pub overwrite_when_full: bool,
    /// Forward other nodes' packets (repeater/transport role)
    pub forward: bool,
    /// Extra ack copies when relaying direct acks
    pub extra_acks: u8,
}

impl<S: BlobStore, G: CryptoRng, T: RtcClock> ChatState<S, G, T> {
    /// Create chat state around an identity and its storage backend
    pub fn new(local_id: LocalIdentity, store: S, rng: G, rtc: T) -> Self {
        Self {
            local_id,
            contacts: ContactTable::new(),
            channels: ChannelTable::new(),
            region: RegionMap::new(),
            session_keys: SessionKeyPool::new(),
            session_keys_dirty: false,
            nonces: NonceTracker::new(),
            store,
            rng,
            rtc,
            matching: [0; MAX_HASH_MATCHES],
            pending: Deque::new(),
            events: Deque::new(),
            pending_rekey: None,
            expected_ack: 0,
            expecting_idx: 0,
            txt_send_deadline: 0,
            auto_add: true,
            overwrite_when_full: false,
            forward: false,
            extra_acks: 0,
        }
    }

    fn push_event(&mut self, event: ChatEvent) {
        // oldest events give way under pressure
        if self.events.is_full() {
            let _ = self.events.pop_front();
        }
        let _ = self.events.push_back(event);
    }

    fn queue_reply(&mut self, reply: PendingReply) {
        let _ = self.pending.push_back(reply);
    }

    // =========================================================================
    // Session key pool with flash fallback
    // =========================================================================

    fn find_session_key_idx(&mut self, pub_key: &[u8; PUB_KEY_SIZE]) -> Option<usize> {
        if let Some(idx) = self.session_keys.find_index(pub_key) {
            return Some(idx);
        }

        // cache miss: consult the flash file
        let mut blob = [0u8; SESSION_FILE_MAX];
        let len = self.store.get(KEY_SESSION_KEYS, &mut blob).ok()?;
        let mut off = 0;
        while off < len {
            let rec = read_session_record(&blob[off..len])?;
            off += rec.consumed;
            if rec.prefix == pub_key[..4] {
                if self.session_keys.is_full() && self.session_keys_dirty {
                    // save the dirty evictee before overwriting it
                    self.merge_and_save_session_keys();
                }
                self.session_keys.apply_loaded(
                    &rec.prefix,
                    rec.flags,
                    rec.nonce,
                    &rec.session_key,
                    &rec.prev_session_key,
                );
                return self.session_keys.find_index(pub_key);
            }
        }
        None
    }

    fn remove_session_key(&mut self, pub_key: &[u8; PUB_KEY_SIZE]) {
        self.session_keys.remove(pub_key);
        self.session_keys_dirty = true;
    }

    /// Merge the RAM pool with the flash file and write it back: current
    /// RAM records first, then kept flash records (minus RAM-present and
    /// removed prefixes), capped at the file's record budget.
    pub fn merge_and_save_session_keys(&mut self) {
        let mut out = [0u8; SESSION_FILE_MAX];
        let mut out_len = 0;
        let mut count = 0;

        for idx in 0..self.session_keys.len() {
            if let Some(n) = self.session_keys.entry_for_save(idx, &mut out[out_len..]) {
                out_len += n;
                count += 1;
            }
        }

        let mut old = [0u8; SESSION_FILE_MAX];
        if let Ok(old_len) = self.store.get(KEY_SESSION_KEYS, &mut old) {
            let mut off = 0;
            while off < old_len && count < MAX_SESSION_KEYS_FLASH {
                let Some(rec) = read_session_record(&old[off..old_len]) else {
                    break;
                };
                off += rec.consumed;
                let keep = !self.session_keys.has_prefix(&rec.prefix)
                    && !self.session_keys.is_removed(&rec.prefix);
                if keep {
                    out[out_len..out_len + rec.consumed]
                        .copy_from_slice(&old[off - rec.consumed..off]);
                    out_len += rec.consumed;
                    count += 1;
                }
            }
        }

        if self.store.put(KEY_SESSION_KEYS, &out[..out_len]).is_ok() {
            self.session_keys.clear_removed();
            self.session_keys_dirty = false;
        }
    }

    fn can_use_session_key(entry: &crate::session::SessionKeyEntry) -> bool {
        // ACTIVE/DUAL_DECODE: normal use.
        // INIT_SENT with nonce > 1: renegotiation in progress, keep using
        // the old key (nonce 0 means a fresh allocation with no prior key).
        let valid_state = matches!(entry.state, SessionState::Active | SessionState::DualDecode)
            || (entry.state == SessionState::InitSent && entry.nonce > 1);
        valid_state
            && entry.sends_since_last_recv < SESSION_KEY_STALE_THRESHOLD
            && entry.nonce < u16::MAX // exhausted -> fall back to static
    }

    // =========================================================================
    // The outgoing-encryption funnel
    // =========================================================================

    /// Key this node would use to encrypt to contact `idx` right now
    pub fn encryption_key_for(&mut self, idx: usize) -> [u8; 32] {
        let Some(pub_key) = self.contacts.get(idx).map(|c| c.id.pub_key) else {
            return [0; 32];
        };
        if let Some(i) = self.find_session_key_idx(&pub_key) {
            let entry = self.session_keys.get(i).unwrap();
            if Self::can_use_session_key(entry) {
                return entry.session_key;
            }
        }
        let local = &self.local_id;
        *self.contacts.get_mut(idx).unwrap().shared_secret(local)
    }

    /// Nonce this node would use to encrypt to contact `idx` right now.
    ///
    /// This is the single funnel every outgoing encryption flows through:
    /// it advances whichever counter applies, walks the fallback ladder
    /// on silence, and schedules a rekey check for the next tick.
    pub fn encryption_nonce_for(&mut self, idx: usize) -> u16 {
        let Some(pub_key) = self.contacts.get(idx).map(|c| c.id.pub_key) else {
            return 0;
        };

        let mut nonce = 0;
        let mut abandon = false;
        match self.find_session_key_idx(&pub_key) {
            Some(i) => {
                let entry = self.session_keys.get_mut(i).unwrap();
                if Self::can_use_session_key(entry) {
                    entry.nonce += 1;
                    if entry.sends_since_last_recv < 255 {
                        entry.sends_since_last_recv += 1;
                    }
                    nonce = entry.nonce;
                    self.session_keys_dirty = true;
                } else if entry.sends_since_last_recv < 255 {
                    // progressive fallback: count even when the session
                    // key is not in use
                    entry.sends_since_last_recv += 1;
                    let sends = entry.sends_since_last_recv;
                    if sends >= SESSION_KEY_ABANDON_THRESHOLD {
                        abandon = true;
                    } else if sends >= SESSION_KEY_ECB_THRESHOLD {
                        // nonce stays 0 (ECB)
                    } else {
                        nonce = self.nonces.next_for(&mut self.contacts, idx);
                    }
                } else {
                    nonce = self.nonces.next_for(&mut self.contacts, idx);
                }
            }
            None => {
                nonce = self.nonces.next_for(&mut self.contacts, idx);
            }
        }

        if abandon {
            // give up on this peer's session entirely
            if let Some(c) = self.contacts.get_mut(idx) {
                c.flags &= !CONTACT_FLAG_AEAD;
            }
            self.remove_session_key(&pub_key);
        }

        // deferring to the next tick keeps this callable from any send
        // path without reentering the engine
        if self.pending_rekey.is_none() && self.should_initiate_session_key(idx) {
            self.pending_rekey = Some(idx);
        }

        nonce
    }

    fn should_initiate_session_key(&mut self, idx: usize) -> bool {
        let Some(contact) = self.contacts.get(idx) else {
            return false;
        };
        if !contact.supports_aead() || !contact.has_out_path() {
            return false;
        }
        let pub_key = contact.id.pub_key;
        let out_path_len = contact.out_path_len;
        let aead_nonce = contact.aead_nonce;

        // interval tiers by hop count:
        //   direct: static=100, session=100
        //   1-9:    static=500, session=300
        //   10+:    static=1000, session=300
        let (static_interval, session_interval): (u16, u16) = if out_path_len == 0 {
            (100, 100)
        } else if out_path_len < 10 {
            (500, 300)
        } else {
            (1000, 300)
        };

        if let Some(i) = self.find_session_key_idx(&pub_key) {
            let entry = self.session_keys.get(i).unwrap();
            if entry.state == SessionState::InitSent {
                return false; // negotiation already in flight
            }
            if matches!(entry.state, SessionState::Active | SessionState::DualDecode)
                && entry.nonce < u16::MAX
            {
                if entry.nonce <= NONCE_REKEY_THRESHOLD {
                    return false;
                }
                return (entry.nonce - NONCE_REKEY_THRESHOLD) % session_interval == 0;
            }
            // nonce exhausted: fall through to the static trigger
        }

        if aead_nonce == 0 {
            return false; // nothing sent yet
        }
        aead_nonce % static_interval == 0
    }

    /// Responder half of the handshake: derive and install the new key,
    /// returning our ephemeral public key for the ACCEPT reply.
    fn handle_incoming_session_key_init(
        &mut self,
        contact_idx: usize,
        ephemeral_pub_a: &[u8],
    ) -> Option<[u8; PUB_KEY_SIZE]> {
        let sender = Identity::from_slice(ephemeral_pub_a)?;

        let eph_b = LocalIdentity::generate(&mut self.rng).ok()?;
        let eph_secret = eph_b.shared_secret(&sender).ok()?;

        let static_secret = {
            let local = &self.local_id;
            *self.contacts.get_mut(contact_idx)?.shared_secret(local)
        };
        let new_key = hash::hmac_sha256(&static_secret, eph_secret.as_bytes());

        let pub_key = self.contacts.get(contact_idx)?.id.pub_key;
        if self.session_keys.is_full()
            && !self.session_keys.has_prefix(&pub_key)
            && self.session_keys_dirty
        {
            self.merge_and_save_session_keys();
        }
        let entry = self.session_keys.allocate(&pub_key);
        if matches!(entry.state, SessionState::Active | SessionState::DualDecode) {
            entry.prev_session_key = entry.session_key;
        }
        entry.session_key = new_key;
        entry.nonce = 1;
        entry.state = SessionState::DualDecode;
        entry.sends_since_last_recv = 0;
        self.session_keys_dirty = true;

        Some(eph_b.id.pub_key)
    }

    /// Initiator half: the peer's ACCEPT carries their ephemeral key.
    fn handle_session_key_response(&mut self, contact_idx: usize, data: &[u8]) -> bool {
        // [timestamp:4][RESP_TYPE_SESSION_KEY_ACCEPT:1][ephemeral_pub_B:32]
        if data.len() < 5 + PUB_KEY_SIZE || data[4] != RESP_TYPE_SESSION_KEY_ACCEPT {
            return false;
        }
        let Some(pub_key) = self.contacts.get(contact_idx).map(|c| c.id.pub_key) else {
            return false;
        };
        let Some(i) = self.find_session_key_idx(&pub_key) else {
            return false;
        };
        if self.session_keys.get(i).unwrap().state != SessionState::InitSent {
            return false;
        }
        let Some(peer_eph) = Identity::from_slice(&data[5..5 + PUB_KEY_SIZE]) else {
            return false;
        };

        let static_secret = {
            let local = &self.local_id;
            *self
                .contacts
                .get_mut(contact_idx)
                .unwrap()
                .shared_secret(local)
        };

        let entry = self.session_keys.get_mut(i).unwrap();
        let Some(ephemeral) = entry.ephemeral.take() else {
            return false;
        };
        let Ok(eph_secret) = ephemeral.shared_secret(&peer_eph) else {
            return false;
        };
        entry.session_key = hash::hmac_sha256(&static_secret, eph_secret.as_bytes());
        entry.nonce = 1;
        entry.state = SessionState::Active;
        entry.sends_since_last_recv = 0;
        entry.retries_left = 0;
        entry.timeout_at = 0;
        self.session_keys_dirty = true;
        true
    }

    // =========================================================================
    // Inbound message handling
    // =========================================================================

    /// Byte length of the text portion: decrypted payloads may carry
    /// zero padding, so the text ends at the first NUL
    fn text_len_of(data: &[u8]) -> usize {
        data.iter().position(|&b| b == 0).unwrap_or(data.len())
    }

    fn text_from(data: &[u8]) -> String<MAX_TEXT_LEN> {
        let end = Self::text_len_of(data);
        let mut s = String::new();
        if let Ok(text) = core::str::from_utf8(&data[..end]) {
            let mut n = text.len().min(MAX_TEXT_LEN);
            while n > 0 && !text.is_char_boundary(n) {
                n -= 1;
            }
            let _ = s.push_str(&text[..n]);
        }
        s
    }

    fn handle_txt_msg(&mut self, pkt: &Packet, idx: usize, data: &[u8]) {
        let timestamp = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let kind = data[4] >> 2;

        match kind {
            TXT_TYPE_PLAIN => {
                let text = Self::text_from(&data[5..]);
                let text_len = Self::text_len_of(&data[5..]);
                if let Some(c) = self.contacts.get_mut(idx) {
                    c.lastmod = self.rtc.current_time();
                }
                self.push_event(ChatEvent::MessageReceived {
                    idx,
                    timestamp,
                    text,
                });

                // ack proves receipt: H(timestamp || flags || text || sender pub)
                let mut ack = [0u8; 4];
                let pub_key = self.contacts.get(idx).map(|c| c.id.pub_key).unwrap_or_default();
                hash::sha256_pair(&mut ack, &data[..5 + text_len], &pub_key);
                let ack_hash = u32::from_le_bytes(ack);

                if pkt.is_route_flood() {
                    // teach the sender the path here, ack piggybacked
                    let mut in_path = [0u8; MAX_PATH_SIZE];
                    in_path[..pkt.path_byte_len()]
                        .copy_from_slice(&pkt.path[..pkt.path_byte_len()]);
                    let mut extra = Vec::new();
                    let _ = extra.extend_from_slice(&ack);
                    self.queue_reply(PendingReply::PathReturn {
                        contact_idx: idx,
                        in_path,
                        in_path_len: pkt.path_len,
                        extra_type: PayloadType::Ack as u8,
                        extra,
                        delay_ms: TXT_ACK_DELAY,
                    });
                } else {
                    self.queue_reply(PendingReply::Ack {
                        contact_idx: idx,
                        ack_hash,
                    });
                }
            }
            TXT_TYPE_CLI_DATA => {
                let text = Self::text_from(&data[5..]);
                self.push_event(ChatEvent::CommandDataReceived {
                    idx,
                    timestamp,
                    text,
                });
                // no ack for CLI data; still teach the path on flood
                if pkt.is_route_flood() {
                    let mut in_path = [0u8; MAX_PATH_SIZE];
                    in_path[..pkt.path_byte_len()]
                        .copy_from_slice(&pkt.path[..pkt.path_byte_len()]);
                    self.queue_reply(PendingReply::PathReturn {
                        contact_idx: idx,
                        in_path,
                        in_path_len: pkt.path_len,
                        extra_type: 0,
                        extra: Vec::new(),
                        delay_ms: 0,
                    });
                }
            }
            TXT_TYPE_SIGNED_PLAIN => {
                if data.len() < 9 {
                    return;
                }
                let mut sender_prefix = [0u8; 4];
                sender_prefix.copy_from_slice(&data[5..9]);
                let text = Self::text_from(&data[9..]);
                let text_len = Self::text_len_of(&data[9..]);
                if let Some(c) = self.contacts.get_mut(idx) {
                    if timestamp > c.sync_since {
                        c.sync_since = timestamp;
                    }
                    c.lastmod = self.rtc.current_time();
                }
                self.push_event(ChatEvent::SignedMessageReceived {
                    idx,
                    timestamp,
                    sender_prefix,
                    text,
                });

                // signed acks hash against OUR key (the room addressed us)
                let mut ack = [0u8; 4];
                hash::sha256_pair(&mut ack, &data[..9 + text_len], &self.local_id.id.pub_key);
                let ack_hash = u32::from_le_bytes(ack);

                if pkt.is_route_flood() {
                    let mut in_path = [0u8; MAX_PATH_SIZE];
                    in_path[..pkt.path_byte_len()]
                        .copy_from_slice(&pkt.path[..pkt.path_byte_len()]);
                    let mut extra = Vec::new();
                    let _ = extra.extend_from_slice(&ack);
                    self.queue_reply(PendingReply::PathReturn {
                        contact_idx: idx,
                        in_path,
                        in_path_len: pkt.path_len,
                        extra_type: PayloadType::Ack as u8,
                        extra,
                        delay_ms: TXT_ACK_DELAY,
                    });
                } else {
                    self.queue_reply(PendingReply::Ack {
                        contact_idx: idx,
                        ack_hash,
                    });
                }
            }
            _ => {}
        }
    }

    fn handle_req(&mut self, pkt: &Packet, idx: usize, data: &[u8]) {
        let sender_timestamp = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);

        // strict > replay defense; an equal timestamp is a retry and is
        // processed idempotently
        if let Some(c) = self.contacts.get(idx) {
            if sender_timestamp < c.last_req_timestamp {
                return; // replay, drop silently
            }
        }
        if let Some(c) = self.contacts.get_mut(idx) {
            c.last_req_timestamp = sender_timestamp;
        }

        // session key INIT is intercepted ahead of the application
        if data.len() >= 5 + PUB_KEY_SIZE && data[4] == REQ_TYPE_SESSION_KEY_INIT {
            if let Some(eph_pub_b) =
                self.handle_incoming_session_key_init(idx, &data[5..5 + PUB_KEY_SIZE])
            {
                let mut reply = Vec::new();
                let _ = reply.extend_from_slice(&sender_timestamp.to_le_bytes());
                let _ = reply.push(RESP_TYPE_SESSION_KEY_ACCEPT);
                let _ = reply.extend_from_slice(&eph_pub_b);

                let mut in_path = [0u8; MAX_PATH_SIZE];
                in_path[..pkt.path_byte_len()].copy_from_slice(&pkt.path[..pkt.path_byte_len()]);
                // ACCEPT must ride the static secret: the initiator can't
                // derive the session key until it has our ephemeral
                self.queue_reply(PendingReply::Response {
                    contact_idx: idx,
                    data: reply,
                    use_static: true,
                    flood_origin: pkt.is_route_flood(),
                    in_path,
                    in_path_len: pkt.path_len,
                });
            }
            return;
        }

        let mut bytes = Vec::new();
        let _ = bytes.extend_from_slice(&data[4..data.len().min(4 + 144)]);
        self.push_event(ChatEvent::RequestReceived {
            idx,
            timestamp: sender_timestamp,
            data: bytes,
        });
    }

    fn handle_response(&mut self, pkt: &Packet, idx: usize, data: &[u8]) {
        // intercept session-key ACCEPT; the INIT_SENT guard makes a
        // collision with an application response byte vanishingly unlikely
        if data.len() >= 5
            && data[4] == RESP_TYPE_SESSION_KEY_ACCEPT
            && self.handle_session_key_response(idx, data)
        {
            // handled
        } else {
            let mut bytes = Vec::new();
            let _ = bytes.extend_from_slice(&data[..data.len().min(144)]);
            self.push_event(ChatEvent::ContactResponse { idx, data: bytes });
        }

        if pkt.is_route_flood() {
            if let Some(c) = self.contacts.get(idx) {
                if c.has_out_path() {
                    // they replied by flood although we taught them a
                    // path; maybe the return path was lost - re-teach it
                    let mut in_path = [0u8; MAX_PATH_SIZE];
                    in_path[..pkt.path_byte_len()]
                        .copy_from_slice(&pkt.path[..pkt.path_byte_len()]);
                    self.queue_reply(PendingReply::ReturnPathRetry {
                        contact_idx: idx,
                        in_path,
                        in_path_len: pkt.path_len,
                    });
                }
            }
        }
    }

    /// Record what ack we're waiting on (one outstanding send at a time)
    fn arm_ack(&mut self, contact_idx: usize, expected_ack: u32, deadline: u32) {
        self.expected_ack = expected_ack;
        self.expecting_idx = contact_idx;
        self.txt_send_deadline = deadline;
    }
}

// =============================================================================
// MeshApp implementation
// =============================================================================

impl<S: BlobStore, G: CryptoRng, T: RtcClock> MeshApp for ChatState<S, G, T> {
    fn allow_packet_forward(&mut self, _pkt: &Packet) -> bool {
        self.forward
    }

    fn filter_recv_flood(&mut self, pkt: &Packet) -> bool {
        pkt.has_transport_codes() && self.region.is_denied(pkt, REGION_DENY_FLOOD)
    }

    fn extra_ack_transmit_count(&self) -> u8 {
        self.extra_acks
    }

    fn search_peers_by_hash(&mut self, hash: u8) -> usize {
        self.contacts.search_by_hash(hash, &mut self.matching)
    }

    fn peer_static_secret(&mut self, peer_idx: usize) -> [u8; 32] {
        let idx = self.matching[peer_idx];
        let local = &self.local_id;
        match self.contacts.get_mut(idx) {
            Some(c) => *c.shared_secret(local),
            None => [0; 32],
        }
    }

    fn peer_session_key(&mut self, peer_idx: usize) -> Option<[u8; 32]> {
        let idx = self.matching[peer_idx];
        let pub_key = self.contacts.get(idx)?.id.pub_key;
        let i = self.find_session_key_idx(&pub_key)?;
        let entry = self.session_keys.get(i)?;
        let decodable = matches!(entry.state, SessionState::Active | SessionState::DualDecode)
            || (entry.state == SessionState::InitSent && entry.nonce > 1);
        decodable.then_some(entry.session_key)
    }

    fn peer_prev_session_key(&mut self, peer_idx: usize) -> Option<[u8; 32]> {
        let idx = self.matching[peer_idx];
        let pub_key = self.contacts.get(idx)?.id.pub_key;
        let i = self.find_session_key_idx(&pub_key)?;
        let entry = self.session_keys.get(i)?;
        (entry.state == SessionState::DualDecode).then_some(entry.prev_session_key)
    }

    fn peer_encryption_key(&mut self, peer_idx: usize) -> [u8; 32] {
        let idx = self.matching[peer_idx];
        self.encryption_key_for(idx)
    }

    fn peer_encryption_nonce(&mut self, peer_idx: usize) -> u16 {
        let idx = self.matching[peer_idx];
        self.encryption_nonce_for(idx)
    }

    fn on_session_key_decrypt_success(&mut self, peer_idx: usize) {
        let idx = self.matching[peer_idx];
        let Some(pub_key) = self.contacts.get(idx).map(|c| c.id.pub_key) else {
            return;
        };
        if let Some(i) = self.find_session_key_idx(&pub_key) {
            let entry = self.session_keys.get_mut(i).unwrap();
            if entry.state == SessionState::DualDecode {
                // first inbound under the new key confirms it
                entry.prev_session_key = [0; SESSION_KEY_SIZE];
                entry.state = SessionState::Active;
                self.session_keys_dirty = true;
            }
            entry.sends_since_last_recv = 0;
        }
    }

    fn ecdh_shared_secret(&mut self, sender: &Identity) -> Option<[u8; 32]> {
        self.local_id
            .shared_secret(sender)
            .ok()
            .map(|s| *s.as_bytes())
    }

    fn search_channels_by_hash(
        &mut self,
        hash: u8,
        dest: &mut [GroupChannel; MAX_HASH_MATCHES],
    ) -> usize {
        self.channels.search_by_hash(hash, dest)
    }

    fn on_advert_recv(&mut self, pkt: &Packet, id: &Identity, timestamp: u32, app_data: &[u8]) {
        let parser = AdvertDataParser::new(app_data);
        if !(parser.is_valid() && parser.has_name()) {
            return;
        }

        let existing = self.contacts.find_by_pub_key(&id.pub_key);
        if let Some(idx) = existing {
            if timestamp <= self.contacts.get(idx).unwrap().last_advert_timestamp {
                // stale or replayed advert
                return;
            }
        }

        // cache the raw advert (for contact sharing/export), with route
        // forced to FLOOD so no transport codes land in the blob
        {
            let mut copy = pkt.clone();
            copy.set_route(RouteKind::Flood);
            let mut raw = [0u8; MAX_TRANS_UNIT];
            if let Ok(n) = copy.write_to(&mut raw) {
                let _ = self.store.put(&id.pub_key, &raw[..n]);
            }
        }

        let (idx, is_new) = match existing {
            Some(idx) => (idx, false),
            None => {
                if !self.auto_add || !self.should_auto_add(parser.node_type()) {
                    return;
                }
                let mut c = Contact::new(*id);
                c.aead_nonce = seed_nonce(&mut self.rng);
                match self.contacts.add(c, self.overwrite_when_full) {
                    Ok(idx) => (idx, true),
                    Err(_) => return, // table full
                }
            }
        };

        let now = self.rtc.current_time();
        if let Some(c) = self.contacts.get_mut(idx) {
            c.name.clear();
            let _ = c.name.push_str(parser.name());
            c.node_type = parser.node_type();
            if let Some((lat, lon)) = parser.lat_lon() {
                c.gps_lat = lat;
                c.gps_lon = lon;
            }
            c.last_advert_timestamp = timestamp;
            c.lastmod = now;
            if parser.feat1() & FEAT1_AEAD_SUPPORT != 0 {
                c.flags |= CONTACT_FLAG_AEAD;
            } else {
                c.flags &= !CONTACT_FLAG_AEAD;
            }
        }

        self.push_event(ChatEvent::ContactDiscovered { idx, is_new });
    }

    fn on_peer_data_recv(
        &mut self,
        pkt: &Packet,
        payload_type: PayloadType,
        peer_idx: usize,
        data: &[u8],
    ) {
        let idx = self.matching[peer_idx];
        if self.contacts.get(idx).is_none() {
            return;
        }

        match payload_type {
            PayloadType::TxtMsg if data.len() > 5 => self.handle_txt_msg(pkt, idx, data),
            PayloadType::Req if data.len() > 4 => self.handle_req(pkt, idx, data),
            PayloadType::Response if !data.is_empty() => self.handle_response(pkt, idx, data),
            _ => {}
        }
    }

    fn on_peer_path_recv(
        &mut self,
        _pkt: &Packet,
        peer_idx: usize,
        out_path: &[u8],
        out_path_len: u8,
        extra_type: u8,
        extra: &[u8],
    ) -> bool {
        let idx = self.matching[peer_idx];
        let Some(c) = self.contacts.get_mut(idx) else {
            return false;
        };

        // replace the stored path wholesale; the newest teaching wins
        c.out_path_len = Packet::copy_path(&mut c.out_path, out_path, out_path_len);
        c.lastmod = self.rtc.current_time();
        self.push_event(ChatEvent::ContactPathUpdated { idx });

        if extra_type == PayloadType::Ack as u8 && extra.len() >= 4 {
            let crc = u32::from_le_bytes([extra[0], extra[1], extra[2], extra[3]]);
            if crc == self.expected_ack && self.expected_ack != 0 {
                self.expected_ack = 0;
                self.txt_send_deadline = 0;
                self.push_event(ChatEvent::AckConfirmed { crc });
            }
        } else if extra_type == PayloadType::Response as u8 && !extra.is_empty() {
            if extra.len() >= 5
                && extra[4] == RESP_TYPE_SESSION_KEY_ACCEPT
                && self.handle_session_key_response(idx, extra)
            {
                // handled
            } else {
                let mut bytes = Vec::new();
                let _ = bytes.extend_from_slice(&extra[..extra.len().min(144)]);
                self.push_event(ChatEvent::ContactResponse { idx, data: bytes });
            }
        }
        true // reciprocate when taught by flood
    }

    fn on_anon_data_recv(
        &mut self,
        _pkt: &Packet,
        _secret: &[u8; 32],
        sender: &Identity,
        data: &[u8],
    ) {
        let mut bytes = Vec::new();
        let _ = bytes.extend_from_slice(&data[..data.len().min(144)]);
        self.push_event(ChatEvent::AnonDataReceived {
            sender: sender.pub_key,
            data: bytes,
        });
    }

    fn on_group_data_recv(
        &mut self,
        _pkt: &Packet,
        payload_type: PayloadType,
        channel: &GroupChannel,
        data: &[u8],
    ) {
        if payload_type == PayloadType::GrpTxt && data.len() > 5 && (data[4] >> 2) == TXT_TYPE_PLAIN
        {
            let timestamp = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
            let text = Self::text_from(&data[5..]);
            self.push_event(ChatEvent::ChannelMessageReceived {
                channel_hash: channel.hash,
                timestamp,
                text,
            });
        }
    }

    fn on_ack_recv(&mut self, pkt: &mut Packet, crc: u32) {
        if self.expected_ack != 0 && crc == self.expected_ack {
            let idx = self.expecting_idx;
            self.expected_ack = 0;
            self.txt_send_deadline = 0;
            pkt.mark_do_not_retransmit(); // the ack was for this node
            self.push_event(ChatEvent::AckConfirmed { crc });

            if pkt.is_route_flood() {
                if let Some(c) = self.contacts.get(idx) {
                    if c.has_out_path() {
                        // they acked by flood despite a taught path; the
                        // return path may have been lost - re-teach it
                        let mut in_path = [0u8; MAX_PATH_SIZE];
                        in_path[..pkt.path_byte_len()]
                            .copy_from_slice(&pkt.path[..pkt.path_byte_len()]);
                        self.queue_reply(PendingReply::ReturnPathRetry {
                            contact_idx: idx,
                            in_path,
                            in_path_len: pkt.path_len,
                        });
                    }
                }
            }
        }
    }
}

impl<S: BlobStore, G: CryptoRng, T: RtcClock> ChatState<S, G, T> {
    fn should_auto_add(&self, _node_type: NodeType) -> bool {
        true
    }
}

// =============================================================================
// Chat node
// =============================================================================

/// A complete chat node: routing engine + application state
pub struct ChatNode<R, GM, C, S, G, T>
where
    R: Radio,
    GM: CryptoRng,
    C: MillisClock,
    S: BlobStore,
    G: CryptoRng,
    T: RtcClock,
{
    /// The routing engine
    pub mesh: Mesh<R, GM, C>,
    /// The application state
    pub state: ChatState<S, G, T>,
}

impl<R, GM, C, S, G, T> ChatNode<R, GM, C, S, G, T>
where
    R: Radio,
    GM: CryptoRng,
    C: MillisClock,
    S: BlobStore,
    G: CryptoRng,
    T: RtcClock,
{
    /// Assemble a node from an engine and its state
    pub fn new(mesh: Mesh<R, GM, C>, state: ChatState<S, G, T>) -> Self {
        Self { mesh, state }
    }

    /// One cooperative tick: radio service, pending replies, timeouts,
    /// deferred rekeys.
    pub fn loop_once(&mut self) {
        self.mesh.loop_once(&mut self.state);
        let now = self.mesh.now_ms();

        while let Some(reply) = self.state.pending.pop_front() {
            self.execute_reply(reply);
        }

        if self.state.txt_send_deadline != 0
            && millis_has_passed(now, self.state.txt_send_deadline)
        {
            self.state.txt_send_deadline = 0;
            self.state.expected_ack = 0;
            self.state.push_event(ChatEvent::SendTimeout);
        }

        self.check_session_key_timeouts(now);

        if let Some(idx) = self.state.pending_rekey.take() {
            let _ = self.initiate_session_key_negotiation(idx);
        }
    }

    /// Pop the next UI event, if any
    pub fn next_event(&mut self) -> Option<ChatEvent> {
        self.state.events.pop_front()
    }

    fn contact_hash(&self, idx: usize) -> Option<u8> {
        self.state.contacts.get(idx).map(|c| c.id.node_hash())
    }

    fn execute_reply(&mut self, reply: PendingReply) {
        match reply {
            PendingReply::Ack { contact_idx, ack_hash } => {
                self.send_ack_to(contact_idx, ack_hash);
            }
            PendingReply::PathReturn {
                contact_idx,
                in_path,
                in_path_len,
                extra_type,
                extra,
                delay_ms,
            } => {
                let Some(dest_hash) = self.contact_hash(contact_idx) else {
                    return;
                };
                let key = self.state.encryption_key_for(contact_idx);
                let nonce = self.state.encryption_nonce_for(contact_idx);
                if let Ok(pkt) = self.mesh.create_path_return(
                    dest_hash,
                    &key,
                    &in_path,
                    in_path_len,
                    extra_type,
                    &extra,
                    nonce,
                ) {
                    let _ = self.mesh.send_flood(pkt, delay_ms);
                }
            }
            PendingReply::Response {
                contact_idx,
                data,
                use_static,
                flood_origin,
                in_path,
                in_path_len,
            } => {
                let Some(contact) = self.state.contacts.get(contact_idx) else {
                    return;
                };
                let dest = contact.id;
                let out_path_len = contact.out_path_len;
                let out_path = contact.out_path;

                let (key, nonce) = if use_static {
                    let local_key = {
                        let local = &self.state.local_id;
                        *self
                            .state
                            .contacts
                            .get_mut(contact_idx)
                            .unwrap()
                            .shared_secret(local)
                    };
                    let n = self
                        .state
                        .nonces
                        .next_for(&mut self.state.contacts, contact_idx);
                    (local_key, n)
                } else {
                    (
                        self.state.encryption_key_for(contact_idx),
                        self.state.encryption_nonce_for(contact_idx),
                    )
                };

                if flood_origin {
                    // response piggybacks on the return path
                    if let Ok(pkt) = self.mesh.create_path_return(
                        dest.node_hash(),
                        &key,
                        &in_path,
                        in_path_len,
                        PayloadType::Response as u8,
                        &data,
                        nonce,
                    ) {
                        let _ = self.mesh.send_flood(pkt, SERVER_RESPONSE_DELAY);
                    }
                } else if let Ok(pkt) =
                    self.mesh
                        .create_datagram(PayloadType::Response, &dest, &key, &data, nonce)
                {
                    if out_path_len != OUT_PATH_UNKNOWN {
                        let _ = self.mesh.send_direct(
                            pkt,
                            &out_path,
                            out_path_len,
                            SERVER_RESPONSE_DELAY,
                        );
                    } else {
                        let _ = self.mesh.send_flood(pkt, SERVER_RESPONSE_DELAY);
                    }
                }
            }
            PendingReply::ReturnPathRetry {
                contact_idx,
                in_path,
                in_path_len,
            } => {
                let Some(contact) = self.state.contacts.get(contact_idx) else {
                    return;
                };
                let dest_hash = contact.id.node_hash();
                let out_path_len = contact.out_path_len;
                let out_path = contact.out_path;
                if out_path_len == OUT_PATH_UNKNOWN {
                    return;
                }
                let key = self.state.encryption_key_for(contact_idx);
                let nonce = self.state.encryption_nonce_for(contact_idx);
                if let Ok(pkt) = self.mesh.create_path_return(
                    dest_hash,
                    &key,
                    &in_path,
                    in_path_len,
                    0,
                    &[],
                    nonce,
                ) {
                    let _ = self.mesh.send_direct(pkt, &out_path, out_path_len, 3000);
                }
            }
        }
    }

    fn send_ack_to(&mut self, contact_idx: usize, ack_hash: u32) {
        let Some(contact) = self.state.contacts.get(contact_idx) else {
            return;
        };
        let out_path_len = contact.out_path_len;
        let out_path = contact.out_path;

        if out_path_len == OUT_PATH_UNKNOWN {
            if let Ok(ack) = self.mesh.create_ack(ack_hash) {
                let _ = self.mesh.send_flood(ack, TXT_ACK_DELAY);
            }
            return;
        }

        let mut delay = TXT_ACK_DELAY;
        if self.state.extra_acks > 0 {
            if let Ok(multi) = self.mesh.create_multi_ack(ack_hash, 1) {
                let _ = self.mesh.send_direct(multi, &out_path, out_path_len, delay);
            }
            delay += 300;
        }
        if let Ok(ack) = self.mesh.create_ack(ack_hash) {
            let _ = self.mesh.send_direct(ack, &out_path, out_path_len, delay);
        }
    }

    // =========================================================================
    // Session key negotiation (initiator side)
    // =========================================================================

    fn send_session_key_init(&mut self, contact_idx: usize) -> Result<()> {
        let eph_pub = {
            let Some(pub_key) = self
                .state
                .contacts
                .get(contact_idx)
                .map(|c| c.id.pub_key)
            else {
                return Err(Error::PeerNotFound);
            };
            let ephemeral = LocalIdentity::generate(&mut self.state.rng)
                .map_err(|_| Error::RngFailure)?;
            let eph_pub = ephemeral.id.pub_key;
            let entry = self.state.session_keys.allocate(&pub_key);
            entry.ephemeral = Some(ephemeral);
            eph_pub
        };

        let mut req = [0u8; 1 + PUB_KEY_SIZE];
        req[0] = REQ_TYPE_SESSION_KEY_INIT;
        req[1..].copy_from_slice(&eph_pub);
        self.send_request(contact_idx, &req).map(|_| ())
    }

    /// Begin (or decline to begin) a rekey with contact `idx`
    pub fn initiate_session_key_negotiation(&mut self, contact_idx: usize) -> Result<()> {
        let Some(pub_key) = self
            .state
            .contacts
            .get(contact_idx)
            .map(|c| c.id.pub_key)
        else {
            return Err(Error::PeerNotFound);
        };

        if self.state.session_keys.is_full()
            && !self.state.session_keys.has_prefix(&pub_key)
            && self.state.session_keys_dirty
        {
            self.state.merge_and_save_session_keys();
        }
        if let Some(i) = self.state.session_keys.find_index(&pub_key) {
            if self.state.session_keys.get(i).unwrap().state == SessionState::InitSent {
                return Ok(()); // one outstanding negotiation per peer
            }
        }

        self.send_session_key_init(contact_idx)?;

        let now = self.mesh.now_ms();
        if let Some(i) = self.state.session_keys.find_index(&pub_key) {
            let entry = self.state.session_keys.get_mut(i).unwrap();
            entry.state = SessionState::InitSent;
            entry.retries_left = SESSION_KEY_MAX_RETRIES - 1;
            entry.timeout_at = future_millis(now, SESSION_KEY_TIMEOUT_MS);
        }
        Ok(())
    }

    fn check_session_key_timeouts(&mut self, now: u32) {
        for i in 0..self.state.session_keys.len() {
            let (expired, retries_left, prefix) = {
                let Some(entry) = self.state.session_keys.get(i) else {
                    continue;
                };
                if entry.state != SessionState::InitSent
                    || entry.timeout_at == 0
                    || !millis_has_passed(now, entry.timeout_at)
                {
                    continue;
                }
                (true, entry.retries_left, entry.peer_pub_prefix)
            };
            if !expired {
                continue;
            }

            if retries_left > 0 {
                let Some(contact_idx) = self.state.contacts.find_by_pub_key(&prefix) else {
                    // contact gone; clean up on the next pass
                    if let Some(e) = self.state.session_keys.get_mut(i) {
                        e.retries_left = 0;
                    }
                    continue;
                };
                if let Some(e) = self.state.session_keys.get_mut(i) {
                    e.retries_left -= 1;
                    e.timeout_at = future_millis(now, SESSION_KEY_TIMEOUT_MS);
                }
                // fresh ephemeral for the retry
                let _ = self.send_session_key_init(contact_idx);
            } else {
                // all retries exhausted
                if let Some(e) = self.state.session_keys.get_mut(i) {
                    e.clear();
                }
            }
        }
    }

    // =========================================================================
    // Outbound flows
    // =========================================================================

    fn timeout_for(&self, airtime: u32, mode: SendMode, path_len: u8) -> u32 {
        match mode {
            SendMode::Flood => airtime * 6 + 8000,
            SendMode::Direct => airtime * 2 * (u32::from(path_len) + 1) + 3000,
        }
    }

    fn dispatch_to_contact(&mut self, contact_idx: usize, pkt: Packet) -> Result<(SendMode, u32)> {
        let contact = self
            .state
            .contacts
            .get(contact_idx)
            .ok_or(Error::PeerNotFound)?;
        let out_path_len = contact.out_path_len;
        let out_path = contact.out_path;
        let airtime = self.mesh.est_airtime_for(pkt.raw_length());

        if out_path_len == OUT_PATH_UNKNOWN {
            self.mesh.send_flood(pkt, 0)?;
            Ok((SendMode::Flood, self.timeout_for(airtime, SendMode::Flood, 0)))
        } else {
            self.mesh.send_direct(pkt, &out_path, out_path_len, 0)?;
            Ok((
                SendMode::Direct,
                self.timeout_for(airtime, SendMode::Direct, out_path_len),
            ))
        }
    }

    /// Send a text message; arms the single outstanding ack tracker.
    ///
    /// # Errors
    ///
    /// `Error::InvalidParameter` for oversized text,
    /// `Error::PoolExhausted` when nothing can be queued.
    pub fn send_message(&mut self, contact_idx: usize, attempt: u8, text: &str) -> Result<SendInfo> {
        if text.len() > MAX_TEXT_LEN {
            return Err(Error::InvalidParameter);
        }
        let timestamp = self.state.rtc.current_time_unique();

        let mut temp = [0u8; 5 + MAX_TEXT_LEN + 1];
        temp[..4].copy_from_slice(&timestamp.to_le_bytes());
        temp[4] = attempt & 3;
        temp[5..5 + text.len()].copy_from_slice(text.as_bytes());
        let len = 5 + text.len();

        // the ack the peer will compute back to us
        let mut ack = [0u8; 4];
        hash::sha256_pair(&mut ack, &temp[..len], &self.state.local_id.id.pub_key);
        let expected_ack = u32::from_le_bytes(ack);

        let dest = self
            .state
            .contacts
            .get(contact_idx)
            .ok_or(Error::PeerNotFound)?
            .id;
        let key = self.state.encryption_key_for(contact_idx);
        let nonce = self.state.encryption_nonce_for(contact_idx);
        let pkt = self
            .mesh
            .create_datagram(PayloadType::TxtMsg, &dest, &key, &temp[..len], nonce)?;

        let (mode, est_timeout_ms) = self.dispatch_to_contact(contact_idx, pkt)?;
        let now = self.mesh.now_ms();
        self.state
            .arm_ack(contact_idx, expected_ack, future_millis(now, est_timeout_ms));

        Ok(SendInfo {
            mode,
            expected_ack,
            est_timeout_ms,
        })
    }

    /// Send CLI command data (no ack expected)
    ///
    /// # Errors
    ///
    /// See [`ChatNode::send_message`].
    pub fn send_command_data(&mut self, contact_idx: usize, text: &str) -> Result<SendInfo> {
        if text.len() > MAX_TEXT_LEN {
            return Err(Error::InvalidParameter);
        }
        let timestamp = self.state.rtc.current_time_unique();

        let mut temp = [0u8; 5 + MAX_TEXT_LEN];
        temp[..4].copy_from_slice(&timestamp.to_le_bytes());
        temp[4] = TXT_TYPE_CLI_DATA << 2;
        temp[5..5 + text.len()].copy_from_slice(text.as_bytes());
        let len = 5 + text.len();

        let dest = self
            .state
            .contacts
            .get(contact_idx)
            .ok_or(Error::PeerNotFound)?
            .id;
        let key = self.state.encryption_key_for(contact_idx);
        let nonce = self.state.encryption_nonce_for(contact_idx);
        let pkt = self
            .mesh
            .create_datagram(PayloadType::TxtMsg, &dest, &key, &temp[..len], nonce)?;

        let (mode, est_timeout_ms) = self.dispatch_to_contact(contact_idx, pkt)?;
        Ok(SendInfo {
            mode,
            expected_ack: 0,
            est_timeout_ms,
        })
    }

    /// Send an application request; returns the tag to match the response
    ///
    /// # Errors
    ///
    /// `Error::InvalidParameter` on oversized data.
    pub fn send_request(&mut self, contact_idx: usize, req_data: &[u8]) -> Result<u32> {
        if req_data.len() > MAX_PACKET_PAYLOAD - 16 {
            return Err(Error::InvalidParameter);
        }
        let tag = self.state.rtc.current_time_unique();

        let mut temp = [0u8; MAX_PACKET_PAYLOAD];
        temp[..4].copy_from_slice(&tag.to_le_bytes());
        temp[4..4 + req_data.len()].copy_from_slice(req_data);
        let len = 4 + req_data.len();

        let dest = self
            .state
            .contacts
            .get(contact_idx)
            .ok_or(Error::PeerNotFound)?
            .id;
        let key = self.state.encryption_key_for(contact_idx);
        let nonce = self.state.encryption_nonce_for(contact_idx);
        let pkt = self
            .mesh
            .create_datagram(PayloadType::Req, &dest, &key, &temp[..len], nonce)?;

        self.dispatch_to_contact(contact_idx, pkt)?;
        Ok(tag)
    }

    /// Send a response to a previously received request
    ///
    /// # Errors
    ///
    /// `Error::InvalidParameter` on oversized data.
    pub fn send_response(&mut self, contact_idx: usize, data: &[u8]) -> Result<()> {
        if data.len() > 144 {
            return Err(Error::InvalidParameter);
        }
        let mut bytes = Vec::new();
        let _ = bytes.extend_from_slice(data);
        self.state.queue_reply(PendingReply::Response {
            contact_idx,
            data: bytes,
            use_static: false,
            flood_origin: false,
            in_path: [0; MAX_PATH_SIZE],
            in_path_len: 0,
        });
        Ok(())
    }

    /// Send an anonymous login to a room/server (always the static secret)
    ///
    /// # Errors
    ///
    /// `Error::InvalidParameter` on an oversized password.
    pub fn send_login(&mut self, contact_idx: usize, password: &str) -> Result<SendInfo> {
        let pwd_len = password.len().min(15);
        let now = self.state.rtc.current_time_unique();

        let contact = self
            .state
            .contacts
            .get(contact_idx)
            .ok_or(Error::PeerNotFound)?;
        let dest = contact.id;
        let is_room = contact.node_type == NodeType::Room;
        let sync_since = contact.sync_since;

        let mut temp = [0u8; 24];
        temp[..4].copy_from_slice(&now.to_le_bytes());
        let len = if is_room {
            temp[4..8].copy_from_slice(&sync_since.to_le_bytes());
            temp[8..8 + pwd_len].copy_from_slice(&password.as_bytes()[..pwd_len]);
            8 + pwd_len
        } else {
            temp[4..4 + pwd_len].copy_from_slice(&password.as_bytes()[..pwd_len]);
            4 + pwd_len
        };

        let secret = {
            let local = &self.state.local_id;
            *self
                .state
                .contacts
                .get_mut(contact_idx)
                .unwrap()
                .shared_secret(local)
        };
        // anonymous requests ride the legacy envelope; the responder has
        // no nonce context for an unknown sender
        let pkt = self.mesh.create_anon_datagram(
            &self.state.local_id,
            &dest,
            &secret,
            &temp[..len],
            0,
        )?;

        let (mode, est_timeout_ms) = self.dispatch_to_contact(contact_idx, pkt)?;
        Ok(SendInfo {
            mode,
            expected_ack: 0,
            est_timeout_ms,
        })
    }

    /// Send a group text message on channel `channel_idx`
    ///
    /// # Errors
    ///
    /// `Error::NotFound` for a bad channel index,
    /// `Error::InvalidParameter` for oversized text.
    pub fn send_group_message(
        &mut self,
        channel_idx: usize,
        sender_name: &str,
        text: &str,
    ) -> Result<()> {
        let channel = self
            .state
            .channels
            .get(channel_idx)
            .ok_or(Error::NotFound)?
            .channel;
        let timestamp = self.state.rtc.current_time_unique();

        let mut temp = [0u8; 5 + MAX_TEXT_LEN];
        temp[..4].copy_from_slice(&timestamp.to_le_bytes());
        temp[4] = TXT_TYPE_PLAIN;

        // "<sender>: <text>"
        let name_len = sender_name.len().min(32);
        let mut len = 5;
        temp[len..len + name_len].copy_from_slice(&sender_name.as_bytes()[..name_len]);
        len += name_len;
        temp[len] = b':';
        temp[len + 1] = b' ';
        len += 2;
        let text_len = text.len().min(5 + MAX_TEXT_LEN - len);
        temp[len..len + text_len].copy_from_slice(&text.as_bytes()[..text_len]);
        len += text_len;

        // group messages share one key across members; stay on the
        // legacy envelope where cross-sender nonce reuse cannot bite
        let pkt = self
            .mesh
            .create_group_datagram(PayloadType::GrpTxt, &channel, &temp[..len], 0)?;
        self.mesh.send_flood(pkt, 0)
    }

    /// Broadcast a signed self-advert
    ///
    /// # Errors
    ///
    /// `Error::PoolExhausted` when the pool or queue is full.
    pub fn send_self_advert(
        &mut self,
        name: &str,
        lat_lon: Option<(i32, i32)>,
        delay_ms: u32,
    ) -> Result<()> {
        let mut app_data = [0u8; MAX_ADVERT_DATA_SIZE];
        let mut builder =
            AdvertDataBuilder::new(NodeType::Chat, name).with_feat1(FEAT1_AEAD_SUPPORT);
        if let Some((lat, lon)) = lat_lon {
            builder = builder.with_lat_lon(lat, lon);
        }
        let n = builder.encode_to(&mut app_data);

        let timestamp = self.state.rtc.current_time();
        let pkt = self
            .mesh
            .create_advert(&self.state.local_id, timestamp, &app_data[..n])?;
        self.mesh.send_flood(pkt, delay_ms)
    }

    /// Forget the direct path to a contact (next send floods)
    pub fn reset_path_to(&mut self, contact_idx: usize) {
        if let Some(c) = self.state.contacts.get_mut(contact_idx) {
            c.reset_path();
        }
    }

    // =========================================================================
    // Contact import/export
    // =========================================================================

    /// Export a contact's last raw advert
    ///
    /// # Errors
    ///
    /// `Error::StorageNotFound` when no advert is cached.
    pub fn export_contact(&mut self, contact_idx: usize, dest: &mut [u8]) -> Result<usize> {
        let pub_key = self
            .state
            .contacts
            .get(contact_idx)
            .ok_or(Error::PeerNotFound)?
            .id
            .pub_key;
        self.state.store.get(&pub_key, dest)
    }

    /// Import a contact from exported advert bytes by re-injecting the
    /// advert as if freshly received.
    ///
    /// # Errors
    ///
    /// `Error::InvalidParameter` for non-advert bytes.
    pub fn import_contact(&mut self, raw: &[u8]) -> Result<()> {
        let mut pkt = Packet::read_from(raw).map_err(|_| Error::InvalidParameter)?;
        if pkt.payload_type() != Some(PayloadType::Advert) {
            return Err(Error::InvalidParameter);
        }
        pkt.set_route(RouteKind::Flood);
        // make the tables forget it so it can be processed again
        self.mesh.tables.clear(&pkt);
        let _ = self.mesh.process_received(&mut self.state, &mut pkt);
        Ok(())
    }

    /// Re-broadcast a contact's cached advert to immediate neighbors
    ///
    /// # Errors
    ///
    /// `Error::StorageNotFound` when no advert is cached.
    pub fn share_contact_zero_hop(&mut self, contact_idx: usize) -> Result<()> {
        let mut raw = [0u8; MAX_TRANS_UNIT];
        let n = self.export_contact(contact_idx, &mut raw)?;
        let pkt = Packet::read_from(&raw[..n]).map_err(|_| Error::StorageCorrupted)?;
        // {0, 0} transport codes: carry this nowhere beyond one hop
        self.mesh.send_zero_hop_scoped(pkt, [0, 0], 0)
    }

    // =========================================================================
    // Persistence orchestration
    // =========================================================================

    /// Write all contacts to the blob store
    ///
    /// # Errors
    ///
    /// Propagates blob-store failures.
    pub fn save_contacts(&mut self) -> Result<()> {
        let mut blob = [0u8; 1 + CONTACT_RECORD_SIZE * 32];
        blob[0] = self.state.contacts.len() as u8;
        let mut off = 1;
        for c in self.state.contacts.iter() {
            off += write_contact_record(&mut blob[off..], c)?;
        }
        self.state.store.put(KEY_CONTACTS, &blob[..off])
    }

    /// Load contacts from the blob store (replaces the table)
    ///
    /// # Errors
    ///
    /// `Error::StorageCorrupted` on malformed records.
    pub fn load_contacts(&mut self) -> Result<()> {
        let mut blob = [0u8; 1 + CONTACT_RECORD_SIZE * 32];
        let len = match self.state.store.get(KEY_CONTACTS, &mut blob) {
            Ok(n) => n,
            Err(Error::StorageNotFound) => return Ok(()),
            Err(e) => return Err(e),
        };
        if len == 0 {
            return Ok(());
        }
        let count = blob[0] as usize;
        let mut off = 1;
        for _ in 0..count {
            if off + CONTACT_RECORD_SIZE > len {
                return Err(Error::StorageCorrupted);
            }
            let mut c = read_contact_record(&blob[off..])?;
            off += CONTACT_RECORD_SIZE;
            // nonce counters load separately; reseed as a fallback
            c.aead_nonce = seed_nonce(&mut self.state.rng);
            let _ = self.state.contacts.add(c, false);
        }
        Ok(())
    }

    /// Write every contact's nonce counter
    ///
    /// # Errors
    ///
    /// Propagates blob-store failures.
    pub fn save_nonces(&mut self) -> Result<()> {
        let mut blob = [0u8; NONCE_RECORD_SIZE * 32];
        let mut off = 0;
        for idx in 0..self.state.contacts.len() {
            if let Some((prefix, nonce)) = self.state.nonces.entry(&self.state.contacts, idx) {
                off += write_nonce_record(&mut blob[off..], &prefix, nonce)?;
            }
        }
        self.state.store.put(KEY_NONCES, &blob[..off])?;
        self.state.nonces.clear_dirty(&mut self.state.contacts);
        Ok(())
    }

    /// Load nonce counters and finish with the boot-bump policy.
    ///
    /// `dirty_boot` distinguishes power loss/watchdog/brownout from a
    /// clean sleep-wake; a dirty boot bumps every counter (contacts and
    /// session keys) past any unsaved increments.
    ///
    /// # Errors
    ///
    /// Propagates blob-store failures other than absence.
    pub fn load_nonces(&mut self, dirty_boot: bool) -> Result<()> {
        let mut blob = [0u8; NONCE_RECORD_SIZE * 32];
        match self.state.store.get(KEY_NONCES, &mut blob) {
            Ok(len) => {
                let mut off = 0;
                while off + NONCE_RECORD_SIZE <= len {
                    if let Some((prefix, nonce)) = read_nonce_record(&blob[off..]) {
                        self.state
                            .nonces
                            .apply_loaded(&mut self.state.contacts, &prefix, nonce);
                    }
                    off += NONCE_RECORD_SIZE;
                }
            }
            Err(Error::StorageNotFound) => {}
            Err(e) => return Err(e),
        }
        self.state
            .nonces
            .finalize_load(&mut self.state.contacts, dirty_boot);
        if dirty_boot {
            self.state.session_keys.boot_bump();
        }
        Ok(())
    }

    /// Load the session-key file into the RAM pool (newest-first wins)
    ///
    /// # Errors
    ///
    /// Propagates blob-store failures other than absence.
    pub fn load_session_keys(&mut self) -> Result<()> {
        let mut blob = [0u8; SESSION_FILE_MAX];
        let len = match self.state.store.get(KEY_SESSION_KEYS, &mut blob) {
            Ok(n) => n,
            Err(Error::StorageNotFound) => return Ok(()),
            Err(e) => return Err(e),
        };
        let mut off = 0;
        let mut loaded = 0;
        while off < len && loaded < 8 {
            let Some(rec) = read_session_record(&blob[off..len]) else {
                break;
            };
            off += rec.consumed;
            self.state.session_keys.apply_loaded(
                &rec.prefix,
                rec.flags,
                rec.nonce,
                &rec.session_key,
                &rec.prev_session_key,
            );
            loaded += 1;
        }
        Ok(())
    }

    /// Persist dirty state (call periodically and before sleep)
    pub fn flush_dirty(&mut self) {
        if self.state.nonces.is_dirty() {
            let _ = self.save_nonces();
        }
        if self.state.session_keys_dirty {
            self.state.merge_and_save_session_keys();
        }
    }

    /// Persist the region map
    ///
    /// # Errors
    ///
    /// Propagates blob-store failures.
    pub fn save_region_map(&mut self) -> Result<()> {
        let mut blob = [0u8; 1200];
        let n = self.state.region.save_to(&mut blob)?;
        self.state.store.put(KEY_REGIONS, &blob[..n])
    }

    /// Load the region map
    ///
    /// # Errors
    ///
    /// Propagates blob-store failures other than absence.
    pub fn load_region_map(&mut self) -> Result<()> {
        let mut blob = [0u8; 1200];
        match self.state.store.get(KEY_REGIONS, &mut blob) {
            Ok(n) => self.state.region.restore_from(&blob[..n]),
            Err(Error::StorageNotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Session-key pool state for diagnostics
    #[must_use]
    pub fn session_key_count(&self) -> usize {
        self.state.session_keys.len()
    }

    /// Session state with a peer, if any
    #[must_use]
    pub fn session_state_with(&self, contact_idx: usize) -> Option<SessionState> {
        let pub_key = self.state.contacts.get(contact_idx)?.id.pub_key;
        (0..self.state.session_keys.len()).find_map(|i| {
            let e = self.state.session_keys.get(i)?;
            (e.peer_pub_prefix == pub_key[..4]).then_some(e.state)
        })
    }
}
