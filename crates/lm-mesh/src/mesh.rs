// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! The routing engine
//!
//! For every received frame the engine emits exactly one
//! [`DispatcherAction`]: release it, deliver it (callbacks fired, then
//! released), or rewrite and re-queue it for retransmission.
//!
//! Classification runs in order: TRACE legs, zero-hop CONTROL, DIRECT
//! next-hop handling, the flood pre-filter, then payload-type dispatch.
//! First rule that matches wins. Flood copies of the same content
//! collapse in the mesh tables regardless of route; the first arrival
//! wins.
//!
//! The engine is polymorphic over [`MeshApp`] — the application's
//! capability set (peer lookup, channel lookup, deliveries, forwarding
//! policy) — rather than an inheritance chain. Callbacks fire on the
//! caller's thread, inside `loop_once`.

use crate::channel::GroupChannel;
use crate::dispatcher::{Dispatcher, DispatcherAction};
use crate::packet::{Packet, PayloadType, RouteKind, PH_ROUTE_MASK};
use crate::radio::Radio;
use crate::tables::MeshTables;
use lm_common::constants::{
    CIPHER_BLOCK_SIZE, CIPHER_MAC_SIZE, MAX_ADVERT_DATA_SIZE, MAX_HASH_MATCHES,
    MAX_PACKET_PAYLOAD, MAX_PATH_SIZE, MAX_TRANS_UNIT, PUB_KEY_SIZE, SIGNATURE_SIZE,
};
use lm_common::log::LogBuffer;
use lm_common::time::MillisClock;
use lm_common::{log_debug, log_warn, Error, Result};
use lm_crypto::{aead, cipher, CryptoRng, Identity, LocalIdentity};

/// Longest combined path + extra that fits a PATH payload
pub const MAX_COMBINED_PATH: usize = MAX_PACKET_PAYLOAD - 2 - CIPHER_BLOCK_SIZE;

/// TRACE flag bits: low 2 bits select the path hash size (2^n bytes)
pub const TRACE_PATH_SIZE_MASK: u8 = 0x03;

/// Application capability set consumed by the routing engine.
///
/// Peer indexes handed to the `peer_*` accessors are positions in the
/// match set produced by the most recent `search_peers_by_hash` call.
pub trait MeshApp {
    /// May this node forward the packet? (repeater/transport policy)
    fn allow_packet_forward(&mut self, pkt: &Packet) -> bool {
        let _ = pkt;
        false
    }

    /// Pre-filter for flood packets; `true` rejects (region scoping)
    fn filter_recv_flood(&mut self, pkt: &Packet) -> bool {
        let _ = pkt;
        false
    }

    /// Extra ACK copies to emit when relaying direct acks
    fn extra_ack_transmit_count(&self) -> u8 {
        0
    }

    /// Find contacts whose routing hash matches; returns the match count
    /// (capped at `MAX_HASH_MATCHES`)
    fn search_peers_by_hash(&mut self, hash: u8) -> usize {
        let _ = hash;
        0
    }

    /// Static ECDH secret for match `peer_idx`
    fn peer_static_secret(&mut self, peer_idx: usize) -> [u8; 32] {
        let _ = peer_idx;
        [0; 32]
    }

    /// Current session key for match `peer_idx`, when its state allows
    /// decryption (ACTIVE, DUAL_DECODE, or INIT_SENT mid-renegotiation)
    fn peer_session_key(&mut self, peer_idx: usize) -> Option<[u8; 32]> {
        let _ = peer_idx;
        None
    }

    /// Previous session key for match `peer_idx` (DUAL_DECODE only)
    fn peer_prev_session_key(&mut self, peer_idx: usize) -> Option<[u8; 32]> {
        let _ = peer_idx;
        None
    }

    /// Key the node would use to ENCRYPT to this peer right now
    fn peer_encryption_key(&mut self, peer_idx: usize) -> [u8; 32] {
        self.peer_static_secret(peer_idx)
    }

    /// Nonce the node would use to encrypt to this peer right now
    /// (0 = ECB); advances counters and may schedule a rekey
    fn peer_encryption_nonce(&mut self, peer_idx: usize) -> u16 {
        let _ = peer_idx;
        0
    }

    /// An inbound message decrypted under the peer's current session key
    fn on_session_key_decrypt_success(&mut self, peer_idx: usize) {
        let _ = peer_idx;
    }

    /// Derive a fresh ECDH secret with an anonymous sender's key
    fn ecdh_shared_secret(&mut self, sender: &Identity) -> Option<[u8; 32]> {
        let _ = sender;
        None
    }

    /// Find channels whose hash matches; returns the match count
    fn search_channels_by_hash(
        &mut self,
        hash: u8,
        dest: &mut [GroupChannel; MAX_HASH_MATCHES],
    ) -> usize {
        let _ = (hash, dest);
        0
    }

    /// A signature-valid advert from another node
    fn on_advert_recv(&mut self, pkt: &Packet, id: &Identity, timestamp: u32, app_data: &[u8]) {
        let _ = (pkt, id, timestamp, app_data);
    }

    /// Decrypted peer data (REQ / RESPONSE / TXT_MSG) addressed to us
    fn on_peer_data_recv(
        &mut self,
        pkt: &Packet,
        payload_type: PayloadType,
        peer_idx: usize,
        data: &[u8],
    ) {
        let _ = (pkt, payload_type, peer_idx, data);
    }

    /// A decrypted PATH payload teaching us a route back to the peer.
    /// Return `true` to have the engine send a reciprocal return path
    /// when the teaching packet arrived by flood.
    fn on_peer_path_recv(
        &mut self,
        pkt: &Packet,
        peer_idx: usize,
        out_path: &[u8],
        out_path_len: u8,
        extra_type: u8,
        extra: &[u8],
    ) -> bool {
        let _ = (pkt, peer_idx, out_path, out_path_len, extra_type, extra);
        false
    }

    /// Decrypted anonymous request (sender not in contacts)
    fn on_anon_data_recv(&mut self, pkt: &Packet, secret: &[u8; 32], sender: &Identity, data: &[u8]) {
        let _ = (pkt, secret, sender, data);
    }

    /// Decrypted group datagram
    fn on_group_data_recv(
        &mut self,
        pkt: &Packet,
        payload_type: PayloadType,
        channel: &GroupChannel,
        data: &[u8],
    ) {
        let _ = (pkt, payload_type, channel, data);
    }

    /// An ACK CRC was received (the handler may mark do-not-retransmit)
    fn on_ack_recv(&mut self, pkt: &mut Packet, crc: u32) {
        let _ = (pkt, crc);
    }

    /// A TRACE completed its path at this node
    fn on_trace_recv(
        &mut self,
        pkt: &Packet,
        tag: u32,
        auth_code: u32,
        flags: u8,
        path_snrs: &[u8],
        extra: &[u8],
    ) {
        let _ = (pkt, tag, auth_code, flags, path_snrs, extra);
    }

    /// A zero-hop control frame
    fn on_control_recv(&mut self, pkt: &Packet) {
        let _ = pkt;
    }

    /// An application-defined raw frame
    fn on_raw_data_recv(&mut self, pkt: &Packet) {
        let _ = pkt;
    }
}

// =============================================================================
// Envelope helpers
// =============================================================================

// Route bits are cleared from the header in the AAD so the flood and
// direct legs of the same payload authenticate alike.
fn peer_aad(header: u8, dest_hash: u8, src_hash: u8) -> [u8; 3] {
    [header & !PH_ROUTE_MASK, dest_hash, src_hash]
}

fn anon_aad(header: u8, dest_hash: u8) -> [u8; 2] {
    [header & !PH_ROUTE_MASK, dest_hash]
}

fn group_aad(header: u8, channel_hash: u8) -> [u8; 2] {
    [header & !PH_ROUTE_MASK, channel_hash]
}

/// Seal a plaintext: AEAD-4 when `nonce` is non-zero, legacy ECB when it
/// is the sentinel 0.
fn seal_envelope(
    secret: &[u8; 32],
    dest: &mut [u8],
    plaintext: &[u8],
    aad: &[u8],
    nonce: u16,
    dest_hash: u8,
    src_hash: u8,
) -> Result<usize> {
    if nonce != 0 {
        aead::aead_encrypt(secret, dest, plaintext, aad, nonce, dest_hash, src_hash)
            .map_err(Error::from)
    } else {
        cipher::encrypt_then_mac(secret, dest, plaintext).map_err(Error::from)
    }
}

/// Try to open an envelope under one key: AEAD-4 first, then ECB.
/// Returns the plaintext length, 0 on failure.
fn open_envelope(
    secret: &[u8; 32],
    dest: &mut [u8],
    src: &[u8],
    aad: &[u8],
    dest_hash: u8,
    src_hash: u8,
) -> usize {
    let n = aead::aead_decrypt(secret, dest, src, aad, dest_hash, src_hash);
    if n > 0 {
        return n;
    }
    cipher::mac_then_decrypt(secret, dest, src)
}

// =============================================================================
// Mesh
// =============================================================================

/// The mesh core: radio + pool + tables + routing state
pub struct Mesh<R: Radio, G: CryptoRng, C: MillisClock> {
    /// Radio driver
    pub radio: R,
    rng: G,
    clock: C,
    /// This node's public identity
    pub self_id: Identity,
    /// Duplicate-suppression tables
    pub tables: MeshTables,
    /// Pool, queue and transmit pacing
    pub dispatcher: Dispatcher,
    /// Delay before re-emitting routed (direct) traffic, ms
    pub direct_retx_delay_ms: u32,
    /// Circular log of notable routing events
    pub log: LogBuffer,
}

impl<R: Radio, G: CryptoRng, C: MillisClock> Mesh<R, G, C> {
    /// Create a mesh core
    pub fn new(radio: R, rng: G, clock: C, self_id: Identity) -> Self {
        Self {
            radio,
            rng,
            clock,
            self_id,
            tables: MeshTables::new(),
            dispatcher: Dispatcher::new(),
            direct_retx_delay_ms: 0,
            log: LogBuffer::new(),
        }
    }

    /// Current millisecond clock reading
    pub fn now_ms(&self) -> u32 {
        self.clock.millis()
    }

    /// Estimated airtime for a frame of `len` bytes
    pub fn est_airtime_for(&self, len: usize) -> u32 {
        self.radio.est_airtime_for(len)
    }

    /// Random delay before re-emitting a flood packet: 0–4 half-airtimes
    /// (with a 4% guard band), de-synchronizing neighboring repeaters.
    fn flood_retransmit_delay(&mut self, pkt: &Packet) -> u32 {
        let t = (self.radio.est_airtime_for(pkt.raw_length()) * 52 / 50) / 2;
        self.rng.next_in_range(0, 5) * t
    }

    /// One cooperative tick: serve a received frame, then the transmitter
    pub fn loop_once<A: MeshApp>(&mut self, app: &mut A) {
        let now = self.clock.millis();

        let mut raw = [0u8; MAX_TRANS_UNIT];
        let len = self.radio.recv_raw(&mut raw);
        if len > 0 {
            match Packet::read_from(&raw[..len]) {
                Ok(mut pkt) => {
                    pkt.rx_snr_x4 = self.radio.last_snr().saturating_mul(4);
                    pkt.rx_rssi = self.radio.last_rssi();
                    self.dispatcher.stats.recv_ok += 1;
                    let action = self.process_received(app, &mut pkt);
                    if let DispatcherAction::RetransmitDelayed { priority, delay_ms } = action {
                        if self.dispatcher.send(&pkt, priority, delay_ms, now).is_err() {
                            log_warn!(self.log, now, "dispatch", "pool exhausted, forward dropped");
                        }
                    }
                }
                Err(_) => {
                    self.dispatcher.stats.recv_malformed += 1;
                    log_debug!(self.log, now, "codec", "malformed frame ({len} bytes)");
                }
            }
        }

        self.dispatcher
            .transmit_tick(&mut self.radio, &mut self.rng, now);
    }

    // =========================================================================
    // Classification
    // =========================================================================

    /// Classify one received packet and fire the appropriate callbacks.
    ///
    /// Public so the upper layer can re-inject a locally constructed
    /// packet as if it had arrived over the radio (contact import).
    pub fn process_received<A: MeshApp>(
        &mut self,
        app: &mut A,
        pkt: &mut Packet,
    ) -> DispatcherAction {
        let now = self.clock.millis();
        let ptype = pkt.payload_type();

        // TRACE, direct: either the end of its path, or our hop to stamp
        if pkt.is_route_direct() && ptype == Some(PayloadType::Trace) {
            if (pkt.path_len as usize) + 1 < MAX_PATH_SIZE && pkt.payload_len >= 9 {
                let p = &pkt.payload;
                let trace_tag = u32::from_le_bytes([p[0], p[1], p[2], p[3]]);
                let auth_code = u32::from_le_bytes([p[4], p[5], p[6], p[7]]);
                let flags = p[8];
                let path_sz = flags & TRACE_PATH_SIZE_MASK; // hash size = 2^path_sz
                let hash_len = 1usize << path_sz;

                let len = pkt.payload_len as usize - 9;
                let offset = (pkt.path_len as usize) << path_sz;
                if offset >= len {
                    // reached the end of the given path
                    app.on_trace_recv(
                        pkt,
                        trace_tag,
                        auth_code,
                        flags,
                        &pkt.path[..pkt.path_len as usize],
                        &pkt.payload[9..9 + len],
                    );
                } else if offset + hash_len <= len
                    && self
                        .self_id
                        .is_hash_match(&pkt.payload[9 + offset..9 + offset + hash_len])
                    && app.allow_packet_forward(pkt)
                    && !self.tables.has_seen(pkt, now)
                {
                    // stamp our SNR (not a hash!) and pass it along
                    pkt.path[pkt.path_len as usize] = pkt.rx_snr_x4 as u8;
                    pkt.path_len += 1;
                    return DispatcherAction::RetransmitDelayed {
                        priority: 5,
                        delay_ms: self.direct_retx_delay_ms,
                    };
                }
            }
            return DispatcherAction::Release;
        }

        // CONTROL with the high payload bit: zero-hop only
        if pkt.is_route_direct()
            && ptype == Some(PayloadType::Control)
            && pkt.payload_len >= 1
            && (pkt.payload[0] & 0x80) != 0
        {
            if pkt.path_hash_count() == 0 {
                app.on_control_recv(pkt);
                return DispatcherAction::Deliver;
            }
            return DispatcherAction::Release;
        }

        // DIRECT with a hop list: are we the next hop?
        if pkt.is_route_direct() && pkt.path_hash_count() > 0 {
            // early-received ACK: deliver even when it isn't for us to relay
            if ptype == Some(PayloadType::Ack) && pkt.payload_len >= 4 {
                let crc = u32::from_le_bytes([
                    pkt.payload[0],
                    pkt.payload[1],
                    pkt.payload[2],
                    pkt.payload[3],
                ]);
                app.on_ack_recv(pkt, crc);
            }

            let hs = pkt.path_hash_size();
            if self.self_id.is_hash_match(&pkt.path[..hs]) && app.allow_packet_forward(pkt) {
                if ptype == Some(PayloadType::Multipart) {
                    return self.forward_multipart_direct(app, pkt, now);
                }
                if ptype == Some(PayloadType::Ack) {
                    if !self.tables.has_seen(pkt, now) {
                        Self::remove_self_from_path(pkt);
                        self.route_direct_recv_acks(app, pkt, 0, now);
                    }
                    return DispatcherAction::Release;
                }

                if !self.tables.has_seen(pkt, now) {
                    Self::remove_self_from_path(pkt);
                    // routed traffic is highest priority
                    return DispatcherAction::RetransmitDelayed {
                        priority: 0,
                        delay_ms: self.direct_retx_delay_ms,
                    };
                }
            }
            // not the next hop, or already forwarded
            return DispatcherAction::Release;
        }

        // region scoping for transport floods
        if pkt.is_route_flood() && app.filter_recv_flood(pkt) {
            return DispatcherAction::Release;
        }

        // payload dispatch (flood, or zero-hop direct)
        let mut action = DispatcherAction::Release;
        match ptype {
            Some(PayloadType::Ack) => {
                if pkt.payload_len >= 4 && !self.tables.has_seen(pkt, now) {
                    let crc = u32::from_le_bytes([
                        pkt.payload[0],
                        pkt.payload[1],
                        pkt.payload[2],
                        pkt.payload[3],
                    ]);
                    app.on_ack_recv(pkt, crc);
                    action = self.route_recv_packet(app, pkt, now);
                }
            }

            Some(
                t @ (PayloadType::Path
                | PayloadType::Req
                | PayloadType::Response
                | PayloadType::TxtMsg),
            ) => {
                if 2 + CIPHER_MAC_SIZE >= pkt.payload_len as usize {
                    // incomplete data packet
                } else if !self.tables.has_seen(pkt, now) {
                    let dest_hash = pkt.payload[0];
                    let src_hash = pkt.payload[1];
                    if self.self_id.is_hash_match(&[dest_hash]) {
                        let found = self.try_peer_decrypt(app, pkt, t, dest_hash, src_hash);
                        if found {
                            // packet was for this node; don't re-flood it
                            pkt.mark_do_not_retransmit();
                        }
                    }
                    action = self.route_recv_packet(app, pkt, now);
                }
            }

            Some(PayloadType::AnonReq) => {
                let hdr = 1 + PUB_KEY_SIZE;
                if hdr + CIPHER_MAC_SIZE >= pkt.payload_len as usize {
                    // incomplete data packet
                } else if !self.tables.has_seen(pkt, now) {
                    let dest_hash = pkt.payload[0];
                    if self.self_id.is_hash_match(&[dest_hash]) {
                        if let Some(sender) = Identity::from_slice(&pkt.payload[1..hdr]) {
                            if let Some(secret) = app.ecdh_shared_secret(&sender) {
                                let aad = anon_aad(pkt.header, dest_hash);
                                let mut data = [0u8; MAX_PACKET_PAYLOAD];
                                let n = open_envelope(
                                    &secret,
                                    &mut data,
                                    &pkt.payload[hdr..pkt.payload_len as usize],
                                    &aad,
                                    dest_hash,
                                    sender.node_hash(),
                                );
                                if n > 0 {
                                    app.on_anon_data_recv(pkt, &secret, &sender, &data[..n]);
                                    pkt.mark_do_not_retransmit();
                                }
                            }
                        }
                    }
                    action = self.route_recv_packet(app, pkt, now);
                }
            }

            Some(t @ (PayloadType::GrpData | PayloadType::GrpTxt)) => {
                if 1 + CIPHER_MAC_SIZE >= pkt.payload_len as usize {
                    // incomplete data packet
                } else if !self.tables.has_seen(pkt, now) {
                    let channel_hash = pkt.payload[0];
                    let mut channels =
                        [GroupChannel { secret: [0; 32], hash: 0 }; MAX_HASH_MATCHES];
                    let num = app.search_channels_by_hash(channel_hash, &mut channels);
                    let aad = group_aad(pkt.header, channel_hash);
                    let mut data = [0u8; MAX_PACKET_PAYLOAD];
                    for channel in &channels[..num] {
                        let n = open_envelope(
                            &channel.secret,
                            &mut data,
                            &pkt.payload[1..pkt.payload_len as usize],
                            &aad,
                            channel_hash,
                            0,
                        );
                        if n > 0 {
                            app.on_group_data_recv(pkt, t, channel, &data[..n]);
                            break;
                        }
                    }
                    action = self.route_recv_packet(app, pkt, now);
                }
            }

            Some(PayloadType::Advert) => {
                action = self.process_advert(app, pkt, now);
            }

            Some(PayloadType::Multipart) => {
                if pkt.payload_len > 2 {
                    let inner_type = pkt.payload[0] & 0x0F;
                    if inner_type == PayloadType::Ack as u8 && pkt.payload_len >= 5 {
                        // synthesize the wrapped ACK without the wrapper byte
                        let mut tmp = Packet::new();
                        tmp.header = pkt.header;
                        tmp.path_len = Packet::copy_path(&mut tmp.path, &pkt.path, pkt.path_len);
                        tmp.payload_len = pkt.payload_len - 1;
                        tmp.payload[..tmp.payload_len as usize]
                            .copy_from_slice(&pkt.payload[1..pkt.payload_len as usize]);

                        if !self.tables.has_seen(&tmp, now) {
                            let crc = u32::from_le_bytes([
                                tmp.payload[0],
                                tmp.payload[1],
                                tmp.payload[2],
                                tmp.payload[3],
                            ]);
                            app.on_ack_recv(&mut tmp, crc);
                            // multipart ACKs are never sent flood; no forward
                        }
                    }
                }
            }

            Some(PayloadType::RawCustom) => {
                if pkt.is_route_direct() && !self.tables.has_seen(pkt, now) {
                    app.on_raw_data_recv(pkt);
                    // never flood-routed
                }
            }

            _ => {
                // unknown payload types are dropped, not forwarded
            }
        }
        action
    }

    fn process_advert<A: MeshApp>(
        &mut self,
        app: &mut A,
        pkt: &mut Packet,
        now: u32,
    ) -> DispatcherAction {
        let fixed = PUB_KEY_SIZE + 4 + SIGNATURE_SIZE;
        if fixed > pkt.payload_len as usize {
            return DispatcherAction::Release; // incomplete advertisement
        }
        let Some(id) = Identity::from_slice(&pkt.payload[..PUB_KEY_SIZE]) else {
            return DispatcherAction::Release;
        };
        if self.self_id.matches(&id.pub_key) {
            return DispatcherAction::Release; // our own advert echoed back
        }
        if self.tables.has_seen(pkt, now) {
            return DispatcherAction::Release;
        }

        let timestamp = u32::from_le_bytes([
            pkt.payload[PUB_KEY_SIZE],
            pkt.payload[PUB_KEY_SIZE + 1],
            pkt.payload[PUB_KEY_SIZE + 2],
            pkt.payload[PUB_KEY_SIZE + 3],
        ]);
        let mut signature = [0u8; SIGNATURE_SIZE];
        signature.copy_from_slice(&pkt.payload[PUB_KEY_SIZE + 4..fixed]);

        let app_data_len = (pkt.payload_len as usize - fixed).min(MAX_ADVERT_DATA_SIZE);
        let app_data_off = fixed;

        // signature covers pub_key || timestamp || app_data
        let mut message = [0u8; PUB_KEY_SIZE + 4 + MAX_ADVERT_DATA_SIZE];
        message[..PUB_KEY_SIZE + 4].copy_from_slice(&pkt.payload[..PUB_KEY_SIZE + 4]);
        message[PUB_KEY_SIZE + 4..PUB_KEY_SIZE + 4 + app_data_len]
            .copy_from_slice(&pkt.payload[app_data_off..app_data_off + app_data_len]);

        if !id.verify(&signature, &message[..PUB_KEY_SIZE + 4 + app_data_len]) {
            log_warn!(self.log, now, "routing", "advert with forged signature");
            return DispatcherAction::Release;
        }

        app.on_advert_recv(
            pkt,
            &id,
            timestamp,
            &pkt.payload[app_data_off..app_data_off + app_data_len],
        );
        self.route_recv_packet(app, pkt, now)
    }

    fn try_peer_decrypt<A: MeshApp>(
        &mut self,
        app: &mut A,
        pkt: &Packet,
        ptype: PayloadType,
        dest_hash: u8,
        src_hash: u8,
    ) -> bool {
        let num = app.search_peers_by_hash(src_hash);
        let aad = peer_aad(pkt.header, dest_hash, src_hash);
        let mut data = [0u8; MAX_PACKET_PAYLOAD];

        for j in 0..num {
            // candidate order: current session key, previous session key
            // (dual-decode window), then the static ECDH secret
            if let Some(key) = app.peer_session_key(j) {
                let n = open_envelope(
                    &key,
                    &mut data,
                    &pkt.payload[2..pkt.payload_len as usize],
                    &aad,
                    dest_hash,
                    src_hash,
                );
                if n > 0 {
                    app.on_session_key_decrypt_success(j);
                    self.deliver_peer(app, pkt, ptype, j, src_hash, &data[..n]);
                    return true;
                }
            }
            if let Some(key) = app.peer_prev_session_key(j) {
                let n = open_envelope(
                    &key,
                    &mut data,
                    &pkt.payload[2..pkt.payload_len as usize],
                    &aad,
                    dest_hash,
                    src_hash,
                );
                if n > 0 {
                    self.deliver_peer(app, pkt, ptype, j, src_hash, &data[..n]);
                    return true;
                }
            }
            let key = app.peer_static_secret(j);
            let n = open_envelope(
                &key,
                &mut data,
                &pkt.payload[2..pkt.payload_len as usize],
                &aad,
                dest_hash,
                src_hash,
            );
            if n > 0 {
                self.deliver_peer(app, pkt, ptype, j, src_hash, &data[..n]);
                return true;
            }
        }
        false
    }

    fn deliver_peer<A: MeshApp>(
        &mut self,
        app: &mut A,
        pkt: &Packet,
        ptype: PayloadType,
        peer_idx: usize,
        src_hash: u8,
        data: &[u8],
    ) {
        if ptype != PayloadType::Path {
            app.on_peer_data_recv(pkt, ptype, peer_idx, data);
            return;
        }

        // PATH payload: [path_len][path bytes][extra_type][extra...]
        if data.is_empty() {
            return;
        }
        let out_path_len = data[0];
        let hash_size = ((out_path_len >> 6) + 1) as usize;
        let hash_count = (out_path_len & 63) as usize;
        let path_bytes = hash_size * hash_count;
        if 1 + path_bytes + 1 > data.len() {
            return;
        }
        let out_path = &data[1..1 + path_bytes];
        let extra_type = data[1 + path_bytes] & 0x0F; // upper bits reserved
        let extra = &data[1 + path_bytes + 1..];

        let wants_reciprocal =
            app.on_peer_path_recv(pkt, peer_idx, out_path, out_path_len, extra_type, extra);

        if wants_reciprocal && pkt.is_route_flood() {
            // teach the sender the path to here, but send it DIRECTLY
            // along the path we just learned
            let key = app.peer_encryption_key(peer_idx);
            let nonce = app.peer_encryption_nonce(peer_idx);
            let in_path = &pkt.path[..pkt.path_byte_len()];
            if let Ok(rpath) =
                self.create_path_return(src_hash, &key, in_path, pkt.path_len, 0, &[], nonce)
            {
                let _ = self.send_direct(rpath, out_path, out_path_len, 500);
            }
        }
    }

    // =========================================================================
    // Forwarding rules
    // =========================================================================

    /// Strip this node's hash from the head of a direct packet's path
    pub fn remove_self_from_path(pkt: &mut Packet) {
        let count = pkt.path_hash_count();
        debug_assert!(count > 0);
        let sz = pkt.path_hash_size();
        pkt.set_path_hash_count((count - 1) as u8);
        pkt.path.copy_within(sz..count * sz, 0);
    }

    /// The flood forwarding rule: append our hash, bump the count,
    /// re-emit with priority = hop distance (closer sources first).
    fn route_recv_packet<A: MeshApp>(
        &mut self,
        app: &mut A,
        pkt: &mut Packet,
        _now: u32,
    ) -> DispatcherAction {
        let n = pkt.path_hash_count();
        let hs = pkt.path_hash_size();
        // the count field holds 6 bits, so 63 hops is the ceiling even at
        // hash size 1
        if pkt.is_route_flood()
            && !pkt.is_marked_do_not_retransmit()
            && n < 63
            && (n + 1) * hs <= MAX_PATH_SIZE
            && app.allow_packet_forward(pkt)
        {
            self.self_id.copy_hash_to(&mut pkt.path[n * hs..(n + 1) * hs]);
            pkt.set_path_hash_count((n + 1) as u8);

            let delay = self.flood_retransmit_delay(pkt);
            return DispatcherAction::RetransmitDelayed {
                priority: pkt.path_hash_count() as u8,
                delay_ms: delay,
            };
        }
        DispatcherAction::Release
    }

    fn forward_multipart_direct<A: MeshApp>(
        &mut self,
        app: &mut A,
        pkt: &Packet,
        now: u32,
    ) -> DispatcherAction {
        let remaining = pkt.payload[0] >> 4;
        let inner_type = pkt.payload[0] & 0x0F;

        if inner_type == PayloadType::Ack as u8 && pkt.payload_len >= 5 {
            let mut tmp = Packet::new();
            tmp.header = pkt.header;
            tmp.path_len = Packet::copy_path(&mut tmp.path, &pkt.path, pkt.path_len);
            tmp.payload_len = pkt.payload_len - 1;
            tmp.payload[..tmp.payload_len as usize]
                .copy_from_slice(&pkt.payload[1..pkt.payload_len as usize]);

            if !self.tables.has_seen(&tmp, now) {
                Self::remove_self_from_path(&mut tmp);
                // expect the remaining multipart ACKs ~300 ms apart (×2)
                self.route_direct_recv_acks(app, &tmp, (u32::from(remaining) + 1) * 300, now);
            }
        }
        DispatcherAction::Release
    }

    fn route_direct_recv_acks<A: MeshApp>(
        &mut self,
        app: &mut A,
        packet: &Packet,
        delay_ms: u32,
        now: u32,
    ) {
        if packet.is_marked_do_not_retransmit() || packet.payload_len < 4 {
            return;
        }
        let crc = u32::from_le_bytes([
            packet.payload[0],
            packet.payload[1],
            packet.payload[2],
            packet.payload[3],
        ]);

        let mut delay = delay_ms;
        let mut extra = app.extra_ack_transmit_count();
        while extra > 0 {
            delay += self.direct_retx_delay_ms + 300;
            if let Ok(mut a1) = self.create_multi_ack(crc, extra) {
                a1.path_len = Packet::copy_path(&mut a1.path, &packet.path, packet.path_len);
                a1.set_route(RouteKind::Direct);
                let _ = self.dispatcher.send(&a1, 0, delay, now);
            }
            extra -= 1;
        }

        if let Ok(mut a2) = self.create_ack(crc) {
            a2.path_len = Packet::copy_path(&mut a2.path, &packet.path, packet.path_len);
            a2.set_route(RouteKind::Direct);
            let _ = self.dispatcher.send(&a2, 0, delay, now);
        }
    }

    // =========================================================================
    // Packet construction
    // =========================================================================

    /// Compose a signed self-advert
    ///
    /// # Errors
    ///
    /// `Error::InvalidParameter` when `app_data` exceeds 32 bytes.
    pub fn create_advert(
        &mut self,
        id: &LocalIdentity,
        timestamp: u32,
        app_data: &[u8],
    ) -> Result<Packet> {
        if app_data.len() > MAX_ADVERT_DATA_SIZE {
            return Err(Error::InvalidParameter);
        }
        let mut pkt = Packet::with_type(PayloadType::Advert);

        let mut len = 0;
        pkt.payload[..PUB_KEY_SIZE].copy_from_slice(&id.id.pub_key);
        len += PUB_KEY_SIZE;
        pkt.payload[len..len + 4].copy_from_slice(&timestamp.to_le_bytes());
        len += 4;
        let sig_off = len;
        len += SIGNATURE_SIZE;
        pkt.payload[len..len + app_data.len()].copy_from_slice(app_data);
        len += app_data.len();

        let mut message = [0u8; PUB_KEY_SIZE + 4 + MAX_ADVERT_DATA_SIZE];
        let msg_len = PUB_KEY_SIZE + 4 + app_data.len();
        message[..PUB_KEY_SIZE].copy_from_slice(&id.id.pub_key);
        message[PUB_KEY_SIZE..PUB_KEY_SIZE + 4].copy_from_slice(&timestamp.to_le_bytes());
        message[PUB_KEY_SIZE + 4..msg_len].copy_from_slice(app_data);
        let signature = id.sign(&message[..msg_len]);
        pkt.payload[sig_off..sig_off + SIGNATURE_SIZE].copy_from_slice(&signature);

        pkt.payload_len = len as u8;
        Ok(pkt)
    }

    /// Compose a PATH return teaching `dest_hash` the route in
    /// `path`/`path_len`, optionally piggybacking an ACK or RESPONSE.
    ///
    /// # Errors
    ///
    /// `Error::InvalidParameter` when path + extra exceed the payload.
    pub fn create_path_return(
        &mut self,
        dest_hash: u8,
        secret: &[u8; 32],
        path: &[u8],
        path_len: u8,
        extra_type: u8,
        extra: &[u8],
        nonce: u16,
    ) -> Result<Packet> {
        let hash_size = ((path_len >> 6) + 1) as usize;
        let hash_count = (path_len & 63) as usize;
        let path_bytes = hash_size * hash_count;
        if path_bytes > path.len() || path_bytes + extra.len() + 5 > MAX_COMBINED_PATH {
            return Err(Error::InvalidParameter);
        }

        let mut pkt = Packet::with_type(PayloadType::Path);
        let src_hash = self.self_id.node_hash();
        pkt.payload[0] = dest_hash;
        pkt.payload[1] = src_hash;

        let mut data = [0u8; MAX_PACKET_PAYLOAD];
        let mut data_len = 0;
        data[data_len] = path_len;
        data_len += 1;
        data[data_len..data_len + path_bytes].copy_from_slice(&path[..path_bytes]);
        data_len += path_bytes;
        if !extra.is_empty() {
            data[data_len] = extra_type;
            data_len += 1;
            data[data_len..data_len + extra.len()].copy_from_slice(extra);
            data_len += extra.len();
        } else {
            // random blob so the packet hash stays unique per emission
            data[data_len] = 0xFF; // dummy payload type
            data_len += 1;
            let _ = self.rng.fill_bytes(&mut data[data_len..data_len + 4]);
            data_len += 4;
        }

        let aad = peer_aad(pkt.header, dest_hash, src_hash);
        let n = seal_envelope(
            secret,
            &mut pkt.payload[2..],
            &data[..data_len],
            &aad,
            nonce,
            dest_hash,
            src_hash,
        )?;
        pkt.payload_len = (2 + n) as u8;
        Ok(pkt)
    }

    /// Compose an encrypted datagram (TXT_MSG / REQ / RESPONSE)
    ///
    /// # Errors
    ///
    /// `Error::InvalidParameter` for other payload types or oversized data.
    pub fn create_datagram(
        &mut self,
        payload_type: PayloadType,
        dest: &Identity,
        secret: &[u8; 32],
        data: &[u8],
        nonce: u16,
    ) -> Result<Packet> {
        if !matches!(
            payload_type,
            PayloadType::TxtMsg | PayloadType::Req | PayloadType::Response
        ) {
            return Err(Error::InvalidParameter);
        }
        if data.len() + CIPHER_MAC_SIZE + CIPHER_BLOCK_SIZE - 1 > MAX_PACKET_PAYLOAD {
            return Err(Error::InvalidParameter);
        }

        let mut pkt = Packet::with_type(payload_type);
        let dest_hash = dest.node_hash();
        let src_hash = self.self_id.node_hash();
        pkt.payload[0] = dest_hash;
        pkt.payload[1] = src_hash;

        let aad = peer_aad(pkt.header, dest_hash, src_hash);
        let n = seal_envelope(
            secret,
            &mut pkt.payload[2..],
            data,
            &aad,
            nonce,
            dest_hash,
            src_hash,
        )?;
        pkt.payload_len = (2 + n) as u8;
        Ok(pkt)
    }

    /// Compose an anonymous request carrying the sender's full key
    ///
    /// # Errors
    ///
    /// `Error::InvalidParameter` on oversized data.
    pub fn create_anon_datagram(
        &mut self,
        sender: &LocalIdentity,
        dest: &Identity,
        secret: &[u8; 32],
        data: &[u8],
        nonce: u16,
    ) -> Result<Packet> {
        if data.len() + 1 + PUB_KEY_SIZE + CIPHER_BLOCK_SIZE - 1 > MAX_PACKET_PAYLOAD {
            return Err(Error::InvalidParameter);
        }

        let mut pkt = Packet::with_type(PayloadType::AnonReq);
        let dest_hash = dest.node_hash();
        let src_hash = sender.id.node_hash();
        pkt.payload[0] = dest_hash;
        pkt.payload[1..1 + PUB_KEY_SIZE].copy_from_slice(&sender.id.pub_key);

        let aad = anon_aad(pkt.header, dest_hash);
        let n = seal_envelope(
            secret,
            &mut pkt.payload[1 + PUB_KEY_SIZE..],
            data,
            &aad,
            nonce,
            dest_hash,
            src_hash,
        )?;
        pkt.payload_len = (1 + PUB_KEY_SIZE + n) as u8;
        Ok(pkt)
    }

    /// Compose a group datagram under a channel's pre-shared key
    ///
    /// # Errors
    ///
    /// `Error::InvalidParameter` for other types or oversized data.
    pub fn create_group_datagram(
        &mut self,
        payload_type: PayloadType,
        channel: &GroupChannel,
        data: &[u8],
        nonce: u16,
    ) -> Result<Packet> {
        if !matches!(payload_type, PayloadType::GrpTxt | PayloadType::GrpData) {
            return Err(Error::InvalidParameter);
        }
        if data.len() + 1 + CIPHER_BLOCK_SIZE - 1 > MAX_PACKET_PAYLOAD {
            return Err(Error::InvalidParameter);
        }

        let mut pkt = Packet::with_type(payload_type);
        pkt.payload[0] = channel.hash;

        let aad = group_aad(pkt.header, channel.hash);
        let n = seal_envelope(
            &channel.secret,
            &mut pkt.payload[1..],
            data,
            &aad,
            nonce,
            channel.hash,
            0,
        )?;
        pkt.payload_len = (1 + n) as u8;
        Ok(pkt)
    }

    /// Compose a bare 4-byte ACK
    ///
    /// # Errors
    ///
    /// Infallible in practice; kept fallible for pool-style call sites.
    pub fn create_ack(&mut self, ack_crc: u32) -> Result<Packet> {
        let mut pkt = Packet::with_type(PayloadType::Ack);
        pkt.payload[..4].copy_from_slice(&ack_crc.to_le_bytes());
        pkt.payload_len = 4;
        Ok(pkt)
    }

    /// Compose a multipart-wrapped ACK with a remaining count
    ///
    /// # Errors
    ///
    /// Infallible in practice; kept fallible for pool-style call sites.
    pub fn create_multi_ack(&mut self, ack_crc: u32, remaining: u8) -> Result<Packet> {
        let mut pkt = Packet::with_type(PayloadType::Multipart);
        pkt.payload[0] = (remaining << 4) | PayloadType::Ack as u8;
        pkt.payload[1..5].copy_from_slice(&ack_crc.to_le_bytes());
        pkt.payload_len = 5;
        Ok(pkt)
    }

    /// Compose a TRACE; the hop list is appended at send time
    ///
    /// # Errors
    ///
    /// Infallible in practice; kept fallible for pool-style call sites.
    pub fn create_trace(&mut self, tag: u32, auth_code: u32, flags: u8) -> Result<Packet> {
        let mut pkt = Packet::with_type(PayloadType::Trace);
        pkt.payload[..4].copy_from_slice(&tag.to_le_bytes());
        pkt.payload[4..8].copy_from_slice(&auth_code.to_le_bytes());
        pkt.payload[8] = flags;
        pkt.payload_len = 9;
        Ok(pkt)
    }

    /// Compose a control frame
    ///
    /// # Errors
    ///
    /// `Error::InvalidParameter` on oversized data.
    pub fn create_control(&mut self, data: &[u8]) -> Result<Packet> {
        if data.len() > MAX_PACKET_PAYLOAD {
            return Err(Error::InvalidParameter);
        }
        let mut pkt = Packet::with_type(PayloadType::Control);
        pkt.payload[..data.len()].copy_from_slice(data);
        pkt.payload_len = data.len() as u8;
        Ok(pkt)
    }

    /// Compose a raw custom frame
    ///
    /// # Errors
    ///
    /// `Error::InvalidParameter` on oversized data.
    pub fn create_raw(&mut self, data: &[u8]) -> Result<Packet> {
        if data.len() > MAX_PACKET_PAYLOAD {
            return Err(Error::InvalidParameter);
        }
        let mut pkt = Packet::with_type(PayloadType::RawCustom);
        pkt.payload[..data.len()].copy_from_slice(data);
        pkt.payload_len = data.len() as u8;
        Ok(pkt)
    }

    // =========================================================================
    // Senders
    // =========================================================================

    fn flood_priority(pkt: &Packet) -> u8 {
        match pkt.payload_type() {
            Some(PayloadType::Path) => 2,
            Some(PayloadType::Advert) => 3, // de-prioritize adverts
            _ => 1,
        }
    }

    /// Flood a packet with an empty accumulated path
    ///
    /// # Errors
    ///
    /// `Error::InvalidParameter` for TRACE packets or a bad hash size,
    /// `Error::PoolExhausted` when the pool or queue is full.
    pub fn send_flood(&mut self, pkt: Packet, delay_ms: u32) -> Result<()> {
        self.send_flood_sized(pkt, delay_ms, 1)
    }

    /// Flood with an explicit path-hash size (1..=3)
    ///
    /// # Errors
    ///
    /// See [`Mesh::send_flood`].
    pub fn send_flood_sized(&mut self, mut pkt: Packet, delay_ms: u32, hash_size: u8) -> Result<()> {
        if pkt.payload_type() == Some(PayloadType::Trace) {
            return Err(Error::InvalidParameter); // TRACE rides direct only
        }
        if hash_size == 0 || hash_size > 3 {
            return Err(Error::InvalidParameter);
        }
        pkt.set_route(RouteKind::Flood);
        pkt.set_path_hash_size_and_count(hash_size, 0);

        let now = self.clock.millis();
        // mark as already seen in case it is rebroadcast back to us
        self.tables.has_seen(&pkt, now);
        let pri = Self::flood_priority(&pkt);
        self.dispatcher.send(&pkt, pri, delay_ms, now)
    }

    /// Flood scoped by transport codes
    ///
    /// # Errors
    ///
    /// See [`Mesh::send_flood`].
    pub fn send_flood_scoped(
        &mut self,
        mut pkt: Packet,
        transport_codes: [u16; 2],
        delay_ms: u32,
    ) -> Result<()> {
        if pkt.payload_type() == Some(PayloadType::Trace) {
            return Err(Error::InvalidParameter);
        }
        pkt.set_route(RouteKind::TransportFlood);
        pkt.transport_codes = transport_codes;
        pkt.set_path_hash_size_and_count(1, 0);

        let now = self.clock.millis();
        self.tables.has_seen(&pkt, now);
        let pri = Self::flood_priority(&pkt);
        self.dispatcher.send(&pkt, pri, delay_ms, now)
    }

    /// Send along an explicit hop list.
    ///
    /// TRACE packets are special: their planned path rides at the end of
    /// the payload (the wire path accumulates SNRs instead), and may be
    /// longer than 64 bytes.
    ///
    /// # Errors
    ///
    /// `Error::PoolExhausted` when the pool or queue is full.
    pub fn send_direct(&mut self, mut pkt: Packet, path: &[u8], path_len: u8, delay_ms: u32) -> Result<()> {
        pkt.set_route(RouteKind::Direct);

        let pri;
        if pkt.payload_type() == Some(PayloadType::Trace) {
            let n = pkt.payload_len as usize;
            let add = (path_len as usize).min(MAX_PACKET_PAYLOAD - n).min(path.len());
            pkt.payload[n..n + add].copy_from_slice(&path[..add]);
            pkt.payload_len = (n + add) as u8;
            pkt.path_len = 0;
            pri = 5;
        } else {
            pkt.path_len = Packet::copy_path(&mut pkt.path, path, path_len);
            pri = if pkt.payload_type() == Some(PayloadType::Path) {
                1
            } else {
                0
            };
        }

        let now = self.clock.millis();
        self.tables.has_seen(&pkt, now);
        self.dispatcher.send(&pkt, pri, delay_ms, now)
    }

    /// Send to immediate neighbors only (empty path)
    ///
    /// # Errors
    ///
    /// `Error::PoolExhausted` when the pool or queue is full.
    pub fn send_zero_hop(&mut self, mut pkt: Packet, delay_ms: u32) -> Result<()> {
        pkt.set_route(RouteKind::Direct);
        pkt.path_len = 0;

        let now = self.clock.millis();
        self.tables.has_seen(&pkt, now);
        self.dispatcher.send(&pkt, 0, delay_ms, now)
    }

    /// Zero-hop with transport codes (`[0, 0]` = "send this nowhere")
    ///
    /// # Errors
    ///
    /// `Error::PoolExhausted` when the pool or queue is full.
    pub fn send_zero_hop_scoped(
        &mut self,
        mut pkt: Packet,
        transport_codes: [u16; 2],
        delay_ms: u32,
    ) -> Result<()> {
        pkt.set_route(RouteKind::TransportDirect);
        pkt.transport_codes = transport_codes;
        pkt.path_len = 0;

        let now = self.clock.millis();
        self.tables.has_seen(&pkt, now);
        self.dispatcher.send(&pkt, 0, delay_ms, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PH_TYPE_SHIFT;
    use lm_crypto::rng::XorShiftRng;

    struct NullRadio;
    impl Radio for NullRadio {
        fn start_send_raw(&mut self, _bytes: &[u8]) -> Result<()> {
            Ok(())
        }
        fn is_send_complete(&self) -> bool {
            true
        }
        fn on_send_finished(&mut self) {}
        fn recv_raw(&mut self, _buf: &mut [u8]) -> usize {
            0
        }
        fn is_receiving(&self) -> bool {
            false
        }
        fn est_airtime_for(&self, len: usize) -> u32 {
            (len as u32) * 8
        }
        fn noise_floor(&self) -> i16 {
            -120
        }
        fn last_rssi(&self) -> i16 {
            -80
        }
        fn last_snr(&self) -> i8 {
            10
        }
        fn current_rssi(&self) -> i16 {
            -110
        }
        fn set_params(&mut self, _f: f32, _b: f32, _sf: u8, _cr: u8) -> Result<()> {
            Ok(())
        }
        fn set_tx_power(&mut self, _dbm: i8) -> Result<()> {
            Ok(())
        }
        fn reset_agc(&mut self) {}
    }

    struct Clock(u32);
    impl MillisClock for Clock {
        fn millis(&self) -> u32 {
            self.0
        }
    }

    struct ForwardingApp;
    impl MeshApp for ForwardingApp {
        fn allow_packet_forward(&mut self, _pkt: &Packet) -> bool {
            true
        }
    }

    fn make_mesh() -> (Mesh<NullRadio, XorShiftRng, Clock>, LocalIdentity) {
        let mut rng = XorShiftRng::new(77);
        let id = LocalIdentity::generate(&mut rng).unwrap();
        let mesh = Mesh::new(NullRadio, XorShiftRng::new(78), Clock(1000), id.id);
        (mesh, id)
    }

    #[test]
    fn test_remove_self_from_path() {
        let mut pkt = Packet::new();
        pkt.set_path_hash_size_and_count(1, 3);
        pkt.path[..3].copy_from_slice(&[0x10, 0x20, 0x30]);

        Mesh::<NullRadio, XorShiftRng, Clock>::remove_self_from_path(&mut pkt);
        assert_eq!(pkt.path_hash_count(), 2);
        assert_eq!(&pkt.path[..2], &[0x20, 0x30]);
    }

    #[test]
    fn test_direct_next_hop_forwarding() {
        let (mut mesh, _id) = make_mesh();
        let mut app = ForwardingApp;

        let mut pkt = Packet::with_type(PayloadType::TxtMsg);
        pkt.set_route(RouteKind::Direct);
        pkt.set_path_hash_size_and_count(1, 2);
        pkt.path[0] = mesh.self_id.node_hash();
        pkt.path[1] = 0x42;
        pkt.payload[..8].fill(7);
        pkt.payload_len = 8;

        let action = mesh.process_received(&mut app, &mut pkt);
        assert_eq!(
            action,
            DispatcherAction::RetransmitDelayed {
                priority: 0,
                delay_ms: 0
            }
        );
        assert_eq!(pkt.path_hash_count(), 1);
        assert_eq!(pkt.path[0], 0x42);
    }

    #[test]
    fn test_direct_not_next_hop_released() {
        let (mut mesh, _id) = make_mesh();
        let mut app = ForwardingApp;

        let mut pkt = Packet::with_type(PayloadType::TxtMsg);
        pkt.set_route(RouteKind::Direct);
        pkt.set_path_hash_size_and_count(1, 1);
        pkt.path[0] = mesh.self_id.node_hash().wrapping_add(1);
        pkt.payload[..8].fill(7);
        pkt.payload_len = 8;

        assert_eq!(
            mesh.process_received(&mut app, &mut pkt),
            DispatcherAction::Release
        );
    }

    #[test]
    fn test_flood_hop_bound() {
        let (mut mesh, _id) = make_mesh();
        let mut app = ForwardingApp;

        // 62 hops: room to append one more
        let mut pkt = Packet::with_type(PayloadType::Advert);
        pkt.set_route(RouteKind::Flood);
        pkt.set_path_hash_size_and_count(1, 62);
        let action = mesh.route_recv_packet(&mut app, &mut pkt, 0);
        assert!(matches!(action, DispatcherAction::RetransmitDelayed { priority: 63, .. }));

        // 63 hops: the count field is saturated, refuse to append
        let mut at_cap = Packet::with_type(PayloadType::Advert);
        at_cap.set_route(RouteKind::Flood);
        at_cap.set_path_hash_size_and_count(1, 63);
        assert_eq!(
            mesh.route_recv_packet(&mut app, &mut at_cap, 0),
            DispatcherAction::Release
        );

        // 32 hops at size 2: 64 path bytes, no room either
        let mut full = Packet::with_type(PayloadType::Advert);
        full.set_route(RouteKind::Flood);
        full.set_path_hash_size_and_count(2, 32);
        assert_eq!(
            mesh.route_recv_packet(&mut app, &mut full, 0),
            DispatcherAction::Release
        );
    }

    #[test]
    fn test_flood_append_sets_priority_to_hop_count() {
        let (mut mesh, _id) = make_mesh();
        let mut app = ForwardingApp;

        let mut pkt = Packet::with_type(PayloadType::TxtMsg);
        pkt.set_route(RouteKind::Flood);
        pkt.set_path_hash_size_and_count(1, 2);
        pkt.path[..2].copy_from_slice(&[1, 2]);

        let action = mesh.route_recv_packet(&mut app, &mut pkt, 0);
        assert!(matches!(action, DispatcherAction::RetransmitDelayed { priority: 3, .. }));
        assert_eq!(pkt.path[2], mesh.self_id.node_hash());
    }

    #[test]
    fn test_do_not_retransmit_stops_flood() {
        let (mut mesh, _id) = make_mesh();
        let mut app = ForwardingApp;

        let mut pkt = Packet::with_type(PayloadType::TxtMsg);
        pkt.set_route(RouteKind::Flood);
        pkt.mark_do_not_retransmit();
        assert_eq!(
            mesh.route_recv_packet(&mut app, &mut pkt, 0),
            DispatcherAction::Release
        );
    }

    #[test]
    fn test_zero_hop_control_delivery() {
        let (mut mesh, _id) = make_mesh();

        struct ControlApp {
            control_seen: bool,
        }
        impl MeshApp for ControlApp {
            fn on_control_recv(&mut self, _pkt: &Packet) {
                self.control_seen = true;
            }
        }
        let mut app = ControlApp {
            control_seen: false,
        };

        let mut pkt = mesh.create_control(&[0x80, 1, 2]).unwrap();
        pkt.set_route(RouteKind::Direct);
        assert_eq!(
            mesh.process_received(&mut app, &mut pkt),
            DispatcherAction::Deliver
        );
        assert!(app.control_seen);

        // with a non-empty path it is NOT delivered
        let mut app2 = ControlApp {
            control_seen: false,
        };
        let mut pkt2 = mesh.create_control(&[0x80, 1, 2]).unwrap();
        pkt2.set_route(RouteKind::Direct);
        pkt2.set_path_hash_size_and_count(1, 1);
        pkt2.path[0] = 9;
        assert_eq!(
            mesh.process_received(&mut app2, &mut pkt2),
            DispatcherAction::Release
        );
        assert!(!app2.control_seen);
    }

    #[test]
    fn test_unknown_payload_type_dropped() {
        let (mut mesh, _id) = make_mesh();
        let mut app = ForwardingApp;

        let mut pkt = Packet::new();
        pkt.header = 0x0C << PH_TYPE_SHIFT; // unassigned type
        pkt.set_route(RouteKind::Flood);
        pkt.payload_len = 4;
        assert_eq!(
            mesh.process_received(&mut app, &mut pkt),
            DispatcherAction::Release
        );
    }

    #[test]
    fn test_self_advert_dropped() {
        let (mut mesh, id) = make_mesh();

        struct CountingApp {
            adverts: u32,
        }
        impl MeshApp for CountingApp {
            fn on_advert_recv(&mut self, _p: &Packet, _i: &Identity, _t: u32, _d: &[u8]) {
                self.adverts += 1;
            }
        }
        let mut app = CountingApp { adverts: 0 };

        let mut pkt = mesh.create_advert(&id, 1, b"x").unwrap();
        pkt.set_route(RouteKind::Flood);
        assert_eq!(
            mesh.process_received(&mut app, &mut pkt),
            DispatcherAction::Release
        );
        assert_eq!(app.adverts, 0);
    }

    #[test]
    fn test_trace_appends_snr() {
        let (mut mesh, _id) = make_mesh();
        let mut app = ForwardingApp;

        let mut pkt = mesh.create_trace(0x11223344, 0xAABBCCDD, 0).unwrap();
        // planned path: us, then another node
        let hop_list = [mesh.self_id.node_hash(), 0x55];
        let n = pkt.payload_len as usize;
        pkt.payload[n..n + 2].copy_from_slice(&hop_list);
        pkt.payload_len += 2;
        pkt.set_route(RouteKind::Direct);
        pkt.path_len = 0;
        pkt.rx_snr_x4 = 24; // 6 dB

        let action = mesh.process_received(&mut app, &mut pkt);
        assert!(matches!(action, DispatcherAction::RetransmitDelayed { priority: 5, .. }));
        assert_eq!(pkt.path_len, 1);
        assert_eq!(pkt.path[0], 24);
    }

    #[test]
    fn test_trace_completion_delivery() {
        let (mut mesh, _id) = make_mesh();

        struct TraceApp {
            seen: Option<(u32, u32, u8)>,
        }
        impl MeshApp for TraceApp {
            fn on_trace_recv(
                &mut self,
                _pkt: &Packet,
                tag: u32,
                auth: u32,
                flags: u8,
                _snrs: &[u8],
                _extra: &[u8],
            ) {
                self.seen = Some((tag, auth, flags));
            }
        }
        let mut app = TraceApp { seen: None };

        let mut pkt = mesh.create_trace(7, 9, 0).unwrap();
        pkt.set_route(RouteKind::Direct);
        // no appended hop list: offset 0 >= len 0 -> complete
        pkt.path_len = 0;
        mesh.process_received(&mut app, &mut pkt);
        assert_eq!(app.seen, Some((7, 9, 0)));
    }
}
