// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! The KISS modem proper
//!
//! Port 0 commands carry data frames and the classic TNC parameters
//! (txdelay, p-persistence, slottime). `SETHARDWARE` multiplexes the
//! identity/crypto/radio sub-commands. Transmission runs the textbook
//! p-persistence CSMA state machine: wait for a clear channel, draw a
//! random byte, transmit if it is at or below the persistence setting,
//! otherwise wait one slot and re-check.

use crate::framing::{encode_frame, KissDeframer, KissFrame, KISS_MAX_FRAME_SIZE};
use heapless::Vec;
use lm_common::constants::{PUB_KEY_SIZE, SIGNATURE_SIZE};
use lm_common::time::{future_millis, millis_has_passed};
use lm_crypto::{cipher, hash, CryptoRng, Identity, LocalIdentity};
use lm_mesh::Radio;

/// Maximum radio packet size
pub const KISS_MAX_PACKET_SIZE: usize = 255;

/// Port 0 command: data frame for the radio
pub const KISS_CMD_DATA: u8 = 0x00;
/// Port 0 command: TX delay in 10 ms units
pub const KISS_CMD_TXDELAY: u8 = 0x01;
/// Port 0 command: p-persistence value
pub const KISS_CMD_PERSISTENCE: u8 = 0x02;
/// Port 0 command: slot time in 10 ms units
pub const KISS_CMD_SLOTTIME: u8 = 0x03;
/// Port 0 command: TX tail (accepted, unused with LoRa)
pub const KISS_CMD_TXTAIL: u8 = 0x04;
/// Port 0 command: full duplex flag
pub const KISS_CMD_FULLDUPLEX: u8 = 0x05;
/// Port 0 command: hardware sub-command escape
pub const KISS_CMD_SETHARDWARE: u8 = 0x06;
/// Port 0 command: leave KISS mode
pub const KISS_CMD_RETURN: u8 = 0xFF;

/// Default TX delay (10 ms units)
pub const KISS_DEFAULT_TXDELAY: u8 = 50;
/// Default persistence
pub const KISS_DEFAULT_PERSISTENCE: u8 = 63;
/// Default slot time (10 ms units)
pub const KISS_DEFAULT_SLOTTIME: u8 = 10;

/// Hardware sub-command: read the node's public key
pub const HW_CMD_GET_IDENTITY: u8 = 0x01;
/// Hardware sub-command: read random bytes
pub const HW_CMD_GET_RANDOM: u8 = 0x02;
/// Hardware sub-command: verify an Ed25519 signature
pub const HW_CMD_VERIFY_SIGNATURE: u8 = 0x03;
/// Hardware sub-command: sign with the node key
pub const HW_CMD_SIGN_DATA: u8 = 0x04;
/// Hardware sub-command: ECDH + legacy-envelope encrypt
pub const HW_CMD_ENCRYPT_DATA: u8 = 0x05;
/// Hardware sub-command: ECDH + legacy-envelope decrypt
pub const HW_CMD_DECRYPT_DATA: u8 = 0x06;
/// Hardware sub-command: X25519 key exchange
pub const HW_CMD_KEY_EXCHANGE: u8 = 0x07;
/// Hardware sub-command: SHA-256
pub const HW_CMD_HASH: u8 = 0x08;
/// Hardware sub-command: set radio parameters (10 bytes)
pub const HW_CMD_SET_RADIO: u8 = 0x09;
/// Hardware sub-command: set TX power
pub const HW_CMD_SET_TX_POWER: u8 = 0x0A;
/// Hardware sub-command: read radio parameters
pub const HW_CMD_GET_RADIO: u8 = 0x0B;
/// Hardware sub-command: read TX power
pub const HW_CMD_GET_TX_POWER: u8 = 0x0C;
/// Hardware sub-command: instantaneous RSSI
pub const HW_CMD_GET_CURRENT_RSSI: u8 = 0x0D;
/// Hardware sub-command: is the channel busy?
pub const HW_CMD_IS_CHANNEL_BUSY: u8 = 0x0E;
/// Hardware sub-command: airtime estimate for a length
pub const HW_CMD_GET_AIRTIME: u8 = 0x0F;
/// Hardware sub-command: noise floor
pub const HW_CMD_GET_NOISE_FLOOR: u8 = 0x10;
/// Hardware sub-command: firmware version
pub const HW_CMD_GET_VERSION: u8 = 0x11;
/// Hardware sub-command: frame statistics
pub const HW_CMD_GET_STATS: u8 = 0x12;
/// Hardware sub-command: enable/disable RX signal reports
pub const HW_CMD_SET_SIGNAL_REPORT: u8 = 0x19;

/// Response code for a sub-command
#[must_use]
pub const fn hw_resp(cmd: u8) -> u8 {
    cmd | 0x80
}

/// Generic OK response
pub const HW_RESP_OK: u8 = 0xF0;
/// Generic error response
pub const HW_RESP_ERROR: u8 = 0xF1;
/// Unsolicited: transmission finished
pub const HW_RESP_TX_DONE: u8 = 0xF8;
/// Unsolicited: RX metadata (snr, rssi)
pub const HW_RESP_RX_META: u8 = 0xF9;

/// Error detail: bad frame length
pub const HW_ERR_INVALID_LENGTH: u8 = 0x01;
/// Error detail: bad parameter
pub const HW_ERR_INVALID_PARAM: u8 = 0x02;
/// Error detail: MAC verification failed
pub const HW_ERR_MAC_FAILED: u8 = 0x04;
/// Error detail: unknown sub-command
pub const HW_ERR_UNKNOWN_CMD: u8 = 0x05;

/// Modem firmware version reported by GET_VERSION
pub const KISS_FIRMWARE_VERSION: u8 = 1;

/// Serial stream the modem talks over
pub trait SerialPort {
    /// Pop one received byte, if any
    fn read_byte(&mut self) -> Option<u8>;
    /// Write bytes out (assumed non-blocking/buffered by the host layer)
    fn write_bytes(&mut self, bytes: &[u8]);
}

/// Transmit state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Nothing to send
    Idle,
    /// Waiting for the channel to clear
    WaitClear,
    /// Lost the persistence draw; waiting one slot
    SlotWait,
    /// Won the draw; waiting out the TX delay
    Delay,
    /// Frame is on the air
    Sending,
}

/// Stored radio configuration (mirrors SET_RADIO)
#[derive(Debug, Clone, Copy)]
pub struct RadioParams {
    /// Frequency in Hz
    pub freq_hz: u32,
    /// Bandwidth in Hz
    pub bw_hz: u32,
    /// Spreading factor
    pub sf: u8,
    /// Coding rate
    pub cr: u8,
    /// TX power in dBm
    pub tx_power: u8,
}

impl Default for RadioParams {
    fn default() -> Self {
        Self {
            freq_hz: 915_000_000,
            bw_hz: 250_000,
            sf: 10,
            cr: 5,
            tx_power: 17,
        }
    }
}

/// The KISS modem: framing, command dispatch and the TX state machine
pub struct KissModem<S: SerialPort> {
    serial: S,
    deframer: KissDeframer,

    pending_tx: [u8; KISS_MAX_PACKET_SIZE],
    pending_tx_len: usize,
    has_pending_tx: bool,

    txdelay: u8,
    persistence: u8,
    slottime: u8,
    txtail: u8,
    fullduplex: bool,

    tx_state: TxState,
    tx_timer: u32,

    params: RadioParams,
    signal_report: bool,

    rx_count: u32,
    tx_count: u32,
    err_count: u32,
}

impl<S: SerialPort> KissModem<S> {
    /// Create a modem over a serial stream
    pub fn new(serial: S) -> Self {
        Self {
            serial,
            deframer: KissDeframer::new(),
            pending_tx: [0; KISS_MAX_PACKET_SIZE],
            pending_tx_len: 0,
            has_pending_tx: false,
            txdelay: KISS_DEFAULT_TXDELAY,
            persistence: KISS_DEFAULT_PERSISTENCE,
            slottime: KISS_DEFAULT_SLOTTIME,
            txtail: 0,
            fullduplex: false,
            tx_state: TxState::Idle,
            tx_timer: 0,
            params: RadioParams::default(),
            signal_report: false,
            rx_count: 0,
            tx_count: 0,
            err_count: 0,
        }
    }

    /// Current TX state (for diagnostics)
    #[must_use]
    pub const fn tx_state(&self) -> TxState {
        self.tx_state
    }

    /// Current persistence setting
    #[must_use]
    pub const fn persistence(&self) -> u8 {
        self.persistence
    }

    /// Current TX delay (10 ms units)
    #[must_use]
    pub const fn txdelay(&self) -> u8 {
        self.txdelay
    }

    /// Current slot time (10 ms units)
    #[must_use]
    pub const fn slottime(&self) -> u8 {
        self.slottime
    }

    /// Current TX tail (10 ms units; accepted for KISS compatibility)
    #[must_use]
    pub const fn txtail(&self) -> u8 {
        self.txtail
    }

    fn write_frame(&mut self, command: u8, payload: &[u8]) {
        let mut encoded = [0u8; 2 * KISS_MAX_FRAME_SIZE];
        if let Some(n) = encode_frame(&mut encoded, command, payload) {
            self.serial.write_bytes(&encoded[..n]);
        }
    }

    fn write_hardware_frame(&mut self, resp: u8, data: &[u8]) {
        let mut payload = Vec::<u8, KISS_MAX_FRAME_SIZE>::new();
        let _ = payload.push(resp);
        let _ = payload.extend_from_slice(data);
        self.write_frame(KISS_CMD_SETHARDWARE, &payload);
    }

    fn write_error(&mut self, detail: u8) {
        self.err_count += 1;
        self.write_hardware_frame(HW_RESP_ERROR, &[detail]);
    }

    /// One cooperative tick: serial in, radio in, TX state machine.
    pub fn loop_once<R: Radio, G: CryptoRng>(
        &mut self,
        radio: &mut R,
        identity: &LocalIdentity,
        rng: &mut G,
        now_ms: u32,
    ) {
        // serial -> command dispatch
        while let Some(byte) = self.serial.read_byte() {
            if let Some(frame) = self.deframer.feed(byte) {
                self.handle_frame(&frame, radio, identity, rng);
            }
        }

        // radio -> serial
        let mut buf = [0u8; KISS_MAX_PACKET_SIZE];
        let len = radio.recv_raw(&mut buf);
        if len > 0 {
            self.rx_count += 1;
            let snr = radio.last_snr();
            let rssi = radio.last_rssi();
            self.write_frame(KISS_CMD_DATA, &buf[..len]);
            if self.signal_report {
                self.write_hardware_frame(HW_RESP_RX_META, &[snr as u8, rssi as u8]);
            }
        }

        self.transmit_tick(radio, rng, now_ms);
    }

    // =========================================================================
    // CSMA transmit state machine
    // =========================================================================

    fn transmit_tick<R: Radio, G: CryptoRng>(&mut self, radio: &mut R, rng: &mut G, now: u32) {
        match self.tx_state {
            TxState::Idle => {
                if self.has_pending_tx {
                    self.tx_state = if self.fullduplex {
                        // full duplex skips the channel check entirely
                        self.tx_timer = now;
                        TxState::Delay
                    } else {
                        TxState::WaitClear
                    };
                }
            }

            TxState::WaitClear => {
                if !radio.is_receiving() {
                    let mut rand_val = [0u8; 1];
                    let _ = rng.fill_bytes(&mut rand_val);
                    self.tx_timer = now;
                    self.tx_state = if rand_val[0] <= self.persistence {
                        TxState::Delay
                    } else {
                        TxState::SlotWait
                    };
                }
            }

            TxState::SlotWait => {
                if millis_has_passed(now, future_millis(self.tx_timer, u32::from(self.slottime) * 10)) {
                    self.tx_state = TxState::WaitClear;
                }
            }

            TxState::Delay => {
                if millis_has_passed(now, future_millis(self.tx_timer, u32::from(self.txdelay) * 10)) {
                    if radio
                        .start_send_raw(&self.pending_tx[..self.pending_tx_len])
                        .is_ok()
                    {
                        self.tx_state = TxState::Sending;
                    } else {
                        self.write_error(HW_ERR_INVALID_PARAM);
                        self.has_pending_tx = false;
                        self.tx_state = TxState::Idle;
                    }
                }
            }

            TxState::Sending => {
                if radio.is_send_complete() {
                    radio.on_send_finished();
                    self.tx_count += 1;
                    self.write_hardware_frame(HW_RESP_TX_DONE, &[0x01]);
                    self.has_pending_tx = false;
                    self.tx_state = TxState::Idle;
                }
            }
        }
    }

    // =========================================================================
    // Command dispatch
    // =========================================================================

    fn handle_frame<R: Radio, G: CryptoRng>(
        &mut self,
        frame: &KissFrame,
        radio: &mut R,
        identity: &LocalIdentity,
        rng: &mut G,
    ) {
        match frame.command {
            KISS_CMD_DATA => {
                if frame.payload.is_empty() || frame.payload.len() > KISS_MAX_PACKET_SIZE {
                    self.write_error(HW_ERR_INVALID_LENGTH);
                    return;
                }
                if self.has_pending_tx {
                    // one frame in flight at a time
                    self.write_error(HW_ERR_INVALID_PARAM);
                    return;
                }
                self.pending_tx[..frame.payload.len()].copy_from_slice(&frame.payload);
                self.pending_tx_len = frame.payload.len();
                self.has_pending_tx = true;
            }
            KISS_CMD_TXDELAY => {
                if let Some(&v) = frame.payload.first() {
                    self.txdelay = v;
                }
            }
            KISS_CMD_PERSISTENCE => {
                if let Some(&v) = frame.payload.first() {
                    self.persistence = v;
                }
            }
            KISS_CMD_SLOTTIME => {
                if let Some(&v) = frame.payload.first() {
                    self.slottime = v;
                }
            }
            KISS_CMD_TXTAIL => {
                if let Some(&v) = frame.payload.first() {
                    self.txtail = v;
                }
            }
            KISS_CMD_FULLDUPLEX => {
                if let Some(&v) = frame.payload.first() {
                    self.fullduplex = v != 0;
                }
            }
            KISS_CMD_SETHARDWARE => {
                self.handle_hardware(&frame.payload, radio, identity, rng);
            }
            KISS_CMD_RETURN => {
                // leaving KISS mode is the host's business; acknowledged
                self.write_hardware_frame(HW_RESP_OK, &[]);
            }
            _ => self.write_error(HW_ERR_UNKNOWN_CMD),
        }
    }

    fn handle_hardware<R: Radio, G: CryptoRng>(
        &mut self,
        payload: &[u8],
        radio: &mut R,
        identity: &LocalIdentity,
        rng: &mut G,
    ) {
        let Some(&cmd) = payload.first() else {
            self.write_error(HW_ERR_INVALID_LENGTH);
            return;
        };
        let args = &payload[1..];

        match cmd {
            HW_CMD_GET_IDENTITY => {
                let pub_key = identity.id.pub_key;
                self.write_hardware_frame(hw_resp(cmd), &pub_key);
            }

            HW_CMD_GET_RANDOM => {
                let n = args.first().copied().unwrap_or(32).min(64) as usize;
                let mut bytes = [0u8; 64];
                if rng.fill_bytes(&mut bytes[..n]).is_ok() {
                    let out: Vec<u8, 64> = Vec::from_slice(&bytes[..n]).unwrap_or_default();
                    self.write_hardware_frame(hw_resp(cmd), &out);
                } else {
                    self.write_error(HW_ERR_INVALID_PARAM);
                }
            }

            HW_CMD_VERIFY_SIGNATURE => {
                // [pub_key:32][signature:64][message...]
                if args.len() < PUB_KEY_SIZE + SIGNATURE_SIZE {
                    self.write_error(HW_ERR_INVALID_LENGTH);
                    return;
                }
                let Some(peer) = Identity::from_slice(&args[..PUB_KEY_SIZE]) else {
                    self.write_error(HW_ERR_INVALID_PARAM);
                    return;
                };
                let mut sig = [0u8; SIGNATURE_SIZE];
                sig.copy_from_slice(&args[PUB_KEY_SIZE..PUB_KEY_SIZE + SIGNATURE_SIZE]);
                let msg = &args[PUB_KEY_SIZE + SIGNATURE_SIZE..];
                let ok = peer.verify(&sig, msg);
                self.write_hardware_frame(hw_resp(cmd), &[u8::from(ok)]);
            }

            HW_CMD_SIGN_DATA => {
                if args.is_empty() {
                    self.write_error(HW_ERR_INVALID_LENGTH);
                    return;
                }
                let sig = identity.sign(args);
                self.write_hardware_frame(hw_resp(cmd), &sig);
            }

            HW_CMD_ENCRYPT_DATA => {
                // [peer_pub:32][plaintext...]
                if args.len() <= PUB_KEY_SIZE {
                    self.write_error(HW_ERR_INVALID_LENGTH);
                    return;
                }
                let Some(peer) = Identity::from_slice(&args[..PUB_KEY_SIZE]) else {
                    self.write_error(HW_ERR_INVALID_PARAM);
                    return;
                };
                let Ok(secret) = identity.shared_secret(&peer) else {
                    self.write_error(HW_ERR_INVALID_PARAM);
                    return;
                };
                let mut out = [0u8; KISS_MAX_PACKET_SIZE];
                match cipher::encrypt_then_mac(secret.as_bytes(), &mut out, &args[PUB_KEY_SIZE..])
                {
                    Ok(n) => self.write_hardware_frame(hw_resp(cmd), &out[..n]),
                    Err(_) => self.write_error(HW_ERR_INVALID_LENGTH),
                }
            }

            HW_CMD_DECRYPT_DATA => {
                // [peer_pub:32][envelope...]
                if args.len() <= PUB_KEY_SIZE {
                    self.write_error(HW_ERR_INVALID_LENGTH);
                    return;
                }
                let Some(peer) = Identity::from_slice(&args[..PUB_KEY_SIZE]) else {
                    self.write_error(HW_ERR_INVALID_PARAM);
                    return;
                };
                let Ok(secret) = identity.shared_secret(&peer) else {
                    self.write_error(HW_ERR_INVALID_PARAM);
                    return;
                };
                let mut out = [0u8; KISS_MAX_PACKET_SIZE];
                let n = cipher::mac_then_decrypt(secret.as_bytes(), &mut out, &args[PUB_KEY_SIZE..]);
                if n > 0 {
                    self.write_hardware_frame(hw_resp(cmd), &out[..n]);
                } else {
                    self.write_error(HW_ERR_MAC_FAILED);
                }
            }

            HW_CMD_KEY_EXCHANGE => {
                if args.len() < PUB_KEY_SIZE {
                    self.write_error(HW_ERR_INVALID_LENGTH);
                    return;
                }
                let Some(peer) = Identity::from_slice(&args[..PUB_KEY_SIZE]) else {
                    self.write_error(HW_ERR_INVALID_PARAM);
                    return;
                };
                match identity.shared_secret(&peer) {
                    Ok(secret) => self.write_hardware_frame(hw_resp(cmd), secret.as_bytes()),
                    Err(_) => self.write_error(HW_ERR_INVALID_PARAM),
                }
            }

            HW_CMD_HASH => {
                let mut digest = [0u8; 32];
                hash::sha256(&mut digest, args);
                self.write_hardware_frame(hw_resp(cmd), &digest);
            }

            HW_CMD_SET_RADIO => {
                // [freq_hz:4][bw_hz:4][sf:1][cr:1]
                if args.len() < 10 {
                    self.write_error(HW_ERR_INVALID_LENGTH);
                    return;
                }
                let freq_hz = u32::from_le_bytes([args[0], args[1], args[2], args[3]]);
                let bw_hz = u32::from_le_bytes([args[4], args[5], args[6], args[7]]);
                let sf = args[8];
                let cr = args[9];
                match radio.set_params(freq_hz as f32 / 1e6, bw_hz as f32 / 1e3, sf, cr) {
                    Ok(()) => {
                        self.params.freq_hz = freq_hz;
                        self.params.bw_hz = bw_hz;
                        self.params.sf = sf;
                        self.params.cr = cr;
                        radio.reset_agc();
                        self.write_hardware_frame(HW_RESP_OK, &[]);
                    }
                    Err(_) => self.write_error(HW_ERR_INVALID_PARAM),
                }
            }

            HW_CMD_SET_TX_POWER => {
                let Some(&dbm) = args.first() else {
                    self.write_error(HW_ERR_INVALID_LENGTH);
                    return;
                };
                match radio.set_tx_power(dbm as i8) {
                    Ok(()) => {
                        self.params.tx_power = dbm;
                        self.write_hardware_frame(HW_RESP_OK, &[]);
                    }
                    Err(_) => self.write_error(HW_ERR_INVALID_PARAM),
                }
            }

            HW_CMD_GET_RADIO => {
                let mut out = [0u8; 10];
                out[..4].copy_from_slice(&self.params.freq_hz.to_le_bytes());
                out[4..8].copy_from_slice(&self.params.bw_hz.to_le_bytes());
                out[8] = self.params.sf;
                out[9] = self.params.cr;
                self.write_hardware_frame(hw_resp(cmd), &out);
            }

            HW_CMD_GET_TX_POWER => {
                let power = self.params.tx_power;
                self.write_hardware_frame(hw_resp(cmd), &[power]);
            }

            HW_CMD_GET_CURRENT_RSSI => {
                let rssi = radio.current_rssi();
                self.write_hardware_frame(hw_resp(cmd), &rssi.to_le_bytes());
            }

            HW_CMD_IS_CHANNEL_BUSY => {
                let busy = radio.is_receiving();
                self.write_hardware_frame(hw_resp(cmd), &[u8::from(busy)]);
            }

            HW_CMD_GET_AIRTIME => {
                if args.len() < 2 {
                    self.write_error(HW_ERR_INVALID_LENGTH);
                    return;
                }
                let len = u16::from_le_bytes([args[0], args[1]]) as usize;
                let airtime = radio.est_airtime_for(len);
                self.write_hardware_frame(hw_resp(cmd), &airtime.to_le_bytes());
            }

            HW_CMD_GET_NOISE_FLOOR => {
                let floor = radio.noise_floor();
                self.write_hardware_frame(hw_resp(cmd), &floor.to_le_bytes());
            }

            HW_CMD_GET_VERSION => {
                self.write_hardware_frame(hw_resp(cmd), &[KISS_FIRMWARE_VERSION]);
            }

            HW_CMD_GET_STATS => {
                let mut out = [0u8; 12];
                out[..4].copy_from_slice(&self.rx_count.to_le_bytes());
                out[4..8].copy_from_slice(&self.tx_count.to_le_bytes());
                out[8..12].copy_from_slice(&self.err_count.to_le_bytes());
                self.write_hardware_frame(hw_resp(cmd), &out);
            }

            HW_CMD_SET_SIGNAL_REPORT => {
                if let Some(&v) = args.first() {
                    self.signal_report = v != 0;
                    self.write_hardware_frame(HW_RESP_OK, &[]);
                } else {
                    self.write_error(HW_ERR_INVALID_LENGTH);
                }
            }

            _ => self.write_error(HW_ERR_UNKNOWN_CMD),
        }
    }
}
