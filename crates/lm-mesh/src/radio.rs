// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Radio hardware abstraction
//!
//! The core polls the radio; nothing here blocks. Hardware drivers
//! (SX126x/LR11x0 class) implement this trait; tests wire two nodes
//! together with an in-memory implementation that shuffles frames.

use lm_common::Result;

/// Radio driver interface consumed by the dispatcher
pub trait Radio {
    /// Begin transmitting a raw frame (returns immediately)
    ///
    /// # Errors
    ///
    /// Returns `Error::RadioError` if the hardware rejects the frame.
    fn start_send_raw(&mut self, bytes: &[u8]) -> Result<()>;

    /// Has the in-flight transmission finished?
    fn is_send_complete(&self) -> bool;

    /// Acknowledge a finished transmission (re-arms receive)
    fn on_send_finished(&mut self);

    /// Pop a received frame into `buf`; returns the byte count (0 = none)
    fn recv_raw(&mut self, buf: &mut [u8]) -> usize;

    /// Is a frame currently being received (preamble/header detected)?
    fn is_receiving(&self) -> bool;

    /// Estimated airtime in milliseconds for a frame of `len` bytes
    fn est_airtime_for(&self, len: usize) -> u32;

    /// Measured noise floor in dBm
    fn noise_floor(&self) -> i16;

    /// RSSI of the last received frame, dBm
    fn last_rssi(&self) -> i16;

    /// SNR of the last received frame, dB
    fn last_snr(&self) -> i8;

    /// Instantaneous channel RSSI, dBm
    fn current_rssi(&self) -> i16;

    /// Reconfigure frequency (MHz), bandwidth (kHz), spreading factor,
    /// coding rate
    ///
    /// # Errors
    ///
    /// Returns `Error::RadioError` on out-of-range parameters.
    fn set_params(&mut self, freq_mhz: f32, bw_khz: f32, sf: u8, cr: u8) -> Result<()>;

    /// Set transmit power in dBm
    ///
    /// # Errors
    ///
    /// Returns `Error::RadioError` on out-of-range power.
    fn set_tx_power(&mut self, dbm: i8) -> Result<()>;

    /// Reset the automatic gain control (after parameter changes)
    fn reset_agc(&mut self);
}

/// LoRa airtime estimate for the given symbol parameters.
///
/// `Ts = 2^sf / bw`; preamble + header + payload symbols, coding rate
/// `4/(4+cr)`. Close enough for timeout budgeting; drivers with silicon
/// airtime counters should prefer those.
#[must_use]
pub fn est_lora_airtime_ms(len: usize, bw_khz: f32, sf: u8, cr: u8, preamble_syms: u16) -> u32 {
    let ts_us = ((1u32 << sf) as f32) * 1000.0 / bw_khz; // symbol time in us
    let de = if ts_us > 16_000.0 { 1.0 } else { 0.0 }; // low data rate optimize
    let num = (8 * len) as f32 - 4.0 * sf as f32 + 28.0 + 16.0;
    let den = 4.0 * (sf as f32 - 2.0 * de);
    let mut payload_syms = (num / den) * ((cr as f32) + 4.0);
    if payload_syms < 0.0 {
        payload_syms = 0.0;
    }
    let total_syms = preamble_syms as f32 + 4.25 + 8.0 + payload_syms;
    (total_syms * ts_us / 1000.0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_airtime_scales_with_length() {
        let short = est_lora_airtime_ms(20, 250.0, 10, 1, 8);
        let long = est_lora_airtime_ms(200, 250.0, 10, 1, 8);
        assert!(long > short);
    }

    #[test]
    fn test_airtime_scales_with_sf() {
        let sf7 = est_lora_airtime_ms(100, 125.0, 7, 1, 8);
        let sf11 = est_lora_airtime_ms(100, 125.0, 11, 1, 8);
        assert!(sf11 > 8 * sf7);
    }
}
