// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! KISS framing
//!
//! Standard KISS byte stuffing: frames delimited by `FEND`, with `FEND`
//! and `FESC` inside a frame escaped as `FESC TFEND` / `FESC TFESC`.
//! The first byte of every frame is the command byte.

use heapless::Vec;

/// Frame delimiter
pub const KISS_FEND: u8 = 0xC0;
/// Escape byte
pub const KISS_FESC: u8 = 0xDB;
/// Escaped FEND
pub const KISS_TFEND: u8 = 0xDC;
/// Escaped FESC
pub const KISS_TFESC: u8 = 0xDD;

/// Maximum deframed frame size (command byte + payload)
pub const KISS_MAX_FRAME_SIZE: usize = 512;

/// A complete deframed KISS frame
pub struct KissFrame {
    /// Command byte (first byte of the frame)
    pub command: u8,
    /// Frame payload after the command byte
    pub payload: Vec<u8, KISS_MAX_FRAME_SIZE>,
}

/// Incremental KISS decoder fed one serial byte at a time
pub struct KissDeframer {
    buf: Vec<u8, KISS_MAX_FRAME_SIZE>,
    escaped: bool,
    active: bool,
}

impl KissDeframer {
    /// Create an idle deframer
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buf: Vec::new(),
            escaped: false,
            active: false,
        }
    }

    /// Feed one byte; returns a frame when one completes
    pub fn feed(&mut self, byte: u8) -> Option<KissFrame> {
        if byte == KISS_FEND {
            if self.active && !self.buf.is_empty() {
                let mut payload = Vec::new();
                let _ = payload.extend_from_slice(&self.buf[1..]);
                let frame = KissFrame {
                    command: self.buf[0],
                    payload,
                };
                self.buf.clear();
                self.escaped = false;
                // stay active: back-to-back frames share one FEND
                return Some(frame);
            }
            self.buf.clear();
            self.escaped = false;
            self.active = true;
            return None;
        }

        if !self.active {
            return None; // garbage between frames
        }

        let decoded = if self.escaped {
            self.escaped = false;
            match byte {
                KISS_TFEND => KISS_FEND,
                KISS_TFESC => KISS_FESC,
                other => other, // tolerate invalid escapes
            }
        } else if byte == KISS_FESC {
            self.escaped = true;
            return None;
        } else {
            byte
        };

        if self.buf.push(decoded).is_err() {
            // oversized frame: drop and resynchronize on the next FEND
            self.buf.clear();
            self.active = false;
            self.escaped = false;
        }
        None
    }
}

impl Default for KissDeframer {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a frame (command byte + payload) into `dest` with escaping.
///
/// Returns the encoded length, or `None` if `dest` is too small.
pub fn encode_frame(dest: &mut [u8], command: u8, payload: &[u8]) -> Option<usize> {
    let mut i = 0;
    let mut push = |dest: &mut [u8], b: u8| -> bool {
        if i >= dest.len() {
            return false;
        }
        dest[i] = b;
        i += 1;
        true
    };

    if !push(dest, KISS_FEND) {
        return None;
    }
    for &b in core::iter::once(&command).chain(payload.iter()) {
        match b {
            KISS_FEND => {
                if !push(dest, KISS_FESC) || !push(dest, KISS_TFEND) {
                    return None;
                }
            }
            KISS_FESC => {
                if !push(dest, KISS_FESC) || !push(dest, KISS_TFESC) {
                    return None;
                }
            }
            other => {
                if !push(dest, other) {
                    return None;
                }
            }
        }
    }
    if !push(dest, KISS_FEND) {
        return None;
    }
    Some(i)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(command: u8, payload: &[u8]) -> KissFrame {
        let mut encoded = [0u8; 2 * KISS_MAX_FRAME_SIZE];
        let n = encode_frame(&mut encoded, command, payload).unwrap();

        let mut deframer = KissDeframer::new();
        let mut result = None;
        for &b in &encoded[..n] {
            if let Some(frame) = deframer.feed(b) {
                result = Some(frame);
            }
        }
        result.expect("frame should complete")
    }

    #[test]
    fn test_simple_roundtrip() {
        let frame = roundtrip(0x00, b"hello");
        assert_eq!(frame.command, 0x00);
        assert_eq!(frame.payload.as_slice(), b"hello");
    }

    #[test]
    fn test_escaping_roundtrip() {
        let payload = [0x01, KISS_FEND, 0x02, KISS_FESC, 0x03];
        let frame = roundtrip(0x06, &payload);
        assert_eq!(frame.command, 0x06);
        assert_eq!(frame.payload.as_slice(), &payload);
    }

    #[test]
    fn test_encoded_never_contains_bare_fend() {
        let payload = [KISS_FEND; 8];
        let mut encoded = [0u8; 64];
        let n = encode_frame(&mut encoded, 0x00, &payload).unwrap();
        // only the two delimiters are bare FENDs
        let fends = encoded[..n].iter().filter(|&&b| b == KISS_FEND).count();
        assert_eq!(fends, 2);
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut encoded = [0u8; 64];
        let n1 = encode_frame(&mut encoded, 0x01, b"a").unwrap();
        let n2 = encode_frame(&mut encoded[n1..], 0x02, b"b").unwrap();

        let mut deframer = KissDeframer::new();
        let mut frames = heapless::Vec::<u8, 4>::new();
        for &b in &encoded[..n1 + n2] {
            if let Some(frame) = deframer.feed(b) {
                frames.push(frame.command).unwrap();
            }
        }
        assert_eq!(frames.as_slice(), &[0x01, 0x02]);
    }

    #[test]
    fn test_garbage_between_frames_ignored() {
        let mut deframer = KissDeframer::new();
        for &b in b"noise" {
            assert!(deframer.feed(b).is_none());
        }
        let mut encoded = [0u8; 32];
        let n = encode_frame(&mut encoded, 0x00, b"ok").unwrap();
        let mut got = None;
        for &b in &encoded[..n] {
            if let Some(f) = deframer.feed(b) {
                got = Some(f);
            }
        }
        assert_eq!(got.unwrap().payload.as_slice(), b"ok");
    }
}
