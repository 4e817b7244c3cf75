// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Advert app-data codec
//!
//! The signed portion of an advert carries up to 32 bytes of app data:
//!
//! ```text
//! [flags:1] [lat:i32 lon:i32, iff bit4] [feat1:1, iff bit5] [name, iff bit7]
//! ```
//!
//! Flags: low nibble = node type, bit4 = lat/lon present, bit5 = feature
//! byte present, bit7 = name present. Lat/lon are degrees ×1e6,
//! little-endian. Feature bit 0 advertises AEAD envelope support.

use lm_common::constants::MAX_ADVERT_DATA_SIZE;

/// Flags bit: lat/lon fields present
pub const ADV_LATLON_MASK: u8 = 0x10;
/// Flags bit: feature byte present
pub const ADV_FEAT1_MASK: u8 = 0x20;
/// Flags bit: name present
pub const ADV_NAME_MASK: u8 = 0x80;

/// Feature bit: node speaks the AEAD-4 envelope
pub const FEAT1_AEAD_SUPPORT: u8 = 0x01;

/// Maximum display-name length in bytes
pub const MAX_NAME_LEN: usize = 31;

/// Advertised node role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeType {
    /// Interactive chat endpoint
    Chat = 1,
    /// Store-and-forward repeater
    Repeater = 2,
    /// Room/server node
    Room = 3,
    /// Sensor host
    Sensor = 4,
    /// Unknown role
    Unknown = 0,
}

impl NodeType {
    /// Decode from the flags nibble
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value & 0x0F {
            1 => Self::Chat,
            2 => Self::Repeater,
            3 => Self::Room,
            4 => Self::Sensor,
            _ => Self::Unknown,
        }
    }
}

/// Builds advert app data
pub struct AdvertDataBuilder<'a> {
    node_type: NodeType,
    name: &'a str,
    lat_lon: Option<(i32, i32)>,
    feat1: u8,
}

impl<'a> AdvertDataBuilder<'a> {
    /// Start building app data for a node of the given type and name
    #[must_use]
    pub const fn new(node_type: NodeType, name: &'a str) -> Self {
        Self {
            node_type,
            name,
            lat_lon: None,
            feat1: 0,
        }
    }

    /// Attach a position (degrees ×1e6)
    #[must_use]
    pub const fn with_lat_lon(mut self, lat: i32, lon: i32) -> Self {
        self.lat_lon = Some((lat, lon));
        self
    }

    /// Set the feature byte
    #[must_use]
    pub const fn with_feat1(mut self, feat1: u8) -> Self {
        self.feat1 = feat1;
        self
    }

    /// Encode into `dest`, returning the length.
    ///
    /// The name is truncated to whatever fits the 32-byte budget.
    pub fn encode_to(&self, dest: &mut [u8; MAX_ADVERT_DATA_SIZE]) -> usize {
        let mut flags = self.node_type as u8;
        let mut i = 1;
        if let Some((lat, lon)) = self.lat_lon {
            flags |= ADV_LATLON_MASK;
            dest[i..i + 4].copy_from_slice(&lat.to_le_bytes());
            dest[i + 4..i + 8].copy_from_slice(&lon.to_le_bytes());
            i += 8;
        }
        if self.feat1 != 0 {
            flags |= ADV_FEAT1_MASK;
            dest[i] = self.feat1;
            i += 1;
        }
        if !self.name.is_empty() {
            flags |= ADV_NAME_MASK;
            let avail = MAX_ADVERT_DATA_SIZE - i;
            let mut n = self.name.len().min(avail).min(MAX_NAME_LEN);
            // don't split a UTF-8 sequence
            while n > 0 && !self.name.is_char_boundary(n) {
                n -= 1;
            }
            dest[i..i + n].copy_from_slice(&self.name.as_bytes()[..n]);
            i += n;
        }
        dest[0] = flags;
        i
    }
}

/// Parses advert app data
pub struct AdvertDataParser<'a> {
    flags: u8,
    lat_lon: Option<(i32, i32)>,
    feat1: u8,
    name: &'a str,
    valid: bool,
}

impl<'a> AdvertDataParser<'a> {
    /// Parse `app_data`; check `is_valid` before using the accessors
    #[must_use]
    pub fn new(app_data: &'a [u8]) -> Self {
        let invalid = Self {
            flags: 0,
            lat_lon: None,
            feat1: 0,
            name: "",
            valid: false,
        };
        if app_data.is_empty() || app_data.len() > MAX_ADVERT_DATA_SIZE {
            return invalid;
        }
        let flags = app_data[0];
        let mut i = 1;

        let mut lat_lon = None;
        if flags & ADV_LATLON_MASK != 0 {
            if app_data.len() < i + 8 {
                return invalid;
            }
            let lat = i32::from_le_bytes([
                app_data[i],
                app_data[i + 1],
                app_data[i + 2],
                app_data[i + 3],
            ]);
            let lon = i32::from_le_bytes([
                app_data[i + 4],
                app_data[i + 5],
                app_data[i + 6],
                app_data[i + 7],
            ]);
            lat_lon = Some((lat, lon));
            i += 8;
        }

        let mut feat1 = 0;
        if flags & ADV_FEAT1_MASK != 0 {
            if app_data.len() < i + 1 {
                return invalid;
            }
            feat1 = app_data[i];
            i += 1;
        }

        let mut name = "";
        if flags & ADV_NAME_MASK != 0 {
            let bytes = &app_data[i..];
            if bytes.is_empty() || bytes.len() > MAX_NAME_LEN {
                return invalid;
            }
            match core::str::from_utf8(bytes) {
                Ok(s) => name = s,
                Err(_) => return invalid,
            }
        }

        Self {
            flags,
            lat_lon,
            feat1,
            name,
            valid: true,
        }
    }

    /// Did the app data parse cleanly?
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.valid
    }

    /// Advertised node type
    #[must_use]
    pub const fn node_type(&self) -> NodeType {
        NodeType::from_u8(self.flags)
    }

    /// Is a name present?
    #[must_use]
    pub const fn has_name(&self) -> bool {
        self.flags & ADV_NAME_MASK != 0
    }

    /// Display name (empty when absent)
    #[must_use]
    pub const fn name(&self) -> &'a str {
        self.name
    }

    /// Position, if advertised (degrees ×1e6)
    #[must_use]
    pub const fn lat_lon(&self) -> Option<(i32, i32)> {
        self.lat_lon
    }

    /// Feature byte (0 when absent)
    #[must_use]
    pub const fn feat1(&self) -> u8 {
        self.feat1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_name_only() {
        let mut buf = [0u8; MAX_ADVERT_DATA_SIZE];
        let n = AdvertDataBuilder::new(NodeType::Chat, "alice").encode_to(&mut buf);
        assert_eq!(n, 1 + 5);

        let p = AdvertDataParser::new(&buf[..n]);
        assert!(p.is_valid());
        assert_eq!(p.node_type(), NodeType::Chat);
        assert_eq!(p.name(), "alice");
        assert_eq!(p.feat1(), 0);
        assert!(p.lat_lon().is_none());
    }

    #[test]
    fn test_roundtrip_full() {
        let mut buf = [0u8; MAX_ADVERT_DATA_SIZE];
        let n = AdvertDataBuilder::new(NodeType::Repeater, "rp-7")
            .with_lat_lon(51_500_000, -123_456)
            .with_feat1(FEAT1_AEAD_SUPPORT)
            .encode_to(&mut buf);

        let p = AdvertDataParser::new(&buf[..n]);
        assert!(p.is_valid());
        assert_eq!(p.node_type(), NodeType::Repeater);
        assert_eq!(p.name(), "rp-7");
        assert_eq!(p.lat_lon(), Some((51_500_000, -123_456)));
        assert_eq!(p.feat1() & FEAT1_AEAD_SUPPORT, FEAT1_AEAD_SUPPORT);
    }

    #[test]
    fn test_long_name_truncated() {
        let mut buf = [0u8; MAX_ADVERT_DATA_SIZE];
        let long = "a-very-long-node-name-that-overflows-the-advert";
        let n = AdvertDataBuilder::new(NodeType::Chat, long).encode_to(&mut buf);
        assert!(n <= MAX_ADVERT_DATA_SIZE);
        let p = AdvertDataParser::new(&buf[..n]);
        assert!(p.is_valid());
        assert!(p.name().len() <= MAX_NAME_LEN);
        assert!(long.starts_with(p.name()));
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(!AdvertDataParser::new(&[]).is_valid());
        // claims lat/lon but too short
        assert!(!AdvertDataParser::new(&[ADV_LATLON_MASK | 1, 0, 0]).is_valid());
        // claims a name but has none
        assert!(!AdvertDataParser::new(&[ADV_NAME_MASK | 1]).is_valid());
        // non-UTF8 name
        assert!(!AdvertDataParser::new(&[ADV_NAME_MASK | 1, 0xFF, 0xFE]).is_valid());
    }
}
