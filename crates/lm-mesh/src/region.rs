// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Region map
//!
//! TRANSPORT_* packets carry two 16-bit region codes. The region map is
//! a small tree (entries point at parents) with per-region deny flags;
//! the flood pre-filter consults it to decide whether a transport-scoped
//! packet belongs in this node's part of the network. A wildcard entry
//! matches any code not otherwise known.

use crate::packet::Packet;
use heapless::String;
use lm_common::{Error, Result};

/// Maximum region entries
pub const MAX_REGION_ENTRIES: usize = 32;

/// Deny flood forwarding within the region
pub const REGION_DENY_FLOOD: u8 = 0x01;
/// Deny direct forwarding (reserved)
pub const REGION_DENY_DIRECT: u8 = 0x02;

/// Maximum region name length
pub const MAX_REGION_NAME: usize = 30;

/// One region in the map
#[derive(Clone)]
pub struct RegionEntry {
    /// Region code as carried in transport codes
    pub id: u16,
    /// Parent region id (0 = root)
    pub parent: u16,
    /// REGION_DENY_* bits
    pub flags: u8,
    /// Display name
    pub name: String<MAX_REGION_NAME>,
}

/// The node's region tree plus wildcard policy
pub struct RegionMap {
    regions: heapless::Vec<RegionEntry, MAX_REGION_ENTRIES>,
    wildcard_flags: u8,
    next_id: u16,
    home_id: u16,
}

impl RegionMap {
    /// Record size in the serialized map
    const RECORD_SIZE: usize = 2 + 2 + 1 + 1 + MAX_REGION_NAME;

    /// Create an empty map (wildcard allows everything)
    #[must_use]
    pub const fn new() -> Self {
        Self {
            regions: heapless::Vec::new(),
            wildcard_flags: 0,
            next_id: 1,
            home_id: 0,
        }
    }

    /// Is `c` acceptable in a region name?
    #[must_use]
    pub fn is_name_char(c: u8) -> bool {
        c.is_ascii_alphanumeric() || c == b'-' || c == b'_' || c == b'.'
    }

    /// Add or update a region; `id` 0 auto-assigns.
    ///
    /// # Errors
    ///
    /// `Error::PoolExhausted` when the map is full,
    /// `Error::InvalidParameter` for a bad name.
    pub fn put_region(&mut self, name: &str, parent_id: u16, id: u16) -> Result<&RegionEntry> {
        if name.is_empty()
            || name.len() > MAX_REGION_NAME
            || !name.bytes().all(Self::is_name_char)
        {
            return Err(Error::InvalidParameter);
        }

        if let Some(idx) = self.regions.iter().position(|r| r.name.as_str() == name) {
            self.regions[idx].parent = parent_id;
            if id != 0 {
                self.regions[idx].id = id;
            }
            return Ok(&self.regions[idx]);
        }

        let assigned = if id == 0 {
            let v = self.next_id;
            self.next_id = self.next_id.wrapping_add(1).max(1);
            v
        } else {
            id
        };
        let mut n = String::new();
        let _ = n.push_str(name);
        self.regions
            .push(RegionEntry {
                id: assigned,
                parent: parent_id,
                flags: 0,
                name: n,
            })
            .map_err(|_| Error::PoolExhausted)?;
        Ok(self.regions.last().unwrap())
    }

    /// Remove a region by name; returns whether one existed
    pub fn remove_region(&mut self, name: &str) -> bool {
        let Some(idx) = self.regions.iter().position(|r| r.name.as_str() == name) else {
            return false;
        };
        self.regions.remove(idx);
        true
    }

    /// Look up by region id
    #[must_use]
    pub fn find_by_id(&self, id: u16) -> Option<&RegionEntry> {
        self.regions.iter().find(|r| r.id == id)
    }

    /// Look up by name
    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<&RegionEntry> {
        self.regions.iter().find(|r| r.name.as_str() == name)
    }

    /// Set deny flags on a region (or the wildcard when `name` is "*")
    pub fn set_flags(&mut self, name: &str, flags: u8) -> bool {
        if name == "*" {
            self.wildcard_flags = flags;
            return true;
        }
        if let Some(idx) = self.regions.iter().position(|r| r.name.as_str() == name) {
            self.regions[idx].flags = flags;
            return true;
        }
        false
    }

    /// Set the home region
    pub fn set_home(&mut self, id: u16) {
        self.home_id = id;
    }

    /// The home region id (0 = unset)
    #[must_use]
    pub const fn home(&self) -> u16 {
        self.home_id
    }

    /// Match a transport-scoped packet against the map.
    ///
    /// Returns the first known region matching either transport code, or
    /// `None` when only the wildcard applies. `is_denied` is the actual
    /// forwarding decision.
    #[must_use]
    pub fn find_match(&self, packet: &Packet) -> Option<&RegionEntry> {
        if !packet.has_transport_codes() {
            return None;
        }
        packet
            .transport_codes
            .iter()
            .find_map(|&code| (code != 0).then(|| self.find_by_id(code)).flatten())
    }

    /// Should a transport-scoped packet be refused, per the deny mask?
    #[must_use]
    pub fn is_denied(&self, packet: &Packet, mask: u8) -> bool {
        match self.find_match(packet) {
            Some(region) => region.flags & mask != 0,
            None => self.wildcard_flags & mask != 0,
        }
    }

    /// Region count
    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Is the map empty?
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Serialized size of the current map
    #[must_use]
    pub fn blob_size(&self) -> usize {
        6 + self.regions.len() * Self::RECORD_SIZE
    }

    /// Serialize into `dest`
    ///
    /// # Errors
    ///
    /// `Error::BufferTooSmall` when `dest` is undersized.
    pub fn save_to(&self, dest: &mut [u8]) -> Result<usize> {
        if dest.len() < self.blob_size() {
            return Err(Error::BufferTooSmall);
        }
        dest[0..2].copy_from_slice(&self.next_id.to_le_bytes());
        dest[2..4].copy_from_slice(&self.home_id.to_le_bytes());
        dest[4] = self.wildcard_flags;
        dest[5] = self.regions.len() as u8;
        let mut i = 6;
        for r in &self.regions {
            dest[i..i + 2].copy_from_slice(&r.id.to_le_bytes());
            dest[i + 2..i + 4].copy_from_slice(&r.parent.to_le_bytes());
            dest[i + 4] = r.flags;
            dest[i + 5] = r.name.len() as u8;
            let name_area = &mut dest[i + 6..i + 6 + MAX_REGION_NAME];
            name_area.fill(0);
            name_area[..r.name.len()].copy_from_slice(r.name.as_bytes());
            i += Self::RECORD_SIZE;
        }
        Ok(i)
    }

    /// Restore from a serialized map
    ///
    /// # Errors
    ///
    /// `Error::StorageCorrupted` for a malformed blob.
    pub fn restore_from(&mut self, src: &[u8]) -> Result<()> {
        if src.len() < 6 {
            return Err(Error::StorageCorrupted);
        }
        let count = src[5] as usize;
        if count > MAX_REGION_ENTRIES || src.len() < 6 + count * Self::RECORD_SIZE {
            return Err(Error::StorageCorrupted);
        }
        self.next_id = u16::from_le_bytes([src[0], src[1]]).max(1);
        self.home_id = u16::from_le_bytes([src[2], src[3]]);
        self.wildcard_flags = src[4];
        self.regions.clear();
        let mut i = 6;
        for _ in 0..count {
            let id = u16::from_le_bytes([src[i], src[i + 1]]);
            let parent = u16::from_le_bytes([src[i + 2], src[i + 3]]);
            let flags = src[i + 4];
            let name_len = (src[i + 5] as usize).min(MAX_REGION_NAME);
            let name_bytes = &src[i + 6..i + 6 + name_len];
            let name_str =
                core::str::from_utf8(name_bytes).map_err(|_| Error::StorageCorrupted)?;
            let mut name = String::new();
            let _ = name.push_str(name_str);
            let _ = self.regions.push(RegionEntry {
                id,
                parent,
                flags,
                name,
            });
            i += Self::RECORD_SIZE;
        }
        Ok(())
    }
}

impl Default for RegionMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{PayloadType, RouteKind};

    fn transport_packet(codes: [u16; 2]) -> Packet {
        let mut pkt = Packet::with_type(PayloadType::TxtMsg);
        pkt.set_route(RouteKind::TransportFlood);
        pkt.transport_codes = codes;
        pkt.payload_len = 4;
        pkt
    }

    #[test]
    fn test_put_and_match() {
        let mut map = RegionMap::new();
        let id = map.put_region("valley", 0, 0).unwrap().id;
        let pkt = transport_packet([id, 0]);
        assert_eq!(map.find_match(&pkt).unwrap().name.as_str(), "valley");
    }

    #[test]
    fn test_deny_flood() {
        let mut map = RegionMap::new();
        let id = map.put_region("valley", 0, 0).unwrap().id;
        assert!(!map.is_denied(&transport_packet([id, 0]), REGION_DENY_FLOOD));

        map.set_flags("valley", REGION_DENY_FLOOD);
        assert!(map.is_denied(&transport_packet([id, 0]), REGION_DENY_FLOOD));
        // other mask still allowed
        assert!(!map.is_denied(&transport_packet([id, 0]), REGION_DENY_DIRECT));
    }

    #[test]
    fn test_wildcard_policy() {
        let mut map = RegionMap::new();
        // unknown codes fall through to the wildcard
        assert!(!map.is_denied(&transport_packet([0x77, 0]), REGION_DENY_FLOOD));
        map.set_flags("*", REGION_DENY_FLOOD);
        assert!(map.is_denied(&transport_packet([0x77, 0]), REGION_DENY_FLOOD));
    }

    #[test]
    fn test_name_validation() {
        let mut map = RegionMap::new();
        assert!(map.put_region("ok-name_1.2", 0, 0).is_ok());
        assert!(map.put_region("bad name", 0, 0).is_err());
        assert!(map.put_region("", 0, 0).is_err());
    }

    #[test]
    fn test_save_restore() {
        let mut map = RegionMap::new();
        let a = map.put_region("north", 0, 0).unwrap().id;
        map.put_region("north-east", a, 0).unwrap();
        map.set_flags("north", REGION_DENY_FLOOD);
        map.set_home(a);

        let mut blob = [0u8; 1024];
        let n = map.save_to(&mut blob).unwrap();

        let mut restored = RegionMap::new();
        restored.restore_from(&blob[..n]).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.home(), a);
        assert_eq!(restored.find_by_name("north").unwrap().flags, REGION_DENY_FLOOD);
        assert_eq!(restored.find_by_name("north-east").unwrap().parent, a);
    }
}
