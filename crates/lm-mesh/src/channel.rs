// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Group channels
//!
//! A group channel is a pre-shared symmetric key; its 1-byte hash (the
//! leading byte of SHA-256 over the key) addresses the channel on the
//! wire the same way peer hashes address nodes. There is no group key
//! management beyond the pre-shared secret.

use crate::advert::MAX_NAME_LEN;
use heapless::String;
use lm_common::constants::MAX_HASH_MATCHES;
use lm_common::{Error, Result};
use lm_crypto::hash;

/// Maximum configured channels per node
pub const MAX_GROUP_CHANNELS: usize = 8;

/// A group's shared secret and its wire hash
#[derive(Clone, Copy)]
pub struct GroupChannel {
    /// Pre-shared key (a 16-byte PSK occupies the leading bytes, rest zero)
    pub secret: [u8; 32],
    /// 1-byte channel hash
    pub hash: u8,
}

impl GroupChannel {
    /// Build a channel from a 16- or 32-byte pre-shared key
    ///
    /// # Errors
    ///
    /// `Error::InvalidParameter` for any other key length.
    pub fn from_psk(psk: &[u8]) -> Result<Self> {
        if psk.len() != 16 && psk.len() != 32 {
            return Err(Error::InvalidParameter);
        }
        let mut secret = [0u8; 32];
        secret[..psk.len()].copy_from_slice(psk);
        let mut h = [0u8; 1];
        hash::sha256(&mut h, psk);
        Ok(Self {
            secret,
            hash: h[0],
        })
    }
}

/// A configured channel with its display name
#[derive(Clone)]
pub struct ChannelDetails {
    /// Shared key + hash
    pub channel: GroupChannel,
    /// Display name
    pub name: String<MAX_NAME_LEN>,
}

/// Fixed-size channel table
pub struct ChannelTable {
    channels: heapless::Vec<ChannelDetails, MAX_GROUP_CHANNELS>,
}

impl ChannelTable {
    /// Create an empty table
    #[must_use]
    pub const fn new() -> Self {
        Self {
            channels: heapless::Vec::new(),
        }
    }

    /// Add a channel from its pre-shared key
    ///
    /// # Errors
    ///
    /// `Error::PoolExhausted` when the table is full,
    /// `Error::InvalidParameter` for a bad key length.
    pub fn add(&mut self, name: &str, psk: &[u8]) -> Result<&ChannelDetails> {
        let channel = GroupChannel::from_psk(psk)?;
        let mut n = String::new();
        let _ = n.push_str(&name[..name.len().min(MAX_NAME_LEN)]);
        self.channels
            .push(ChannelDetails { channel, name: n })
            .map_err(|_| Error::PoolExhausted)?;
        Ok(self.channels.last().unwrap())
    }

    /// Collect up to `MAX_HASH_MATCHES` channels whose hash matches
    pub fn search_by_hash(
        &self,
        hash: u8,
        dest: &mut [GroupChannel; MAX_HASH_MATCHES],
    ) -> usize {
        let mut n = 0;
        for details in &self.channels {
            if n >= MAX_HASH_MATCHES {
                break;
            }
            if details.channel.hash == hash {
                dest[n] = details.channel;
                n += 1;
            }
        }
        n
    }

    /// Find the table index of a channel by its secret
    #[must_use]
    pub fn find_index(&self, channel: &GroupChannel) -> Option<usize> {
        self.channels
            .iter()
            .position(|d| d.channel.secret == channel.secret)
    }

    /// Channel by index
    #[must_use]
    pub fn get(&self, idx: usize) -> Option<&ChannelDetails> {
        self.channels.get(idx)
    }

    /// Configured channel count
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Is the table empty?
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl Default for ChannelTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_psk_lengths() {
        assert!(GroupChannel::from_psk(&[1u8; 16]).is_ok());
        assert!(GroupChannel::from_psk(&[1u8; 32]).is_ok());
        assert!(GroupChannel::from_psk(&[1u8; 20]).is_err());
    }

    #[test]
    fn test_hash_is_key_derived() {
        let a = GroupChannel::from_psk(&[1u8; 32]).unwrap();
        let b = GroupChannel::from_psk(&[1u8; 32]).unwrap();
        let c = GroupChannel::from_psk(&[2u8; 32]).unwrap();
        assert_eq!(a.hash, b.hash);
        // different keys usually produce different hashes; equality is
        // possible (1-byte hash) but not for these fixed vectors
        assert_ne!(a.secret, c.secret);
    }

    #[test]
    fn test_search_by_hash() {
        let mut table = ChannelTable::new();
        table.add("ops", &[1u8; 32]).unwrap();
        table.add("general", &[2u8; 32]).unwrap();

        let target = GroupChannel::from_psk(&[1u8; 32]).unwrap();
        let mut matches = [GroupChannel::from_psk(&[0u8; 16]).unwrap(); 4];
        let n = table.search_by_hash(target.hash, &mut matches);
        assert!(n >= 1);
        assert!(matches[..n].iter().any(|c| c.secret == target.secret));
    }
}
