// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! LinkMesh Core
//!
//! The store-and-forward mesh engine for LoRa-class radios:
//!
//! - **Packet**: bit-exact wire codec and path-hash manipulation
//! - **Tables**: LRU duplicate suppression and recent-ack tracking
//! - **Dispatcher**: packet pool, priority TX queue, radio-driven loop
//! - **Mesh**: the routing engine — classify, deliver, forward, drop
//! - **Contacts / Channels / Adverts**: peer and group state
//! - **Session / Nonce**: session-key rotation and per-peer nonce lifecycle
//! - **Region**: transport-code flood scoping
//! - **Storage**: blob-store contracts and persistence record codecs
//! - **Chat**: the application node tying it all together

#![no_std]
#![deny(unsafe_code)]
#![warn(missing_docs)]

#[cfg(feature = "std")]
extern crate std;

pub mod advert;
pub mod channel;
pub mod chat;
pub mod contact;
pub mod dispatcher;
pub mod mesh;
pub mod nonce;
pub mod packet;
pub mod radio;
pub mod region;
pub mod session;
pub mod storage;
pub mod tables;

pub use chat::ChatNode;
pub use dispatcher::{DispatcherAction, PacketPool, TxQueue};
pub use mesh::{Mesh, MeshApp};
pub use packet::{Packet, PayloadType, RouteKind};
pub use radio::Radio;
pub use tables::MeshTables;
