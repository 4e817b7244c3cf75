// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! LinkMesh KISS Modem
//!
//! Turns a node into a dumb-but-cryptographic radio modem: standard KISS
//! framing over a serial stream, port-0 commands for the classic TNC
//! parameters, and a `SETHARDWARE` escape for identity, crypto and radio
//! control operations. The host computer runs the mesh stack; the modem
//! moves frames and keeps the keys.

#![no_std]
#![deny(unsafe_code)]
#![warn(missing_docs)]

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod framing;
pub mod modem;

pub use framing::{KissDeframer, KissFrame};
pub use modem::{KissModem, SerialPort, TxState};
