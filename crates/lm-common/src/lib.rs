// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! LinkMesh Common Library
//!
//! Shared types, error definitions and utilities used across all LinkMesh
//! crates:
//!
//! - **Errors**: unified error type with subsystem error codes
//! - **Logging**: circular log buffer for constrained targets
//! - **Time**: millisecond/RTC clock traits and wrap-safe helpers
//! - **Constants**: protocol-wide limits and thresholds
//!
//! # Security
//!
//! No heap allocations are performed - all buffers use fixed-size arrays or
//! heapless collections.

#![no_std]
#![deny(unsafe_code)]
#![warn(missing_docs)]

#[cfg(feature = "std")]
extern crate std;

pub mod constants;
pub mod errors;
pub mod log;
pub mod time;
pub mod version;

pub use errors::{Error, Result};
pub use time::{future_millis, millis_has_passed, MillisClock, RtcClock};
pub use version::Version;
