// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Crypto-internal error type

use core::fmt;
use lm_common::Error;

/// Errors raised inside the crypto layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum CryptoError {
    /// Key bytes are malformed or have the wrong size
    InvalidKey,
    /// Authentication tag did not match
    AuthFailed,
    /// Random number generator failure
    RngFailure,
    /// Output buffer too small
    BufferTooSmall,
    /// Input does not satisfy the envelope's minimum layout
    InvalidInput,
}

impl CryptoError {
    /// Get a short description of the error
    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::InvalidKey => "invalid key",
            Self::AuthFailed => "authentication failed",
            Self::RngFailure => "rng failure",
            Self::BufferTooSmall => "buffer too small",
            Self::InvalidInput => "invalid input",
        }
    }
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl From<CryptoError> for Error {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::InvalidKey => Error::InvalidKey,
            CryptoError::AuthFailed => Error::DecryptFailed,
            CryptoError::RngFailure => Error::RngFailure,
            CryptoError::BufferTooSmall => Error::BufferTooSmall,
            CryptoError::InvalidInput => Error::InvalidParameter,
        }
    }
}
