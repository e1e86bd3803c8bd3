//! Error types for the WEFT core.
//!
//! Hostile wire input is never an error on the receive path: malformed
//! bundles are dropped silently. These types cover caller contract
//! violations and crypto failures surfaced to direct callers.

use crate::codec::CodecError;
use thiserror::Error;

/// Core errors
#[derive(Debug, Error)]
pub enum Error {
    /// Codec error
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Cryptographic error
    #[error("crypto error: {0}")]
    Crypto(#[from] weft_crypto::CryptoError),

    /// Channel 0 is reserved for control traffic
    #[error("channel 0 is reserved for control traffic")]
    ControlChannelReserved,

    /// Operation not valid in the current session state
    #[error("invalid state for operation")]
    InvalidState,

    /// No peer ephemeral key has been pinned yet
    #[error("no peer ephemeral key pinned")]
    NoPeerEphemeral,

    /// Session keys must be exactly 32 bytes
    #[error("invalid key length: expected 32, got {0}")]
    InvalidKeyLength(usize),
}
