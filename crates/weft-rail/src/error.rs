//! Rail error types.

use thiserror::Error;

/// Channel multiplexer errors
#[derive(Debug, Error)]
pub enum RailError {
    /// Channel id is 0 or exceeds 24 bits
    #[error("invalid channel id: {0}")]
    InvalidChannelId(u32),

    /// No channel is open under this id
    #[error("unknown channel: {0}")]
    UnknownChannel(u32),

    /// The channel exists but is disabled
    #[error("channel disabled: {0}")]
    ChannelDisabled(u32),

    /// Bitmap width must be a positive multiple of 8
    #[error("invalid window width: {0}")]
    InvalidWindowWidth(usize),

    /// Cryptographic failure
    #[error("crypto error: {0}")]
    Crypto(#[from] weft_crypto::CryptoError),
}
