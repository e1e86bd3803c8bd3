//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Tag length is neither 8 nor 16 bytes
    #[error("invalid tag length: {0}")]
    InvalidTagLength(usize),

    /// Requested hash output length outside 1..=64
    #[error("invalid hash output length: {0}")]
    InvalidHashLength(usize),

    /// KDF output longer than 255 * 64 bytes
    #[error("kdf output too long: {0}")]
    KdfOutputTooLong(usize),

    /// Peer public key is a low-order point
    #[error("invalid public key: low-order point")]
    LowOrderPoint,

    /// Signature failed verification or is malformed
    #[error("invalid signature")]
    InvalidSignature,

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,
}
