//! # WEFT Crypto
//!
//! Cryptographic primitives for the WEFT messaging stack.
//!
//! This crate provides:
//! - `ChaCha20-Poly1305` AEAD with truncated (8- or 16-byte) tags
//! - BLAKE2b hashing with selectable output length
//! - HKDF-BLAKE2b key derivation
//! - X25519 Diffie-Hellman key exchange
//! - XEdDSA signatures over X25519 keys (BLAKE2b-512 in place of SHA-512)
//! - Secure random number generation
//! - Constant-time comparison helpers
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Notes |
//! |----------|-----------|-------|
//! | Key Exchange | X25519 | RFC 7748 |
//! | AEAD | ChaCha20-Poly1305 | RFC 8439 construction, tag truncated to 8 or 16 bytes |
//! | Hash | BLAKE2b | 1..=64 byte digests |
//! | KDF | HKDF-BLAKE2b | 64-byte hash size, max 255*64 bytes of output |
//! | Signatures | XEdDSA-BLAKE2b | signs with X25519 identity keys |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod aead;
pub mod constant_time;
pub mod error;
pub mod hash;
pub mod random;
pub mod x25519;
pub mod xeddsa;

pub use aead::{AeadKey, TagLen};
pub use error::CryptoError;

/// X25519 key size (public, secret and shared secret)
pub const X25519_KEY_SIZE: usize = 32;

/// AEAD key size
pub const AEAD_KEY_SIZE: usize = 32;

/// Truncated AEAD tag size used on the bundle wire
pub const SHORT_TAG_SIZE: usize = 8;

/// Full Poly1305 tag size, used by the handshake
pub const FULL_TAG_SIZE: usize = 16;

/// XEdDSA signature size (`R || S`)
pub const SIGNATURE_SIZE: usize = 64;
