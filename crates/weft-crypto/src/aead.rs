//! `ChaCha20-Poly1305` AEAD with truncated tags.
//!
//! This is the RFC 8439 construction with two deviations required by the
//! bundle wire format:
//! - the 12-byte nonce is always `(0, 0, 0, 0, nonce_le_u64)`, so callers
//!   address messages by a 64-bit counter;
//! - the Poly1305 tag may be truncated to 8 bytes (`TagLen::Short`) for
//!   bundle framing, or kept at 16 bytes (`TagLen::Full`) for handshake
//!   payloads.
//!
//! The Poly1305 one-time key is the first 32 bytes of the ChaCha20 keystream
//! at counter 0; the ciphertext stream starts at counter 1. The MAC input is
//! `AD || pad16(AD) || CT || pad16(CT) || LE64(|AD|) || LE64(|CT|)`.
//!
//! Verification compares the first `tag_len` bytes of the computed tag in
//! constant time and fails closed: no plaintext is produced on mismatch.

use crate::constant_time::ct_eq;
use crate::error::CryptoError;
use crate::{AEAD_KEY_SIZE, FULL_TAG_SIZE, SHORT_TAG_SIZE};
use chacha20::ChaCha20;
use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use poly1305::Poly1305;
use poly1305::universal_hash::{KeyInit, UniversalHash};
use rand_core::{CryptoRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Authentication tag length selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TagLen {
    /// 8-byte truncated tag (bundle wire)
    Short,
    /// 16-byte full Poly1305 tag (handshake payloads)
    Full,
}

impl TagLen {
    /// Tag length in bytes.
    #[must_use]
    pub fn bytes(self) -> usize {
        match self {
            Self::Short => SHORT_TAG_SIZE,
            Self::Full => FULL_TAG_SIZE,
        }
    }

    /// Select a tag length from a byte count.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidTagLength` for anything but 8 or 16.
    pub fn from_len(len: usize) -> Result<Self, CryptoError> {
        match len {
            SHORT_TAG_SIZE => Ok(Self::Short),
            FULL_TAG_SIZE => Ok(Self::Full),
            other => Err(CryptoError::InvalidTagLength(other)),
        }
    }
}

/// AEAD encryption key (32 bytes), zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct AeadKey([u8; AEAD_KEY_SIZE]);

impl AeadKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn new(bytes: [u8; AEAD_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a slice.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyLength` if the slice is not 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        if slice.len() != AEAD_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: AEAD_KEY_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; AEAD_KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Generate a random key.
    #[must_use]
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; AEAD_KEY_SIZE];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Raw key bytes. Handle with care.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; AEAD_KEY_SIZE] {
        &self.0
    }
}

/// Output of [`seal`]: detached ciphertext and truncated tag.
#[derive(Debug)]
pub struct Sealed {
    /// Ciphertext, same length as the plaintext
    pub ciphertext: Vec<u8>,
    /// Truncated Poly1305 tag (8 or 16 bytes)
    pub tag: Vec<u8>,
}

/// Build the IETF nonce `(0, 0, 0, 0, nonce_le_u64)`.
fn ietf_nonce(nonce: u64) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[4..].copy_from_slice(&nonce.to_le_bytes());
    out
}

/// XOR `buf` with the ChaCha20 keystream starting at the given block counter.
fn stream_xor(key: &AeadKey, nonce: u64, counter: u32, buf: &mut [u8]) {
    let nonce_bytes = ietf_nonce(nonce);
    let mut cipher = ChaCha20::new(key.as_bytes().into(), (&nonce_bytes).into());
    cipher.seek(u64::from(counter) * 64);
    cipher.apply_keystream(buf);
}

/// Derive the Poly1305 one-time key: keystream block 0 over 32 zero bytes.
fn one_time_key(key: &AeadKey, nonce: u64) -> [u8; 32] {
    let mut otk = [0u8; 32];
    stream_xor(key, nonce, 0, &mut otk);
    otk
}

/// Compute the full 16-byte Poly1305 tag over the RFC 8439 MAC layout.
fn compute_tag(otk: &[u8; 32], ad: &[u8], ciphertext: &[u8]) -> [u8; 16] {
    let mut auth = Vec::with_capacity(ad.len() + ciphertext.len() + 48);
    auth.extend_from_slice(ad);
    auth.resize(auth.len() + pad16(ad.len()), 0);
    auth.extend_from_slice(ciphertext);
    auth.resize(auth.len() + pad16(ciphertext.len()), 0);
    auth.extend_from_slice(&(ad.len() as u64).to_le_bytes());
    auth.extend_from_slice(&(ciphertext.len() as u64).to_le_bytes());

    let mut mac = Poly1305::new(poly1305::Key::from_slice(otk));
    mac.update_padded(&auth);
    mac.finalize().into()
}

fn pad16(len: usize) -> usize {
    (16 - (len % 16)) % 16
}

/// Encrypt and authenticate `plaintext` under `(key, nonce, ad)`.
///
/// Returns the detached ciphertext and a tag truncated to `tag_len`.
#[must_use]
pub fn seal(key: &AeadKey, nonce: u64, plaintext: &[u8], ad: &[u8], tag_len: TagLen) -> Sealed {
    let mut ciphertext = plaintext.to_vec();
    stream_xor(key, nonce, 1, &mut ciphertext);

    let mut otk = one_time_key(key, nonce);
    let tag = compute_tag(&otk, ad, &ciphertext);
    otk.zeroize();

    Sealed {
        ciphertext,
        tag: tag[..tag_len.bytes()].to_vec(),
    }
}

/// Verify and decrypt a detached `(ciphertext, tag)` pair.
///
/// The supplied tag's length selects the truncation: 8 or 16 bytes.
///
/// # Errors
///
/// Returns `CryptoError::InvalidTagLength` for an unsupported tag length
/// and `CryptoError::DecryptionFailed` when authentication fails. No
/// plaintext is produced on failure.
pub fn open(
    key: &AeadKey,
    nonce: u64,
    ciphertext: &[u8],
    tag: &[u8],
    ad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let tag_len = TagLen::from_len(tag.len())?;

    let mut otk = one_time_key(key, nonce);
    let computed = compute_tag(&otk, ad, ciphertext);
    otk.zeroize();

    if !ct_eq(&computed[..tag_len.bytes()], tag) {
        return Err(CryptoError::DecryptionFailed);
    }

    let mut plaintext = ciphertext.to_vec();
    stream_xor(key, nonce, 1, &mut plaintext);
    Ok(plaintext)
}
