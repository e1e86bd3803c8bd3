//! X25519 Diffie-Hellman key exchange (RFC 7748).

use crate::error::CryptoError;
use crate::X25519_KEY_SIZE;
use rand_core::{CryptoRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// X25519 secret key, zeroized on drop.
#[derive(Clone)]
pub struct SecretKey(x25519_dalek::StaticSecret);

/// X25519 public key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKey(x25519_dalek::PublicKey);

/// X25519 shared secret, zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; X25519_KEY_SIZE]);

/// An ephemeral or static X25519 keypair.
#[derive(Clone)]
pub struct Keypair {
    /// Secret half
    pub secret: SecretKey,
    /// Public half
    pub public: PublicKey,
}

impl SecretKey {
    /// Generate a random secret key (RFC 7748 clamped).
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(x25519_dalek::StaticSecret::random_from_rng(rng))
    }

    /// Import from raw bytes (clamped on use).
    #[must_use]
    pub fn from_bytes(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        Self(x25519_dalek::StaticSecret::from(bytes))
    }

    /// Derive the matching public key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey(x25519_dalek::PublicKey::from(&self.0))
    }

    /// Raw secret bytes. Handle with care.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; X25519_KEY_SIZE] {
        self.0.to_bytes()
    }
}

impl PublicKey {
    /// Import from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        Self(x25519_dalek::PublicKey::from(bytes))
    }

    /// Import from a slice.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyLength` if the slice is not 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        if slice.len() != X25519_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: X25519_KEY_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; X25519_KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self::from_bytes(bytes))
    }

    /// Raw public key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; X25519_KEY_SIZE] {
        self.0.as_bytes()
    }
}

impl Keypair {
    /// Generate a fresh keypair.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let secret = SecretKey::generate(rng);
        let public = secret.public_key();
        Self { secret, public }
    }
}

impl SharedSecret {
    /// Shared secret bytes; feed these through the KDF before use as a key.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; X25519_KEY_SIZE] {
        &self.0
    }
}

/// Perform X25519 between a local secret and a peer public key.
///
/// # Errors
///
/// Returns `CryptoError::LowOrderPoint` when the peer key is a low-order
/// point (all-zero shared secret).
pub fn shared_key(secret: &SecretKey, peer: &PublicKey) -> Result<SharedSecret, CryptoError> {
    let shared = secret.0.diffie_hellman(&peer.0);
    if shared.as_bytes() == &[0u8; X25519_KEY_SIZE] {
        return Err(CryptoError::LowOrderPoint);
    }
    Ok(SharedSecret(*shared.as_bytes()))
}
