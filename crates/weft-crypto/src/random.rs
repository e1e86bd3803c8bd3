//! Secure random number generation.
//!
//! All randomness comes from the operating system CSPRNG. Components that
//! need deterministic replay (key generation, switch codes) instead accept a
//! caller-supplied `rand_core` RNG.

use crate::CryptoError;

/// Fill a buffer with random bytes from the OS CSPRNG.
///
/// # Errors
///
/// Returns `CryptoError::RandomFailed` if the entropy source is unavailable.
pub fn fill_random(buf: &mut [u8]) -> Result<(), CryptoError> {
    getrandom::fill(buf).map_err(|_| CryptoError::RandomFailed)
}

/// Generate a random 8-byte array.
///
/// # Errors
///
/// Returns `CryptoError::RandomFailed` if the entropy source is unavailable.
pub fn random_8() -> Result<[u8; 8], CryptoError> {
    let mut buf = [0u8; 8];
    fill_random(&mut buf)?;
    Ok(buf)
}

/// Generate a random 32-byte array.
///
/// # Errors
///
/// Returns `CryptoError::RandomFailed` if the entropy source is unavailable.
pub fn random_32() -> Result<[u8; 32], CryptoError> {
    let mut buf = [0u8; 32];
    fill_random(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_random_distinct() {
        let a = random_32().unwrap();
        let b = random_32().unwrap();
        assert_ne!(a, b);
    }
}
