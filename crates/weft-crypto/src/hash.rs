//! BLAKE2b hashing and HKDF-BLAKE2b key derivation.

use crate::error::CryptoError;
use blake2::digest::{Update, VariableOutput};
use blake2::{Blake2b512, Blake2bVar};
use hkdf::Hkdf;
use hkdf::hmac::SimpleHmac;

/// Maximum HKDF output: 255 blocks of the 64-byte hash.
pub const MAX_KDF_OUTPUT: usize = 255 * 64;

/// Compute a BLAKE2b digest of the requested length (1..=64 bytes).
///
/// # Errors
///
/// Returns `CryptoError::InvalidHashLength` when `len` is outside 1..=64.
pub fn hash(data: &[u8], len: usize) -> Result<Vec<u8>, CryptoError> {
    let mut hasher = Blake2bVar::new(len).map_err(|_| CryptoError::InvalidHashLength(len))?;
    hasher.update(data);
    let mut out = vec![0u8; len];
    hasher
        .finalize_variable(&mut out)
        .map_err(|_| CryptoError::InvalidHashLength(len))?;
    Ok(out)
}

/// BLAKE2b-8: the short digest used for static-key possession proofs.
#[must_use]
pub fn hash8(data: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    // Length 8 is always valid for BLAKE2b.
    let mut hasher = Blake2bVar::new(8).expect("8 is a valid BLAKE2b length");
    hasher.update(data);
    hasher
        .finalize_variable(&mut out)
        .expect("output buffer matches digest length");
    out
}

/// BLAKE2b-32 convenience digest.
#[must_use]
pub fn hash32(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    let mut hasher = Blake2bVar::new(32).expect("32 is a valid BLAKE2b length");
    hasher.update(data);
    hasher
        .finalize_variable(&mut out)
        .expect("output buffer matches digest length");
    out
}

/// HKDF-BLAKE2b: derive `len` bytes of key material.
///
/// `salt` may be `None` (zero-length salt); `info` binds the output to a
/// protocol label.
///
/// # Errors
///
/// Returns `CryptoError::KdfOutputTooLong` when `len` exceeds 255 * 64.
pub fn kdf(
    secret: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    len: usize,
) -> Result<Vec<u8>, CryptoError> {
    if len > MAX_KDF_OUTPUT {
        return Err(CryptoError::KdfOutputTooLong(len));
    }
    let hk = Hkdf::<Blake2b512, SimpleHmac<Blake2b512>>::new(salt, secret);
    let mut okm = vec![0u8; len];
    hk.expand(info, &mut okm)
        .map_err(|_| CryptoError::KdfOutputTooLong(len))?;
    Ok(okm)
}

/// Derive a 32-byte key.
///
/// # Errors
///
/// Propagates [`kdf`] errors (cannot occur for 32-byte output).
pub fn kdf32(secret: &[u8], info: &[u8]) -> Result<[u8; 32], CryptoError> {
    let okm = kdf(secret, None, info, 32)?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&okm);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        let a = hash(b"hello", 64).unwrap();
        let b = hash(b"hello", 64).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_hash_length_bounds() {
        assert!(hash(b"x", 0).is_err());
        assert!(hash(b"x", 65).is_err());
        assert_eq!(hash(b"x", 1).unwrap().len(), 1);
    }

    #[test]
    fn test_hash_lengths_are_distinct_functions() {
        // BLAKE2b parameterizes the digest length, so blake2b-8 is not a
        // truncation of blake2b-64.
        let short = hash(b"input", 8).unwrap();
        let long = hash(b"input", 64).unwrap();
        assert_ne!(short[..], long[..8]);
    }

    #[test]
    fn test_blake2b512_abc_vector() {
        // Official BLAKE2b-512 test vector for "abc".
        let digest = hash(b"abc", 64).unwrap();
        let expected = [
            0xba, 0x80, 0xa5, 0x3f, 0x98, 0x1c, 0x4d, 0x0d, 0x6a, 0x27, 0x97, 0xb6, 0x9f, 0x12,
            0xf6, 0xe9, 0x4c, 0x21, 0x2f, 0x14, 0x68, 0x5a, 0xc4, 0xb7, 0x4b, 0x12, 0xbb, 0x6f,
            0xdb, 0xff, 0xa2, 0xd1, 0x7d, 0x87, 0xc5, 0x39, 0x2a, 0xab, 0x79, 0x2d, 0xc2, 0x52,
            0xd5, 0xde, 0x45, 0x33, 0xcc, 0x95, 0x18, 0xd3, 0x8a, 0xa8, 0xdb, 0xf1, 0x92, 0x5a,
            0xb9, 0x23, 0x86, 0xed, 0xd4, 0x00, 0x99, 0x23,
        ];
        assert_eq!(digest, expected);
    }

    #[test]
    fn test_hash8_matches_variable_api() {
        assert_eq!(hash8(b"proof input")[..], hash(b"proof input", 8).unwrap()[..]);
    }

    #[test]
    fn test_kdf_deterministic_and_info_separated() {
        let k1 = kdf32(b"secret", b"label-a").unwrap();
        let k2 = kdf32(b"secret", b"label-a").unwrap();
        let k3 = kdf32(b"secret", b"label-b").unwrap();
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
    }

    #[test]
    fn test_kdf_salt_separated() {
        let a = kdf(b"secret", None, b"info", 32).unwrap();
        let b = kdf(b"secret", Some(b"salty"), b"info", 32).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_kdf_output_limit() {
        assert!(kdf(b"s", None, b"i", MAX_KDF_OUTPUT).is_ok());
        assert!(matches!(
            kdf(b"s", None, b"i", MAX_KDF_OUTPUT + 1),
            Err(CryptoError::KdfOutputTooLong(_))
        ));
    }

    #[test]
    fn test_kdf_empty_info() {
        // The session key after a switch uses empty info.
        let key = kdf32(b"shared", b"").unwrap();
        assert_ne!(key, [0u8; 32]);
    }
}
