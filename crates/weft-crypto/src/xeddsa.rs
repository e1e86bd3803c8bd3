//! XEdDSA signatures over X25519 keys.
//!
//! Lets an X25519 identity key sign without publishing a separate Ed25519
//! key: the Montgomery key is mapped to its Edwards twin with the sign bit
//! fixed to zero, and signing negates the scalar when needed so the pair
//! stays consistent. BLAKE2b-512 stands in for SHA-512 throughout, so these
//! signatures are deliberately incompatible with standard Ed25519.
//!
//! Signature format: `R (32 bytes) || S (32 bytes)`.

use crate::error::CryptoError;
use crate::x25519::{PublicKey, SecretKey};
use crate::SIGNATURE_SIZE;
use blake2::{Blake2b512, Digest};
use curve25519_dalek::constants::ED25519_BASEPOINT_TABLE;
use curve25519_dalek::edwards::EdwardsPoint;
use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::scalar::{clamp_integer, Scalar};
use rand_core::{CryptoRng, RngCore};
use zeroize::Zeroize;

/// Domain prefix for the nonce hash: LE encoding of 2^512 - 2.
const NONCE_PREFIX_FIRST: u8 = 0xFE;

fn wide_scalar(hasher: Blake2b512) -> Scalar {
    let digest = hasher.finalize();
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&digest);
    let scalar = Scalar::from_bytes_mod_order_wide(&wide);
    wide.zeroize();
    scalar
}

/// Derive the signing scalar and sign-0 Edwards public key from an X25519
/// secret. The scalar is negated when the natural Edwards point has its
/// sign bit set, so the public key always compresses with sign 0.
fn calculate_key_pair(secret: &SecretKey) -> (Scalar, [u8; 32]) {
    let mut clamped = clamp_integer(secret.to_bytes());
    let mut a = Scalar::from_bytes_mod_order(clamped);
    clamped.zeroize();

    let point = ED25519_BASEPOINT_TABLE * &a;
    let mut compressed = point.compress();
    if compressed.as_bytes()[31] & 0x80 != 0 {
        a = -a;
        compressed = (-point).compress();
    }
    (a, compressed.to_bytes())
}

/// Sign `message` with an X25519 secret key.
///
/// `rng` supplies the 64 bytes of nonce randomness the scheme requires;
/// signatures over the same message differ between calls.
pub fn sign<R: RngCore + CryptoRng>(
    secret: &SecretKey,
    message: &[u8],
    rng: &mut R,
) -> [u8; SIGNATURE_SIZE] {
    let (mut a, public) = calculate_key_pair(secret);

    let mut z = [0u8; 64];
    rng.fill_bytes(&mut z);

    let mut nonce_hasher = Blake2b512::new();
    nonce_hasher.update([NONCE_PREFIX_FIRST]);
    nonce_hasher.update([0xFFu8; 63]);
    nonce_hasher.update(a.to_bytes());
    nonce_hasher.update(message);
    nonce_hasher.update(z);
    let mut r = wide_scalar(nonce_hasher);
    z.zeroize();

    let big_r = (ED25519_BASEPOINT_TABLE * &r).compress();

    let mut challenge_hasher = Blake2b512::new();
    challenge_hasher.update(big_r.as_bytes());
    challenge_hasher.update(public);
    challenge_hasher.update(message);
    let h = wide_scalar(challenge_hasher);

    let s = r + h * a;
    r.zeroize();
    a.zeroize();

    let mut sig = [0u8; SIGNATURE_SIZE];
    sig[..32].copy_from_slice(big_r.as_bytes());
    sig[32..].copy_from_slice(&s.to_bytes());
    sig
}

/// Verify an XEdDSA signature against an X25519 public key.
///
/// # Errors
///
/// Returns `CryptoError::InvalidSignature` when the public key does not map
/// onto the curve, the scalar half is non-canonical, or the equation does
/// not hold.
pub fn verify(public: &PublicKey, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    if signature.len() != SIGNATURE_SIZE {
        return Err(CryptoError::InvalidSignature);
    }
    let mut r_bytes = [0u8; 32];
    r_bytes.copy_from_slice(&signature[..32]);
    let mut s_bytes = [0u8; 32];
    s_bytes.copy_from_slice(&signature[32..]);

    let edwards = MontgomeryPoint(*public.as_bytes())
        .to_edwards(0)
        .ok_or(CryptoError::InvalidSignature)?;
    let public_edwards = edwards.compress();

    let s: Scalar = Option::from(Scalar::from_canonical_bytes(s_bytes))
        .ok_or(CryptoError::InvalidSignature)?;

    let mut challenge_hasher = Blake2b512::new();
    challenge_hasher.update(r_bytes);
    challenge_hasher.update(public_edwards.as_bytes());
    challenge_hasher.update(message);
    let h = wide_scalar(challenge_hasher);

    // R' = s*B - h*A must reproduce R.
    let r_check = EdwardsPoint::vartime_double_scalar_mul_basepoint(&-h, &edwards, &s);
    if r_check.compress().as_bytes() == &r_bytes {
        Ok(())
    } else {
        Err(CryptoError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x25519::Keypair;
    use rand_core::OsRng;

    #[test]
    fn test_sign_verify_roundtrip() {
        let kp = Keypair::generate(&mut OsRng);
        let sig = sign(&kp.secret, b"prove this identity", &mut OsRng);
        assert!(verify(&kp.public, b"prove this identity", &sig).is_ok());
    }

    #[test]
    fn test_wrong_message_rejected() {
        let kp = Keypair::generate(&mut OsRng);
        let sig = sign(&kp.secret, b"message one", &mut OsRng);
        assert!(verify(&kp.public, b"message two", &sig).is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let signer = Keypair::generate(&mut OsRng);
        let other = Keypair::generate(&mut OsRng);
        let sig = sign(&signer.secret, b"message", &mut OsRng);
        assert!(verify(&other.public, b"message", &sig).is_err());
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let kp = Keypair::generate(&mut OsRng);
        let mut sig = sign(&kp.secret, b"message", &mut OsRng);
        sig[0] ^= 0x01;
        assert!(verify(&kp.public, b"message", &sig).is_err());

        let mut sig2 = sign(&kp.secret, b"message", &mut OsRng);
        sig2[63] ^= 0x01;
        assert!(verify(&kp.public, b"message", &sig2).is_err());
    }

    #[test]
    fn test_signatures_randomized_but_both_valid() {
        let kp = Keypair::generate(&mut OsRng);
        let sig1 = sign(&kp.secret, b"same message", &mut OsRng);
        let sig2 = sign(&kp.secret, b"same message", &mut OsRng);
        assert_ne!(sig1[..], sig2[..]);
        assert!(verify(&kp.public, b"same message", &sig1).is_ok());
        assert!(verify(&kp.public, b"same message", &sig2).is_ok());
    }

    #[test]
    fn test_truncated_signature_rejected() {
        let kp = Keypair::generate(&mut OsRng);
        let sig = sign(&kp.secret, b"message", &mut OsRng);
        assert!(verify(&kp.public, b"message", &sig[..63]).is_err());
    }
}
