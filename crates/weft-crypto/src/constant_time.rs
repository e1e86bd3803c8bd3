//! Constant-time comparison helpers.
//!
//! All comparisons accumulate over every byte and never short-circuit;
//! execution time depends only on the compared length.

use subtle::ConstantTimeEq;

/// Constant-time equality of two byte slices.
///
/// Slices of different lengths compare unequal (the length check itself is
/// not secret: lengths are public framing information).
#[must_use]
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Constant-time equality of the first `len` bytes of two slices.
///
/// Returns `false` if either slice is shorter than `len`.
#[must_use]
pub fn ct_eq_prefix(a: &[u8], b: &[u8], len: usize) -> bool {
    if a.len() < len || b.len() < len {
        return false;
    }
    a[..len].ct_eq(&b[..len]).into()
}
