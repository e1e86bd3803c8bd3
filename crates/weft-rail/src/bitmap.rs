//! Byte-aligned sliding replay bitmap with configurable width.
//!
//! Same semantics as the tunnel's 64-bit window, but stored in a byte
//! array so the width is a policy decision (any positive multiple of 8).
//! Bit 0 corresponds to the highest accepted nonce; bit k to `head - k`.

use crate::error::RailError;

/// Sliding replay bitmap.
#[derive(Debug, Clone)]
pub struct SlidingBitmap {
    bits: Vec<u8>,
    head: u64,
}

impl SlidingBitmap {
    /// Create a bitmap of `width_bits` bits.
    ///
    /// # Errors
    ///
    /// Returns `RailError::InvalidWindowWidth` unless the width is a
    /// positive multiple of 8.
    pub fn new(width_bits: usize) -> Result<Self, RailError> {
        if width_bits == 0 || width_bits % 8 != 0 {
            return Err(RailError::InvalidWindowWidth(width_bits));
        }
        Ok(Self {
            bits: vec![0u8; width_bits / 8],
            head: 0,
        })
    }

    /// Window width in bits.
    #[must_use]
    pub fn width(&self) -> u64 {
        (self.bits.len() * 8) as u64
    }

    /// Highest accepted nonce.
    #[must_use]
    pub fn head(&self) -> u64 {
        self.head
    }

    fn get_bit(&self, k: u64) -> bool {
        let byte = (k / 8) as usize;
        let bit = k % 8;
        (self.bits[byte] >> bit) & 1 == 1
    }

    fn set_bit(&mut self, k: u64) {
        let byte = (k / 8) as usize;
        let bit = k % 8;
        self.bits[byte] |= 1 << bit;
    }

    /// Shift every recorded bit toward older positions by `by` bits.
    fn shift(&mut self, by: u64) {
        let width = self.width();
        if by >= width {
            self.bits.fill(0);
            return;
        }
        let byte_shift = (by / 8) as usize;
        let bit_shift = (by % 8) as u32;
        let len = self.bits.len();
        for i in (0..len).rev() {
            let lo = if i >= byte_shift {
                self.bits[i - byte_shift]
            } else {
                0
            };
            let carry = if bit_shift > 0 && i > byte_shift {
                self.bits[i - byte_shift - 1] >> (8 - bit_shift)
            } else {
                0
            };
            self.bits[i] = (lo << bit_shift) | carry;
        }
    }

    /// Whether `nonce` counts as already seen. Nonce 0 is always seen;
    /// nonces older than the window's reach are treated as seen.
    #[must_use]
    pub fn has_seen(&self, nonce: u64) -> bool {
        if nonce == 0 {
            return true;
        }
        if nonce > self.head {
            return false;
        }
        let diff = self.head - nonce;
        if diff >= self.width() {
            return true;
        }
        self.get_bit(diff)
    }

    /// Mark `nonce` as seen, advancing the window when it exceeds the head.
    pub fn mark(&mut self, nonce: u64) {
        if nonce == 0 {
            return;
        }
        if nonce > self.head {
            let diff = nonce - self.head;
            self.shift(diff);
            self.head = nonce;
            self.set_bit(0);
        } else {
            let diff = self.head - nonce;
            if diff < self.width() {
                self.set_bit(diff);
            }
        }
    }

    /// Accept `nonce` if unseen, marking it. Returns false on replay.
    pub fn check_and_mark(&mut self, nonce: u64) -> bool {
        if self.has_seen(nonce) {
            return false;
        }
        self.mark(nonce);
        true
    }

    /// Reset to empty.
    pub fn reset(&mut self) {
        self.bits.fill(0);
        self.head = 0;
    }
}
