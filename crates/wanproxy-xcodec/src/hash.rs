//! Rolling window hash used to name segments.
//!
//! The rolling value is a polynomial hash over the last [`SEGMENT_LENGTH`]
//! bytes, updated in O(1) as the window slides. [`RollingHash::mix`] runs the
//! rolling value through a 64-bit finaliser so that nearby windows produce
//! well-spread dictionary keys.

use crate::segment::SEGMENT_LENGTH;

const BASE: u64 = 0x0000_0100_0000_01b3;

const fn pow_base(exp: usize) -> u64 {
    let mut acc: u64 = 1;
    let mut i = 0;
    while i < exp {
        acc = acc.wrapping_mul(BASE);
        i += 1;
    }
    acc
}

/// Weight of the byte leaving a full window.
const OUTGOING_WEIGHT: u64 = pow_base(SEGMENT_LENGTH - 1);

/// Incrementally updatable hash over a window of `SEGMENT_LENGTH` bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollingHash {
    value: u64,
}

impl RollingHash {
    /// Create an empty rolling hash
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a byte to a window that is not yet full.
    #[inline]
    pub fn add(&mut self, byte: u8) {
        self.value = self.value.wrapping_mul(BASE).wrapping_add(byte as u64);
    }

    /// Slide a full window by one byte: `outgoing` leaves, `incoming` enters.
    #[inline]
    pub fn roll(&mut self, incoming: u8, outgoing: u8) {
        let trimmed = self
            .value
            .wrapping_sub((outgoing as u64).wrapping_mul(OUTGOING_WEIGHT));
        self.value = trimmed.wrapping_mul(BASE).wrapping_add(incoming as u64);
    }

    /// Forget every byte seen so far.
    pub fn reset(&mut self) {
        self.value = 0;
    }

    /// The dictionary key for the current window.
    #[inline]
    pub fn mix(&self) -> u64 {
        fmix64(self.value)
    }
}

#[inline]
fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

/// Hash a complete segment's bytes.
///
/// Equal to [`RollingHash::mix`] at the end of any window holding the same bytes.
pub fn segment_hash(data: &[u8]) -> u64 {
    let mut hash = RollingHash::new();
    for &b in data {
        hash.add(b);
    }
    hash.mix()
}
