//! Wrap-safe 24-bit counters. Datagram numbers, message numbers and the
//! per-channel ordering/sequencing indices are all 24-bit values that wrap
//! on the wire; comparisons treat a distance of less than half the range
//! as "after".

/// Exclusive upper bound of the 24-bit counter space.
pub const U24_RANGE: u32 = 1 << 24;
const HALF_RANGE: u32 = 1 << 23;
const MASK: u32 = U24_RANGE - 1;

/// A 24-bit wire counter stored masked in a `u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct U24(u32);

impl U24 {
    pub const ZERO: U24 = U24(0);

    #[inline]
    pub fn new(v: u32) -> Self {
        U24(v & MASK)
    }

    #[inline]
    pub fn get(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn wrapping_add(self, rhs: u32) -> Self {
        U24((self.0.wrapping_add(rhs)) & MASK)
    }

    /// Post-increments, returning the pre-increment value.
    #[inline]
    pub fn fetch_inc(&mut self) -> Self {
        let old = *self;
        *self = self.wrapping_add(1);
        old
    }

    /// Forward distance from `from` to `self` over the wrapping space.
    #[inline]
    pub fn diff(self, from: U24) -> u32 {
        self.0.wrapping_sub(from.0) & MASK
    }

    /// `true` when `self` is after `other` over a 24-bit window: the
    /// forward distance from `other` is non-zero and below half range.
    #[inline]
    pub fn after(self, other: U24) -> bool {
        let d = self.diff(other);
        d != 0 && d < HALF_RANGE
    }
}

impl From<u32> for U24 {
    fn from(v: u32) -> Self {
        U24::new(v)
    }
}

impl std::fmt::Display for U24 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn after_agrees_with_natural_order_in_window() {
        for (a, b) in [(1u32, 0u32), (100, 3), (HALF_RANGE - 1, 0)] {
            assert!(U24::new(a).after(U24::new(b)), "{a} after {b}");
            assert!(!U24::new(b).after(U24::new(a)), "{b} not after {a}");
        }
    }

    #[test]
    fn after_handles_wraparound() {
        let before_wrap = U24::new(MASK);
        let after_wrap = U24::new(2);
        assert!(after_wrap.after(before_wrap));
        assert!(!before_wrap.after(after_wrap));
    }

    #[test]
    fn equal_is_not_after() {
        let x = U24::new(77);
        assert!(!x.after(x));
    }

    #[test]
    fn diff_is_forward_distance() {
        assert_eq!(U24::new(5).diff(U24::new(3)), 2);
        assert_eq!(U24::new(1).diff(U24::new(MASK)), 2);
    }

    #[test]
    fn fetch_inc_wraps() {
        let mut n = U24::new(MASK);
        assert_eq!(n.fetch_inc().get(), MASK);
        assert_eq!(n.get(), 0);
    }
}
