//! Branchless integer arithmetic over the pointer-sized word.
//!
//! Every helper here treats `0` the same way the reference allocator this crate
//! is modeled on does: `log2_floor(0) == log2_ceil(0) == 0` and `0` is considered
//! a power of two. Callers never pass `0` through the size-class machinery in
//! practice (the smallest fragment is [`crate::MIN_FRAGMENT_SIZE`]), but keeping
//! these total simplifies every call site above them.

/// True iff `x` is zero or an integer power of two.
#[inline]
pub(crate) const fn is_power_of_two(x: usize) -> bool {
    (x & x.wrapping_sub(1)) == 0
}

/// Greatest `k` such that `2^k <= x`. Returns `0` for `x` in `{0, 1}`.
#[inline]
pub(crate) const fn log2_floor(x: usize) -> u32 {
    let bits = usize::BITS;
    if x <= 1 {
        0
    } else {
        bits - 1 - x.leading_zeros()
    }
}

/// Least `k` such that `2^k >= x`. Returns `0` for `x` in `{0, 1}`.
#[inline]
pub(crate) const fn log2_ceil(x: usize) -> u32 {
    let floor = log2_floor(x);
    if is_power_of_two(x) {
        floor
    } else {
        floor + 1
    }
}

/// `1 << power`, widened to a pointer-sized word before the shift so that the
/// shift amount is never applied to a narrower integer type than the target
/// expects.
#[inline]
pub(crate) const fn pow2(power: u32) -> usize {
    (1usize) << power
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_of_two_predicate() {
        assert!(is_power_of_two(0));
        assert!(is_power_of_two(1));
        assert!(is_power_of_two(2));
        assert!(!is_power_of_two(3));
        assert!(is_power_of_two(4));
        assert!(!is_power_of_two(5));
        assert!(!is_power_of_two(6));
        assert!(!is_power_of_two(7));
        assert!(is_power_of_two(8));
        assert!(!is_power_of_two(9));
    }

    #[test]
    fn floor_matches_reference_table() {
        assert_eq!(log2_floor(0), 0);
        assert_eq!(log2_floor(1), 0);
        assert_eq!(log2_floor(2), 1);
        assert_eq!(log2_floor(3), 1);
        assert_eq!(log2_floor(4), 2);
        assert_eq!(log2_floor(30), 4);
        assert_eq!(log2_floor(60), 5);
        assert_eq!(log2_floor(64), 6);
    }

    #[test]
    fn ceil_matches_reference_table() {
        assert_eq!(log2_ceil(0), 0);
        assert_eq!(log2_ceil(1), 0);
        assert_eq!(log2_ceil(2), 1);
        assert_eq!(log2_ceil(3), 2);
        assert_eq!(log2_ceil(4), 2);
        assert_eq!(log2_ceil(30), 5);
        assert_eq!(log2_ceil(60), 6);
        assert_eq!(log2_ceil(64), 6);
    }

    #[test]
    fn pow2_matches_reference_table() {
        for k in 0..10u32 {
            assert_eq!(pow2(k), 1usize << k);
        }
    }
}
