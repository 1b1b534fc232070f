//! Numeric utilities: safe and centralized integer conversions.
//!
//! Prefer saturating conversions for metrics and timings, fallible ones where an
//! out-of-range value must stop the operation.

use std::time::Duration;

#[inline]
#[must_use]
pub fn u64_to_usize(v: u64) -> Option<usize> {
    usize::try_from(v).ok()
}

#[inline]
#[must_use]
pub fn usize_to_u64(v: usize) -> u64 {
    u64::try_from(v).unwrap_or(u64::MAX)
}

#[inline]
#[must_use]
pub fn u128_to_u64_saturating(v: u128) -> u64 {
    u64::try_from(v).unwrap_or(u64::MAX)
}

#[inline]
#[must_use]
pub fn i64_to_u64_saturating_nonnegative(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

/// Elapsed milliseconds of a duration, saturating at `u64::MAX`.
#[inline]
#[must_use]
pub fn duration_ms(d: Duration) -> u64 {
    u128_to_u64_saturating(d.as_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u64_to_usize_matches_std_try_from() {
        for &v in &[0u64, 1, 42, u64::from(u32::MAX), u64::from(u32::MAX) + 1] {
            assert_eq!(u64_to_usize(v), usize::try_from(v).ok());
        }
    }

    #[test]
    fn i64_to_u64_nonneg_saturating() {
        assert_eq!(i64_to_u64_saturating_nonnegative(-5), 0);
        assert_eq!(i64_to_u64_saturating_nonnegative(0), 0);
        assert_eq!(i64_to_u64_saturating_nonnegative(7), 7);
    }

    #[test]
    fn u128_to_u64_saturating_edges() {
        assert_eq!(u128_to_u64_saturating(0), 0);
        assert_eq!(u128_to_u64_saturating(u128::from(u64::MAX)), u64::MAX);
        assert_eq!(u128_to_u64_saturating(u128::from(u64::MAX) + 1), u64::MAX);
    }

    #[test]
    fn duration_ms_truncates() {
        assert_eq!(duration_ms(Duration::from_micros(1_999)), 1);
        assert_eq!(duration_ms(Duration::from_secs(2)), 2_000);
    }
}
