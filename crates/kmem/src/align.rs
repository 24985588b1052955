//! Alignment helpers shared by the heap and pool allocators.

/// The smallest alignment either allocator hands out.
///
/// Both allocators store machine words (block headers, free-list links)
/// inside the managed region, so nothing smaller than a pointer is usable.
pub const ALIGN_MIN: usize = align_of::<usize>();

/// Rounds `value` up to the next multiple of `align`.
///
/// Returns `None` on overflow.
///
/// # Panics
///
/// Panics if `align` is not a power of two.
#[must_use]
pub const fn align_up(value: usize, align: usize) -> Option<usize> {
    assert!(align.is_power_of_two(), "alignment must be a power of two");
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Rounds `value` down to the previous multiple of `align`.
///
/// # Panics
///
/// Panics if `align` is not a power of two.
#[must_use]
pub const fn align_down(value: usize, align: usize) -> usize {
    assert!(align.is_power_of_two(), "alignment must be a power of two");
    value & !(align - 1)
}

/// Returns `true` if `value` is a multiple of `align`.
#[must_use]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    align_down(value, align) == value
}

/// Shrinks the byte range `start..start + len` to the largest sub-range whose
/// start and length are both multiples of `align`.
///
/// Returns the aligned start address and the aligned length. The length is
/// zero if nothing aligned fits.
#[must_use]
pub fn align_region(start: *mut u8, len: usize, align: usize) -> (*mut u8, usize) {
    let offset = start.align_offset(align);
    let len = align_down(len.saturating_sub(offset), align);
    (start.wrapping_add(offset), len)
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), Some(0));
        assert_eq!(align_up(1, 8), Some(8));
        assert_eq!(align_up(8, 8), Some(8));
        assert_eq!(align_up(27, 4), Some(28));
        assert_eq!(align_up(28, 4), Some(28));
        assert_eq!(align_up(usize::MAX, 8), None);
    }

    #[test]
    fn test_align_down() {
        assert_eq!(align_down(1023, 4), 1020);
        assert_eq!(align_down(1024, 4), 1024);
        assert_eq!(align_down(7, 8), 0);
    }

    #[test]
    fn test_is_aligned() {
        assert!(is_aligned(0, 16));
        assert!(is_aligned(32, 16));
        assert!(!is_aligned(33, 16));
    }

    #[test]
    #[should_panic = "alignment must be a power of two"]
    fn test_align_up_rejects_non_power_of_two() {
        let _ = align_up(10, 3);
    }

    #[test]
    fn test_align_region() {
        let mut buf = [0_u64; 8];
        let base = buf.as_mut_ptr().cast::<u8>();

        let (start, len) = align_region(base, 64, 8);
        assert_eq!(start, base);
        assert_eq!(len, 64);

        let (start, len) = align_region(base.wrapping_add(1), 63, 8);
        assert_eq!(start, base.wrapping_add(8));
        assert_eq!(len, 56);

        let (_, len) = align_region(base.wrapping_add(1), 6, 8);
        assert_eq!(len, 0);
    }
}
