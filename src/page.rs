//! Page-size discovery and the small alignment-arithmetic helpers used
//! throughout the allocator.

/// Round `size` up to the nearest multiple of `align`, which must be a
/// power of two.
pub(crate) fn round_up(size: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (size + (align - 1)) & !(align - 1)
}

/// Round `size` up to the nearest multiple of the host page size.
pub(crate) fn round_up_to_page_size(size: usize, page_size: usize) -> usize {
    round_up(size, page_size)
}

/// Round `size` up to the nearest multiple of 16, the data/code alignment
/// the allocator guarantees regardless of page size.
pub(crate) fn round_up_16(size: usize) -> usize {
    round_up(size, 16)
}

/// Query the host page size once and cache it for the lifetime of the
/// process. `region::page::size()` already memoizes this on most
/// platforms, but we avoid relying on that implementation detail.
pub(crate) fn page_size() -> usize {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let size = region::page::size();
    PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 16), 0);
        assert_eq!(round_up(1, 16), 16);
        assert_eq!(round_up(16, 16), 16);
        assert_eq!(round_up(17, 16), 32);
    }

    #[test]
    fn test_round_up_to_page_size() {
        assert_eq!(round_up_to_page_size(0, 4096), 0);
        assert_eq!(round_up_to_page_size(1, 4096), 4096);
        assert_eq!(round_up_to_page_size(4096, 4096), 4096);
        assert_eq!(round_up_to_page_size(4097, 4096), 8192);
    }

    #[test]
    fn test_round_up_16() {
        assert_eq!(round_up_16(0), 0);
        assert_eq!(round_up_16(3), 16);
        assert_eq!(round_up_16(40), 48);
    }

    #[test]
    fn test_page_size_is_power_of_two_and_stable() {
        let a = page_size();
        let b = page_size();
        assert_eq!(a, b);
        assert!(a.is_power_of_two());
    }
}
