use crate::util::constants::*;
use crate::util::Address;

pub fn page_align_down(address: Address) -> Address {
    address.align_down(BYTES_IN_PAGE)
}

pub fn page_align_up(address: Address) -> Address {
    address.align_up(BYTES_IN_PAGE)
}

pub fn is_page_aligned(address: Address) -> bool {
    address.is_aligned_to(BYTES_IN_PAGE)
}

pub fn raw_align_up(val: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (val + align - 1) & !(align - 1)
}

pub fn raw_align_down(val: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    val & !(align - 1)
}

pub fn bytes_to_pages_up(bytes: usize) -> usize {
    raw_align_up(bytes, BYTES_IN_PAGE) >> LOG_BYTES_IN_PAGE
}

/// Rounds an allocation request up to the collector's object granule.
pub fn align_object_size(size: usize) -> usize {
    raw_align_up(size.max(MIN_OBJECT_SIZE), ALLOC_ALIGN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_roundings() {
        assert_eq!(raw_align_up(1, 8), 8);
        assert_eq!(raw_align_up(8, 8), 8);
        assert_eq!(raw_align_down(15, 8), 8);
        assert_eq!(bytes_to_pages_up(1), 1);
        assert_eq!(bytes_to_pages_up(BYTES_IN_PAGE + 1), 2);
    }

    #[test]
    fn object_granule() {
        assert_eq!(align_object_size(1), MIN_OBJECT_SIZE);
        assert_eq!(align_object_size(17), 24);
    }
}
