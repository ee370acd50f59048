use std::ops::Range;

/// Returns the smallest multiple of `page_size` that is greater than or equal to `size`,
/// or `None` if that multiple does not fit in a `u64`.
pub(crate) fn page_aligned_size(size: u64, page_size: u64) -> Option<u64> {
    debug_assert!(page_size > 0);
    let remainder = size % page_size;
    if remainder == 0 {
        Some(size)
    } else {
        size.checked_add(page_size - remainder)
    }
}

pub(crate) fn is_page_aligned(value: u64, page_size: u64) -> bool {
    value % page_size == 0
}

/// Expands `range` outwards to whole pages. The result starts at the page containing
/// `range.start` and ends at the end of the page containing `range.end - 1`.
pub(crate) fn page_range_covering(range: &Range<u64>, page_size: u64) -> Option<Range<u64>> {
    let start = range.start - range.start % page_size;
    let end = page_aligned_size(range.end, page_size)?;
    Some(start..end)
}

/// Grows `current` by `growth_factor` and never returns less than `needed`. The result is
/// not page aligned; callers pass it to a resize which aligns it.
pub(crate) fn grown_size(current: u64, needed: u64, growth_factor: f64) -> u64 {
    let grown = (current as f64 * growth_factor).floor() as u64;
    grown.max(needed)
}
