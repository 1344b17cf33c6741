//! Logical addresses and their decomposition into page table indices.
//!
//! A logical address is split into a page number and an in-page offset. The page number
//! is further split into one index per page table level, root first. Unlike hardware
//! paging, the table fan-out is configurable and need not be a power of two, so the split
//! is done arithmetically rather than with bit masks.

use core::fmt;
use core::ops::Add;

use crate::numbers::PageNumber;

/// A logical (virtual) address within one process address space.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct LogicalAddress(usize);

impl LogicalAddress {
    /// Creates a new logical address.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Returns the raw address value.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns true if the address is aligned to the given page size.
    #[inline]
    pub const fn is_aligned(self, page_size: usize) -> bool {
        self.0 % page_size == 0
    }
}

impl fmt::Debug for LogicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogicalAddress({:#x})", self.0)
    }
}

impl fmt::Display for LogicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<usize> for LogicalAddress {
    #[inline]
    fn from(value: usize) -> Self {
        Self(value)
    }
}

/// Saturating, like [`PageNumber::start`].
impl Add<usize> for LogicalAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: usize) -> Self::Output {
        Self(self.0.saturating_add(rhs))
    }
}

/// Geometry of a process address space.
///
/// Level `levels - 1` is the root table and level 0 is the table holding leaf entries,
/// matching the way hardware page tables are usually numbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressLayout {
    page_size: usize,
    entries_per_table: usize,
    levels: usize,
}

impl AddressLayout {
    /// Creates a layout. Callers are expected to have validated the values through
    /// [`crate::MmuConfig::validate`].
    pub const fn new(page_size: usize, entries_per_table: usize, levels: usize) -> Self {
        Self {
            page_size,
            entries_per_table,
            levels,
        }
    }

    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    pub const fn entries_per_table(&self) -> usize {
        self.entries_per_table
    }

    pub const fn levels(&self) -> usize {
        self.levels
    }

    /// Returns the number of pages addressable through the table tree, or None if it
    /// overflows `usize`.
    pub fn max_pages(&self) -> Option<usize> {
        let levels = u32::try_from(self.levels).ok()?;
        self.entries_per_table.checked_pow(levels)
    }

    /// Returns the page containing the given address.
    #[inline]
    pub const fn page_of(&self, addr: LogicalAddress) -> PageNumber {
        PageNumber::new(addr.as_usize() / self.page_size)
    }

    /// Returns the offset of the given address within its page.
    #[inline]
    pub const fn offset_of(&self, addr: LogicalAddress) -> usize {
        addr.as_usize() % self.page_size
    }

    /// Returns the table index for a page at the specified level.
    #[inline]
    pub fn page_index(&self, page: PageNumber, level: usize) -> usize {
        let divisor = self.entries_per_table.pow(level as u32);
        (page.as_usize() / divisor) % self.entries_per_table
    }

    /// Splits a page number into its table indices, root first.
    ///
    /// Returns None if the page lies beyond what the table tree can address.
    pub fn indices(&self, page: PageNumber) -> Option<Vec<usize>> {
        if page.as_usize() >= self.max_pages()? {
            return None;
        }

        Some(
            (0..self.levels)
                .rev()
                .map(|level| self.page_index(page, level))
                .collect(),
        )
    }

    /// Reassembles a page number from root-first table indices.
    ///
    /// Returns None if the number of indices does not match the level count or an index
    /// is out of range for a table.
    pub fn page_from_indices(&self, indices: &[usize]) -> Option<PageNumber> {
        if indices.len() != self.levels {
            return None;
        }

        let mut page = 0usize;
        for &index in indices {
            if index >= self.entries_per_table {
                return None;
            }
            page = page
                .checked_mul(self.entries_per_table)?
                .checked_add(index)?;
        }
        Some(PageNumber::new(page))
    }

    /// Builds the logical address for root-first table indices and an in-page offset.
    pub fn compose(&self, indices: &[usize], offset: usize) -> Option<LogicalAddress> {
        if offset >= self.page_size {
            return None;
        }
        let page = self.page_from_indices(indices)?;
        let base = page.as_usize().checked_mul(self.page_size)?;
        Some(LogicalAddress::new(base + offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> AddressLayout {
        AddressLayout::new(16, 4, 3)
    }

    #[test]
    fn splits_page_and_offset() {
        let layout = layout();
        let addr = LogicalAddress::new(16 * 9 + 5);
        assert_eq!(layout.page_of(addr), PageNumber::new(9));
        assert_eq!(layout.offset_of(addr), 5);
    }

    #[test]
    fn offsets_saturate() {
        let addr = LogicalAddress::new(usize::MAX - 1) + 4;
        assert_eq!(addr.as_usize(), usize::MAX);
    }

    #[test]
    fn indices_are_root_first() {
        // 27 = 1*16 + 2*4 + 3
        let indices = layout().indices(PageNumber::new(27)).unwrap();
        assert_eq!(indices, vec![1, 2, 3]);
    }

    #[test]
    fn page_index_per_level() {
        let layout = layout();
        let page = PageNumber::new(27);
        assert_eq!(layout.page_index(page, 0), 3);
        assert_eq!(layout.page_index(page, 1), 2);
        assert_eq!(layout.page_index(page, 2), 1);
    }

    #[test]
    fn rejects_pages_beyond_the_tree() {
        let layout = layout();
        assert_eq!(layout.max_pages(), Some(64));
        assert!(layout.indices(PageNumber::new(63)).is_some());
        assert!(layout.indices(PageNumber::new(64)).is_none());
    }

    #[test]
    fn compose_inverts_indices() {
        let layout = layout();
        let addr = layout.compose(&[1, 2, 3], 7).unwrap();
        assert_eq!(addr.as_usize(), 27 * 16 + 7);
        assert_eq!(layout.indices(layout.page_of(addr)).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn compose_rejects_bad_input() {
        let layout = layout();
        assert!(layout.compose(&[1, 2], 0).is_none());
        assert!(layout.compose(&[1, 2, 4], 0).is_none());
        assert!(layout.compose(&[1, 2, 3], 16).is_none());
    }

    #[test]
    fn non_power_of_two_fan_out() {
        let layout = AddressLayout::new(10, 3, 2);
        assert_eq!(layout.max_pages(), Some(9));
        assert_eq!(layout.indices(PageNumber::new(7)).unwrap(), vec![2, 1]);
    }
}
