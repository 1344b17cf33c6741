//! Leaf page table entry.

use crate::{FrameNumber, swap::SwapRegion};

use super::flags::PageFlags;

/// A leaf page table entry.
///
/// An entry is in one of three states:
/// - valid, holding the frame that backs the page;
/// - invalid with a swap region, after the page was evicted to swap;
/// - invalid with neither, before the page is first touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageEntry {
    frame: Option<FrameNumber>,
    flags: PageFlags,
    swapped: Option<SwapRegion>,
}

impl PageEntry {
    /// Creates a new, unbacked entry with read and write permission.
    pub const fn new() -> Self {
        Self {
            frame: None,
            flags: PageFlags::read_write(),
            swapped: None,
        }
    }

    /// Returns the frame stored in this entry.
    ///
    /// Returns None if the entry is not valid.
    pub fn frame(&self) -> Option<FrameNumber> {
        if self.flags.is_valid() {
            self.frame
        } else {
            None
        }
    }

    /// Returns the flags for this entry.
    pub fn flags(&self) -> PageFlags {
        self.flags
    }

    /// Returns the flags for this entry for modification.
    pub fn flags_mut(&mut self) -> &mut PageFlags {
        &mut self.flags
    }

    pub fn is_valid(&self) -> bool {
        self.flags.is_valid()
    }

    /// Returns the swap region holding this page's content, if it was swapped out.
    pub fn swapped(&self) -> Option<SwapRegion> {
        self.swapped
    }

    /// Backs this entry with a frame and marks it valid.
    ///
    /// Any swap region is dropped; the caller has already read it back.
    pub fn map(&mut self, frame: FrameNumber) {
        self.frame = Some(frame);
        self.swapped = None;
        self.flags.set_valid(true);
    }

    /// Detaches the frame, recording where the content went.
    ///
    /// Returns the frame that was mapped, or None if the entry was not valid.
    pub fn swap_out(&mut self, region: SwapRegion) -> Option<FrameNumber> {
        let frame = self.frame()?;
        self.frame = None;
        self.swapped = Some(region);
        self.flags.set_valid(false);
        self.flags.set_used(false);
        self.flags.set_modified(false);
        Some(frame)
    }
}

impl Default for PageEntry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_entry_is_unbacked() {
        let entry = PageEntry::new();
        assert!(!entry.is_valid());
        assert_eq!(entry.frame(), None);
        assert_eq!(entry.swapped(), None);
    }

    #[test]
    fn map_makes_entry_valid() {
        let mut entry = PageEntry::new();
        entry.map(FrameNumber::new(5));
        assert!(entry.is_valid());
        assert_eq!(entry.frame(), Some(FrameNumber::new(5)));
    }

    #[test]
    fn swap_out_detaches_frame() {
        let mut swap = crate::swap::SwapStore::new(16);
        let region = swap.swap_out(crate::Pid::new(1), &[0; 4]).unwrap();

        let mut entry = PageEntry::new();
        entry.map(FrameNumber::new(2));
        entry.flags_mut().set_modified(true);

        assert_eq!(entry.swap_out(region), Some(FrameNumber::new(2)));
        assert!(!entry.is_valid());
        assert!(!entry.flags().is_modified());
        assert_eq!(entry.swapped(), Some(region));
        assert_eq!(entry.swap_out(region), None);
    }
}
