//! Multi-level page tables.
//!
//! Every process owns a [`PageDirectory`]: a tree of [`TableNode`]s whose depth and
//! fan-out come from the [`AddressLayout`]. Tables are created lazily as pages are
//! touched, never eagerly for the whole address space. [`PageTables`] holds the
//! directories of all processes together with the frame allocator that backs their
//! leaves, so that the set of valid leaves and the set of allocated frames always move
//! together.

mod entry;
mod flags;
mod node;

use std::collections::{HashMap, VecDeque};

use crate::{
    FrameNumber, MmuError, PageNumber, Pid, address::AddressLayout,
    frame_allocator::FrameAllocator, swap::SwapRegion,
};

pub use entry::PageEntry;
pub use flags::{Access, PageFlags};
pub use node::{Slot, TableNode};

/// Outcome of a successful page table walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub frame: FrameNumber,
    /// Whether the leaf currently grants read access.
    pub readable: bool,
    /// Whether the leaf currently grants write access.
    pub writable: bool,
    /// Whether the walk allocated the frame.
    pub fresh: bool,
}

/// The page table tree of one process.
#[derive(Debug)]
pub struct PageDirectory {
    /// The root page table for this address space.
    root: TableNode,
    entries: usize,
}

impl PageDirectory {
    /// Creates a new page directory with an empty root page table.
    pub fn new(entries: usize) -> Self {
        Self {
            root: TableNode::new(entries),
            entries,
        }
    }

    /// Walks the tree to the leaf for root-first `indices`.
    ///
    /// Returns None if any table on the way, or the leaf itself, does not exist.
    pub fn walk(&self, indices: &[usize]) -> Option<&PageEntry> {
        let (&leaf_index, path) = indices.split_last()?;
        let mut table = &self.root;

        for &index in path {
            table = match table.slot(index)? {
                Slot::Node(child) => &**child,
                Slot::Empty | Slot::Leaf(_) => return None,
            };
        }

        match table.slot(leaf_index)? {
            Slot::Leaf(entry) => Some(entry),
            Slot::Empty | Slot::Node(_) => None,
        }
    }

    /// Like [`walk`](Self::walk), but returns the leaf for modification.
    pub fn walk_mut(&mut self, indices: &[usize]) -> Option<&mut PageEntry> {
        let (&leaf_index, path) = indices.split_last()?;
        let mut table = &mut self.root;

        for &index in path {
            table = match table.slot_mut(index)? {
                Slot::Node(child) => &mut **child,
                Slot::Empty | Slot::Leaf(_) => return None,
            };
        }

        match table.slot_mut(leaf_index)? {
            Slot::Leaf(entry) => Some(entry),
            Slot::Empty | Slot::Node(_) => None,
        }
    }

    /// Walks the tree, creating intermediate tables and the leaf as needed.
    ///
    /// A newly created leaf is invalid; backing it with a frame is up to the caller.
    pub fn walk_or_create(
        &mut self,
        pid: Pid,
        indices: &[usize],
    ) -> Result<&mut PageEntry, MmuError> {
        let invalid = || MmuError::InvalidIndices {
            pid,
            indices: indices.to_vec(),
        };
        let (&leaf_index, path) = indices.split_last().ok_or_else(invalid)?;
        let entries = self.entries;
        let mut table = &mut self.root;

        for (depth, &index) in path.iter().enumerate() {
            let slot = table.slot_mut(index).ok_or_else(invalid)?;
            if let Slot::Empty = slot {
                *slot = Slot::Node(Box::new(TableNode::new(entries)));
            }

            table = match slot {
                Slot::Node(child) => &mut **child,
                Slot::Empty | Slot::Leaf(_) => {
                    return Err(MmuError::InconsistentTable {
                        pid,
                        reason: format!("leaf found at depth {depth} where a table was expected"),
                    });
                }
            };
        }

        let slot = table.slot_mut(leaf_index).ok_or_else(invalid)?;
        if let Slot::Empty = slot {
            *slot = Slot::Leaf(PageEntry::new());
        }

        match slot {
            Slot::Leaf(entry) => Ok(entry),
            Slot::Empty | Slot::Node(_) => Err(MmuError::InconsistentTable {
                pid,
                reason: "table found where a leaf was expected".into(),
            }),
        }
    }

    /// Visits every leaf entry of this directory.
    pub fn for_each_leaf(&self, mut visit: impl FnMut(&PageEntry)) {
        self.root.for_each_leaf(&mut visit);
    }
}

/// Page tables of every process, and the frames that back them.
pub struct PageTables {
    layout: AddressLayout,
    directories: HashMap<Pid, PageDirectory>,
    allocator: FrameAllocator,
    /// Pages currently holding a frame, oldest mapping first.
    resident: VecDeque<(Pid, PageNumber)>,
}

impl PageTables {
    pub fn new(layout: AddressLayout, frames: usize) -> Self {
        Self {
            layout,
            directories: HashMap::new(),
            allocator: FrameAllocator::new(frames),
            resident: VecDeque::new(),
        }
    }

    pub fn layout(&self) -> AddressLayout {
        self.layout
    }

    pub fn allocator(&self) -> &FrameAllocator {
        &self.allocator
    }

    /// Creates an empty directory for `pid`. Returns false if one already exists.
    pub fn create_directory(&mut self, pid: Pid) -> bool {
        if self.directories.contains_key(&pid) {
            return false;
        }
        self.directories
            .insert(pid, PageDirectory::new(self.layout.entries_per_table()));
        true
    }

    pub fn has_directory(&self, pid: Pid) -> bool {
        self.directories.contains_key(&pid)
    }

    /// Resolves a page to its frame for the given access.
    ///
    /// Tables and the leaf are created on demand, and a leaf that has never been backed
    /// gets a frame from the allocator. Fails with:
    /// - [`MmuError::InvalidAddress`] if the page is beyond the table tree;
    /// - [`MmuError::PermissionDenied`] if the leaf's permission bits forbid the access;
    /// - [`MmuError::PageFault`] if the leaf's content lives in swap;
    /// - [`MmuError::OutOfFrames`] if a frame is needed and none is free.
    pub fn resolve(
        &mut self,
        pid: Pid,
        page: PageNumber,
        access: Access,
    ) -> Result<Translation, MmuError> {
        self.resolve_inner(pid, page, Some(access))
    }

    /// Resolves a page without consulting its permission bits.
    ///
    /// Used to write back content whose write was accepted before the page's permissions
    /// changed.
    pub fn resolve_unchecked(&mut self, pid: Pid, page: PageNumber) -> Result<Translation, MmuError> {
        self.resolve_inner(pid, page, None)
    }

    /// Sets the permission bits of a page, creating its leaf if needed but not backing it.
    pub fn protect(
        &mut self,
        pid: Pid,
        page: PageNumber,
        readable: bool,
        writable: bool,
    ) -> Result<(), MmuError> {
        let indices = self.indices_for(pid, page)?;
        let directory = self
            .directories
            .get_mut(&pid)
            .ok_or(MmuError::UnknownProcess(pid))?;
        let flags = directory.walk_or_create(pid, &indices)?.flags_mut();
        flags.set_readable(readable);
        flags.set_writable(writable);
        Ok(())
    }

    fn resolve_inner(
        &mut self,
        pid: Pid,
        page: PageNumber,
        access: Option<Access>,
    ) -> Result<Translation, MmuError> {
        let indices = self.indices_for(pid, page)?;
        let directory = self
            .directories
            .get_mut(&pid)
            .ok_or(MmuError::UnknownProcess(pid))?;
        let entry = directory.walk_or_create(pid, &indices)?;

        if let Some(access) = access.filter(|&access| !entry.flags().permits(access)) {
            return Err(MmuError::PermissionDenied { pid, page, access });
        }

        let fresh = Self::back(entry, &mut self.allocator, pid, page)?;
        if fresh {
            self.resident.push_back((pid, page));
        }

        entry.flags_mut().set_used(true);
        let frame = entry.frame().ok_or_else(|| MmuError::InconsistentTable {
            pid,
            reason: format!("page {page} is valid without a frame"),
        })?;

        Ok(Translation {
            frame,
            readable: entry.flags().is_readable(),
            writable: entry.flags().is_writable(),
            fresh,
        })
    }

    /// Returns the leaf for root-first `indices`, creating tables, the leaf and its frame
    /// on demand.
    ///
    /// A leaf whose content is in swap is returned as is, still invalid.
    pub fn ensure_leaf(&mut self, pid: Pid, indices: &[usize]) -> Result<&mut PageEntry, MmuError> {
        let page = self
            .layout
            .page_from_indices(indices)
            .ok_or_else(|| MmuError::InvalidIndices {
                pid,
                indices: indices.to_vec(),
            })?;
        let directory = self
            .directories
            .get_mut(&pid)
            .ok_or(MmuError::UnknownProcess(pid))?;
        let entry = directory.walk_or_create(pid, indices)?;

        if entry.swapped().is_none() && Self::back(entry, &mut self.allocator, pid, page)? {
            self.resident.push_back((pid, page));
        }
        Ok(entry)
    }

    /// Returns a copy of the leaf for a page, without creating anything.
    pub fn entry(&self, pid: Pid, page: PageNumber) -> Option<PageEntry> {
        let indices = self.layout.indices(page)?;
        self.directories.get(&pid)?.walk(&indices).copied()
    }

    /// Returns the leaf for a page for modification, without creating anything.
    pub fn entry_mut(&mut self, pid: Pid, page: PageNumber) -> Option<&mut PageEntry> {
        let indices = self.layout.indices(page)?;
        self.directories.get_mut(&pid)?.walk_mut(&indices)
    }

    /// Takes a free frame straight from the allocator.
    pub fn allocate_frame(&mut self) -> Option<FrameNumber> {
        self.allocator.allocate()
    }

    /// Returns a frame obtained from [`allocate_frame`](Self::allocate_frame) that ended up
    /// unused.
    pub fn free_frame(&mut self, frame: FrameNumber) -> Result<(), MmuError> {
        self.allocator.free(frame)
    }

    /// Maps a page whose content has been restored from swap into `frame`.
    pub fn map_swapped_in(
        &mut self,
        pid: Pid,
        page: PageNumber,
        frame: FrameNumber,
    ) -> Result<(), MmuError> {
        let entry = self
            .entry_mut(pid, page)
            .ok_or_else(|| MmuError::InconsistentTable {
                pid,
                reason: format!("page {page} vanished while being swapped in"),
            })?;
        entry.map(frame);
        entry.flags_mut().set_used(true);
        self.resident.push_back((pid, page));
        Ok(())
    }

    /// Picks the oldest resident page other than `keep` as an eviction victim and
    /// removes it from the resident queue.
    pub fn next_victim(&mut self, keep: (Pid, PageNumber)) -> Option<(Pid, PageNumber)> {
        let position = self.resident.iter().position(|&page| page != keep)?;
        self.resident.remove(position)
    }

    /// Puts a victim back at the front of the resident queue after a failed eviction.
    pub fn restore_victim(&mut self, victim: (Pid, PageNumber)) {
        self.resident.push_front(victim);
    }

    /// Detaches a victim's frame after its content was copied to `region`, and frees it.
    pub fn detach(
        &mut self,
        pid: Pid,
        page: PageNumber,
        region: SwapRegion,
    ) -> Result<FrameNumber, MmuError> {
        let frame = self
            .entry_mut(pid, page)
            .and_then(|entry| entry.swap_out(region))
            .ok_or_else(|| MmuError::InconsistentTable {
                pid,
                reason: format!("resident page {page} has no frame"),
            })?;
        self.allocator.free(frame)?;
        Ok(frame)
    }

    /// Discards the tree of `pid` and frees every frame its leaves hold.
    ///
    /// Returns the number of frames released. Releasing a process without tables is a
    /// no-op.
    pub fn release_process(&mut self, pid: Pid) -> Result<usize, MmuError> {
        let Some(directory) = self.directories.remove(&pid) else {
            return Ok(0);
        };
        self.resident.retain(|&(owner, _)| owner != pid);

        let mut frames = Vec::new();
        directory.for_each_leaf(|entry| frames.extend(entry.frame()));

        let mut failed = Vec::new();
        for &frame in &frames {
            if let Err(err) = self.allocator.free(frame) {
                log::error!("pid {pid}: could not release frame {frame}: {err}");
                failed.push(frame.as_usize());
            }
        }

        if !failed.is_empty() {
            return Err(MmuError::InconsistentTable {
                pid,
                reason: format!("frames {failed:?} were already free"),
            });
        }

        log::debug!("released {} frames of pid {pid}", frames.len());
        Ok(frames.len())
    }

    /// Counts the frames referenced by valid leaves across every process.
    pub fn frames_in_use(&self) -> usize {
        let mut count = 0;
        for directory in self.directories.values() {
            directory.for_each_leaf(|entry| {
                if entry.is_valid() {
                    count += 1;
                }
            });
        }
        count
    }

    fn indices_for(&self, pid: Pid, page: PageNumber) -> Result<Vec<usize>, MmuError> {
        self.layout
            .indices(page)
            .ok_or(MmuError::InvalidAddress {
                pid,
                address: page.start(self.layout.page_size()),
            })
    }

    /// Backs a never-used leaf with a fresh frame. Returns true if a frame was allocated.
    fn back(
        entry: &mut PageEntry,
        allocator: &mut FrameAllocator,
        pid: Pid,
        page: PageNumber,
    ) -> Result<bool, MmuError> {
        if entry.is_valid() {
            return Ok(false);
        }
        if entry.swapped().is_some() {
            return Err(MmuError::PageFault { pid, page });
        }

        let frame = allocator.allocate().ok_or(MmuError::OutOfFrames)?;
        entry.map(frame);
        log::debug!("mapped pid {pid} page {page} to frame {frame}");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables(frames: usize) -> PageTables {
        let mut tables = PageTables::new(AddressLayout::new(16, 4, 3), frames);
        tables.create_directory(Pid::new(1));
        tables
    }

    mod directory {
        use super::*;

        #[test]
        fn walk_of_empty_directory_finds_nothing() {
            let directory = PageDirectory::new(4);
            assert!(directory.walk(&[0, 0, 0]).is_none());
        }

        #[test]
        fn walk_or_create_builds_the_path() {
            let mut directory = PageDirectory::new(4);
            let entry = directory.walk_or_create(Pid::new(1), &[1, 2, 3]).unwrap();
            assert!(!entry.is_valid());

            assert!(directory.walk(&[1, 2, 3]).is_some());
            assert!(directory.walk(&[1, 2, 2]).is_none());
            assert!(directory.walk(&[0, 2, 3]).is_none());
        }

        #[test]
        fn walk_or_create_rejects_out_of_range_index() {
            let mut directory = PageDirectory::new(4);
            assert!(matches!(
                directory.walk_or_create(Pid::new(1), &[0, 4, 0]),
                Err(MmuError::InvalidIndices { .. })
            ));
        }

        #[test]
        fn mismatched_depth_is_inconsistent() {
            let mut directory = PageDirectory::new(4);
            directory.walk_or_create(Pid::new(1), &[1, 2]).unwrap();
            assert!(matches!(
                directory.walk_or_create(Pid::new(1), &[1, 2, 3]),
                Err(MmuError::InconsistentTable { .. })
            ));
        }
    }

    #[test]
    fn ensure_leaf_then_resolve_agree() {
        let mut tables = tables(8);
        let pid = Pid::new(1);

        let frame = tables.ensure_leaf(pid, &[1, 2, 3]).unwrap().frame().unwrap();

        let layout = tables.layout();
        let addr = layout.compose(&[1, 2, 3], 0).unwrap();
        let translation = tables
            .resolve(pid, layout.page_of(addr), Access::Read)
            .unwrap();

        assert_eq!(translation.frame, frame);
        assert!(!translation.fresh);
    }

    #[test]
    fn resolve_allocates_on_first_touch() {
        let mut tables = tables(8);
        let pid = Pid::new(1);

        let first = tables.resolve(pid, PageNumber::new(5), Access::Read).unwrap();
        let second = tables.resolve(pid, PageNumber::new(5), Access::Write).unwrap();

        assert!(first.fresh);
        assert!(!second.fresh);
        assert_eq!(first.frame, second.frame);
        assert!(tables.entry(pid, PageNumber::new(5)).unwrap().flags().is_used());
        assert_eq!(tables.allocator().allocated_frames(), 1);
    }

    #[test]
    fn resolve_rejects_pages_beyond_the_tree() {
        let mut tables = tables(8);
        assert!(matches!(
            tables.resolve(Pid::new(1), PageNumber::new(64), Access::Read),
            Err(MmuError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn resolve_unknown_process() {
        let mut tables = tables(8);
        assert_eq!(
            tables.resolve(Pid::new(9), PageNumber::new(0), Access::Read),
            Err(MmuError::UnknownProcess(Pid::new(9)))
        );
    }

    #[test]
    fn resolve_checks_permissions() {
        let mut tables = tables(8);
        let pid = Pid::new(1);
        let page = PageNumber::new(2);
        let indices = tables.layout().indices(page).unwrap();

        tables
            .ensure_leaf(pid, &indices)
            .unwrap()
            .flags_mut()
            .set_writable(false);

        assert!(tables.resolve(pid, page, Access::Read).is_ok());
        assert_eq!(
            tables.resolve(pid, page, Access::Write),
            Err(MmuError::PermissionDenied {
                pid,
                page,
                access: Access::Write
            })
        );
    }

    #[test]
    fn protect_creates_an_unbacked_leaf() {
        let mut tables = tables(8);
        let pid = Pid::new(1);
        let page = PageNumber::new(3);

        tables.protect(pid, page, true, false).unwrap();
        let entry = tables.entry(pid, page).unwrap();
        assert!(!entry.is_valid());
        assert!(!entry.flags().is_writable());
        assert_eq!(tables.allocator().allocated_frames(), 0);

        assert!(matches!(
            tables.resolve(pid, page, Access::Write),
            Err(MmuError::PermissionDenied { .. })
        ));
        let translation = tables.resolve_unchecked(pid, page).unwrap();
        assert!(translation.fresh);
        assert!(translation.readable);
        assert!(!translation.writable);
    }

    #[test]
    fn resolve_reports_out_of_frames() {
        let mut tables = tables(1);
        let pid = Pid::new(1);
        tables.resolve(pid, PageNumber::new(0), Access::Read).unwrap();
        assert_eq!(
            tables.resolve(pid, PageNumber::new(1), Access::Read),
            Err(MmuError::OutOfFrames)
        );
    }

    #[test]
    fn swapped_leaf_faults() {
        let mut tables = tables(2);
        let pid = Pid::new(1);
        let page = PageNumber::new(0);
        tables.resolve(pid, page, Access::Read).unwrap();

        let mut swap = crate::swap::SwapStore::new(64);
        let region = swap.swap_out(pid, &[0; 16]).unwrap();
        assert_eq!(tables.next_victim((pid, PageNumber::new(9))), Some((pid, page)));
        tables.detach(pid, page, region).unwrap();

        assert_eq!(tables.allocator().free_frames(), 2);
        assert_eq!(
            tables.resolve(pid, page, Access::Read),
            Err(MmuError::PageFault { pid, page })
        );
    }

    #[test]
    fn next_victim_skips_the_kept_page() {
        let mut tables = tables(4);
        let pid = Pid::new(1);
        tables.resolve(pid, PageNumber::new(0), Access::Read).unwrap();
        tables.resolve(pid, PageNumber::new(1), Access::Read).unwrap();

        assert_eq!(
            tables.next_victim((pid, PageNumber::new(0))),
            Some((pid, PageNumber::new(1)))
        );
        assert_eq!(tables.next_victim((pid, PageNumber::new(0))), None);
    }

    #[test]
    fn release_frees_every_frame() {
        let mut tables = tables(8);
        let pid = Pid::new(1);
        for page in [0, 5, 17, 63] {
            tables.resolve(pid, PageNumber::new(page), Access::Read).unwrap();
        }
        assert_eq!(tables.frames_in_use(), 4);

        assert_eq!(tables.release_process(pid), Ok(4));
        assert_eq!(tables.allocator().free_frames(), 8);
        assert_eq!(tables.frames_in_use(), 0);
        assert!(!tables.has_directory(pid));
        assert_eq!(tables.release_process(pid), Ok(0));
    }

    #[test]
    fn release_names_frames_that_were_already_free() {
        let mut tables = tables(8);
        let pid = Pid::new(1);
        tables.resolve(pid, PageNumber::new(0), Access::Read).unwrap();
        let stray = tables.resolve(pid, PageNumber::new(1), Access::Read).unwrap().frame;
        tables.free_frame(stray).unwrap();

        let err = tables.release_process(pid).unwrap_err();
        let MmuError::InconsistentTable { reason, .. } = &err else {
            panic!("unexpected error {err:?}");
        };
        assert_eq!(*reason, format!("frames [{}] were already free", stray.as_usize()));
        assert_eq!(tables.allocator().free_frames(), 8);
    }

    #[test]
    fn bitmap_matches_valid_leaves_across_processes() {
        let mut tables = tables(8);
        tables.create_directory(Pid::new(2));
        tables.resolve(Pid::new(1), PageNumber::new(0), Access::Read).unwrap();
        tables.resolve(Pid::new(2), PageNumber::new(0), Access::Read).unwrap();
        tables.resolve(Pid::new(2), PageNumber::new(7), Access::Read).unwrap();

        assert_eq!(tables.frames_in_use(), tables.allocator().allocated_frames());
        tables.release_process(Pid::new(2)).unwrap();
        assert_eq!(tables.frames_in_use(), tables.allocator().allocated_frames());
    }
}
