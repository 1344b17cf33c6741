//! The memory component.
//!
//! [`Memory`] owns everything below the TLB and the page content cache: the registry of
//! processes and their sizes, the page tables, the frame allocator behind them, the swap
//! store and the physical byte store. It is also where running out of frames is handled:
//! the oldest resident page of any process is moved to swap to make room.

use std::collections::HashMap;

use crate::{
    Access, FrameNumber, LogicalAddress, MmuConfig, MmuError, PageNumber, Pid,
    address::AddressLayout,
    page_table::{PageEntry, PageTables, Translation},
    physical::PhysicalMemory,
    swap::SwapStore,
};

/// Outcome of resolving an address through the memory component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub translation: Translation,
    /// Whether the page's content had to be read back from swap.
    pub swapped_in: bool,
}

pub struct Memory<P> {
    tables: PageTables,
    swap: SwapStore,
    physical: P,
    /// Registered processes and their size in pages.
    processes: HashMap<Pid, usize>,
    /// Pages moved to swap since the last [`Memory::take_evicted`].
    evicted: Vec<(Pid, PageNumber)>,
}

impl<P: PhysicalMemory> Memory<P> {
    /// Creates the memory component described by `config` on top of `physical`.
    pub fn new(config: &MmuConfig, physical: P) -> Self {
        Self {
            tables: PageTables::new(config.layout(), config.frame_count()),
            swap: SwapStore::new(config.memory.swap_size),
            physical,
            processes: HashMap::new(),
            evicted: Vec::new(),
        }
    }

    pub fn layout(&self) -> AddressLayout {
        self.tables.layout()
    }

    pub fn tables(&self) -> &PageTables {
        &self.tables
    }

    pub fn swap(&self) -> &SwapStore {
        &self.swap
    }

    pub fn physical(&self) -> &P {
        &self.physical
    }

    /// Registers a process owning `page_count` pages of logical address space.
    pub fn create_process(&mut self, pid: Pid, page_count: usize) -> Result<(), MmuError> {
        if self.processes.contains_key(&pid) {
            return Err(MmuError::ProcessExists(pid));
        }

        let layout = self.layout();
        if layout.max_pages().is_some_and(|max| page_count > max) {
            return Err(MmuError::InvalidAddress {
                pid,
                address: PageNumber::new(page_count).start(layout.page_size()),
            });
        }

        self.tables.create_directory(pid);
        self.processes.insert(pid, page_count);
        log::info!("created pid {pid} with {page_count} pages");
        Ok(())
    }

    pub fn process_exists(&self, pid: Pid) -> bool {
        self.processes.contains_key(&pid)
    }

    /// Returns the size of a process in pages.
    pub fn process_page_count(&self, pid: Pid) -> Option<usize> {
        self.processes.get(&pid).copied()
    }

    /// Resolves a logical address of `pid` to a frame for the given access.
    ///
    /// Pages are backed on first touch. If no frame is free, the oldest resident page is
    /// swapped out and the allocation retried once; a page whose content is in swap is
    /// read back in.
    pub fn resolve(
        &mut self,
        pid: Pid,
        addr: LogicalAddress,
        access: Access,
    ) -> Result<Resolution, MmuError> {
        let page = self.checked_page(pid, addr)?;
        self.resolve_page(pid, page, Some(access))
    }

    /// Resolves a page for writing back content, ignoring its permission bits.
    pub fn resolve_for_write_back(
        &mut self,
        pid: Pid,
        page: PageNumber,
    ) -> Result<Resolution, MmuError> {
        self.page_address(pid, page)?;
        self.resolve_page(pid, page, None)
    }

    /// Drains the pages swapped out since the last call.
    ///
    /// Translations cached for these pages are stale. Evictions are recorded even when
    /// the resolution that caused them later fails.
    pub fn take_evicted(&mut self) -> Vec<(Pid, PageNumber)> {
        core::mem::take(&mut self.evicted)
    }

    /// Reads the first `size` bytes of a frame.
    pub fn read_frame(&mut self, frame: FrameNumber, size: usize) -> Result<Vec<u8>, MmuError> {
        self.physical.read_frame(frame, size)
    }

    /// Writes into the frame backing `page` and marks the page modified.
    pub fn write_frame(
        &mut self,
        pid: Pid,
        page: PageNumber,
        frame: FrameNumber,
        offset: usize,
        bytes: &[u8],
    ) -> Result<(), MmuError> {
        self.physical.write_frame(frame, offset, bytes)?;
        if let Some(entry) = self.tables.entry_mut(pid, page) {
            entry.flags_mut().set_modified(true);
        }
        Ok(())
    }

    /// Sets the permission bits of a page.
    pub fn protect(
        &mut self,
        pid: Pid,
        page: PageNumber,
        readable: bool,
        writable: bool,
    ) -> Result<(), MmuError> {
        self.page_address(pid, page)?;
        self.tables.protect(pid, page, readable, writable)
    }

    /// Returns a copy of the leaf entry for a page, if one exists.
    pub fn page_entry(&self, pid: Pid, page: PageNumber) -> Option<PageEntry> {
        self.tables.entry(pid, page)
    }

    /// Releases every frame and swap region of `pid` and forgets the process.
    ///
    /// Returns the number of frames released. Unknown processes are ignored.
    pub fn release_process(&mut self, pid: Pid) -> Result<usize, MmuError> {
        if self.processes.remove(&pid).is_none() {
            return Ok(0);
        }

        let regions = self.swap.release_process(pid);
        let frames = self.tables.release_process(pid)?;
        log::info!("released pid {pid}: {frames} frames, {regions} swap regions");
        Ok(frames)
    }

    /// Checks that `addr` lies inside the address space of a registered process and
    /// returns its page.
    pub fn checked_page(&self, pid: Pid, addr: LogicalAddress) -> Result<PageNumber, MmuError> {
        let page_count = self
            .process_page_count(pid)
            .ok_or(MmuError::UnknownProcess(pid))?;
        let page = self.layout().page_of(addr);
        if page.as_usize() >= page_count {
            return Err(MmuError::InvalidAddress { pid, address: addr });
        }
        Ok(page)
    }

    /// Checks that `page` lies inside the address space of a registered process and
    /// returns its first address.
    pub fn page_address(&self, pid: Pid, page: PageNumber) -> Result<LogicalAddress, MmuError> {
        let page_count = self
            .process_page_count(pid)
            .ok_or(MmuError::UnknownProcess(pid))?;
        let address = page.start(self.layout().page_size());
        if page.as_usize() >= page_count {
            return Err(MmuError::InvalidAddress { pid, address });
        }
        Ok(address)
    }

    fn resolve_page(
        &mut self,
        pid: Pid,
        page: PageNumber,
        access: Option<Access>,
    ) -> Result<Resolution, MmuError> {
        let mut swapped_in = false;

        let translation = match self.walk(pid, page, access) {
            Ok(translation) => translation,
            Err(MmuError::OutOfFrames) => {
                self.evict_one((pid, page))?;
                self.walk(pid, page, access)?
            }
            Err(MmuError::PageFault { .. })
                if self.tables.entry(pid, page).and_then(|e| e.swapped()).is_some() =>
            {
                self.swap_in(pid, page)?;
                swapped_in = true;
                self.walk(pid, page, access)?
            }
            Err(err) => return Err(err),
        };

        Ok(Resolution {
            translation,
            swapped_in,
        })
    }

    fn walk(
        &mut self,
        pid: Pid,
        page: PageNumber,
        access: Option<Access>,
    ) -> Result<Translation, MmuError> {
        match access {
            Some(access) => self.tables.resolve(pid, page, access),
            None => self.tables.resolve_unchecked(pid, page),
        }
    }

    /// Restores a swapped page into a fresh frame.
    ///
    /// The swap region is released only once the page is mapped again; on failure the
    /// frame goes back to the allocator and the page stays in swap.
    fn swap_in(&mut self, pid: Pid, page: PageNumber) -> Result<(), MmuError> {
        let region = self
            .tables
            .entry(pid, page)
            .and_then(|entry| entry.swapped())
            .ok_or(MmuError::PageFault { pid, page })?;
        log::warn!("page fault: pid {pid} page {page} is in swap");

        let frame = match self.tables.allocate_frame() {
            Some(frame) => frame,
            None => {
                self.evict_one((pid, page))?;
                self.tables.allocate_frame().ok_or(MmuError::OutOfFrames)?
            }
        };

        let restored = self
            .swap
            .read(region)
            .and_then(|content| self.physical.write_frame(frame, 0, &content))
            .and_then(|()| self.tables.map_swapped_in(pid, page, frame));
        if let Err(err) = restored {
            log::error!("could not restore pid {pid} page {page} from swap: {err}");
            self.tables.free_frame(frame)?;
            return Err(err);
        }
        self.swap.release_region(region)
    }

    /// Moves the oldest resident page other than `keep` to swap, freeing its frame.
    fn evict_one(&mut self, keep: (Pid, PageNumber)) -> Result<(), MmuError> {
        let victim = self.tables.next_victim(keep).ok_or(MmuError::OutOfFrames)?;
        match self.swap_out(victim) {
            Ok(()) => {
                self.evicted.push(victim);
                Ok(())
            }
            Err(err) => {
                self.tables.restore_victim(victim);
                Err(err)
            }
        }
    }

    fn swap_out(&mut self, (pid, page): (Pid, PageNumber)) -> Result<(), MmuError> {
        let frame = self
            .tables
            .entry(pid, page)
            .and_then(|entry| entry.frame())
            .ok_or_else(|| MmuError::InconsistentTable {
                pid,
                reason: format!("resident page {page} has no frame"),
            })?;

        let content = self.physical.read_frame(frame, self.layout().page_size())?;
        let region = self.swap.swap_out(pid, &content)?;
        self.tables.detach(pid, page, region)?;
        log::debug!("swapped out pid {pid} page {page} from frame {frame}");
        Ok(())
    }
}
