//! Page content cache.
//!
//! The cache holds whole pages of content keyed by (pid, page). Writes land in the cache
//! and mark the entry dirty; they reach physical memory only when the entry is evicted or
//! the process is flushed. An entry is never marked clean in place: its dirty bit goes
//! away only when the entry itself does.
//!
//! Replacement uses a clock hand that persists across calls and wraps modulo the number
//! of slots:
//! - `CLOCK` evicts the first slot whose use bit is clear, clearing use bits as it passes.
//! - `CLOCK-M` prefers a slot that is both unused and clean. If a full turn of the hand
//!   finds none, it evicts the first unused slot it saw, dirty or not.
//!
//! Either way the scan ends within two turns of the hand.

use crate::{CacheConfig, CachePolicy, MmuError, PageNumber, Pid};

/// A cached page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pid: Pid,
    page: PageNumber,
    content: Vec<u8>,
    use_bit: bool,
    dirty: bool,
}

impl CacheEntry {
    fn new(pid: Pid, page: PageNumber, content: Vec<u8>) -> Self {
        Self {
            pid,
            page,
            content,
            use_bit: true,
            dirty: false,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn page(&self) -> PageNumber {
        self.page
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn is_used(&self) -> bool {
        self.use_bit
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn matches(&self, pid: Pid, page: PageNumber) -> bool {
        self.pid == pid && self.page == page
    }
}

/// What happens to a process's entries once their content has been written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Leave the entries cached and dirty (a checkpoint).
    Keep,
    /// Remove the process's entries from the cache.
    Clear,
}

/// Page content cache with clock replacement.
#[derive(Debug)]
pub struct PageCache {
    slots: Vec<Option<CacheEntry>>,
    policy: CachePolicy,
    /// Next slot the clock hand will inspect.
    hand: usize,
    page_size: usize,
}

impl PageCache {
    pub fn new(config: CacheConfig, page_size: usize) -> Self {
        Self {
            slots: vec![None; config.entries],
            policy: config.policy,
            hand: 0,
            page_size,
        }
    }

    /// Returns false if the cache was configured with zero entries.
    pub fn is_enabled(&self) -> bool {
        !self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    /// Returns the slot the clock hand points at.
    pub fn hand(&self) -> usize {
        self.hand
    }

    /// Returns the cached entry for a page without touching its use bit.
    pub fn get(&self, pid: Pid, page: PageNumber) -> Option<&CacheEntry> {
        self.slots
            .iter()
            .flatten()
            .find(|entry| entry.matches(pid, page))
    }

    /// Returns the first `size` bytes of a cached page, marking it used.
    pub fn lookup(&mut self, pid: Pid, page: PageNumber, size: usize) -> Option<Vec<u8>> {
        let entry = self.find_mut(pid, page)?;
        entry.use_bit = true;
        let len = size.min(entry.content.len());
        log::trace!("cache hit: pid {pid} page {page}");
        Some(entry.content[..len].to_vec())
    }

    /// Writes `bytes` into a cached page at `offset` and marks it dirty.
    ///
    /// The page must already be cached; callers fill it with a read first.
    pub fn write(
        &mut self,
        pid: Pid,
        page: PageNumber,
        offset: usize,
        bytes: &[u8],
    ) -> Result<(), MmuError> {
        let page_size = self.page_size;
        let entry = self
            .find_mut(pid, page)
            .ok_or(MmuError::NotCached { pid, page })?;

        let end = offset
            .checked_add(bytes.len())
            .filter(|&end| end <= entry.content.len())
            .ok_or(MmuError::InvalidAddress {
                pid,
                address: page.start(page_size) + offset,
            })?;

        entry.content[offset..end].copy_from_slice(bytes);
        entry.use_bit = true;
        entry.dirty = true;
        Ok(())
    }

    /// Caches the content of a page, evicting another page if the cache is full.
    ///
    /// A dirty victim is handed to `write_back` before its slot is reused; if the
    /// write-back fails the cache is left unchanged. Returns the evicted entry, if any.
    /// If the page is already cached its content is replaced and it is marked used.
    pub fn insert_or_update<F>(
        &mut self,
        pid: Pid,
        page: PageNumber,
        content: Vec<u8>,
        mut write_back: F,
    ) -> Result<Option<CacheEntry>, MmuError>
    where
        F: FnMut(Pid, PageNumber, &[u8]) -> Result<(), MmuError>,
    {
        if !self.is_enabled() {
            return Ok(None);
        }

        if let Some(entry) = self.find_mut(pid, page) {
            entry.content = content;
            entry.use_bit = true;
            return Ok(None);
        }

        let evicted = self.make_room(&mut write_back)?;
        if let Some(slot) = self.slots.iter_mut().find(|slot| slot.is_none()) {
            *slot = Some(CacheEntry::new(pid, page, content));
            log::debug!("cache filled: pid {pid} page {page}");
        }
        Ok(evicted)
    }

    /// Frees a slot if the cache is full, writing back the victim if it is dirty.
    ///
    /// Callers that fetch content from a slower store call this before the fetch, so the
    /// write-back of the victim reaches memory before the new page is read. Returns the
    /// evicted entry, or None if a slot was already free. On a failed write-back the
    /// victim stays cached.
    pub fn make_room<F>(&mut self, mut write_back: F) -> Result<Option<CacheEntry>, MmuError>
    where
        F: FnMut(Pid, PageNumber, &[u8]) -> Result<(), MmuError>,
    {
        if !self.is_enabled() || self.slots.iter().any(Option::is_none) {
            return Ok(None);
        }

        let (victim, steps) = self.select_victim();
        if let Some(entry) = self.slots[victim].as_ref().filter(|entry| entry.dirty) {
            write_back(entry.pid, entry.page, &entry.content)?;
        }

        let evicted = self.slots[victim].take();
        self.hand = (victim + 1) % self.slots.len();

        if let Some(evicted) = &evicted {
            log::debug!(
                "cache evicted pid {} page {} (dirty: {}) after {steps} steps of {:?}",
                evicted.pid,
                evicted.page,
                evicted.dirty,
                self.policy
            );
        }
        Ok(evicted)
    }

    /// Writes back every dirty page of `pid`.
    ///
    /// With [`FlushMode::Keep`] the entries stay cached and keep their dirty bits. With
    /// [`FlushMode::Clear`] they are removed once written. Returns the number of pages
    /// written back. Stops at the first failed write-back.
    pub fn flush_process<F>(
        &mut self,
        pid: Pid,
        mode: FlushMode,
        mut write_back: F,
    ) -> Result<usize, MmuError>
    where
        F: FnMut(Pid, PageNumber, &[u8]) -> Result<(), MmuError>,
    {
        let mut written = 0;
        for slot in self.slots.iter_mut() {
            let Some(entry) = slot.as_ref().filter(|entry| entry.pid == pid) else {
                continue;
            };

            if entry.dirty {
                write_back(entry.pid, entry.page, &entry.content)?;
                written += 1;
            }

            if mode == FlushMode::Clear {
                *slot = None;
            }
        }
        Ok(written)
    }

    /// Writes back every dirty page, then empties the cache.
    ///
    /// If a write-back fails, entries not yet written stay cached.
    pub fn flush_all<F>(&mut self, mut write_back: F) -> Result<usize, MmuError>
    where
        F: FnMut(Pid, PageNumber, &[u8]) -> Result<(), MmuError>,
    {
        let mut written = 0;
        for slot in self.slots.iter_mut() {
            if let Some(entry) = slot.as_ref().filter(|entry| entry.dirty) {
                write_back(entry.pid, entry.page, &entry.content)?;
                written += 1;
            }
            *slot = None;
        }
        self.hand = 0;
        Ok(written)
    }

    /// Removes one page from the cache, writing it back first if it is dirty.
    pub fn remove<F>(
        &mut self,
        pid: Pid,
        page: PageNumber,
        mut write_back: F,
    ) -> Result<Option<CacheEntry>, MmuError>
    where
        F: FnMut(Pid, PageNumber, &[u8]) -> Result<(), MmuError>,
    {
        let Some(slot) = self
            .slots
            .iter_mut()
            .find(|slot| slot.as_ref().is_some_and(|entry| entry.matches(pid, page)))
        else {
            return Ok(None);
        };

        if let Some(entry) = slot.as_ref().filter(|entry| entry.dirty) {
            write_back(entry.pid, entry.page, &entry.content)?;
        }
        Ok(slot.take())
    }

    /// Drops every page of `pid` without writing anything back.
    pub fn invalidate_process(&mut self, pid: Pid) -> usize {
        let mut dropped = 0;
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(|entry| entry.pid == pid) {
                *slot = None;
                dropped += 1;
            }
        }
        dropped
    }

    /// Drops every page without writing anything back.
    pub fn clear_all(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.hand = 0;
    }

    fn find_mut(&mut self, pid: Pid, page: PageNumber) -> Option<&mut CacheEntry> {
        self.slots
            .iter_mut()
            .flatten()
            .find(|entry| entry.matches(pid, page))
    }

    /// Runs the clock over a full cache and returns the victim slot together with the
    /// number of slots inspected.
    fn select_victim(&mut self) -> (usize, usize) {
        let len = self.slots.len();
        let mut first_unused = None;

        for step in 1..=2 * len {
            let index = self.hand;
            let Some(entry) = self.slots[index].as_mut() else {
                return (index, step);
            };

            if entry.use_bit {
                entry.use_bit = false;
            } else {
                match self.policy {
                    CachePolicy::Clock => return (index, step),
                    CachePolicy::ClockM if !entry.dirty => return (index, step),
                    CachePolicy::ClockM => {
                        first_unused.get_or_insert(index);
                    }
                }
            }

            self.hand = (index + 1) % len;
            if step % len == 0 {
                if let Some(index) = first_unused {
                    return (index, step);
                }
            }
        }

        // Two turns clear every use bit, so the loop always returns first.
        (first_unused.unwrap_or(self.hand), 2 * len)
    }
}
