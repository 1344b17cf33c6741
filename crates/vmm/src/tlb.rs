//! Translation lookaside buffer.
//!
//! The TLB caches page-to-frame facts for recently translated pages. It carries no page
//! content, so evicting or flushing an entry never needs a write-back: the page table
//! still holds the same mapping.

use crate::{Access, FrameNumber, PageNumber, Pid, TlbConfig, TlbPolicy};

/// A cached translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntry {
    pub pid: Pid,
    pub page: PageNumber,
    pub frame: FrameNumber,
    /// Whether the page was readable when the translation was cached.
    pub readable: bool,
    /// Whether the page was writable when the translation was cached.
    pub writable: bool,
    /// Tick at which the entry was inserted.
    pub loaded_at: u64,
    /// Tick of the most recent hit, or of the insertion.
    pub last_used_at: u64,
}

impl TlbPolicy {
    /// Returns the index of the entry to replace.
    fn select_victim(self, entries: &[TlbEntry]) -> Option<usize> {
        let key = |entry: &TlbEntry| match self {
            TlbPolicy::Fifo => entry.loaded_at,
            TlbPolicy::Lru => entry.last_used_at,
        };

        entries
            .iter()
            .enumerate()
            .min_by_key(|(_, entry)| key(entry))
            .map(|(index, _)| index)
    }
}

/// A fully associative TLB with FIFO or LRU replacement.
///
/// Time is a logical tick that advances on every lookup and insertion, so replacement
/// order does not depend on the wall clock.
#[derive(Debug)]
pub struct Tlb {
    entries: Vec<TlbEntry>,
    capacity: usize,
    policy: TlbPolicy,
    tick: u64,
}

impl Tlb {
    pub fn new(config: TlbConfig) -> Self {
        Self {
            entries: Vec::with_capacity(config.entries),
            capacity: config.entries,
            policy: config.policy,
            tick: 0,
        }
    }

    /// Returns false if the TLB was configured with zero entries.
    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn policy(&self) -> TlbPolicy {
        self.policy
    }

    /// Looks up the frame for a page, recording the hit.
    pub fn resolve(&mut self, pid: Pid, page: PageNumber) -> Option<FrameNumber> {
        self.resolve_for(pid, page, Access::Read)
    }

    /// Looks up the frame for a page and access kind.
    ///
    /// An access the cached permissions do not grant is a miss, so the caller falls back
    /// to the page table and its permission check.
    pub fn resolve_for(&mut self, pid: Pid, page: PageNumber, access: Access) -> Option<FrameNumber> {
        let now = self.advance();
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.pid == pid && entry.page == page)?;

        let permitted = match access {
            Access::Read => entry.readable,
            Access::Write => entry.writable,
        };
        if !permitted {
            return None;
        }

        entry.last_used_at = now;
        log::trace!("tlb hit: pid {pid} page {page} -> frame {}", entry.frame);
        Some(entry.frame)
    }

    /// Caches a translation, replacing a victim if the TLB is full.
    ///
    /// Returns the evicted entry, if any. Inserting into a disabled TLB does nothing.
    pub fn insert(
        &mut self,
        pid: Pid,
        page: PageNumber,
        frame: FrameNumber,
        readable: bool,
        writable: bool,
    ) -> Option<TlbEntry> {
        if !self.is_enabled() {
            return None;
        }

        let now = self.advance();
        let entry = TlbEntry {
            pid,
            page,
            frame,
            readable,
            writable,
            loaded_at: now,
            last_used_at: now,
        };

        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|existing| existing.pid == pid && existing.page == page)
        {
            *existing = entry;
            return None;
        }

        if self.entries.len() < self.capacity {
            self.entries.push(entry);
            return None;
        }

        let victim = self.policy.select_victim(&self.entries)?;
        let evicted = core::mem::replace(&mut self.entries[victim], entry);
        log::debug!(
            "tlb evicted pid {} page {} ({:?})",
            evicted.pid,
            evicted.page,
            self.policy
        );
        Some(evicted)
    }

    /// Drops the translation for one page. Returns true if it was cached.
    pub fn invalidate(&mut self, pid: Pid, page: PageNumber) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|entry| !(entry.pid == pid && entry.page == page));
        self.entries.len() != before
    }

    /// Drops every translation of a process, returning how many were removed.
    pub fn invalidate_process(&mut self, pid: Pid) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.pid != pid);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Returns the cached entries in slot order.
    pub fn entries(&self) -> &[TlbEntry] {
        &self.entries
    }

    fn advance(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PID: Pid = Pid::new(1);

    fn tlb(entries: usize, policy: TlbPolicy) -> Tlb {
        Tlb::new(TlbConfig { entries, policy })
    }

    fn page(n: usize) -> PageNumber {
        PageNumber::new(n)
    }

    fn frame(n: usize) -> FrameNumber {
        FrameNumber::new(n)
    }

    #[test]
    fn miss_then_hit() {
        let mut tlb = tlb(4, TlbPolicy::Fifo);
        assert_eq!(tlb.resolve(PID, page(3)), None);

        tlb.insert(PID, page(3), frame(7), true, true);
        assert_eq!(tlb.resolve(PID, page(3)), Some(frame(7)));
        assert_eq!(tlb.resolve(Pid::new(2), page(3)), None);
    }

    #[test]
    fn fifo_evicts_oldest_insertion() {
        let capacity = 3;
        let mut tlb = tlb(capacity, TlbPolicy::Fifo);
        for n in 0..=capacity {
            tlb.insert(PID, page(n), frame(n), true, true);
        }

        assert_eq!(tlb.resolve(PID, page(0)), None);
        for n in (1..=capacity).rev() {
            assert_eq!(tlb.resolve(PID, page(n)), Some(frame(n)));
        }
    }

    #[test]
    fn fifo_ignores_hits() {
        let mut tlb = tlb(2, TlbPolicy::Fifo);
        tlb.insert(PID, page(0), frame(0), true, true);
        tlb.insert(PID, page(1), frame(1), true, true);
        tlb.resolve(PID, page(0));

        let evicted = tlb.insert(PID, page(2), frame(2), true, true).unwrap();
        assert_eq!(evicted.page, page(0));
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        let mut tlb = tlb(2, TlbPolicy::Lru);
        tlb.insert(PID, page(0), frame(0), true, true);
        tlb.insert(PID, page(1), frame(1), true, true);
        assert_eq!(tlb.resolve(PID, page(0)), Some(frame(0)));

        let evicted = tlb.insert(PID, page(2), frame(2), true, true).unwrap();
        assert_eq!(evicted.page, page(1));
        assert_eq!(tlb.resolve(PID, page(0)), Some(frame(0)));
        assert_eq!(tlb.resolve(PID, page(2)), Some(frame(2)));
        assert_eq!(tlb.resolve(PID, page(1)), None);
    }

    #[test]
    fn victim_slot_is_replaced_in_place() {
        let mut tlb = tlb(2, TlbPolicy::Fifo);
        tlb.insert(PID, page(0), frame(0), true, true);
        tlb.insert(PID, page(1), frame(1), true, true);
        tlb.insert(PID, page(2), frame(2), true, true);

        let pages: Vec<_> = tlb.entries().iter().map(|entry| entry.page).collect();
        assert_eq!(pages, vec![page(2), page(1)]);
    }

    #[test]
    fn reinserting_a_page_keeps_it_unique() {
        let mut tlb = tlb(2, TlbPolicy::Fifo);
        tlb.insert(PID, page(0), frame(0), true, true);
        tlb.insert(PID, page(0), frame(5), true, true);

        assert_eq!(tlb.len(), 1);
        assert_eq!(tlb.resolve(PID, page(0)), Some(frame(5)));
    }

    #[test]
    fn zero_capacity_always_misses() {
        let mut tlb = tlb(0, TlbPolicy::Lru);
        assert!(!tlb.is_enabled());
        assert_eq!(tlb.insert(PID, page(0), frame(0), true, true), None);
        assert_eq!(tlb.resolve(PID, page(0)), None);
        assert!(tlb.is_empty());
    }

    #[test]
    fn read_only_entry_misses_for_writes() {
        let mut tlb = tlb(2, TlbPolicy::Fifo);
        tlb.insert(PID, page(0), frame(0), true, false);
        assert_eq!(tlb.resolve_for(PID, page(0), Access::Write), None);
        assert_eq!(tlb.resolve_for(PID, page(0), Access::Read), Some(frame(0)));
    }

    #[test]
    fn write_only_entry_misses_for_reads() {
        let mut tlb = tlb(2, TlbPolicy::Fifo);
        tlb.insert(PID, page(0), frame(0), false, true);
        assert_eq!(tlb.resolve(PID, page(0)), None);
        assert_eq!(tlb.resolve_for(PID, page(0), Access::Write), Some(frame(0)));
    }

    #[test]
    fn invalidation() {
        let mut tlb = tlb(4, TlbPolicy::Fifo);
        tlb.insert(PID, page(0), frame(0), true, true);
        tlb.insert(PID, page(1), frame(1), true, true);
        tlb.insert(Pid::new(2), page(0), frame(2), true, true);

        assert!(tlb.invalidate(PID, page(1)));
        assert!(!tlb.invalidate(PID, page(1)));
        assert_eq!(tlb.invalidate_process(PID), 1);
        assert_eq!(tlb.resolve(Pid::new(2), page(0)), Some(frame(2)));

        tlb.clear();
        assert!(tlb.is_empty());
    }
}
