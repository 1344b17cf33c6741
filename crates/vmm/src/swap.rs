//! Swap store for pages evicted from physical memory.
//!
//! Space is handed out append-only: every region starts where the previous one ended and
//! released space is never reused. Regions are tracked per process so that terminating a
//! process releases everything it owns.

use std::collections::HashMap;

use crate::{MmuError, Pid};

/// A contiguous region of the swap store owned by one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SwapRegion {
    pid: Pid,
    base: usize,
    size: usize,
}

impl SwapRegion {
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    /// Returns the byte offset of this region in the swap store.
    pub const fn base(&self) -> usize {
        self.base
    }

    /// Returns the size of this region in bytes.
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Returns the end offset (exclusive) of this region.
    pub const fn end(&self) -> usize {
        self.base + self.size
    }
}

/// Backing store for swapped-out pages.
pub struct SwapStore {
    storage: Vec<u8>,
    next_offset: usize,
    regions: HashMap<Pid, Vec<SwapRegion>>,
}

impl SwapStore {
    /// Creates an empty swap store of the given capacity in bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            storage: vec![0u8; capacity],
            next_offset: 0,
            regions: HashMap::new(),
        }
    }

    /// Copies `bytes` into a fresh region owned by `pid`.
    pub fn swap_out(&mut self, pid: Pid, bytes: &[u8]) -> Result<SwapRegion, MmuError> {
        let available = self.available();
        if bytes.len() > available {
            log::error!(
                "swap exhausted: pid {pid} needs {} bytes, {available} left",
                bytes.len()
            );
            return Err(MmuError::SwapExhausted {
                requested: bytes.len(),
                available,
            });
        }

        let region = SwapRegion {
            pid,
            base: self.next_offset,
            size: bytes.len(),
        };
        self.storage[region.base..region.end()].copy_from_slice(bytes);
        self.next_offset = region.end();
        self.regions.entry(pid).or_default().push(region);

        log::debug!(
            "swapped out {} bytes for pid {pid} at offset {}",
            region.size,
            region.base
        );
        Ok(region)
    }

    /// Reads back the content of a region and drops it from its owner's list.
    pub fn swap_in(&mut self, region: SwapRegion) -> Result<Vec<u8>, MmuError> {
        let content = self.read(region)?;
        self.release_region(region)?;
        Ok(content)
    }

    /// Reads back the content of a region, leaving it owned.
    pub fn read(&self, region: SwapRegion) -> Result<Vec<u8>, MmuError> {
        if !self.regions(region.pid).contains(&region) {
            return Err(Self::not_owned(region));
        }

        log::debug!(
            "swapped in {} bytes for pid {} from offset {}",
            region.size,
            region.pid,
            region.base
        );
        Ok(self.storage[region.base..region.end()].to_vec())
    }

    /// Drops a region from its owner's list. Its space is not reused.
    pub fn release_region(&mut self, region: SwapRegion) -> Result<(), MmuError> {
        let regions = self
            .regions
            .get_mut(&region.pid)
            .ok_or_else(|| Self::not_owned(region))?;
        let position = regions
            .iter()
            .position(|r| *r == region)
            .ok_or_else(|| Self::not_owned(region))?;
        regions.swap_remove(position);
        Ok(())
    }

    /// Forgets every region owned by `pid`, returning how many there were.
    pub fn release_process(&mut self, pid: Pid) -> usize {
        self.regions.remove(&pid).map_or(0, |regions| regions.len())
    }

    /// Returns the regions currently held for `pid`.
    pub fn regions(&self, pid: Pid) -> &[SwapRegion] {
        self.regions.get(&pid).map_or(&[], Vec::as_slice)
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Returns the number of bytes that can still be allocated.
    pub fn available(&self) -> usize {
        self.storage.len() - self.next_offset
    }

    fn not_owned(region: SwapRegion) -> MmuError {
        MmuError::InconsistentTable {
            pid: region.pid,
            reason: format!("swap region at offset {} is not owned", region.base),
        }
    }
}
