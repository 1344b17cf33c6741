//! The memory management unit.
//!
//! [`Mmu`] ties the TLB, the page content cache and the memory component together. Each
//! of the three sits behind its own `spin::Mutex`, and every operation takes the locks it
//! needs in the order cache, TLB, memory and holds them for the whole read-modify-write
//! sequence. That order is what keeps concurrent callers deadlock free, and holding the
//! TLB lock across a page table walk is what keeps a cached translation from outliving
//! the frame it points at.

use core::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use spin::Mutex;

use crate::{
    Access, ConfigError, FrameNumber, LogicalAddress, MmuConfig, MmuError, PageNumber, Pid,
    address::AddressLayout,
    cache::{FlushMode, PageCache},
    memory::Memory,
    page_table::PageEntry,
    physical::{EmulatedMemory, PhysicalMemory},
    tlb::Tlb,
};

#[derive(Debug, Default)]
struct Counters {
    tlb_hits: AtomicU64,
    tlb_misses: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_evictions: AtomicU64,
    write_backs: AtomicU64,
    swap_ins: AtomicU64,
    swap_outs: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// A snapshot of the MMU's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MmuStats {
    pub tlb_hits: u64,
    pub tlb_misses: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
    /// Cached pages written to their frames, by eviction or flush.
    pub write_backs: u64,
    /// Page faults resolved by reading a page back from swap.
    pub swap_ins: u64,
    pub swap_outs: u64,
}

impl fmt::Display for MmuStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "tlb hits:        {}", self.tlb_hits)?;
        writeln!(f, "tlb misses:      {}", self.tlb_misses)?;
        writeln!(f, "cache hits:      {}", self.cache_hits)?;
        writeln!(f, "cache misses:    {}", self.cache_misses)?;
        writeln!(f, "cache evictions: {}", self.cache_evictions)?;
        writeln!(f, "write-backs:     {}", self.write_backs)?;
        writeln!(f, "swap-ins:        {}", self.swap_ins)?;
        write!(f, "swap-outs:       {}", self.swap_outs)
    }
}

/// The memory management unit.
pub struct Mmu<P = EmulatedMemory> {
    config: MmuConfig,
    layout: AddressLayout,
    cache: Mutex<PageCache>,
    tlb: Mutex<Tlb>,
    memory: Mutex<Memory<P>>,
    counters: Counters,
}

impl Mmu<EmulatedMemory> {
    /// Creates an MMU over zeroed emulated memory sized by `config`.
    pub fn new(config: MmuConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let physical = EmulatedMemory::new(config.frame_count(), config.memory.page_size);
        Self::with_memory(config, physical)
    }
}

impl<P: PhysicalMemory> Mmu<P> {
    /// Creates an MMU over a caller-provided physical store.
    pub fn with_memory(config: MmuConfig, physical: P) -> Result<Self, ConfigError> {
        config.validate()?;
        if physical.page_size() != config.memory.page_size {
            return Err(ConfigError::Invalid(format!(
                "physical memory uses {}-byte frames but page_size is {}",
                physical.page_size(),
                config.memory.page_size
            )));
        }

        log::info!(
            "mmu: {} frames of {} bytes, tlb {}x{:?}, cache {}x{:?}",
            config.frame_count(),
            config.memory.page_size,
            config.tlb.entries,
            config.tlb.policy,
            config.cache.entries,
            config.cache.policy
        );

        Ok(Self {
            layout: config.layout(),
            cache: Mutex::new(PageCache::new(config.cache, config.memory.page_size)),
            tlb: Mutex::new(Tlb::new(config.tlb)),
            memory: Mutex::new(Memory::new(&config, physical)),
            counters: Counters::default(),
            config,
        })
    }

    pub fn config(&self) -> &MmuConfig {
        &self.config
    }

    pub fn layout(&self) -> AddressLayout {
        self.layout
    }

    /// Registers a process owning `page_count` pages.
    pub fn create_process(&self, pid: Pid, page_count: usize) -> Result<(), MmuError> {
        self.memory.lock().create_process(pid, page_count)
    }

    pub fn process_exists(&self, pid: Pid) -> bool {
        self.memory.lock().process_exists(pid)
    }

    pub fn process_page_count(&self, pid: Pid) -> Option<usize> {
        self.memory.lock().process_page_count(pid)
    }

    /// Returns a copy of the page table leaf for a page.
    pub fn page_entry(&self, pid: Pid, page: PageNumber) -> Option<PageEntry> {
        self.memory.lock().page_entry(pid, page)
    }

    /// Translates a logical address for reading.
    pub fn translate(&self, pid: Pid, addr: LogicalAddress) -> Result<FrameNumber, MmuError> {
        self.translate_for(pid, addr, Access::Read)
    }

    /// Translates a logical address for the given access.
    ///
    /// The TLB is consulted first. On a miss the page table is walked, which may back the
    /// page with a frame or bring it back from swap, and the result is cached in the TLB.
    pub fn translate_for(
        &self,
        pid: Pid,
        addr: LogicalAddress,
        access: Access,
    ) -> Result<FrameNumber, MmuError> {
        let mut tlb = self.tlb.lock();
        let mut memory = self.memory.lock();
        self.translate_locked(&mut tlb, &mut memory, pid, addr, access)
    }

    /// Returns the first `size` bytes of a page.
    ///
    /// The page is translated for reading before the cache is consulted, so a cached
    /// copy never outlives the page's read permission.
    pub fn read_content(&self, pid: Pid, page: PageNumber, size: usize) -> Result<Vec<u8>, MmuError> {
        let page_size = self.layout.page_size();
        if size > page_size {
            return Err(MmuError::InvalidAddress {
                pid,
                address: page.start(page_size) + size,
            });
        }

        let mut cache = self.cache.lock();
        let mut tlb = self.tlb.lock();
        let mut memory = self.memory.lock();
        let addr = memory.page_address(pid, page)?;
        let frame = self.translate_locked(&mut tlb, &mut memory, pid, addr, Access::Read)?;

        if let Some(content) = cache.lookup(pid, page, size) {
            bump(&self.counters.cache_hits);
            return Ok(content);
        }

        if !cache.is_enabled() {
            return memory.read_frame(frame, size);
        }

        bump(&self.counters.cache_misses);
        log::debug!("cache miss: pid {pid} page {page}");
        let content =
            self.fill_locked(&mut cache, &mut tlb, &mut memory, pid, page, Access::Read)?;
        Ok(content[..size].to_vec())
    }

    /// Writes `bytes` into a page at `offset`.
    ///
    /// With the cache enabled the write lands in the cache and reaches memory on eviction
    /// or flush. A page that is not cached yet is filled from memory first.
    pub fn write_content(
        &self,
        pid: Pid,
        page: PageNumber,
        offset: usize,
        bytes: &[u8],
    ) -> Result<(), MmuError> {
        let page_size = self.layout.page_size();
        if offset
            .checked_add(bytes.len())
            .is_none_or(|end| end > page_size)
        {
            return Err(MmuError::InvalidAddress {
                pid,
                address: page.start(page_size) + offset,
            });
        }

        let mut cache = self.cache.lock();
        let mut tlb = self.tlb.lock();
        let mut memory = self.memory.lock();
        let addr = memory.page_address(pid, page)?;
        let frame = self.translate_locked(&mut tlb, &mut memory, pid, addr, Access::Write)?;

        if !cache.is_enabled() {
            return memory.write_frame(pid, page, frame, offset, bytes);
        }

        match cache.write(pid, page, offset, bytes) {
            Ok(()) => {
                bump(&self.counters.cache_hits);
                return Ok(());
            }
            Err(MmuError::NotCached { .. }) => {}
            Err(err) => return Err(err),
        }

        bump(&self.counters.cache_misses);
        log::debug!("cache miss on write: pid {pid} page {page}");
        self.fill_locked(&mut cache, &mut tlb, &mut memory, pid, page, Access::Write)?;
        cache.write(pid, page, offset, bytes)
    }

    /// Writes back the dirty cached pages of `pid`, keeping them cached.
    pub fn flush_process(&self, pid: Pid) -> Result<usize, MmuError> {
        self.flush_process_with(pid, FlushMode::Keep)
    }

    /// Writes back the dirty cached pages of `pid`, then keeps or drops them.
    ///
    /// Returns the number of pages written back.
    pub fn flush_process_with(&self, pid: Pid, mode: FlushMode) -> Result<usize, MmuError> {
        let mut cache = self.cache.lock();
        let mut tlb = self.tlb.lock();
        let mut memory = self.memory.lock();

        let written = cache.flush_process(pid, mode, |pid, page, bytes| {
            self.write_back_locked(&mut tlb, &mut memory, pid, page, bytes)
        })?;
        log::debug!("flushed pid {pid}: {written} pages written back ({mode:?})");
        Ok(written)
    }

    /// Forgets a terminated process.
    ///
    /// Its cached pages are dropped without write-back, its translations invalidated, and
    /// its frames and swap regions released. Returns the number of frames released.
    pub fn release_process(&self, pid: Pid) -> Result<usize, MmuError> {
        let mut cache = self.cache.lock();
        let mut tlb = self.tlb.lock();
        let mut memory = self.memory.lock();

        let dropped = cache.invalidate_process(pid);
        let invalidated = tlb.invalidate_process(pid);
        log::debug!("pid {pid}: dropped {dropped} cached pages, {invalidated} translations");

        memory.release_process(pid).inspect_err(|err| {
            log::error!("failed to release pid {pid}: {err}");
        })
    }

    /// Writes back every dirty cached page, then empties the cache and the TLB.
    pub fn clear_all(&self) -> Result<usize, MmuError> {
        let mut cache = self.cache.lock();
        let mut tlb = self.tlb.lock();
        let mut memory = self.memory.lock();

        let written = cache.flush_all(|pid, page, bytes| {
            self.write_back_locked(&mut tlb, &mut memory, pid, page, bytes)
        })?;
        tlb.clear();
        log::info!("cleared cache and tlb, {written} pages written back");
        Ok(written)
    }

    /// Sets the read and write permission of a page.
    ///
    /// A cached copy of the page is written back and dropped, and its translation
    /// invalidated, so the next access goes through the new permission bits.
    pub fn protect(
        &self,
        pid: Pid,
        page: PageNumber,
        readable: bool,
        writable: bool,
    ) -> Result<(), MmuError> {
        let mut cache = self.cache.lock();
        let mut tlb = self.tlb.lock();
        let mut memory = self.memory.lock();

        memory.page_address(pid, page)?;
        cache.remove(pid, page, |pid, page, bytes| {
            self.write_back_locked(&mut tlb, &mut memory, pid, page, bytes)
        })?;
        tlb.invalidate(pid, page);
        memory.protect(pid, page, readable, writable)
    }

    pub fn stats(&self) -> MmuStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let counters = &self.counters;
        MmuStats {
            tlb_hits: load(&counters.tlb_hits),
            tlb_misses: load(&counters.tlb_misses),
            cache_hits: load(&counters.cache_hits),
            cache_misses: load(&counters.cache_misses),
            cache_evictions: load(&counters.cache_evictions),
            write_backs: load(&counters.write_backs),
            swap_ins: load(&counters.swap_ins),
            swap_outs: load(&counters.swap_outs),
        }
    }

    fn translate_locked(
        &self,
        tlb: &mut Tlb,
        memory: &mut Memory<P>,
        pid: Pid,
        addr: LogicalAddress,
        access: Access,
    ) -> Result<FrameNumber, MmuError> {
        let page = self.layout.page_of(addr);
        if let Some(frame) = tlb.resolve_for(pid, page, access) {
            bump(&self.counters.tlb_hits);
            return Ok(frame);
        }

        bump(&self.counters.tlb_misses);
        log::debug!("tlb miss: pid {pid} page {page}");

        let result = memory.resolve(pid, addr, access);
        self.retire_evicted(tlb, memory);
        let resolution = result?;
        if resolution.swapped_in {
            bump(&self.counters.swap_ins);
        }

        let translation = resolution.translation;
        tlb.insert(
            pid,
            page,
            translation.frame,
            translation.readable,
            translation.writable,
        );
        Ok(translation.frame)
    }

    /// Reads a whole page from memory into the cache, making room first.
    fn fill_locked(
        &self,
        cache: &mut PageCache,
        tlb: &mut Tlb,
        memory: &mut Memory<P>,
        pid: Pid,
        page: PageNumber,
        access: Access,
    ) -> Result<Vec<u8>, MmuError> {
        let evicted = cache.make_room(|pid, page, bytes| {
            self.write_back_locked(tlb, memory, pid, page, bytes)
        })?;
        if evicted.is_some() {
            bump(&self.counters.cache_evictions);
        }

        // The write-back may have moved pages to swap, so translate after it.
        let page_size = self.layout.page_size();
        let frame = self.translate_locked(tlb, memory, pid, page.start(page_size), access)?;
        let content = memory.read_frame(frame, page_size)?;

        cache.insert_or_update(pid, page, content.clone(), |pid, page, bytes| {
            self.write_back_locked(tlb, memory, pid, page, bytes)
        })?;
        Ok(content)
    }

    /// Writes a whole cached page back to the frame currently backing it.
    fn write_back_locked(
        &self,
        tlb: &mut Tlb,
        memory: &mut Memory<P>,
        pid: Pid,
        page: PageNumber,
        bytes: &[u8],
    ) -> Result<(), MmuError> {
        let frame = match tlb.resolve(pid, page) {
            Some(frame) => frame,
            None => {
                let result = memory.resolve_for_write_back(pid, page);
                self.retire_evicted(tlb, memory);
                let resolution = result?;
                if resolution.swapped_in {
                    bump(&self.counters.swap_ins);
                }
                let translation = resolution.translation;
                tlb.insert(
                    pid,
                    page,
                    translation.frame,
                    translation.readable,
                    translation.writable,
                );
                translation.frame
            }
        };

        memory.write_frame(pid, page, frame, 0, bytes)?;
        bump(&self.counters.write_backs);
        log::debug!("wrote back pid {pid} page {page} to frame {frame}");
        Ok(())
    }

    /// Invalidates the translations of pages the memory component moved to swap.
    fn retire_evicted(&self, tlb: &mut Tlb, memory: &mut Memory<P>) {
        for (pid, page) in memory.take_evicted() {
            tlb.invalidate(pid, page);
            bump(&self.counters.swap_outs);
        }
    }
}
