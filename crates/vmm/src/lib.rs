//! # Virtual Memory Manager (VMM)
//!
//! The VMM simulates the memory management unit of a teaching operating system. It
//! provides:
//!
//! - Address translation through a TLB with FIFO or LRU replacement.
//! - A page content cache with CLOCK or CLOCK-M replacement and write-back.
//! - Per-process multi-level page tables, created lazily, backed by a frame bitmap.
//! - Swapping of resident pages when physical memory runs out.
//!
//! Everything is driven through [`Mmu`], which is safe to share between threads.

mod address;
mod cache;
mod config;
mod error;
mod frame_allocator;
mod memory;
mod mmu;
mod numbers;
mod page_table;
mod physical;
mod swap;
mod tlb;

pub use address::{AddressLayout, LogicalAddress};
pub use cache::{CacheEntry, FlushMode, PageCache};
pub use config::{CacheConfig, CachePolicy, MemoryConfig, MmuConfig, TlbConfig, TlbPolicy};
pub use error::{ConfigError, MmuError, Result};
pub use frame_allocator::FrameAllocator;
pub use memory::{Memory, Resolution};
pub use mmu::{Mmu, MmuStats};
pub use numbers::{FrameNumber, PageNumber, Pid};
pub use page_table::{
    Access, PageDirectory, PageEntry, PageFlags, PageTables, Slot, TableNode, Translation,
};
pub use physical::{EmulatedMemory, PhysicalMemory};
pub use swap::{SwapRegion, SwapStore};
pub use tlb::{Tlb, TlbEntry};
