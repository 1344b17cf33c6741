//! Error types for the memory manager.

use thiserror::Error;

use crate::{Access, FrameNumber, LogicalAddress, PageNumber, Pid};

/// Result alias used across the memory manager.
pub type Result<T> = core::result::Result<T, MmuError>;

/// Errors surfaced by translation, content and lifecycle operations.
///
/// A TLB or cache miss is not an error; lookups report it as `None`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MmuError {
    /// The leaf entry is not backed by a frame and has no swap copy to recover from.
    #[error("page fault: pid {pid} page {page}")]
    PageFault { pid: Pid, page: PageNumber },
    /// The access violates the leaf's read/write permission bits.
    #[error("permission denied: pid {pid} page {page} ({access:?})")]
    PermissionDenied {
        pid: Pid,
        page: PageNumber,
        access: Access,
    },
    /// The request lies outside the configured or registered address space.
    #[error("invalid address {address} for pid {pid}")]
    InvalidAddress { pid: Pid, address: LogicalAddress },
    /// Table indices do not name a slot in the configured tree.
    #[error("invalid table indices {indices:?} for pid {pid}")]
    InvalidIndices { pid: Pid, indices: Vec<usize> },
    /// No free frame and nothing could be swapped out to make room.
    #[error("out of physical frames")]
    OutOfFrames,
    /// The swap store cannot hold another region.
    #[error("swap exhausted: requested {requested} bytes, {available} available")]
    SwapExhausted { requested: usize, available: usize },
    /// A frame was released twice.
    #[error("double free of frame {0}")]
    DoubleFree(FrameNumber),
    /// Page table bookkeeping disagrees with the frame allocator.
    #[error("inconsistent page table for pid {pid}: {reason}")]
    InconsistentTable { pid: Pid, reason: String },
    /// A cache write targeted an entry that was never filled.
    #[error("pid {pid} page {page} is not cached")]
    NotCached { pid: Pid, page: PageNumber },
    #[error("unknown process {0}")]
    UnknownProcess(Pid),
    #[error("process {0} already exists")]
    ProcessExists(Pid),
    /// The physical store reported a failure.
    #[error("backing store error: {0}")]
    Backing(String),
}

impl MmuError {
    /// Returns true if the error leaves the affected process unusable.
    ///
    /// These errors indicate exhausted secondary storage or broken bookkeeping; the
    /// service itself keeps running and other processes are unaffected.
    pub fn is_fatal_to_process(&self) -> bool {
        matches!(
            self,
            Self::SwapExhausted { .. } | Self::DoubleFree(_) | Self::InconsistentTable { .. }
        )
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(MmuError::DoubleFree(FrameNumber::new(1)).is_fatal_to_process());
        assert!(
            MmuError::SwapExhausted {
                requested: 16,
                available: 0
            }
            .is_fatal_to_process()
        );
        assert!(
            !MmuError::PageFault {
                pid: Pid::new(1),
                page: PageNumber::new(0)
            }
            .is_fatal_to_process()
        );
        assert!(!MmuError::OutOfFrames.is_fatal_to_process());
    }

    #[test]
    fn messages_name_the_process() {
        let err = MmuError::InvalidAddress {
            pid: Pid::new(3),
            address: LogicalAddress::new(0x40),
        };
        assert_eq!(err.to_string(), "invalid address 0x40 for pid 3");
    }
}
