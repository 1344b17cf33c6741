//! Physical frame allocator backed by a free bitmap.
//!
//! Each frame is represented by one bit, set while the frame is free. Allocation is
//! first-fit: the lowest-numbered free frame is handed out. The allocator itself is not
//! synchronised; callers keep it behind the memory component's lock.

use crate::{FrameNumber, MmuError};

const BITS_PER_WORD: usize = u64::BITS as usize;

/// Bitmap allocator for physical frames.
#[derive(Debug, Clone)]
pub struct FrameAllocator {
    /// One bit per frame, set when the frame is free.
    free_map: Vec<u64>,
    total_frames: usize,
    free_frames: usize,
}

impl FrameAllocator {
    /// Creates an allocator with every frame free.
    pub fn new(total_frames: usize) -> Self {
        let words = total_frames.div_ceil(BITS_PER_WORD);
        let mut free_map = vec![u64::MAX; words];

        // Bits past the last frame must never look free.
        let tail = total_frames % BITS_PER_WORD;
        if tail != 0 {
            if let Some(last) = free_map.last_mut() {
                *last = (1u64 << tail) - 1;
            }
        }

        Self {
            free_map,
            total_frames,
            free_frames: total_frames,
        }
    }

    /// Allocates the lowest-numbered free frame, or returns None if every frame is in use.
    pub fn allocate(&mut self) -> Option<FrameNumber> {
        let (word_index, word) = self
            .free_map
            .iter_mut()
            .enumerate()
            .find(|(_, word)| **word != 0)?;

        let bit = word.trailing_zeros() as usize;
        *word &= !(1u64 << bit);
        self.free_frames -= 1;

        let frame = FrameNumber::new(word_index * BITS_PER_WORD + bit);
        log::trace!("allocated frame {frame}");
        Some(frame)
    }

    /// Returns a frame to the free pool.
    ///
    /// Freeing a frame that is already free, or that does not exist, means the page
    /// table bookkeeping has gone wrong somewhere; it is reported as
    /// [`MmuError::DoubleFree`] and the bitmap is left untouched.
    pub fn free(&mut self, frame: FrameNumber) -> Result<(), MmuError> {
        if frame.as_usize() >= self.total_frames {
            log::error!("attempted to free nonexistent frame {frame}");
            return Err(MmuError::DoubleFree(frame));
        }

        let (word_index, mask) = Self::locate(frame);
        let word = &mut self.free_map[word_index];
        if *word & mask != 0 {
            log::error!("double free of frame {frame}");
            return Err(MmuError::DoubleFree(frame));
        }

        *word |= mask;
        self.free_frames += 1;
        log::trace!("freed frame {frame}");
        Ok(())
    }

    /// Returns true if the frame is currently free.
    pub fn is_free(&self, frame: FrameNumber) -> bool {
        if frame.as_usize() >= self.total_frames {
            return false;
        }
        let (word_index, mask) = Self::locate(frame);
        self.free_map[word_index] & mask != 0
    }

    /// Returns the total number of frames managed by this allocator.
    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    /// Returns the number of free frames.
    pub fn free_frames(&self) -> usize {
        self.free_frames
    }

    /// Returns the number of allocated frames.
    pub fn allocated_frames(&self) -> usize {
        self.total_frames - self.free_frames
    }

    fn locate(frame: FrameNumber) -> (usize, u64) {
        let index = frame.as_usize();
        (index / BITS_PER_WORD, 1u64 << (index % BITS_PER_WORD))
    }
}
