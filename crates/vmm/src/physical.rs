//! Physical memory byte store.
//!
//! The memory manager only ever touches physical memory through [`PhysicalMemory`], so a
//! simulation can plug in its own store. [`EmulatedMemory`] is a flat in-process buffer.

use crate::{FrameNumber, MmuError};

/// A byte store addressed by frame.
pub trait PhysicalMemory: Send {
    /// Returns the page size this store was created with.
    fn page_size(&self) -> usize;

    /// Reads the first `size` bytes of a frame.
    fn read_frame(&mut self, frame: FrameNumber, size: usize) -> Result<Vec<u8>, MmuError>;

    /// Writes `bytes` into a frame starting at `offset`.
    fn write_frame(
        &mut self,
        frame: FrameNumber,
        offset: usize,
        bytes: &[u8],
    ) -> Result<(), MmuError>;
}

/// Emulated physical memory for simulation.
///
/// This provides a zero-initialised buffer of `frames * page_size` bytes.
pub struct EmulatedMemory {
    memory: Vec<u8>,
    page_size: usize,
}

impl EmulatedMemory {
    /// Creates a new emulated memory holding `frames` frames.
    pub fn new(frames: usize, page_size: usize) -> Self {
        Self {
            memory: vec![0u8; frames * page_size],
            page_size,
        }
    }

    /// Returns the size of the emulated memory in bytes.
    pub fn size(&self) -> usize {
        self.memory.len()
    }

    fn range(
        &self,
        frame: FrameNumber,
        offset: usize,
        len: usize,
    ) -> Result<core::ops::Range<usize>, MmuError> {
        if offset + len > self.page_size {
            return Err(MmuError::Backing(format!(
                "access of {len} bytes at offset {offset} overruns frame {frame}"
            )));
        }
        let start = frame.base(self.page_size) + offset;
        let end = start + len;
        if end > self.memory.len() {
            return Err(MmuError::Backing(format!("frame {frame} is out of range")));
        }
        Ok(start..end)
    }
}

impl PhysicalMemory for EmulatedMemory {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_frame(&mut self, frame: FrameNumber, size: usize) -> Result<Vec<u8>, MmuError> {
        let range = self.range(frame, 0, size)?;
        Ok(self.memory[range].to_vec())
    }

    fn write_frame(
        &mut self,
        frame: FrameNumber,
        offset: usize,
        bytes: &[u8],
    ) -> Result<(), MmuError> {
        let range = self.range(frame, offset, bytes.len())?;
        self.memory[range].copy_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) use recording::{RecordedOp, RecordingMemory};


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_start_zeroed() {
        let mut memory = EmulatedMemory::new(4, 8);
        assert_eq!(memory.size(), 32);
        assert_eq!(memory.read_frame(FrameNumber::new(3), 8).unwrap(), vec![0; 8]);
    }

    #[test]
    fn writes_land_in_the_right_frame() {
        let mut memory = EmulatedMemory::new(4, 8);
        memory.write_frame(FrameNumber::new(1), 2, b"abc").unwrap();

        assert_eq!(
            memory.read_frame(FrameNumber::new(1), 5).unwrap(),
            b"\0\0abc"
        );
        assert_eq!(memory.read_frame(FrameNumber::new(0), 8).unwrap(), vec![0; 8]);
    }

    #[test]
    fn rejects_out_of_range_access() {
        let mut memory = EmulatedMemory::new(2, 8);
        assert!(matches!(
            memory.read_frame(FrameNumber::new(2), 1),
            Err(MmuError::Backing(_))
        ));
        assert!(matches!(
            memory.write_frame(FrameNumber::new(0), 6, b"abc"),
            Err(MmuError::Backing(_))
        ));
    }
}
