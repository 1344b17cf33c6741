//! Page table entry flags.

/// The kind of access a translation is performed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Read,
    Write,
}

/// Page table entry flags.
///
/// Flags are stored as a raw usize with specific bits representing the state and
/// permissions of a leaf entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags(usize);

impl PageFlags {
    /// Valid bit (bit 0). Set while the entry is backed by a frame.
    const VALID: usize = 1 << 0;

    /// Use bit (bit 1). Set whenever a walk resolves through the entry.
    const USED: usize = 1 << 1;

    /// Modified bit (bit 2). Set when the frame content is written.
    const MODIFIED: usize = 1 << 2;

    /// Read permission bit (bit 3).
    const READ: usize = 1 << 3;

    /// Write permission bit (bit 4).
    const WRITE: usize = 1 << 4;

    /// Creates empty page flags (invalid, no permissions).
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Creates flags for a fresh, not yet backed, read/write entry.
    pub const fn read_write() -> Self {
        Self(Self::READ | Self::WRITE)
    }

    /// Creates page flags from a raw usize value.
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// Returns the raw usize value of these flags.
    pub const fn to_raw(self) -> usize {
        self.0
    }

    /// Returns whether the valid bit is set.
    pub fn is_valid(self) -> bool {
        (self.0 & Self::VALID) != 0
    }

    /// Sets or clears the valid bit.
    pub fn set_valid(&mut self, valid: bool) {
        self.set(Self::VALID, valid);
    }

    /// Returns whether the use bit is set.
    pub fn is_used(self) -> bool {
        (self.0 & Self::USED) != 0
    }

    /// Sets or clears the use bit.
    pub fn set_used(&mut self, used: bool) {
        self.set(Self::USED, used);
    }

    /// Returns whether the modified bit is set.
    pub fn is_modified(self) -> bool {
        (self.0 & Self::MODIFIED) != 0
    }

    /// Sets or clears the modified bit.
    pub fn set_modified(&mut self, modified: bool) {
        self.set(Self::MODIFIED, modified);
    }

    /// Returns whether the read permission bit is set.
    pub fn is_readable(self) -> bool {
        (self.0 & Self::READ) != 0
    }

    /// Sets or clears the read permission bit.
    pub fn set_readable(&mut self, readable: bool) {
        self.set(Self::READ, readable);
    }

    /// Returns whether the write permission bit is set.
    pub fn is_writable(self) -> bool {
        (self.0 & Self::WRITE) != 0
    }

    /// Sets or clears the write permission bit.
    pub fn set_writable(&mut self, writable: bool) {
        self.set(Self::WRITE, writable);
    }

    /// Returns whether the permission bits allow the given access.
    pub fn permits(self, access: Access) -> bool {
        match access {
            Access::Read => self.is_readable(),
            Access::Write => self.is_writable(),
        }
    }

    fn set(&mut self, bit: usize, value: bool) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        Self::empty()
    }
}
