//! Process, page and frame number types.
//!
//! These newtypes keep the three kinds of small integers that flow through the memory
//! manager from being confused with one another.

use core::{
    fmt,
    ops::{Add, Sub},
};

use crate::address::LogicalAddress;

/// Macro to define common number functionality.
///
/// This macro generates the basic structure and methods common to the process, page
/// and frame number types, reducing code duplication.
macro_rules! impl_number_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new number.
            #[inline]
            pub const fn new(number: usize) -> Self {
                Self(number)
            }

            /// Returns the raw number.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<usize> for $name {
            #[inline]
            fn from(value: usize) -> Self {
                Self(value)
            }
        }
    };
}

impl_number_common!(
    Pid,
    "A process identifier.\n\n\
     Every page table, TLB entry, cache entry and swap region is owned by exactly one\n\
     process."
);

impl_number_common!(
    FrameNumber,
    "A physical memory frame number.\n\n\
     Frame numbers are zero-indexed; frame `n` starts at byte `n * page_size` of the\n\
     physical store."
);

impl FrameNumber {
    /// Returns the byte offset of the start of this frame in the physical store.
    #[inline]
    pub const fn base(self, page_size: usize) -> usize {
        self.0 * page_size
    }
}

impl_number_common!(
    PageNumber,
    "A logical page number within a process address space.\n\n\
     Page numbers are zero-indexed and correspond to page-aligned logical addresses."
);

impl PageNumber {
    /// Returns the logical address at the start of this page.
    ///
    /// Saturates at the top of the address space, so a page number taken from untrusted
    /// input still yields an address that fails bounds checks.
    #[inline]
    pub const fn start(self, page_size: usize) -> LogicalAddress {
        LogicalAddress::new(self.0.saturating_mul(page_size))
    }
}

impl Add<usize> for PageNumber {
    type Output = Self;

    #[inline]
    fn add(self, rhs: usize) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl Sub<PageNumber> for PageNumber {
    type Output = usize;

    #[inline]
    fn sub(self, rhs: PageNumber) -> Self::Output {
        self.0 - rhs.0
    }
}
