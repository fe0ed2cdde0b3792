use crate::{PAGE_MASK, PAGE_SIZE};
use core::fmt;

/// Byte offset inside a 4 KiB page.
///
/// Always `< PAGE_SIZE`; the constructor masks the upper bits off.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PageOffset(u16);

impl PageOffset {
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new(value: u64) -> Self {
        Self((value & PAGE_MASK) as u16)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Bytes left in the page from this offset on.
    #[inline]
    #[must_use]
    pub const fn remaining(self) -> usize {
        PAGE_SIZE - self.as_usize()
    }
}

impl fmt::Debug for PageOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageOffset({:#05X})", self.0)
    }
}
