use core::fmt;

/// Bytes per disk sector.
pub const SECTOR_SIZE: usize = 512;

/// One sector's worth of bytes.
pub type SectorBuf = [u8; SECTOR_SIZE];

/// Index of a sector on a block device.
///
/// Zero is a perfectly valid sector. Places that need an "unallocated"
/// marker use `Option<SectorNumber>`; the all-ones on-disk encoding is
/// handled by [`SectorNumber::encode`] and [`SectorNumber::decode`].
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SectorNumber(u32);

impl SectorNumber {
    /// Bit pattern stored on disk for an unallocated pointer.
    pub const UNALLOCATED: u32 = u32::MAX;

    #[inline]
    #[must_use]
    pub const fn new(value: u32) -> Self {
        debug_assert!(value != Self::UNALLOCATED);
        Self(value)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// The sector `count` sectors after this one.
    #[inline]
    #[must_use]
    pub const fn add(self, count: u32) -> Self {
        Self::new(self.0 + count)
    }

    /// Raw on-disk representation of an optional sector pointer.
    #[inline]
    #[must_use]
    pub const fn encode(sector: Option<Self>) -> u32 {
        match sector {
            Some(s) => s.0,
            None => Self::UNALLOCATED,
        }
    }

    /// Inverse of [`encode`](Self::encode).
    #[inline]
    #[must_use]
    pub const fn decode(raw: u32) -> Option<Self> {
        if raw == Self::UNALLOCATED {
            None
        } else {
            Some(Self(raw))
        }
    }
}

impl fmt::Debug for SectorNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sector({})", self.0)
    }
}

impl fmt::Display for SectorNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<SectorNumber> for u32 {
    #[inline]
    fn from(value: SectorNumber) -> Self {
        value.0
    }
}
