//! Swap space: page-sized slots on a dedicated disk.
//!
//! Slot `n` covers sectors `8n..8n + 8`. The slot bitmap has its own lock;
//! sector transfers happen outside it once a slot is claimed.

use core::fmt;
use kernel_block::{Bitmap, BlockDevice, BlockError, Disk, SECTOR_SIZE, SectorBuf, SectorNumber};
use kernel_memory_addresses::PAGE_SIZE;
use kernel_sync::SpinLock;
use log::{error, trace};

use alloc::sync::Arc;

/// Sectors per page-sized swap slot.
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// Default swap capacity in pages (4 MiB).
pub const DEFAULT_SWAP_PAGES: usize = 1024;

/// Index of a page-sized slot on the swap disk.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SwapSlot(u32);

impl SwapSlot {
    #[inline]
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// First sector of the slot.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn first_sector(self) -> SectorNumber {
        SectorNumber::new(self.0 * SECTORS_PER_PAGE as u32)
    }
}

impl fmt::Debug for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SwapSlot({})", self.0)
    }
}

impl fmt::Display for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SwapError {
    /// Every slot holds a page.
    #[error("swap space exhausted")]
    Full,
    #[error("swap slot {0} does not hold a page")]
    NotInUse(SwapSlot),
    #[error(transparent)]
    Block(#[from] BlockError),
}

/// Page-granular storage on the swap disk.
pub struct SwapStore<D> {
    disk: Arc<Disk<D>>,
    slots: SpinLock<Bitmap>,
}

impl<D: BlockDevice> SwapStore<D> {
    /// Use the whole disk, one slot per eight sectors.
    #[must_use]
    pub fn new(disk: Arc<Disk<D>>) -> Self {
        let pages = disk.sector_count() as usize / SECTORS_PER_PAGE;
        Self::with_capacity(disk, pages)
    }

    /// Use at most `pages` slots of the disk.
    #[must_use]
    pub fn with_capacity(disk: Arc<Disk<D>>, pages: usize) -> Self {
        let pages = pages.min(disk.sector_count() as usize / SECTORS_PER_PAGE);
        Self {
            disk,
            slots: SpinLock::new(Bitmap::new(pages)),
        }
    }

    /// Total number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    /// Slots currently holding a page.
    #[must_use]
    pub fn used_slots(&self) -> usize {
        self.slots.lock().count_set()
    }

    #[must_use]
    pub fn is_in_use(&self, slot: SwapSlot) -> bool {
        self.slots.lock().test(slot.index())
    }

    #[must_use]
    pub const fn disk(&self) -> &Arc<Disk<D>> {
        &self.disk
    }

    /// Write `page` into the lowest free slot.
    ///
    /// # Errors
    /// [`SwapError::Full`] if no slot is free; a disk error releases the
    /// claimed slot again.
    #[allow(clippy::cast_possible_truncation)]
    pub fn swap_out(&self, page: &[u8; PAGE_SIZE]) -> Result<SwapSlot, SwapError> {
        let index = self.slots.lock().scan_and_set().ok_or(SwapError::Full)?;
        let slot = SwapSlot::new(index as u32);

        for (i, chunk) in page.chunks_exact(SECTOR_SIZE).enumerate() {
            let mut buf: SectorBuf = [0; SECTOR_SIZE];
            buf.copy_from_slice(chunk);
            if let Err(e) = self.disk.write(slot.first_sector().add(i as u32), &buf) {
                error!("swap out to slot {slot} failed: {e}");
                self.slots.lock().clear(index);
                return Err(e.into());
            }
        }

        trace!("swapped out to slot {slot}");
        Ok(slot)
    }

    /// Read the page in `slot` into `page` and free the slot.
    ///
    /// The slot stays reserved until the read has finished, and stays
    /// reserved if it fails.
    ///
    /// # Errors
    /// [`SwapError::NotInUse`] if the slot holds nothing, before or after
    /// the read.
    #[allow(clippy::cast_possible_truncation)]
    pub fn swap_in(&self, slot: SwapSlot, page: &mut [u8; PAGE_SIZE]) -> Result<(), SwapError> {
        if !self.is_in_use(slot) {
            error!("swap in from free slot {slot}");
            return Err(SwapError::NotInUse(slot));
        }

        for (i, chunk) in page.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            let mut buf: SectorBuf = [0; SECTOR_SIZE];
            self.disk.read(slot.first_sector().add(i as u32), &mut buf)?;
            chunk.copy_from_slice(&buf);
        }

        if !self.slots.lock().clear(slot.index()) {
            error!("swap slot {slot} was released while being read");
            return Err(SwapError::NotInUse(slot));
        }
        trace!("swapped in from slot {slot}");
        Ok(())
    }

    /// Drop the page in `slot` without reading it.
    ///
    /// # Errors
    /// [`SwapError::NotInUse`] if the slot holds nothing.
    pub fn release(&self, slot: SwapSlot) -> Result<(), SwapError> {
        if self.slots.lock().clear(slot.index()) {
            Ok(())
        } else {
            error!("double release of swap slot {slot}");
            Err(SwapError::NotInUse(slot))
        }
    }
}

impl<D> fmt::Debug for SwapStore<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwapStore")
            .field("slots", &self.slots)
            .finish_non_exhaustive()
    }
}
