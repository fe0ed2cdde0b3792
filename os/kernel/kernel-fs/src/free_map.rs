use crate::FsError;
use kernel_block::{Bitmap, SectorNumber};
use kernel_sync::SpinLock;
use log::error;

/// Allocation state of every sector on a volume.
#[derive(Debug)]
pub struct FreeMap {
    bits: SpinLock<Bitmap>,
}

impl FreeMap {
    /// All `sector_count` sectors start out free.
    #[must_use]
    pub fn new(sector_count: u32) -> Self {
        Self {
            bits: SpinLock::new(Bitmap::new(sector_count as usize)),
        }
    }

    /// Mark a specific sector as used, e.g. a well-known metadata sector.
    ///
    /// # Errors
    /// [`FsError::AlreadyAllocated`] if the sector is taken or does not exist.
    pub fn reserve(&self, sector: SectorNumber) -> Result<(), FsError> {
        if self.bits.lock().set(sector.as_usize()) {
            Ok(())
        } else {
            Err(FsError::AlreadyAllocated(sector))
        }
    }

    /// Allocate the lowest free sector.
    ///
    /// # Errors
    /// [`FsError::DiskFull`] if every sector is in use.
    #[allow(clippy::cast_possible_truncation)]
    pub fn allocate(&self) -> Result<SectorNumber, FsError> {
        self.bits
            .lock()
            .scan_and_set()
            .map(|index| SectorNumber::new(index as u32))
            .ok_or(FsError::DiskFull)
    }

    /// Return `sector` to the pool.
    ///
    /// # Errors
    /// [`FsError::NotAllocated`] on a double free.
    pub fn release(&self, sector: SectorNumber) -> Result<(), FsError> {
        if self.bits.lock().clear(sector.as_usize()) {
            Ok(())
        } else {
            error!("double free of sector {sector}");
            Err(FsError::NotAllocated(sector))
        }
    }

    #[must_use]
    pub fn is_allocated(&self, sector: SectorNumber) -> bool {
        self.bits.lock().test(sector.as_usize())
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.bits.with_lock(|bits| bits.len() - bits.count_set())
    }
}
