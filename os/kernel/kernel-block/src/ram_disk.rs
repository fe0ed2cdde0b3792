use crate::{BlockDevice, BlockError, SECTOR_SIZE, SectorBuf, SectorNumber};
use alloc::collections::BTreeSet;
use alloc::vec;
use alloc::vec::Vec;

/// Block device backed by kernel memory.
///
/// Sectors can be marked as failing to exercise error paths.
#[derive(Debug, Clone)]
pub struct RamDisk {
    sectors: Vec<SectorBuf>,
    failing: BTreeSet<SectorNumber>,
}

impl RamDisk {
    /// A zeroed disk of `count` sectors.
    #[must_use]
    pub fn new(count: u32) -> Self {
        Self {
            sectors: vec![[0; SECTOR_SIZE]; count as usize],
            failing: BTreeSet::new(),
        }
    }

    /// Make every transfer touching `sector` fail with [`BlockError::Io`].
    pub fn fail_sector(&mut self, sector: SectorNumber) {
        self.failing.insert(sector);
    }

    pub fn heal_sector(&mut self, sector: SectorNumber) {
        self.failing.remove(&sector);
    }

    /// Raw contents of `sector`, bypassing any cache.
    #[must_use]
    pub fn sector(&self, sector: SectorNumber) -> Option<&SectorBuf> {
        self.sectors.get(sector.as_usize())
    }

    fn slot(&mut self, sector: SectorNumber) -> Result<&mut SectorBuf, BlockError> {
        if self.failing.contains(&sector) {
            return Err(BlockError::Io(sector));
        }
        let count = self.sector_count();
        self.sectors
            .get_mut(sector.as_usize())
            .ok_or(BlockError::OutOfRange { sector, count })
    }
}

impl BlockDevice for RamDisk {
    #[allow(clippy::cast_possible_truncation)]
    fn sector_count(&self) -> u32 {
        self.sectors.len() as u32
    }

    fn read_sector(&mut self, sector: SectorNumber, buf: &mut SectorBuf) -> Result<(), BlockError> {
        buf.copy_from_slice(self.slot(sector)?);
        Ok(())
    }

    fn write_sector(&mut self, sector: SectorNumber, buf: &SectorBuf) -> Result<(), BlockError> {
        self.slot(sector)?.copy_from_slice(buf);
        Ok(())
    }
}
