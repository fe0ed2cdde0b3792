//! Byte offset to sector translation through the three pointer tiers.

use super::record::{DIRECT_ENTRIES, INDIRECT_ENTRIES, IndexBlock, InodeRecord};
use crate::{BufferCache, FreeMap, FsError};
use alloc::vec::Vec;
use kernel_block::{BlockDevice, SECTOR_SIZE, SectorNumber};
use log::{debug, warn};

/// Largest number of data sectors a file can have.
pub const MAX_FILE_SECTORS: usize =
    DIRECT_ENTRIES + INDIRECT_ENTRIES + INDIRECT_ENTRIES * INDIRECT_ENTRIES;

/// Largest file length in bytes.
pub const MAX_FILE_LENGTH: u64 = (MAX_FILE_SECTORS * SECTOR_SIZE) as u64;

const ZEROS: [u8; SECTOR_SIZE] = [0; SECTOR_SIZE];

/// Where the pointer for one file sector lives.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SectorLocation {
    /// `direct[index]` of the inode.
    Direct(usize),
    /// Slot of the indirect block.
    Indirect(usize),
    /// Slot `outer` of the double-indirect block, then slot `inner` of the
    /// indirect block it points to.
    DoubleIndirect { outer: usize, inner: usize },
}

impl SectorLocation {
    /// Location of the file's `index`-th sector, `None` past the last tier.
    #[must_use]
    pub const fn of_index(index: usize) -> Option<Self> {
        if index < DIRECT_ENTRIES {
            Some(Self::Direct(index))
        } else if index < DIRECT_ENTRIES + INDIRECT_ENTRIES {
            Some(Self::Indirect(index - DIRECT_ENTRIES))
        } else if index < MAX_FILE_SECTORS {
            let rest = index - DIRECT_ENTRIES - INDIRECT_ENTRIES;
            Some(Self::DoubleIndirect {
                outer: rest / INDIRECT_ENTRIES,
                inner: rest % INDIRECT_ENTRIES,
            })
        } else {
            None
        }
    }

    /// Location of the sector holding byte `offset`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn of_offset(offset: u64) -> Option<Self> {
        if offset >= MAX_FILE_LENGTH {
            return None;
        }
        Self::of_index((offset / SECTOR_SIZE as u64) as usize)
    }
}

/// Number of sectors needed to hold `length` bytes.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn sectors_for(length: u64) -> usize {
    length.div_ceil(SECTOR_SIZE as u64) as usize
}

/// Extent operations on inode records.
///
/// Index blocks are read and written through the buffer cache; data and
/// index sectors come from the free map. Callers pass the number of data
/// sectors already allocated to the inode, and files never have holes, so
/// sectors `0..allocated` are exactly the ones registered.
pub struct ExtentMap<'a, D> {
    cache: &'a BufferCache<D>,
    free_map: &'a FreeMap,
}

impl<'a, D: BlockDevice> ExtentMap<'a, D> {
    #[must_use]
    pub const fn new(cache: &'a BufferCache<D>, free_map: &'a FreeMap) -> Self {
        Self { cache, free_map }
    }

    /// The sector holding byte `offset` of a file of `record.length` bytes.
    ///
    /// # Errors
    /// [`FsError::OutOfRange`] at or past the end of the file,
    /// [`FsError::Unallocated`] if the record is inconsistent, and disk
    /// errors while reading index blocks.
    #[allow(clippy::cast_possible_truncation)]
    pub fn sector_for(&self, record: &InodeRecord, offset: u64) -> Result<SectorNumber, FsError> {
        let length = u64::from(record.length);
        if offset >= length {
            return Err(FsError::OutOfRange { offset, length });
        }
        self.resolve(record, (offset / SECTOR_SIZE as u64) as usize)
    }

    fn resolve(&self, record: &InodeRecord, index: usize) -> Result<SectorNumber, FsError> {
        let missing = FsError::Unallocated { index };
        let sector = match SectorLocation::of_index(index).ok_or(missing)? {
            SectorLocation::Direct(i) => record.direct[i],
            SectorLocation::Indirect(i) => {
                let block = record.indirect.ok_or(missing)?;
                self.read_index(block)?.entries[i]
            }
            SectorLocation::DoubleIndirect { outer, inner } => {
                let top = record.double_indirect.ok_or(missing)?;
                let block = self.read_index(top)?.entries[outer].ok_or(missing)?;
                self.read_index(block)?.entries[inner]
            }
        };
        sector.ok_or(missing)
    }

    /// Allocate, zero and register the sectors needed to hold `new_length`
    /// bytes, allocating index blocks the first time a tier is entered.
    ///
    /// On failure every sector allocated by this call is released again and
    /// `record` and `allocated` are left as they were.
    ///
    /// # Errors
    /// [`FsError::FileTooLarge`], [`FsError::DiskFull`], or disk errors.
    pub fn grow(
        &self,
        record: &mut InodeRecord,
        allocated: &mut usize,
        new_length: u64,
    ) -> Result<(), FsError> {
        if new_length > MAX_FILE_LENGTH {
            return Err(FsError::FileTooLarge { length: new_length });
        }
        let needed = sectors_for(new_length);
        if needed <= *allocated {
            return Ok(());
        }

        let snapshot = record.clone();
        let mut fresh = Vec::new();
        for index in *allocated..needed {
            if let Err(err) = self.append(record, index, &mut fresh) {
                warn!("inode growth to {new_length} bytes failed at sector {index}: {err}");
                *record = snapshot;
                for sector in fresh.into_iter().rev() {
                    if let Err(release) = self.free_map.release(sector) {
                        warn!("rollback could not release sector {sector}: {release}");
                    }
                }
                return Err(err);
            }
        }

        debug!(
            "inode grew from {} to {needed} sectors ({} new, incl. index blocks)",
            *allocated,
            fresh.len()
        );
        *allocated = needed;
        Ok(())
    }

    /// Allocate data sector `index` and hook it into its tier.
    ///
    /// Sectors are appended strictly in order, so an index block is new
    /// exactly when `index` lands on its first slot.
    fn append(
        &self,
        record: &mut InodeRecord,
        index: usize,
        fresh: &mut Vec<SectorNumber>,
    ) -> Result<(), FsError> {
        let location = SectorLocation::of_index(index).ok_or(FsError::FileTooLarge {
            length: MAX_FILE_LENGTH + 1,
        })?;

        let data = self.allocate(fresh)?;
        self.cache.write_sector(data, &ZEROS)?;

        match location {
            SectorLocation::Direct(i) => record.direct[i] = Some(data),
            SectorLocation::Indirect(i) => {
                let block = self.register(record.indirect, i, data, fresh)?;
                record.indirect = Some(block);
            }
            SectorLocation::DoubleIndirect { outer, inner } => {
                let existing = if inner == 0 {
                    None
                } else {
                    let top = record
                        .double_indirect
                        .ok_or(FsError::Unallocated { index })?;
                    self.read_index(top)?.entries[outer]
                };
                let block = self.register(existing, inner, data, fresh)?;
                if inner == 0 {
                    let top = self.register(record.double_indirect, outer, block, fresh)?;
                    record.double_indirect = Some(top);
                }
            }
        }
        Ok(())
    }

    /// Store `value` in `slot` of an index block and return the block.
    ///
    /// Slot 0 starts a new block with every other slot unallocated;
    /// otherwise the existing `block` is updated.
    fn register(
        &self,
        block: Option<SectorNumber>,
        slot: usize,
        value: SectorNumber,
        fresh: &mut Vec<SectorNumber>,
    ) -> Result<SectorNumber, FsError> {
        let (sector, mut index) = if slot == 0 {
            (self.allocate(fresh)?, IndexBlock::EMPTY)
        } else {
            let sector = block.ok_or(FsError::Unallocated { index: slot })?;
            (sector, self.read_index(sector)?)
        };
        index.entries[slot] = Some(value);
        self.cache.write_sector(sector, &index.to_bytes())?;
        Ok(sector)
    }

    /// Return every data and index sector of the first `allocated` file
    /// sectors to the free map, each exactly once.
    ///
    /// All index blocks are read before the first sector is released, so a
    /// disk error leaves the free map untouched.
    ///
    /// # Errors
    /// [`FsError::Unallocated`] if the record disagrees with `allocated`,
    /// double frees, and disk errors.
    pub fn release_all(&self, record: &InodeRecord, allocated: usize) -> Result<usize, FsError> {
        let sectors = self.allocated_sectors(record, allocated)?;
        for &sector in &sectors {
            self.free_map.release(sector)?;
        }
        Ok(sectors.len())
    }

    /// Data and index sectors backing the first `allocated` file sectors.
    fn allocated_sectors(
        &self,
        record: &InodeRecord,
        allocated: usize,
    ) -> Result<Vec<SectorNumber>, FsError> {
        let mut sectors = Vec::new();
        let mut take = |sector: Option<SectorNumber>, index: usize| {
            sectors.push(sector.ok_or(FsError::Unallocated { index })?);
            Ok::<_, FsError>(())
        };

        let direct = allocated.min(DIRECT_ENTRIES);
        for (index, sector) in record.direct[..direct].iter().enumerate() {
            take(*sector, index)?;
        }

        if allocated > DIRECT_ENTRIES {
            let count = (allocated - DIRECT_ENTRIES).min(INDIRECT_ENTRIES);
            let block = record.indirect.ok_or(FsError::Unallocated {
                index: DIRECT_ENTRIES,
            })?;
            let pointers = self.read_index(block)?;
            for (i, sector) in pointers.entries[..count].iter().enumerate() {
                take(*sector, DIRECT_ENTRIES + i)?;
            }
            take(Some(block), DIRECT_ENTRIES)?;
        }

        let first_double = DIRECT_ENTRIES + INDIRECT_ENTRIES;
        if allocated > first_double {
            let remaining = allocated - first_double;
            let top = record.double_indirect.ok_or(FsError::Unallocated {
                index: first_double,
            })?;
            let outer_block = self.read_index(top)?;
            for outer in 0..remaining.div_ceil(INDIRECT_ENTRIES) {
                let base = first_double + outer * INDIRECT_ENTRIES;
                let block = outer_block.entries[outer].ok_or(FsError::Unallocated { index: base })?;
                let count = (remaining - outer * INDIRECT_ENTRIES).min(INDIRECT_ENTRIES);
                let pointers = self.read_index(block)?;
                for (i, sector) in pointers.entries[..count].iter().enumerate() {
                    take(*sector, base + i)?;
                }
                take(Some(block), base)?;
            }
            take(Some(top), first_double)?;
        }

        Ok(sectors)
    }

    fn allocate(&self, fresh: &mut Vec<SectorNumber>) -> Result<SectorNumber, FsError> {
        let sector = self.free_map.allocate()?;
        fresh.push(sector);
        Ok(sector)
    }

    fn read_index(&self, sector: SectorNumber) -> Result<IndexBlock, FsError> {
        let mut bytes = [0; SECTOR_SIZE];
        self.cache.read_sector(sector, &mut bytes)?;
        Ok(IndexBlock::from_bytes(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use kernel_block::{Disk, RamDisk};

    const SECTORS: u32 = 20_000;

    fn storage() -> (BufferCache<RamDisk>, FreeMap) {
        let disk = Arc::new(Disk::new(RamDisk::new(SECTORS)));
        (BufferCache::new(disk), FreeMap::new(SECTORS))
    }

    #[test]
    fn tier_boundaries() {
        assert_eq!(SectorLocation::of_offset(0), Some(SectorLocation::Direct(0)));
        assert_eq!(
            SectorLocation::of_offset(124 * 512 - 1),
            Some(SectorLocation::Direct(123))
        );
        assert_eq!(
            SectorLocation::of_offset(124 * 512),
            Some(SectorLocation::Indirect(0))
        );
        assert_eq!(
            SectorLocation::of_offset((124 + 128) * 512 - 1),
            Some(SectorLocation::Indirect(127))
        );
        assert_eq!(
            SectorLocation::of_offset((124 + 128) * 512),
            Some(SectorLocation::DoubleIndirect { outer: 0, inner: 0 })
        );
        assert_eq!(
            SectorLocation::of_index(252 + 128 * 128 - 1),
            Some(SectorLocation::DoubleIndirect {
                outer: 127,
                inner: 127
            })
        );
        assert_eq!(SectorLocation::of_index(252 + 128 * 128), None);
        assert_eq!(SectorLocation::of_offset(MAX_FILE_LENGTH), None);
    }

    #[test]
    fn growing_into_the_indirect_tier_allocates_one_index_block() {
        let (cache, free_map) = storage();
        let extents = ExtentMap::new(&cache, &free_map);
        let before = free_map.free_count();

        let mut record = InodeRecord::empty();
        let mut allocated = 0;
        let length = (124 + 128) * 512;
        extents.grow(&mut record, &mut allocated, length).unwrap();
        record.length = u32::try_from(length).unwrap();

        assert_eq!(allocated, 252);
        assert_eq!(before - free_map.free_count(), 252 + 1);
        assert!(record.indirect.is_some());
        assert_eq!(record.double_indirect, None);

        // first indirect-tier byte resolves through the index block
        let first_indirect = extents.sector_for(&record, 124 * 512).unwrap();
        let block = extents.read_index(record.indirect.unwrap()).unwrap();
        assert_eq!(block.entries[0], Some(first_indirect));
        assert!(!record.direct.contains(&Some(first_indirect)));
    }

    #[test]
    fn double_indirect_tier_is_entered_at_sector_252() {
        let (cache, free_map) = storage();
        let extents = ExtentMap::new(&cache, &free_map);
        let mut record = InodeRecord::empty();
        let mut allocated = 0;

        let length = (124 + 128) * 512 + 1;
        extents.grow(&mut record, &mut allocated, length).unwrap();
        record.length = u32::try_from(length).unwrap();

        // data + indirect + double-indirect + its first inner block
        assert_eq!(SECTORS as usize - free_map.free_count(), 253 + 1 + 2);
        let top = extents.read_index(record.double_indirect.unwrap()).unwrap();
        let inner = extents.read_index(top.entries[0].unwrap()).unwrap();
        assert_eq!(top.entries[1], None);
        assert_eq!(
            inner.entries[0],
            Some(extents.sector_for(&record, (124 + 128) * 512).unwrap())
        );
        assert_eq!(inner.entries[1], None);
    }

    #[test]
    fn new_sectors_are_zero_filled() {
        let (cache, free_map) = storage();
        let extents = ExtentMap::new(&cache, &free_map);
        // dirty a sector that the free map will hand out next
        let next = SectorNumber::new(0);
        cache.write(next, 0, &[0xEE; 16]).unwrap();

        let mut record = InodeRecord::empty();
        let mut allocated = 0;
        extents.grow(&mut record, &mut allocated, 10).unwrap();
        assert_eq!(record.direct[0], Some(next));

        let mut bytes = [0xAA; SECTOR_SIZE];
        cache.read_sector(next, &mut bytes).unwrap();
        assert_eq!(bytes, ZEROS);
    }

    #[test]
    fn failed_growth_rolls_back() {
        let disk = Arc::new(Disk::new(RamDisk::new(200)));
        let cache = BufferCache::new(disk);
        let free_map = FreeMap::new(130);
        let extents = ExtentMap::new(&cache, &free_map);

        let mut record = InodeRecord::empty();
        let mut allocated = 0;
        extents.grow(&mut record, &mut allocated, 100 * 512).unwrap();
        let committed = record.clone();

        // 30 free sectors cannot hold 40 more data sectors plus an index block
        let err = extents.grow(&mut record, &mut allocated, 140 * 512).unwrap_err();
        assert_eq!(err, FsError::DiskFull);
        assert_eq!(record, committed);
        assert_eq!(allocated, 100);
        assert_eq!(free_map.free_count(), 30);
    }

    #[test]
    fn release_all_returns_every_sector_once() {
        let (cache, free_map) = storage();
        let extents = ExtentMap::new(&cache, &free_map);
        let mut record = InodeRecord::empty();
        let mut allocated = 0;

        extents.grow(&mut record, &mut allocated, 700 * 512).unwrap();
        let used = SECTORS as usize - free_map.free_count();
        // 700 data, 1 indirect, 1 double-indirect, 4 inner blocks
        assert_eq!(used, 700 + 1 + 1 + 4);

        let released = extents.release_all(&record, allocated).unwrap();
        assert_eq!(released, used);
        assert_eq!(free_map.free_count(), SECTORS as usize);
    }

    #[test]
    fn offsets_past_the_length_are_out_of_range() {
        let (cache, free_map) = storage();
        let extents = ExtentMap::new(&cache, &free_map);
        let mut record = InodeRecord::empty();
        let mut allocated = 0;
        extents.grow(&mut record, &mut allocated, 512).unwrap();
        record.length = 512;

        assert!(extents.sector_for(&record, 511).is_ok());
        assert_eq!(
            extents.sector_for(&record, 512),
            Err(FsError::OutOfRange {
                offset: 512,
                length: 512
            })
        );
    }

    #[test]
    fn oversized_files_are_refused() {
        let (cache, free_map) = storage();
        let extents = ExtentMap::new(&cache, &free_map);
        let mut record = InodeRecord::empty();
        let mut allocated = 0;
        assert_eq!(
            extents.grow(&mut record, &mut allocated, MAX_FILE_LENGTH + 1),
            Err(FsError::FileTooLarge {
                length: MAX_FILE_LENGTH + 1
            })
        );
        assert_eq!(allocated, 0);
    }
}
