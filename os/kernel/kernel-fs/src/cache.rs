//! # Buffer Cache
//!
//! A fixed array of sector buffers in front of the file system disk.
//!
//! Admission (is this sector already cached, and if not, which entry becomes
//! its home) is decided under one cache-wide lock. Once an entry is chosen,
//! the caller keeps only that entry's own lock for the copy and any disk I/O,
//! so operations on two different resident sectors do not serialize.
//!
//! Lock order: admission, then entry, then disk. An entry lock is never held
//! while taking the admission lock.
//!
//! Victims are chosen with the clock (second-chance) policy: the hand skips
//! and clears entries whose reference bit is set and takes the first free or
//! unreferenced entry. A dirty victim is written back before it is reused.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use kernel_block::{BlockDevice, BlockError, Disk, SECTOR_SIZE, SectorBuf, SectorNumber};
use kernel_sync::{SpinLock, SpinLockGuard};
use log::{debug, error, info, trace};

/// Memory set aside for cached sectors.
pub const CACHE_BYTES: usize = 32 * 1024;

/// Number of cache entries.
pub const CACHE_ENTRIES: usize = CACHE_BYTES / SECTOR_SIZE;

const _: () = assert!(CACHE_ENTRIES == 64);

/// Contents of one cache entry, guarded by the entry lock.
struct Buffer {
    /// Sector whose bytes are in `data`; `None` until a load succeeded.
    loaded: Option<SectorNumber>,
    dirty: bool,
    data: SectorBuf,
}

struct Entry {
    buffer: SpinLock<Buffer>,
    /// Clock bit, set on every access.
    referenced: AtomicBool,
}

/// State behind the cache-wide lock.
struct Admission {
    /// Sector each entry is home to. `None` marks a free entry.
    homes: Vec<Option<SectorNumber>>,
    hand: usize,
}

impl Admission {
    fn find(&self, sector: SectorNumber) -> Option<usize> {
        self.homes.iter().position(|home| *home == Some(sector))
    }

    /// Advance the clock hand to the next victim.
    ///
    /// Finishes within two sweeps: the first clears every reference bit it
    /// passes, and bits are only set under this same lock.
    fn select_victim(&mut self, entries: &[Entry]) -> usize {
        let len = self.homes.len();
        loop {
            let slot = self.hand;
            self.hand = (self.hand + 1) % len;

            if self.homes[slot].is_none() {
                return slot;
            }
            if !entries[slot].referenced.swap(false, Ordering::Relaxed) {
                return slot;
            }
        }
    }
}

/// Hit and miss counters.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// A cache entry pinned under its own lock.
///
/// The entry cannot be evicted while this guard lives. Do not request a
/// second entry from the same cache while holding one.
pub struct CachedSector<'a> {
    guard: SpinLockGuard<'a, Buffer>,
    sector: SectorNumber,
}

impl CachedSector<'_> {
    #[must_use]
    pub const fn sector(&self) -> SectorNumber {
        self.sector
    }

    #[must_use]
    pub fn data(&self) -> &SectorBuf {
        &self.guard.data
    }

    /// Mutable access; marks the entry dirty.
    pub fn data_mut(&mut self) -> &mut SectorBuf {
        self.guard.dirty = true;
        &mut self.guard.data
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.guard.dirty
    }
}

/// Write-back sector cache over one disk.
pub struct BufferCache<D> {
    disk: Arc<Disk<D>>,
    entries: Box<[Entry]>,
    admission: SpinLock<Admission>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<D: BlockDevice> BufferCache<D> {
    /// A cache of [`CACHE_ENTRIES`] sectors.
    pub fn new(disk: Arc<Disk<D>>) -> Self {
        Self::with_capacity(disk, CACHE_ENTRIES)
    }

    /// A cache of `entries` sectors (at least one).
    pub fn with_capacity(disk: Arc<Disk<D>>, entries: usize) -> Self {
        let entries = entries.max(1);
        Self {
            disk,
            entries: (0..entries)
                .map(|_| Entry {
                    buffer: SpinLock::new(Buffer {
                        loaded: None,
                        dirty: false,
                        data: [0; SECTOR_SIZE],
                    }),
                    referenced: AtomicBool::new(false),
                })
                .collect(),
            admission: SpinLock::new(Admission {
                homes: vec![None; entries],
                hand: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub const fn disk(&self) -> &Arc<Disk<D>> {
        &self.disk
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Whether `sector` currently has a home in the cache.
    #[must_use]
    pub fn contains(&self, sector: SectorNumber) -> bool {
        self.admission.lock().find(sector).is_some()
    }

    /// The entry caching `sector`, if it is resident, pinned under its lock.
    ///
    /// Never touches the disk.
    pub fn lookup(&self, sector: SectorNumber) -> Option<CachedSector<'_>> {
        let admission = self.admission.lock();
        let slot = admission.find(sector)?;
        let guard = self.entries[slot].buffer.lock();
        if guard.loaded != Some(sector) {
            return None;
        }
        self.entries[slot].referenced.store(true, Ordering::Relaxed);
        drop(admission);
        Some(CachedSector { guard, sector })
    }

    /// The entry caching `sector`, reading it from disk on a miss.
    ///
    /// # Errors
    /// Disk errors from writing back the victim or loading the sector.
    /// When the write-back fails the victim keeps its home and data.
    pub fn pin(&self, sector: SectorNumber) -> Result<CachedSector<'_>, BlockError> {
        let mut admission = self.admission.lock();
        let (slot, mut guard) = match admission.find(sector) {
            Some(slot) => (slot, self.entries[slot].buffer.lock()),
            None => {
                let slot = admission.select_victim(&self.entries);
                let mut guard = self.entries[slot].buffer.lock();
                if let (true, Some(old)) = (guard.dirty, guard.loaded) {
                    debug!("cache: evicting dirty sector {old} from entry {slot}");
                    self.disk.write(old, &guard.data)?;
                }
                guard.loaded = None;
                guard.dirty = false;
                admission.homes[slot] = Some(sector);
                (slot, guard)
            }
        };
        self.entries[slot].referenced.store(true, Ordering::Relaxed);
        drop(admission);

        if guard.loaded == Some(sector) {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            trace!("cache: miss on sector {sector}, loading into entry {slot}");
            self.disk.read(sector, &mut guard.data)?;
            guard.loaded = Some(sector);
        }
        Ok(CachedSector { guard, sector })
    }

    /// Copy `dst.len()` bytes starting at `sector_offset` out of `sector`.
    ///
    /// # Errors
    /// Disk errors while populating the entry.
    ///
    /// # Panics
    /// If the range does not fit inside one sector.
    pub fn read(
        &self,
        sector: SectorNumber,
        sector_offset: usize,
        dst: &mut [u8],
    ) -> Result<(), BlockError> {
        let entry = self.pin(sector)?;
        dst.copy_from_slice(&entry.data()[sector_offset..sector_offset + dst.len()]);
        Ok(())
    }

    /// Copy `src` into `sector` starting at `sector_offset` and mark it dirty.
    ///
    /// # Errors
    /// Disk errors while populating the entry.
    ///
    /// # Panics
    /// If the range does not fit inside one sector.
    pub fn write(
        &self,
        sector: SectorNumber,
        sector_offset: usize,
        src: &[u8],
    ) -> Result<(), BlockError> {
        let mut entry = self.pin(sector)?;
        entry.data_mut()[sector_offset..sector_offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Whole-sector [`read`](Self::read).
    ///
    /// # Errors
    /// Disk errors while populating the entry.
    pub fn read_sector(&self, sector: SectorNumber, dst: &mut SectorBuf) -> Result<(), BlockError> {
        self.read(sector, 0, dst)
    }

    /// Whole-sector [`write`](Self::write).
    ///
    /// # Errors
    /// Disk errors while populating the entry.
    pub fn write_sector(&self, sector: SectorNumber, src: &SectorBuf) -> Result<(), BlockError> {
        self.write(sector, 0, src)
    }

    /// Write every dirty entry back to disk, e.g. at shutdown.
    ///
    /// Keeps going after a failed write so one bad sector does not strand the
    /// rest; returns the number of sectors written.
    ///
    /// # Errors
    /// The first disk error encountered.
    pub fn flush_all(&self) -> Result<usize, BlockError> {
        let mut flushed = 0;
        let mut first_error = None;
        for entry in &self.entries {
            let mut buffer = entry.buffer.lock();
            let (true, Some(sector)) = (buffer.dirty, buffer.loaded) else {
                continue;
            };
            match self.disk.write(sector, &buffer.data) {
                Ok(()) => {
                    buffer.dirty = false;
                    flushed += 1;
                }
                Err(err) => {
                    error!("cache: write-back of sector {sector} failed: {err}");
                    first_error.get_or_insert(err);
                }
            }
        }
        info!("cache: flushed {flushed} dirty sectors");
        first_error.map_or(Ok(flushed), Err)
    }
}
