//! Inodes: creation, the open-inode table, deferred removal and
//! byte-granular file I/O.

mod extent;
mod record;

pub use extent::{ExtentMap, MAX_FILE_LENGTH, MAX_FILE_SECTORS, SectorLocation};
pub use record::{DIRECT_ENTRIES, INDIRECT_ENTRIES, INODE_MAGIC, IndexBlock, InodeRecord};

use crate::{BufferCache, FreeMap, FsError};
use alloc::sync::Arc;
use alloc::vec::Vec;
use extent::sectors_for;
use kernel_block::{BlockDevice, Disk, SECTOR_SIZE, SectorNumber};
use kernel_sync::SpinLock;
use log::{debug, error, info, warn};

/// Cache and free map shared by the volume and its inodes.
struct Storage<D> {
    cache: BufferCache<D>,
    free_map: FreeMap,
}

impl<D: BlockDevice> Storage<D> {
    const fn extents(&self) -> ExtentMap<'_, D> {
        ExtentMap::new(&self.cache, &self.free_map)
    }

    fn read_record(&self, sector: SectorNumber) -> Result<InodeRecord, FsError> {
        let mut bytes = [0; SECTOR_SIZE];
        self.cache.read_sector(sector, &mut bytes)?;
        InodeRecord::from_bytes(sector, &bytes)
    }

    fn write_record(&self, sector: SectorNumber, record: &InodeRecord) -> Result<(), FsError> {
        Ok(self.cache.write_sector(sector, &record.to_bytes())?)
    }
}

#[derive(Debug)]
struct InodeState {
    open_count: usize,
    removed: bool,
    deny_write: usize,
    /// Data sectors registered in the record, the explicit bound for
    /// growth and release.
    allocated: usize,
}

/// An open inode.
///
/// At most one exists per inode sector; [`Volume::open`] hands out the
/// same instance to every opener and counts them.
pub struct Inode<D> {
    sector: SectorNumber,
    storage: Arc<Storage<D>>,
    /// Also serializes writers, so growth of one file is never interleaved.
    state: SpinLock<InodeState>,
}

impl<D: BlockDevice> Inode<D> {
    /// Sector holding the inode record; doubles as the inode number.
    #[must_use]
    pub const fn sector(&self) -> SectorNumber {
        self.sector
    }

    /// Current on-disk record.
    ///
    /// # Errors
    /// Disk errors.
    pub fn record(&self) -> Result<InodeRecord, FsError> {
        self.storage.read_record(self.sector)
    }

    /// File length in bytes.
    ///
    /// # Errors
    /// Disk errors.
    pub fn length(&self) -> Result<u64, FsError> {
        Ok(u64::from(self.record()?.length))
    }

    /// Sector holding byte `offset`.
    ///
    /// # Errors
    /// [`FsError::OutOfRange`] at or past the end of the file.
    pub fn sector_for(&self, offset: u64) -> Result<SectorNumber, FsError> {
        self.storage.extents().sector_for(&self.record()?, offset)
    }

    /// Number of data sectors allocated to the file.
    #[must_use]
    pub fn allocated_sectors(&self) -> usize {
        self.state.lock().allocated
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.state.lock().open_count
    }

    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.state.lock().removed
    }

    /// Mark the inode for deletion once the last opener closes it.
    pub fn remove(&self) {
        self.state.lock().removed = true;
        debug!("inode {} marked for removal", self.sector);
    }

    /// Refuse writes until a matching [`allow_write`](Self::allow_write),
    /// e.g. while the file runs as an executable.
    pub fn deny_write(&self) {
        let mut state = self.state.lock();
        state.deny_write += 1;
        debug_assert!(state.deny_write <= state.open_count);
    }

    pub fn allow_write(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.deny_write > 0);
        state.deny_write = state.deny_write.saturating_sub(1);
    }

    /// Read up to `buf.len()` bytes at `offset`; short at end of file.
    ///
    /// # Errors
    /// Disk errors.
    #[allow(clippy::cast_possible_truncation)]
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, FsError> {
        let record = self.record()?;
        let length = u64::from(record.length);
        let extents = self.storage.extents();

        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done as u64;
            if pos >= length {
                break;
            }
            let sector = extents.sector_for(&record, pos)?;
            let sector_offset = (pos % SECTOR_SIZE as u64) as usize;
            let chunk = (buf.len() - done)
                .min(SECTOR_SIZE - sector_offset)
                .min((length - pos) as usize);
            self.storage
                .cache
                .read(sector, sector_offset, &mut buf[done..done + chunk])?;
            done += chunk;
        }
        Ok(done)
    }

    /// Write `buf` at `offset`, growing the file when writing past its end.
    ///
    /// Returns 0 while writes are denied.
    ///
    /// # Errors
    /// [`FsError::FileTooLarge`], [`FsError::DiskFull`], or disk errors. A
    /// failed growth leaves the file unchanged.
    #[allow(clippy::cast_possible_truncation)]
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, FsError> {
        let mut state = self.state.lock();
        if state.deny_write > 0 {
            return Ok(0);
        }

        let extents = self.storage.extents();
        let mut record = self.record()?;
        let end = offset + buf.len() as u64;
        if end > u64::from(record.length) {
            let length = u32::try_from(end).map_err(|_| FsError::FileTooLarge { length: end })?;
            extents.grow(&mut record, &mut state.allocated, end)?;
            record.length = length;
            self.storage.write_record(self.sector, &record)?;
            debug!("inode {} extended to {end} bytes", self.sector);
        }

        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done as u64;
            let sector = extents.sector_for(&record, pos)?;
            let sector_offset = (pos % SECTOR_SIZE as u64) as usize;
            let chunk = (buf.len() - done).min(SECTOR_SIZE - sector_offset);
            self.storage
                .cache
                .write(sector, sector_offset, &buf[done..done + chunk])?;
            done += chunk;
        }
        Ok(done)
    }
}

/// A formatted disk: buffer cache, free map and the open-inode table.
pub struct Volume<D> {
    storage: Arc<Storage<D>>,
    open: SpinLock<Vec<Arc<Inode<D>>>>,
}

impl<D: BlockDevice> Volume<D> {
    /// A volume over `disk` with a default-sized cache and every sector free.
    #[must_use]
    pub fn new(disk: Arc<Disk<D>>) -> Self {
        let free_map = FreeMap::new(disk.sector_count());
        Self::with_cache(BufferCache::new(disk), free_map)
    }

    #[must_use]
    pub fn with_cache(cache: BufferCache<D>, free_map: FreeMap) -> Self {
        info!(
            "volume: {} sectors, {} cache entries",
            cache.disk().sector_count(),
            cache.capacity()
        );
        Self {
            storage: Arc::new(Storage { cache, free_map }),
            open: SpinLock::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn cache(&self) -> &BufferCache<D> {
        &self.storage.cache
    }

    #[must_use]
    pub fn free_map(&self) -> &FreeMap {
        &self.storage.free_map
    }

    /// Write a new inode of `length` zero bytes into `sector`.
    ///
    /// # Errors
    /// [`FsError::FileTooLarge`], [`FsError::DiskFull`], or disk errors;
    /// data sectors allocated before the failure are released.
    pub fn create(&self, sector: SectorNumber, length: u64) -> Result<(), FsError> {
        let length32 = u32::try_from(length).map_err(|_| FsError::FileTooLarge { length })?;
        let extents = self.storage.extents();

        let mut record = InodeRecord::empty();
        let mut allocated = 0;
        extents.grow(&mut record, &mut allocated, length)?;
        record.length = length32;

        if let Err(err) = self.storage.write_record(sector, &record) {
            if let Err(cleanup) = extents.release_all(&record, allocated) {
                warn!("inode {sector}: cleanup after failed create: {cleanup}");
            }
            return Err(err);
        }
        info!("inode {sector} created ({length} bytes)");
        Ok(())
    }

    /// Allocate a sector for a new inode and create it there.
    ///
    /// # Errors
    /// As [`create`](Self::create).
    pub fn create_file(&self, length: u64) -> Result<SectorNumber, FsError> {
        let sector = self.storage.free_map.allocate()?;
        if let Err(err) = self.create(sector, length) {
            self.storage.free_map.release(sector)?;
            return Err(err);
        }
        Ok(sector)
    }

    /// Open the inode stored at `sector`.
    ///
    /// # Errors
    /// [`FsError::BadMagic`] if the sector holds no inode, or disk errors.
    pub fn open(&self, sector: SectorNumber) -> Result<Arc<Inode<D>>, FsError> {
        let mut open = self.open.lock();
        if let Some(inode) = open.iter().find(|inode| inode.sector == sector) {
            inode.state.lock().open_count += 1;
            return Ok(Arc::clone(inode));
        }

        let record = self.storage.read_record(sector)?;
        let inode = Arc::new(Inode {
            sector,
            storage: Arc::clone(&self.storage),
            state: SpinLock::new(InodeState {
                open_count: 1,
                removed: false,
                deny_write: 0,
                allocated: sectors_for(u64::from(record.length)),
            }),
        });
        open.push(Arc::clone(&inode));
        debug!("inode {sector} opened");
        Ok(inode)
    }

    /// Register one more opener of an already open inode.
    #[must_use]
    pub fn reopen(&self, inode: &Arc<Inode<D>>) -> Arc<Inode<D>> {
        inode.state.lock().open_count += 1;
        Arc::clone(inode)
    }

    /// Drop one opener. The last close of a removed inode frees its data
    /// and index sectors and the inode sector itself.
    ///
    /// If that release fails, the inode stays open with one opener so the
    /// close can be retried.
    ///
    /// # Errors
    /// Disk errors or double frees while releasing a removed inode.
    pub fn close(&self, inode: &Arc<Inode<D>>) -> Result<(), FsError> {
        let mut open = self.open.lock();
        let mut state = inode.state.lock();
        if state.open_count == 0 {
            warn!("inode {} closed more often than opened", inode.sector);
            return Ok(());
        }
        state.open_count -= 1;
        if state.open_count > 0 {
            return Ok(());
        }

        if state.removed {
            match self.delete(inode, state.allocated) {
                Ok(released) => {
                    state.allocated = 0;
                    info!("inode {} deleted, {released} sectors released", inode.sector);
                }
                Err(e) => {
                    state.open_count = 1;
                    error!("inode {}: release failed, kept open: {e}", inode.sector);
                    return Err(e);
                }
            }
        }
        open.retain(|other| !Arc::ptr_eq(other, inode));
        Ok(())
    }

    fn delete(&self, inode: &Inode<D>, allocated: usize) -> Result<usize, FsError> {
        let record = inode.record()?;
        let released = self.storage.extents().release_all(&record, allocated)?;
        self.storage.free_map.release(inode.sector)?;
        Ok(released + 1)
    }

    /// Number of distinct open inodes.
    #[must_use]
    pub fn open_inodes(&self) -> usize {
        self.open.lock().len()
    }

    /// Flush every dirty cached sector to disk.
    ///
    /// # Errors
    /// The first disk error; remaining entries are still flushed.
    pub fn shutdown(&self) -> Result<usize, FsError> {
        info!("volume: shutting down");
        Ok(self.storage.cache.flush_all()?)
    }
}

/// An open file: one opener's reference to an inode on a volume.
///
/// Closes the inode when dropped.
pub struct File<D: BlockDevice> {
    volume: Arc<Volume<D>>,
    inode: Arc<Inode<D>>,
}

impl<D: BlockDevice> File<D> {
    /// Open the inode at `sector` on `volume`.
    ///
    /// # Errors
    /// As [`Volume::open`].
    pub fn open(volume: &Arc<Volume<D>>, sector: SectorNumber) -> Result<Self, FsError> {
        Ok(Self {
            inode: volume.open(sector)?,
            volume: Arc::clone(volume),
        })
    }

    /// An independent handle to the same inode.
    #[must_use]
    pub fn reopen(&self) -> Self {
        Self {
            inode: self.volume.reopen(&self.inode),
            volume: Arc::clone(&self.volume),
        }
    }

    #[must_use]
    pub const fn inode(&self) -> &Arc<Inode<D>> {
        &self.inode
    }

    /// # Errors
    /// Disk errors.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, FsError> {
        self.inode.read_at(buf, offset)
    }

    /// # Errors
    /// As [`Inode::write_at`].
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, FsError> {
        self.inode.write_at(buf, offset)
    }

    /// # Errors
    /// Disk errors.
    pub fn length(&self) -> Result<u64, FsError> {
        self.inode.length()
    }
}

impl<D: BlockDevice> Drop for File<D> {
    fn drop(&mut self) {
        if let Err(err) = self.volume.close(&self.inode) {
            error!("closing inode {} failed: {err}", self.inode.sector);
        }
    }
}
