//! Per-process view of user memory.

use crate::mmap::Mapping;
use crate::page::{FileBacking, PageDescriptor, SupplementalPageTable};
use crate::{BackingFile, FrameAllocator, FrameMemory, MapId, PageDirectory, VmError};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use kernel_block::BlockDevice;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalPage, VirtualAddress, VirtualPage};
use kernel_sync::SpinLock;
use log::{debug, info, warn};

/// A process's supplemental page table, page directory and file mappings.
///
/// Shared between the process and the frame table, which records the
/// owner of every resident frame.
pub struct AddressSpace {
    id: u32,
    pub(crate) inner: SpinLock<SpaceState>,
}

pub(crate) struct SpaceState {
    pub(crate) table: SupplementalPageTable,
    pub(crate) directory: Box<dyn PageDirectory>,
    pub(crate) mappings: BTreeMap<MapId, Mapping>,
    pub(crate) next_map_id: u32,
}

impl AddressSpace {
    /// An empty address space over `directory`. `id` only tags log output.
    #[must_use]
    pub fn new(id: u32, directory: impl PageDirectory + 'static) -> Arc<Self> {
        Arc::new(Self {
            id,
            inner: SpinLock::new(SpaceState {
                table: SupplementalPageTable::new(),
                directory: Box::new(directory),
                mappings: BTreeMap::new(),
                next_map_id: 0,
            }),
        })
    }

    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Register a descriptor.
    ///
    /// # Errors
    /// [`VmError::AlreadyMapped`] if the page already has one.
    pub fn insert(&self, descriptor: PageDescriptor) -> Result<(), VmError> {
        self.inner.lock().table.insert(descriptor)
    }

    /// A copy of the descriptor covering `addr`.
    #[must_use]
    pub fn lookup(&self, addr: VirtualAddress) -> Option<PageDescriptor> {
        self.inner.lock().table.lookup(addr).cloned()
    }

    /// Drop the descriptor of `page` without releasing its frame or swap
    /// slot. An orphaned resident frame is discarded when the clock
    /// reaches it.
    pub fn remove(&self, page: VirtualPage) -> Option<PageDescriptor> {
        self.inner.lock().table.remove(page)
    }

    /// Register the pages of a program segment for lazy loading.
    ///
    /// `read_bytes` are read from `file` at `offset` into consecutive pages
    /// starting at `start`; the following `zero_bytes` are zero-filled.
    /// Either every page is registered or none is.
    ///
    /// # Errors
    /// [`VmError::Unaligned`] unless `start` is page aligned and the
    /// segment covers whole pages; [`VmError::AlreadyMapped`] if a page is
    /// already in use.
    pub fn map_segment(
        &self,
        file: &Arc<dyn BackingFile>,
        offset: u64,
        start: VirtualAddress,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<(), VmError> {
        let first = VirtualPage::from_aligned(start).ok_or(VmError::Unaligned(start))?;
        let total = read_bytes + zero_bytes;
        if total % PAGE_SIZE != 0 {
            return Err(VmError::Unaligned(start + total as u64));
        }
        let count = total / PAGE_SIZE;

        let mut inner = self.inner.lock();
        if let Some(taken) = (0..count)
            .map(|i| first.step(i))
            .find(|&page| inner.table.contains(page))
        {
            return Err(VmError::AlreadyMapped(taken));
        }

        let mut remaining = read_bytes;
        for i in 0..count {
            let page_read = remaining.min(PAGE_SIZE);
            let backing = FileBacking::new(
                Arc::clone(file),
                offset + (i * PAGE_SIZE) as u64,
                page_read,
            );
            inner
                .table
                .insert(PageDescriptor::executable(first.step(i), backing, writable))?;
            remaining -= page_read;
        }

        debug!(
            "space {}: {count} segment pages at {first}, {read_bytes} bytes from offset {offset}",
            self.id
        );
        Ok(())
    }

    /// Register a zero-fill-on-demand page, e.g. the initial stack page.
    ///
    /// # Errors
    /// [`VmError::AlreadyMapped`] if the page is already in use.
    pub fn map_anonymous(&self, page: VirtualPage, writable: bool) -> Result<(), VmError> {
        self.insert(PageDescriptor::anonymous(page, writable))
    }

    /// The frame `page` is mapped to, as the MMU would see it.
    #[must_use]
    pub fn translate(&self, page: VirtualPage) -> Option<PhysicalPage> {
        self.inner.lock().directory.translate(page)
    }

    #[must_use]
    pub fn is_accessed(&self, page: VirtualPage) -> bool {
        self.inner.lock().directory.is_accessed(page)
    }

    #[must_use]
    pub fn is_dirty(&self, page: VirtualPage) -> bool {
        self.inner.lock().directory.is_dirty(page)
    }

    /// Run `f` on the page directory, e.g. to model hardware status bits.
    pub fn with_directory<R>(&self, f: impl FnOnce(&mut dyn PageDirectory) -> R) -> R {
        f(self.inner.lock().directory.as_mut())
    }

    /// Pages with a descriptor.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.inner.lock().table.len()
    }

    /// Pages currently held in a frame.
    #[must_use]
    pub fn resident_pages(&self) -> usize {
        self.inner
            .lock()
            .table
            .iter()
            .filter(|d| d.is_resident())
            .count()
    }

    /// Tear the address space down at process exit.
    ///
    /// Every mapping is unmapped with write-back, then every remaining page
    /// is released: resident frames return to the pool exactly once and
    /// swap slots of evicted pages are discarded. Teardown continues past
    /// failures.
    ///
    /// # Errors
    /// The first failure encountered.
    pub fn destroy<M: FrameMemory, S: BlockDevice>(
        self: &Arc<Self>,
        frames: &FrameAllocator<M, S>,
    ) -> Result<(), VmError> {
        let mut first_error = None;

        let ids: Vec<MapId> = self.inner.lock().mappings.keys().copied().collect();
        for id in ids {
            if let Err(e) = self.munmap(frames, id) {
                warn!("space {}: unmapping {id} at exit failed: {e}", self.id);
                first_error.get_or_insert(e);
            }
        }

        let pages: Vec<VirtualPage> = self.inner.lock().table.pages().collect();
        for page in pages {
            if let Err(e) = frames.release_page(self, page, false) {
                warn!("space {}: releasing {page} at exit failed: {e}", self.id);
                first_error.get_or_insert(e);
            }
        }

        info!("space {} destroyed", self.id);
        first_error.map_or(Ok(()), Err)
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
