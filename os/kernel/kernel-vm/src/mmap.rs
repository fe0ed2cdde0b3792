//! Memory-mapped files.

use crate::page::{FileBacking, PageDescriptor};
use crate::{AddressSpace, BackingFile, FrameAllocator, FrameMemory, VmError};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use kernel_block::BlockDevice;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, VirtualPage};
use log::{debug, warn};

/// Identifies a file mapping within its address space. Ids count up
/// from 0 per address space.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct MapId(u32);

impl MapId {
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for MapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "map#{}", self.0)
    }
}

/// A live mapping: the file and the pages it covers.
pub(crate) struct Mapping {
    pub(crate) file: Arc<dyn BackingFile>,
    pub(crate) pages: Vec<VirtualPage>,
}

impl AddressSpace {
    /// Map the whole of `file` at `addr`, one page per 4 KiB of file; the
    /// tail of the last page is zero-filled. Nothing is read until the
    /// pages are touched.
    ///
    /// # Errors
    /// [`VmError::Unaligned`] unless `addr` is a non-null page boundary,
    /// [`VmError::EmptyFile`], and [`VmError::AlreadyMapped`] if any page
    /// of the range is in use, in which case nothing is mapped.
    pub fn mmap(&self, file: Arc<dyn BackingFile>, addr: VirtualAddress) -> Result<MapId, VmError> {
        let start = VirtualPage::from_aligned(addr)
            .filter(|page| page.number() != 0)
            .ok_or(VmError::Unaligned(addr))?;
        let length = file.length()?;
        if length == 0 {
            return Err(VmError::EmptyFile);
        }
        #[allow(clippy::cast_possible_truncation)]
        let count = length.div_ceil(PAGE_SIZE as u64) as usize;
        let pages: Vec<VirtualPage> = (0..count).map(|i| start.step(i)).collect();

        let mut inner = self.inner.lock();
        if let Some(&taken) = pages.iter().find(|&&page| inner.table.contains(page)) {
            return Err(VmError::AlreadyMapped(taken));
        }

        let id = MapId::new(inner.next_map_id);
        inner.next_map_id += 1;

        let mut offset = 0;
        for &page in &pages {
            #[allow(clippy::cast_possible_truncation)]
            let read_bytes = (length - offset).min(PAGE_SIZE as u64) as usize;
            let backing = FileBacking::new(Arc::clone(&file), offset, read_bytes);
            inner
                .table
                .insert(PageDescriptor::mapped(page, backing, id))?;
            offset += PAGE_SIZE as u64;
        }
        inner.mappings.insert(id, Mapping { file, pages });

        debug!(
            "space {}: {id} maps {length} bytes at {start} ({count} pages)",
            self.id()
        );
        Ok(id)
    }

    /// Remove mapping `id`. Dirty resident pages are written back to the
    /// file at their offsets, then their frames are freed. Every page is
    /// processed even if a write-back fails.
    ///
    /// # Errors
    /// [`VmError::BadMapping`] for unknown ids; otherwise the first
    /// write-back failure.
    pub fn munmap<M: FrameMemory, S: BlockDevice>(
        self: &Arc<Self>,
        frames: &FrameAllocator<M, S>,
        id: MapId,
    ) -> Result<(), VmError> {
        let mapping = self
            .inner
            .lock()
            .mappings
            .remove(&id)
            .ok_or(VmError::BadMapping(id))?;

        let mut first_error = None;
        for &page in &mapping.pages {
            if let Err(e) = frames.release_page(self, page, true) {
                warn!("space {}: {id}: releasing {page} failed: {e}", self.id());
                first_error.get_or_insert(e);
            }
        }

        debug!(
            "space {}: {id} unmapped ({} pages)",
            self.id(),
            mapping.pages.len()
        );
        drop(mapping.file);
        first_error.map_or(Ok(()), Err)
    }

    /// Ids of the live mappings, ascending.
    #[must_use]
    pub fn mappings(&self) -> Vec<MapId> {
        self.inner.lock().mappings.keys().copied().collect()
    }
}
