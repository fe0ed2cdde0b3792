//! Physical frame pool with clock eviction.
//!
//! Frames live in a slab indexed by position. A frame is free, pinned
//! (handed out but not yet, or no longer, owned by a page) or resident.
//! Only resident frames are eviction candidates; the clock hand sweeps the
//! slab and skips everything else.
//!
//! One lock covers the whole table, and [`FrameAllocator::allocate`] holds
//! it from the free-list check through any eviction I/O, so no two
//! allocations can pick the same victim.

use crate::page::{FileBacking, PageKind};
use crate::space::SpaceState;
use crate::swap::{SwapSlot, SwapStore};
use crate::{AddressSpace, FrameMemory, PageDescriptor, VmError};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use kernel_block::BlockDevice;
use kernel_memory_addresses::{PhysicalPage, VirtualPage};
use kernel_sync::SpinLock;
use log::{debug, error, trace, warn};

#[derive(Debug)]
enum FrameUse {
    Free,
    Pinned,
    Resident {
        owner: Arc<AddressSpace>,
        page: VirtualPage,
    },
}

#[derive(Debug)]
struct FrameSlot {
    frame: PhysicalPage,
    usage: FrameUse,
}

#[derive(Debug)]
struct FrameTable {
    slots: Vec<FrameSlot>,
    free: Vec<usize>,
    hand: usize,
    resident: usize,
    evictions: usize,
}

/// The pool of user frames, the swap store it evicts to, and the memory
/// holding the frame contents.
pub struct FrameAllocator<M, S> {
    memory: M,
    swap: SwapStore<S>,
    index: BTreeMap<PhysicalPage, usize>,
    table: SpinLock<FrameTable>,
}

impl<M: FrameMemory, S: BlockDevice> FrameAllocator<M, S> {
    /// Take ownership of the user frames handed over by the boot layer.
    #[must_use]
    pub fn new(
        memory: M,
        frames: impl IntoIterator<Item = PhysicalPage>,
        swap: SwapStore<S>,
    ) -> Self {
        let slots: Vec<FrameSlot> = frames
            .into_iter()
            .map(|frame| FrameSlot {
                frame,
                usage: FrameUse::Free,
            })
            .collect();
        let index = slots
            .iter()
            .enumerate()
            .map(|(i, slot)| (slot.frame, i))
            .collect();
        let free = (0..slots.len()).rev().collect();
        debug!("frame pool of {} frames", slots.len());

        Self {
            memory,
            swap,
            index,
            table: SpinLock::new(FrameTable {
                slots,
                free,
                hand: 0,
                resident: 0,
                evictions: 0,
            }),
        }
    }

    #[must_use]
    pub const fn memory(&self) -> &M {
        &self.memory
    }

    #[must_use]
    pub const fn swap(&self) -> &SwapStore<S> {
        &self.swap
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn free_frames(&self) -> usize {
        self.table.lock().free.len()
    }

    /// Frames owned by a page and eligible for eviction.
    #[must_use]
    pub fn resident_frames(&self) -> usize {
        self.table.lock().resident
    }

    /// Pages evicted since the pool was created.
    #[must_use]
    pub fn evictions(&self) -> usize {
        self.table.lock().evictions
    }

    /// Owner and page of a resident frame.
    #[must_use]
    pub fn owner_of(&self, frame: PhysicalPage) -> Option<(u32, VirtualPage)> {
        let index = *self.index.get(&frame)?;
        match &self.table.lock().slots[index].usage {
            FrameUse::Resident { owner, page } => Some((owner.id(), *page)),
            FrameUse::Free | FrameUse::Pinned => None,
        }
    }

    /// Hand out a frame, evicting a resident page if none is free.
    ///
    /// The frame is pinned: it is not an eviction candidate until
    /// [`install`](Self::install)ed.
    ///
    /// # Errors
    /// [`VmError::OutOfFrames`] if nothing is free or resident; swap or
    /// file errors from writing the victim out, in which case the victim
    /// stays resident.
    pub fn allocate(&self, zero: bool) -> Result<PhysicalPage, VmError> {
        let frame = {
            let mut table = self.table.lock();
            let index = match table.free.pop() {
                Some(index) => index,
                None => self.evict(&mut table)?,
            };
            let slot = &mut table.slots[index];
            slot.usage = FrameUse::Pinned;
            slot.frame
        };

        if zero && self.memory.with_frame(frame, |bytes| bytes.fill(0)).is_none() {
            if let Err(e) = self.free(frame) {
                error!("cannot return unbacked frame {frame}: {e}");
            }
            return Err(VmError::BadFrame(frame));
        }

        trace!("allocated frame {frame}");
        Ok(frame)
    }

    /// Record that pinned `frame` now holds `page` of `owner` and make it
    /// an eviction candidate. The page must already be mapped.
    ///
    /// # Errors
    /// [`VmError::BadFrame`] if the frame is not part of the pool.
    pub fn install(
        &self,
        frame: PhysicalPage,
        owner: &Arc<AddressSpace>,
        page: VirtualPage,
    ) -> Result<(), VmError> {
        let index = self.slot_of(frame)?;
        let mut table = self.table.lock();
        let slot = &mut table.slots[index];
        debug_assert!(matches!(slot.usage, FrameUse::Pinned));
        slot.usage = FrameUse::Resident {
            owner: Arc::clone(owner),
            page,
        };
        table.resident += 1;
        Ok(())
    }

    /// Return `frame` to the pool.
    ///
    /// A resident frame is unmapped from its owner and the owner's page
    /// becomes non-resident; its contents are discarded.
    ///
    /// # Errors
    /// [`VmError::BadFrame`] for foreign frames and
    /// [`VmError::FrameNotInUse`] on a double free.
    pub fn free(&self, frame: PhysicalPage) -> Result<(), VmError> {
        let index = self.slot_of(frame)?;
        let mut table = self.table.lock();
        match core::mem::replace(&mut table.slots[index].usage, FrameUse::Free) {
            FrameUse::Free => {
                error!("double free of frame {frame}");
                return Err(VmError::FrameNotInUse(frame));
            }
            FrameUse::Pinned => {}
            FrameUse::Resident { owner, page } => {
                let mut space = owner.inner.lock();
                space.directory.unmap(page);
                if let Some(descriptor) = space.table.get_mut(page)
                    && descriptor.frame() == Some(frame)
                {
                    descriptor.set_frame(None);
                }
                table.resident -= 1;
            }
        }
        table.free.push(index);
        trace!("freed frame {frame}");
        Ok(())
    }

    /// Fill `frame` from the source recorded in `descriptor`: its swap
    /// slot, else its file range with a zeroed tail, else zeros.
    ///
    /// Swapping in frees the slot.
    ///
    /// # Errors
    /// Swap and file errors; [`VmError::BadFrame`] for foreign frames.
    pub fn populate(
        &self,
        frame: PhysicalPage,
        descriptor: &PageDescriptor,
    ) -> Result<(), VmError> {
        self.memory
            .with_frame(frame, |bytes| -> Result<(), VmError> {
                if let Some(slot) = descriptor.swap_slot() {
                    self.swap.swap_in(slot, bytes)?;
                    debug!("{} swapped in from {slot}", descriptor.page());
                    return Ok(());
                }
                match descriptor.backing() {
                    Some(backing) => {
                        let read = backing
                            .file
                            .read_at(&mut bytes[..backing.read_bytes], backing.offset)?;
                        if read < backing.read_bytes {
                            warn!(
                                "{}: short read of {read} of {} bytes at offset {}",
                                descriptor.page(),
                                backing.read_bytes,
                                backing.offset
                            );
                        }
                        bytes[read..].fill(0);
                    }
                    None => bytes.fill(0),
                }
                Ok(())
            })
            .ok_or(VmError::BadFrame(frame))?
    }

    /// Remove `page` from `space`, releasing its frame and swap slot.
    ///
    /// With `write_back`, a dirty mapped-file page is written to its file
    /// first. Holding the table lock keeps the clock away from the page
    /// while it is torn down.
    pub(crate) fn release_page(
        &self,
        space: &Arc<AddressSpace>,
        page: VirtualPage,
        write_back: bool,
    ) -> Result<Option<PageDescriptor>, VmError> {
        let mut table = self.table.lock();
        let mut inner = space.inner.lock();
        let Some(mut descriptor) = inner.table.remove(page) else {
            return Ok(None);
        };

        let mut result = Ok(());
        if let Some(frame) = descriptor.take_frame() {
            if write_back
                && descriptor.kind() == PageKind::MappedFile
                && inner.directory.is_dirty(page)
                && let Some(backing) = descriptor.backing()
            {
                result = self.write_back(frame, backing);
            }
            inner.directory.unmap(page);
            if let Some(&index) = self.index.get(&frame) {
                let usage = core::mem::replace(&mut table.slots[index].usage, FrameUse::Free);
                if matches!(usage, FrameUse::Resident { .. }) {
                    table.resident -= 1;
                }
                table.free.push(index);
            }
        }

        if let Some(slot) = descriptor.take_swap_slot()
            && let Err(e) = self.swap.release(slot)
        {
            result = result.and(Err(e.into()));
        }

        drop(inner);
        drop(table);
        result.map(|()| Some(descriptor))
    }

    /// Advance the clock until an unreferenced resident page is found,
    /// write it out and return its slot index, now free.
    fn evict(&self, table: &mut FrameTable) -> Result<usize, VmError> {
        if table.resident == 0 {
            warn!("frame pool exhausted with no resident page to evict");
            return Err(VmError::OutOfFrames);
        }

        let count = table.slots.len();
        loop {
            let index = table.hand;
            table.hand = (index + 1) % count;

            let FrameUse::Resident { owner, page } = &table.slots[index].usage else {
                continue;
            };
            let (owner, page) = (Arc::clone(owner), *page);
            let frame = table.slots[index].frame;

            let mut space = owner.inner.lock();
            if space.directory.is_accessed(page) {
                space.directory.set_accessed(page, false);
                continue;
            }

            self.page_out(&mut space, page, frame)?;
            drop(space);

            table.slots[index].usage = FrameUse::Free;
            table.resident -= 1;
            table.evictions += 1;
            debug!("evicted {page} of space {} from frame {frame}", owner.id());
            return Ok(index);
        }
    }

    /// Save the victim's contents where its kind requires, then unmap it
    /// and mark it non-resident.
    fn page_out(
        &self,
        space: &mut SpaceState,
        page: VirtualPage,
        frame: PhysicalPage,
    ) -> Result<(), VmError> {
        let dirty = space.directory.is_dirty(page);
        let Some(descriptor) = space.table.get_mut(page) else {
            debug!("discarding orphaned {page}");
            space.directory.unmap(page);
            return Ok(());
        };

        match descriptor.kind() {
            PageKind::Anonymous => {
                let slot = self.swap_out(frame)?;
                descriptor.set_swap_slot(Some(slot));
            }
            PageKind::Executable if dirty => {
                let slot = self.swap_out(frame)?;
                descriptor.retype_anonymous();
                descriptor.set_swap_slot(Some(slot));
            }
            PageKind::MappedFile if dirty => {
                if let Some(backing) = descriptor.backing() {
                    self.write_back(frame, backing)?;
                }
            }
            PageKind::Executable | PageKind::MappedFile => {}
        }

        descriptor.set_frame(None);
        space.directory.unmap(page);
        Ok(())
    }

    pub(crate) fn swap_out(&self, frame: PhysicalPage) -> Result<SwapSlot, VmError> {
        let slot = self
            .memory
            .with_frame(frame, |bytes| self.swap.swap_out(bytes))
            .ok_or(VmError::BadFrame(frame))??;
        debug!("frame {frame} swapped out to {slot}");
        Ok(slot)
    }

    /// Write the valid bytes of a mapped-file page back to the file.
    fn write_back(&self, frame: PhysicalPage, backing: &FileBacking) -> Result<(), VmError> {
        let written = self
            .memory
            .with_frame(frame, |bytes| {
                backing
                    .file
                    .write_at(&bytes[..backing.read_bytes], backing.offset)
            })
            .ok_or(VmError::BadFrame(frame))??;
        if written < backing.read_bytes {
            warn!(
                "short write-back of {written} of {} bytes at offset {}",
                backing.read_bytes, backing.offset
            );
        } else {
            debug!("wrote back {written} bytes at offset {}", backing.offset);
        }
        Ok(())
    }

    fn slot_of(&self, frame: PhysicalPage) -> Result<usize, VmError> {
        self.index
            .get(&frame)
            .copied()
            .ok_or(VmError::BadFrame(frame))
    }
}

impl<M, S> fmt::Debug for FrameAllocator<M, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameAllocator")
            .field("capacity", &self.index.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RamFrames, SoftPageDirectory};
    use kernel_block::{Disk, RamDisk};
    use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};

    fn pool(frames: usize) -> FrameAllocator<RamFrames, RamDisk> {
        let memory = RamFrames::new(PhysicalPage::from_number(0x100), frames);
        let pages: Vec<_> = memory.pages().collect();
        let swap = SwapStore::new(Arc::new(Disk::new(RamDisk::new(64))));
        FrameAllocator::new(memory, pages, swap)
    }

    fn page(n: u64) -> VirtualPage {
        VirtualPage::containing(VirtualAddress::new(n << 12))
    }

    /// Fault `page` in by hand: allocate, map, install.
    fn make_resident(
        frames: &FrameAllocator<RamFrames, RamDisk>,
        space: &Arc<AddressSpace>,
        page: VirtualPage,
    ) -> PhysicalPage {
        space.map_anonymous(page, true).unwrap();
        let frame = frames.allocate(true).unwrap();
        {
            let mut inner = space.inner.lock();
            inner.directory.map(page, frame, true);
            inner.table.get_mut(page).unwrap().set_frame(Some(frame));
        }
        frames.install(frame, space, page).unwrap();
        frame
    }

    #[test]
    fn frames_are_handed_out_lowest_first() {
        let frames = pool(3);
        assert_eq!(frames.allocate(false), Ok(PhysicalPage::from_number(0x100)));
        assert_eq!(frames.allocate(false), Ok(PhysicalPage::from_number(0x101)));
        assert_eq!(frames.free_frames(), 1);
        assert_eq!(frames.resident_frames(), 0);
    }

    #[test]
    fn pinned_frames_are_never_evicted() {
        let frames = pool(2);
        frames.allocate(false).unwrap();
        frames.allocate(false).unwrap();
        assert_eq!(frames.allocate(false), Err(VmError::OutOfFrames));
    }

    #[test]
    fn allocation_can_zero_the_frame() {
        let frames = pool(1);
        let frame = frames.allocate(false).unwrap();
        frames.memory().with_frame(frame, |b| b.fill(0xEE));
        frames.free(frame).unwrap();

        let frame = frames.allocate(true).unwrap();
        assert_eq!(
            frames.memory().with_frame(frame, |b| b.iter().all(|&x| x == 0)),
            Some(true)
        );
    }

    #[test]
    fn double_free_is_reported() {
        let frames = pool(1);
        let frame = frames.allocate(false).unwrap();
        frames.free(frame).unwrap();
        assert_eq!(frames.free(frame), Err(VmError::FrameNotInUse(frame)));
        assert_eq!(
            frames.free(PhysicalPage::from_number(7)),
            Err(VmError::BadFrame(PhysicalPage::from_number(7)))
        );
    }

    #[test]
    fn clock_gives_referenced_pages_a_second_chance() {
        let frames = pool(3);
        let space = AddressSpace::new(1, SoftPageDirectory::new());
        for n in 0..3 {
            make_resident(&frames, &space, page(n));
        }
        space.with_directory(|dir| {
            dir.set_accessed(page(0), true);
            dir.set_accessed(page(2), true);
        });

        let frame = frames.allocate(false).unwrap();
        assert_eq!(frame, PhysicalPage::from_number(0x101));
        assert_eq!(frames.evictions(), 1);
        assert!(!space.lookup(page(1).base()).unwrap().is_resident());
        assert!(space.translate(page(1)).is_none());
        assert!(space.lookup(page(1).base()).unwrap().swap_slot().is_some());

        // The hand cleared the bit it passed and stopped at the victim.
        assert!(!space.is_accessed(page(0)));
        assert!(space.is_accessed(page(2)));
    }

    #[test]
    fn all_referenced_pages_are_evicted_on_the_second_sweep() {
        let frames = pool(2);
        let space = AddressSpace::new(1, SoftPageDirectory::new());
        make_resident(&frames, &space, page(0));
        make_resident(&frames, &space, page(1));
        space.with_directory(|dir| {
            dir.set_accessed(page(0), true);
            dir.set_accessed(page(1), true);
        });

        assert_eq!(frames.allocate(false), Ok(PhysicalPage::from_number(0x100)));
        assert!(space.translate(page(0)).is_none());
        assert!(space.translate(page(1)).is_some());
    }

    #[test]
    fn clean_image_pages_are_discarded_without_swap() {
        use crate::page::FileBacking;

        struct Zeros;
        impl crate::BackingFile for Zeros {
            fn read_at(&self, buf: &mut [u8], _: u64) -> Result<usize, kernel_fs::FsError> {
                buf.fill(0);
                Ok(buf.len())
            }
            fn write_at(&self, _: &[u8], _: u64) -> Result<usize, kernel_fs::FsError> {
                panic!("image pages are never written back");
            }
            fn length(&self) -> Result<u64, kernel_fs::FsError> {
                Ok(PAGE_SIZE as u64)
            }
        }

        let frames = pool(1);
        let space = AddressSpace::new(1, SoftPageDirectory::new());
        let backing = FileBacking::new(Arc::new(Zeros), 0, PAGE_SIZE);
        space
            .insert(PageDescriptor::executable(page(4), backing, false))
            .unwrap();
        let frame = frames.allocate(false).unwrap();
        frames
            .populate(frame, &space.lookup(page(4).base()).unwrap())
            .unwrap();
        {
            let mut inner = space.inner.lock();
            inner.directory.map(page(4), frame, false);
            inner.table.get_mut(page(4)).unwrap().set_frame(Some(frame));
        }
        frames.install(frame, &space, page(4)).unwrap();

        frames.allocate(false).unwrap();
        let descriptor = space.lookup(page(4).base()).unwrap();
        assert_eq!(descriptor.kind(), PageKind::Executable);
        assert_eq!(descriptor.swap_slot(), None);
        assert_eq!(frames.swap().used_slots(), 0);
    }

    #[test]
    fn freeing_a_resident_frame_unmaps_its_page() {
        let frames = pool(2);
        let space = AddressSpace::new(1, SoftPageDirectory::new());
        let frame = make_resident(&frames, &space, page(9));
        assert_eq!(frames.owner_of(frame), Some((1, page(9))));

        frames.free(frame).unwrap();
        assert_eq!(frames.owner_of(frame), None);
        assert_eq!(frames.resident_frames(), 0);
        assert!(space.translate(page(9)).is_none());
        assert!(!space.lookup(page(9).base()).unwrap().is_resident());
    }

    #[test]
    fn full_swap_keeps_the_victim_resident() {
        let memory = RamFrames::new(PhysicalPage::from_number(0), 1);
        let pages: Vec<_> = memory.pages().collect();
        let swap = SwapStore::with_capacity(Arc::new(Disk::new(RamDisk::new(64))), 0);
        let frames = FrameAllocator::new(memory, pages, swap);
        let space = AddressSpace::new(1, SoftPageDirectory::new());
        make_resident(&frames, &space, page(1));

        assert_eq!(
            frames.allocate(false),
            Err(VmError::Swap(crate::SwapError::Full))
        );
        assert!(space.lookup(page(1).base()).unwrap().is_resident());
        assert_eq!(frames.resident_frames(), 1);
    }
}
