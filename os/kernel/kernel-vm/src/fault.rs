//! Page faults and user memory access.

use crate::{AddressSpace, FrameAllocator, FrameMemory, PageDescriptor, SwapSlot, VmError};
use alloc::sync::Arc;
use core::hint::spin_loop;
use kernel_block::BlockDevice;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalPage, VirtualAddress, VirtualPage};
use log::{error, trace};

impl AddressSpace {
    /// Make the page containing `addr` resident.
    ///
    /// The address-space lock is not held while a frame is allocated or
    /// filled, since allocation may evict a page of this very space. The
    /// page is claimed first: a concurrent fault on it waits until this
    /// one has finished.
    ///
    /// # Errors
    /// [`VmError::AccessViolation`] if no descriptor covers `addr`,
    /// [`VmError::ReadOnly`] for a write to a read-only page; both should
    /// terminate the process. Allocation, swap and file errors otherwise.
    pub fn handle_fault<M: FrameMemory, S: BlockDevice>(
        self: &Arc<Self>,
        frames: &FrameAllocator<M, S>,
        addr: VirtualAddress,
        write: bool,
    ) -> Result<(), VmError> {
        match self.claim(addr, write)? {
            Some(descriptor) => self.load(frames, addr, &descriptor),
            None => Ok(()),
        }
    }

    /// Fill a frame for the claimed page from `descriptor`, taken at claim
    /// time, and map it.
    fn load<M: FrameMemory, S: BlockDevice>(
        self: &Arc<Self>,
        frames: &FrameAllocator<M, S>,
        addr: VirtualAddress,
        descriptor: &PageDescriptor,
    ) -> Result<(), VmError> {
        let page = addr.page();
        let frame = match frames.allocate(false) {
            Ok(frame) => frame,
            Err(e) => {
                self.abandon(frames, page, descriptor.swap_slot());
                return Err(e);
            }
        };
        if let Err(e) = frames.populate(frame, descriptor) {
            // A failed swap-in keeps its slot.
            let slot = descriptor
                .swap_slot()
                .filter(|&slot| frames.swap().is_in_use(slot));
            self.abandon(frames, page, slot);
            self.discard(frames, frame);
            return Err(e);
        }

        let mapped = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            match inner.table.get_mut(page) {
                None => Err(VmError::AccessViolation(addr)),
                Some(current) => {
                    let result = if inner.directory.map(page, frame, current.is_writable()) {
                        current.set_frame(Some(frame));
                        Ok(())
                    } else {
                        // The swap-in freed the slot; the frame holds the only copy.
                        if descriptor.swap_slot().is_some() {
                            match frames.swap_out(frame) {
                                Ok(slot) => current.set_swap_slot(Some(slot)),
                                Err(e) => error!(
                                    "space {}: contents of {page} lost: {e}",
                                    self.id()
                                ),
                            }
                        }
                        Err(VmError::MapFailed(page))
                    };
                    current.finish_load();
                    result
                }
            }
        };

        match mapped {
            Ok(()) => {
                frames.install(frame, self, page)?;
                trace!("space {}: {page} resident in {frame}", self.id());
                Ok(())
            }
            Err(e) => {
                self.discard(frames, frame);
                Err(e)
            }
        }
    }

    /// Check access to the page containing `addr` and claim it for loading.
    ///
    /// Returns the descriptor as it was before the claim, or `None` if the
    /// page is already resident. Waits while another fault loads the page.
    fn claim(&self, addr: VirtualAddress, write: bool) -> Result<Option<PageDescriptor>, VmError> {
        let page = addr.page();
        loop {
            {
                let mut inner = self.inner.lock();
                let current = inner
                    .table
                    .get_mut(page)
                    .ok_or(VmError::AccessViolation(addr))?;
                if write && !current.is_writable() {
                    return Err(VmError::ReadOnly(addr));
                }
                if current.is_resident() {
                    return Ok(None);
                }
                if !current.is_loading() {
                    let descriptor = current.clone();
                    current.begin_load();
                    return Ok(Some(descriptor));
                }
            }
            spin_loop();
        }
    }

    /// Give up a claimed page, handing its swap slot back.
    fn abandon<M: FrameMemory, S: BlockDevice>(
        &self,
        frames: &FrameAllocator<M, S>,
        page: VirtualPage,
        slot: Option<SwapSlot>,
    ) {
        let mut inner = self.inner.lock();
        match inner.table.get_mut(page) {
            Some(current) => {
                current.set_swap_slot(slot);
                current.finish_load();
            }
            None => {
                if let Some(slot) = slot
                    && let Err(e) = frames.swap().release(slot)
                {
                    error!("space {}: cannot release {slot}: {e}", self.id());
                }
            }
        }
    }

    /// Copy user memory at `addr` into `buf`, faulting pages in as needed
    /// and setting their accessed bits.
    ///
    /// # Errors
    /// As [`handle_fault`](Self::handle_fault).
    pub fn read_user<M: FrameMemory, S: BlockDevice>(
        self: &Arc<Self>,
        frames: &FrameAllocator<M, S>,
        addr: VirtualAddress,
        buf: &mut [u8],
    ) -> Result<(), VmError> {
        let mut done = 0;
        while done < buf.len() {
            let at = addr
                .checked_add(done as u64)
                .ok_or(VmError::AccessViolation(addr))?;
            let offset = at.offset().as_usize();
            let chunk = (buf.len() - done).min(at.offset().remaining());
            let dst = &mut buf[done..done + chunk];
            self.touch(frames, at, false, |bytes| {
                dst.copy_from_slice(&bytes[offset..offset + chunk]);
            })?;
            done += chunk;
        }
        Ok(())
    }

    /// Copy `data` into user memory at `addr`, faulting pages in as needed
    /// and setting their accessed and dirty bits.
    ///
    /// # Errors
    /// As [`handle_fault`](Self::handle_fault).
    pub fn write_user<M: FrameMemory, S: BlockDevice>(
        self: &Arc<Self>,
        frames: &FrameAllocator<M, S>,
        addr: VirtualAddress,
        data: &[u8],
    ) -> Result<(), VmError> {
        let mut done = 0;
        while done < data.len() {
            let at = addr
                .checked_add(done as u64)
                .ok_or(VmError::AccessViolation(addr))?;
            let offset = at.offset().as_usize();
            let chunk = (data.len() - done).min(at.offset().remaining());
            let src = &data[done..done + chunk];
            self.touch(frames, at, true, |bytes| {
                bytes[offset..offset + chunk].copy_from_slice(src);
            })?;
            done += chunk;
        }
        Ok(())
    }

    /// Access the page containing `addr` the way the MMU would: through
    /// the page directory, updating the status bits, faulting on a miss.
    fn touch<M: FrameMemory, S: BlockDevice, R>(
        self: &Arc<Self>,
        frames: &FrameAllocator<M, S>,
        addr: VirtualAddress,
        write: bool,
        mut access: impl FnMut(&mut [u8; PAGE_SIZE]) -> R,
    ) -> Result<R, VmError> {
        let page = addr.page();
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(entry) = inner.directory.entry(page) {
                    if write && !entry.writable() {
                        return Err(VmError::ReadOnly(addr));
                    }
                    let frame = entry.frame();
                    let result = frames
                        .memory()
                        .with_frame(frame, &mut access)
                        .ok_or(VmError::BadFrame(frame))?;
                    inner.directory.set_entry(
                        page,
                        entry.with_accessed(true).with_dirty(entry.dirty() || write),
                    );
                    return Ok(result);
                }
            }
            self.handle_fault(frames, addr, write)?;
        }
    }

    /// Return a frame that never became resident.
    fn discard<M: FrameMemory, S: BlockDevice>(
        &self,
        frames: &FrameAllocator<M, S>,
        frame: PhysicalPage,
    ) {
        if let Err(e) = frames.free(frame) {
            error!("space {}: cannot return frame {frame}: {e}", self.id());
        }
    }

    /// Fault every page of `[start, start + pages)` in, e.g. to pre-load
    /// a stack.
    ///
    /// # Errors
    /// As [`handle_fault`](Self::handle_fault).
    pub fn prefault<M: FrameMemory, S: BlockDevice>(
        self: &Arc<Self>,
        frames: &FrameAllocator<M, S>,
        start: VirtualPage,
        pages: usize,
    ) -> Result<(), VmError> {
        (0..pages).try_for_each(|i| self.handle_fault(frames, start.step(i).base(), false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PageDirectory, PageEntryBits, RamFrames, SoftPageDirectory, SwapStore};
    use core::sync::atomic::{AtomicBool, Ordering};
    use kernel_block::{Disk, RamDisk};
    use std::thread;
    use std::time::Duration;

    fn pool(frames: usize) -> FrameAllocator<RamFrames, RamDisk> {
        let memory = RamFrames::new(PhysicalPage::from_number(0x100), frames);
        let pages: alloc::vec::Vec<_> = memory.pages().collect();
        let swap = SwapStore::new(Arc::new(Disk::new(RamDisk::new(64))));
        FrameAllocator::new(memory, pages, swap)
    }

    fn addr(n: u64) -> VirtualAddress {
        VirtualAddress::new(n << 12)
    }

    fn read_page(
        space: &Arc<AddressSpace>,
        frames: &FrameAllocator<RamFrames, RamDisk>,
        n: u64,
    ) -> [u8; PAGE_SIZE] {
        let mut buf = [0; PAGE_SIZE];
        space.read_user(frames, addr(n), &mut buf).unwrap();
        buf
    }

    /// Refuses to create entries while `refuse` is set.
    struct Refusing {
        entries: SoftPageDirectory,
        refuse: Arc<AtomicBool>,
    }

    impl PageDirectory for Refusing {
        fn entry(&self, page: VirtualPage) -> Option<PageEntryBits> {
            self.entries.entry(page)
        }

        fn set_entry(&mut self, page: VirtualPage, entry: PageEntryBits) -> bool {
            if self.refuse.load(Ordering::Relaxed) && self.entries.entry(page).is_none() {
                return false;
            }
            self.entries.set_entry(page, entry)
        }

        fn clear_entry(&mut self, page: VirtualPage) -> Option<PageEntryBits> {
            self.entries.clear_entry(page)
        }
    }

    #[test]
    fn second_fault_on_a_loading_page_waits_for_the_first() {
        let frames = pool(2);
        let space = AddressSpace::new(1, SoftPageDirectory::new());
        for n in 1..=4 {
            space.map_anonymous(addr(n).page(), true).unwrap();
        }
        for n in 1..=3 {
            space
                .write_user(&frames, addr(n), &[u8::try_from(n).unwrap(); PAGE_SIZE])
                .unwrap();
        }
        let slot = SwapSlot::new(0);
        assert_eq!(space.lookup(addr(1)).unwrap().swap_slot(), Some(slot));

        // First fault: claim the page, but do not load it yet.
        let claimed = space.claim(addr(1), false).unwrap().unwrap();
        assert_eq!(claimed.swap_slot(), Some(slot));
        let live = space.lookup(addr(1)).unwrap();
        assert!(live.is_loading());
        assert_eq!(live.swap_slot(), None);

        thread::scope(|s| {
            let second = s.spawn(|| read_page(&space, &frames, 1));
            thread::sleep(Duration::from_millis(20));
            assert!(!second.is_finished());

            space.load(&frames, addr(1), &claimed).unwrap();
            // Slot 0 is free again and the next eviction reuses it.
            space.write_user(&frames, addr(4), &[4; PAGE_SIZE]).unwrap();
            assert_eq!(second.join().unwrap(), [1; PAGE_SIZE]);
        });

        for n in 1..=4 {
            assert_eq!(read_page(&space, &frames, n), [u8::try_from(n).unwrap(); PAGE_SIZE]);
        }
        let swapped = space
            .inner
            .lock()
            .table
            .iter()
            .filter(|d| d.swap_slot().is_some())
            .count();
        assert_eq!(frames.swap().used_slots(), swapped);
    }

    #[test]
    fn failed_mapping_keeps_swapped_contents() {
        let _ = env_logger::builder().is_test(true).try_init();
        let frames = pool(1);
        let refuse = Arc::new(AtomicBool::new(false));
        let space = AddressSpace::new(
            1,
            Refusing {
                entries: SoftPageDirectory::new(),
                refuse: Arc::clone(&refuse),
            },
        );
        space.map_anonymous(addr(1).page(), true).unwrap();
        space.map_anonymous(addr(2).page(), true).unwrap();
        space.write_user(&frames, addr(1), &[7; PAGE_SIZE]).unwrap();
        space.write_user(&frames, addr(2), &[8; PAGE_SIZE]).unwrap();

        refuse.store(true, Ordering::Relaxed);
        let mut buf = [0; PAGE_SIZE];
        assert_eq!(
            space.read_user(&frames, addr(1), &mut buf),
            Err(VmError::MapFailed(addr(1).page()))
        );
        let descriptor = space.lookup(addr(1)).unwrap();
        assert!(!descriptor.is_resident());
        assert!(!descriptor.is_loading());
        assert!(descriptor.swap_slot().is_some());
        assert_eq!(frames.free_frames(), 1);

        refuse.store(false, Ordering::Relaxed);
        assert_eq!(read_page(&space, &frames, 1), [7; PAGE_SIZE]);
        assert_eq!(read_page(&space, &frames, 2), [8; PAGE_SIZE]);
    }
}
