//! Supplemental page table: what every user page is and where its data
//! lives while it is not resident.

use crate::mmap::MapId;
use crate::swap::SwapSlot;
use crate::{BackingFile, VmError};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalPage, VirtualAddress, VirtualPage};

/// Where a page's contents come from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PageKind {
    /// Part of a program image; loaded from the file, never written back.
    Executable,
    /// Part of a memory-mapped file; dirty pages are written back.
    MappedFile,
    /// Zero-filled on first use; lives in swap while evicted.
    Anonymous,
}

/// The file range a page is loaded from.
///
/// `read_bytes` come from the file at `offset`; the remaining
/// `zero_bytes` of the page are zero-filled.
#[derive(Clone)]
pub struct FileBacking {
    pub file: Arc<dyn BackingFile>,
    pub offset: u64,
    pub read_bytes: usize,
    pub zero_bytes: usize,
}

impl FileBacking {
    /// # Panics
    /// In debug builds, if the two byte counts do not add up to a page.
    #[must_use]
    pub fn new(file: Arc<dyn BackingFile>, offset: u64, read_bytes: usize) -> Self {
        debug_assert!(read_bytes <= PAGE_SIZE);
        Self {
            file,
            offset,
            read_bytes,
            zero_bytes: PAGE_SIZE - read_bytes,
        }
    }
}

impl fmt::Debug for FileBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileBacking")
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .field("zero_bytes", &self.zero_bytes)
            .finish_non_exhaustive()
    }
}

/// Everything the kernel knows about one user page.
///
/// The page is resident exactly when [`frame`](Self::frame) is `Some`, and
/// then the owning page directory maps it to that frame.
#[derive(Debug, Clone)]
pub struct PageDescriptor {
    page: VirtualPage,
    kind: PageKind,
    writable: bool,
    frame: Option<PhysicalPage>,
    backing: Option<FileBacking>,
    swap_slot: Option<SwapSlot>,
    mapping: Option<MapId>,
    /// A fault is filling a frame for this page.
    loading: bool,
}

impl PageDescriptor {
    /// A program image page.
    #[must_use]
    pub const fn executable(page: VirtualPage, backing: FileBacking, writable: bool) -> Self {
        Self {
            page,
            kind: PageKind::Executable,
            writable,
            frame: None,
            backing: Some(backing),
            swap_slot: None,
            mapping: None,
            loading: false,
        }
    }

    /// A page of mapping `id`. Mapped pages are always writable.
    #[must_use]
    pub const fn mapped(page: VirtualPage, backing: FileBacking, id: MapId) -> Self {
        Self {
            page,
            kind: PageKind::MappedFile,
            writable: true,
            frame: None,
            backing: Some(backing),
            swap_slot: None,
            mapping: Some(id),
            loading: false,
        }
    }

    /// A zero-filled page, e.g. stack.
    #[must_use]
    pub const fn anonymous(page: VirtualPage, writable: bool) -> Self {
        Self {
            page,
            kind: PageKind::Anonymous,
            writable,
            frame: None,
            backing: None,
            swap_slot: None,
            mapping: None,
            loading: false,
        }
    }

    #[must_use]
    pub const fn page(&self) -> VirtualPage {
        self.page
    }

    #[must_use]
    pub const fn kind(&self) -> PageKind {
        self.kind
    }

    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.writable
    }

    #[must_use]
    pub const fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    #[must_use]
    pub const fn frame(&self) -> Option<PhysicalPage> {
        self.frame
    }

    #[must_use]
    pub const fn backing(&self) -> Option<&FileBacking> {
        self.backing.as_ref()
    }

    /// The slot holding the page while it is swapped out.
    #[must_use]
    pub const fn swap_slot(&self) -> Option<SwapSlot> {
        self.swap_slot
    }

    #[must_use]
    pub const fn mapping(&self) -> Option<MapId> {
        self.mapping
    }

    /// Whether a fault is currently loading the page.
    #[must_use]
    pub const fn is_loading(&self) -> bool {
        self.loading
    }

    /// Claim the page for a fault. The caller keeps the swap slot from its
    /// own copy of the descriptor; no other fault can read it.
    pub(crate) const fn begin_load(&mut self) {
        self.loading = true;
        self.swap_slot = None;
    }

    pub(crate) const fn finish_load(&mut self) {
        self.loading = false;
    }

    pub(crate) const fn set_frame(&mut self, frame: Option<PhysicalPage>) {
        self.frame = frame;
    }

    pub(crate) const fn take_frame(&mut self) -> Option<PhysicalPage> {
        self.frame.take()
    }

    pub(crate) const fn set_swap_slot(&mut self, slot: Option<SwapSlot>) {
        self.swap_slot = slot;
    }

    pub(crate) const fn take_swap_slot(&mut self) -> Option<SwapSlot> {
        self.swap_slot.take()
    }

    /// Turn a modified image page into an anonymous one. The file range
    /// is dropped; from now on the page lives in swap.
    pub(crate) fn retype_anonymous(&mut self) {
        self.kind = PageKind::Anonymous;
        self.backing = None;
    }
}

/// Page descriptors of one address space, ordered by page.
#[derive(Debug, Default)]
pub struct SupplementalPageTable {
    pages: BTreeMap<VirtualPage, PageDescriptor>,
}

impl SupplementalPageTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
        }
    }

    /// The descriptor of the page containing `addr`.
    #[must_use]
    pub fn lookup(&self, addr: VirtualAddress) -> Option<&PageDescriptor> {
        self.pages.get(&addr.page())
    }

    #[must_use]
    pub fn get(&self, page: VirtualPage) -> Option<&PageDescriptor> {
        self.pages.get(&page)
    }

    pub fn get_mut(&mut self, page: VirtualPage) -> Option<&mut PageDescriptor> {
        self.pages.get_mut(&page)
    }

    #[must_use]
    pub fn contains(&self, page: VirtualPage) -> bool {
        self.pages.contains_key(&page)
    }

    /// # Errors
    /// [`VmError::AlreadyMapped`] if the page already has a descriptor.
    pub fn insert(&mut self, descriptor: PageDescriptor) -> Result<(), VmError> {
        let page = descriptor.page;
        if self.pages.contains_key(&page) {
            return Err(VmError::AlreadyMapped(page));
        }
        self.pages.insert(page, descriptor);
        Ok(())
    }

    /// Drop the descriptor without touching its frame or swap slot.
    pub fn remove(&mut self, page: VirtualPage) -> Option<PageDescriptor> {
        self.pages.remove(&page)
    }

    pub fn pages(&self) -> impl Iterator<Item = VirtualPage> + '_ {
        self.pages.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageDescriptor> + '_ {
        self.pages.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}
