//! Hardware page table seam.
//!
//! The pager only needs leaf translations for user pages and the two
//! status bits the MMU maintains on them. [`PageDirectory`] exposes exactly
//! that over raw [`PageEntryBits`]; [`SoftPageDirectory`] keeps the entries
//! in a map for hosted use.

use alloc::collections::BTreeMap;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalPage, VirtualPage};

/// A 64-bit x86-64 leaf page table entry in its raw bitfield form.
///
/// | Bits   | Name      | Meaning |
/// |--------|-----------|---------|
/// | 0      | `P`       | Present |
/// | 1      | `RW`      | Writable if set |
/// | 2      | `US`      | User-mode accessible if set |
/// | 3      | `PWT`     | Write-through caching |
/// | 4      | `PCD`     | Disable caching |
/// | 5      | `A`       | Accessed, set by the MMU on any access |
/// | 6      | `D`       | Dirty, set by the MMU on write |
/// | 7–11   |           | Ignored here |
/// | 12–51  | `addr`    | Physical frame number |
/// | 52–62  |           | Ignored here |
/// | 63     | `NX`      | Execute disable |
///
/// ```rust
/// # use kernel_memory_addresses::PhysicalPage;
/// # use kernel_vm::PageEntryBits;
/// let e = PageEntryBits::leaf(PhysicalPage::from_number(0x42), false);
/// assert!(e.present());
/// assert!(!e.writable());
/// assert_eq!(e.frame(), PhysicalPage::from_number(0x42));
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    pub present: bool,
    pub writable: bool,
    pub user_access: bool,
    pub write_through: bool,
    pub cache_disabled: bool,

    /// Set by the MMU whenever the page is read or written. The clock
    /// eviction policy clears it to give the page a second chance.
    pub accessed: bool,

    /// Set by the MMU whenever the page is written.
    pub dirty: bool,

    #[bits(5)]
    __: u8,

    /// Physical frame number (address bits 51:12).
    #[bits(40)]
    pub frame_number: u64,

    #[bits(11)]
    __: u16,

    pub no_execute: bool,
}

impl PageEntryBits {
    /// A present user leaf mapping of `frame` with clear status bits.
    #[must_use]
    pub const fn leaf(frame: PhysicalPage, writable: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_user_access(true)
            .with_writable(writable)
            .with_no_execute(false)
            .with_frame_number(frame.number())
    }

    #[inline]
    #[must_use]
    pub const fn frame(self) -> PhysicalPage {
        PhysicalPage::from_number(self.frame_number())
    }
}

/// Per-process page table.
///
/// Implementations store entries; the status-bit helpers are provided on
/// top of [`entry`](Self::entry) and [`set_entry`](Self::set_entry).
pub trait PageDirectory: Send {
    /// The present entry for `page`, if any.
    fn entry(&self, page: VirtualPage) -> Option<PageEntryBits>;

    /// Store `entry` for `page`. Returns `false` if the table could not
    /// grow to hold it.
    fn set_entry(&mut self, page: VirtualPage, entry: PageEntryBits) -> bool;

    /// Remove the entry for `page` and return it.
    fn clear_entry(&mut self, page: VirtualPage) -> Option<PageEntryBits>;

    /// Map `page` to `frame` with clear accessed and dirty bits.
    fn map(&mut self, page: VirtualPage, frame: PhysicalPage, writable: bool) -> bool {
        self.set_entry(page, PageEntryBits::leaf(frame, writable))
    }

    fn unmap(&mut self, page: VirtualPage) -> Option<PhysicalPage> {
        self.clear_entry(page).map(PageEntryBits::frame)
    }

    fn translate(&self, page: VirtualPage) -> Option<PhysicalPage> {
        self.entry(page).map(PageEntryBits::frame)
    }

    fn is_accessed(&self, page: VirtualPage) -> bool {
        self.entry(page).is_some_and(|e| e.accessed())
    }

    fn set_accessed(&mut self, page: VirtualPage, accessed: bool) {
        if let Some(entry) = self.entry(page) {
            self.set_entry(page, entry.with_accessed(accessed));
        }
    }

    fn is_dirty(&self, page: VirtualPage) -> bool {
        self.entry(page).is_some_and(|e| e.dirty())
    }

    fn set_dirty(&mut self, page: VirtualPage, dirty: bool) {
        if let Some(entry) = self.entry(page) {
            self.set_entry(page, entry.with_dirty(dirty));
        }
    }
}

/// A page directory held entirely in a map.
#[derive(Debug, Default)]
pub struct SoftPageDirectory {
    entries: BTreeMap<VirtualPage, PageEntryBits>,
}

impl SoftPageDirectory {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Number of present entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PageDirectory for SoftPageDirectory {
    fn entry(&self, page: VirtualPage) -> Option<PageEntryBits> {
        self.entries.get(&page).copied().filter(|e| e.present())
    }

    fn set_entry(&mut self, page: VirtualPage, entry: PageEntryBits) -> bool {
        self.entries.insert(page, entry);
        true
    }

    fn clear_entry(&mut self, page: VirtualPage) -> Option<PageEntryBits> {
        self.entries.remove(&page)
    }
}
