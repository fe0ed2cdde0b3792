//! # Demand-Paged Virtual Memory
//!
//! User pages are not backed by memory until they are touched. Each
//! process keeps a [`SupplementalPageTable`] describing how to produce every
//! page it may access:
//!
//! * **executable image** pages are read from the program file, with a
//!   zero-filled tail;
//! * **memory-mapped file** pages are read from, and written back to, the
//!   mapped file;
//! * **anonymous** pages start zeroed and live in swap while evicted.
//!
//! A page fault looks the address up, takes a frame from the
//! [`FrameAllocator`], fills it from the page's source and maps it. When the
//! frame pool runs dry the allocator evicts a resident page chosen by the
//! clock algorithm over the hardware accessed bits. Anonymous pages go to
//! the [`SwapStore`]; dirty mapped-file pages are written back to their file;
//! dirty executable pages become anonymous and go to swap, since the program
//! file is never written.
//!
//! ## Collaborators
//!
//! The hardware page table is reached through [`PageDirectory`], physical
//! frame contents through [`FrameMemory`], and files through
//! [`BackingFile`]. [`SoftPageDirectory`] and [`RamFrames`] are in-memory
//! implementations for hosted use.
//!
//! ## Locking
//!
//! The frame table lock is taken before any address-space lock, which is
//! taken before frame memory, the swap bitmap and the file system. Fault
//! handling never holds its address-space lock while allocating a frame.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod fault;
mod file;
mod frame;
mod memory;
mod mmap;
mod page;
mod page_table;
mod space;
mod swap;

pub use file::BackingFile;
pub use frame::FrameAllocator;
pub use memory::{FrameMemory, RamFrames};
pub use mmap::MapId;
pub use page::{FileBacking, PageDescriptor, PageKind, SupplementalPageTable};
pub use page_table::{PageDirectory, PageEntryBits, SoftPageDirectory};
pub use space::AddressSpace;
pub use swap::{DEFAULT_SWAP_PAGES, SECTORS_PER_PAGE, SwapError, SwapSlot, SwapStore};

use kernel_fs::FsError;
use kernel_memory_addresses::{PhysicalPage, VirtualAddress, VirtualPage};

/// Errors of the virtual memory subsystem.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    /// No page descriptor covers the address.
    #[error("access violation at {0}")]
    AccessViolation(VirtualAddress),
    #[error("write to read-only page at {0}")]
    ReadOnly(VirtualAddress),
    #[error("page {0} already has a descriptor")]
    AlreadyMapped(VirtualPage),
    #[error("address {0} is not page aligned")]
    Unaligned(VirtualAddress),
    #[error("no free frame and no resident page to evict")]
    OutOfFrames,
    #[error("frame {0} is not part of the frame pool")]
    BadFrame(PhysicalPage),
    #[error("frame {0} is already free")]
    FrameNotInUse(PhysicalPage),
    #[error("the page directory could not map {0}")]
    MapFailed(VirtualPage),
    #[error("no mapping with id {0}")]
    BadMapping(MapId),
    #[error("cannot map an empty file")]
    EmptyFile,
    #[error(transparent)]
    Swap(#[from] SwapError),
    #[error(transparent)]
    File(#[from] FsError),
}

impl VmError {
    /// Whether the error is the faulting process's fault rather than the
    /// kernel's; such processes are terminated with a negative status.
    #[must_use]
    pub const fn is_access_violation(&self) -> bool {
        matches!(self, Self::AccessViolation(_) | Self::ReadOnly(_))
    }
}
