//! # Virtual and Physical Page Addresses
//!
//! Strongly typed wrappers for the addresses the paging and frame
//! management code passes around. They keep virtual and physical values
//! apart at compile time while staying zero-cost `u64` newtypes.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`VirtualAddress`] | Any byte address in a process address space. |
//! | [`VirtualPage`] | Page-aligned base of a 4 KiB virtual page. |
//! | [`PhysicalAddress`] | Any physical (bus) address. |
//! | [`PhysicalPage`] | Page-aligned base of a 4 KiB physical frame. |
//! | [`PageOffset`] | Byte offset inside a 4 KiB page (`0..PAGE_SIZE`). |
//!
//! Only 4 KiB pages exist here; the demand pager never maps huge pages.
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x0804_8123);
//! let (page, off) = va.split();
//! assert_eq!(page.base().as_u64(), 0x0804_8000);
//! assert_eq!(off.as_usize(), 0x123);
//! assert_eq!(page.join(off), va);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

mod page_offset;
mod physical_address;
mod virtual_address;

pub use page_offset::PageOffset;
pub use physical_address::{PhysicalAddress, PhysicalPage};
pub use virtual_address::{VirtualAddress, VirtualPage};

/// Size of a page (and of a physical frame) in bytes.
pub const PAGE_SIZE: usize = 4096;

/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFT: u32 = 12;

const PAGE_MASK: u64 = (PAGE_SIZE as u64) - 1;

const _: () = assert!(1 << PAGE_SHIFT == PAGE_SIZE);
