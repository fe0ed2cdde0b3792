//! # File System Storage Layer
//!
//! The part of the file system that sits between open files and the disk:
//!
//! * [`BufferCache`]: a fixed set of sector buffers with clock eviction and
//!   write-back of dirty sectors. Every inode and index-block access goes
//!   through it.
//! * [`FreeMap`]: which sectors of the volume are in use.
//! * [`ExtentMap`]: translation of a byte offset inside a file into the
//!   sector that stores it, through 124 direct pointers, one indirect block
//!   and one double-indirect block. Files grow sector by sector.
//! * [`Volume`], [`Inode`] and [`File`]: inode creation, the table of open
//!   inodes, deferred deletion, and byte-granular reads and writes.
//!
//! ## On-disk inode
//!
//! ```text
//! offset  size  field
//! 0       4     length in bytes
//! 4       496   direct[124]        sector numbers, 0xFFFF_FFFF = unallocated
//! 500     4     indirect           -> 128 sector numbers
//! 504     4     double_indirect    -> 128 indirect blocks
//! 508     4     magic (0x494E4F44)
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod cache;
mod free_map;
mod inode;

pub use cache::{BufferCache, CACHE_BYTES, CACHE_ENTRIES, CacheStats, CachedSector};
pub use free_map::FreeMap;
pub use inode::{
    DIRECT_ENTRIES, ExtentMap, File, INDIRECT_ENTRIES, INODE_MAGIC, IndexBlock, Inode,
    InodeRecord, MAX_FILE_LENGTH, MAX_FILE_SECTORS, SectorLocation, Volume,
};

use kernel_block::{BlockError, SectorNumber};

/// Errors of the file system storage layer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FsError {
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error("no free sectors left on the volume")]
    DiskFull,
    #[error("file length {length} exceeds the largest representable file")]
    FileTooLarge { length: u64 },
    #[error("offset {offset} is past the end of the file ({length} bytes)")]
    OutOfRange { offset: u64, length: u64 },
    #[error("sector {sector} does not hold an inode (magic {magic:#010x})")]
    BadMagic { sector: SectorNumber, magic: u32 },
    #[error("no sector registered for file sector index {index}")]
    Unallocated { index: usize },
    #[error("sector {0} is not allocated")]
    NotAllocated(SectorNumber),
    #[error("sector {0} is already allocated")]
    AlreadyAllocated(SectorNumber),
}
