//! # Block Devices
//!
//! Sector-granular access to the disks below the buffer cache and the swap
//! store. A driver implements [`BlockDevice`]; the kernel only ever talks to
//! it through a [`Disk`], which serializes requests and counts them.
//!
//! Several disks that sit behind the same controller share one
//! [`IoChannel`], so swap traffic and file system traffic never overlap on
//! the wire even though they address different devices.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod bitmap;
mod disk;
mod ram_disk;
mod sector;

pub use bitmap::Bitmap;
pub use disk::{BlockDevice, Disk, DiskStats, IoChannel};
pub use ram_disk::RamDisk;
pub use sector::{SECTOR_SIZE, SectorBuf, SectorNumber};

/// Errors reported by block devices.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockError {
    #[error("sector {sector} is beyond the end of the device ({count} sectors)")]
    OutOfRange { sector: SectorNumber, count: u32 },
    #[error("device I/O failed on sector {0}")]
    Io(SectorNumber),
}
