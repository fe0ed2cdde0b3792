//! On-disk inode and index block records.
//!
//! Sector pointers are `Option<SectorNumber>` in memory. The all-ones
//! "unallocated" pattern only exists in the serialized bytes.

use crate::FsError;
use kernel_block::{SECTOR_SIZE, SectorBuf, SectorNumber};

/// Direct sector pointers in an inode.
pub const DIRECT_ENTRIES: usize = 124;

/// Sector pointers in one index block.
pub const INDIRECT_ENTRIES: usize = SECTOR_SIZE / size_of::<u32>();

/// Identifies an inode sector.
pub const INODE_MAGIC: u32 = 0x494e_4f44;

const LENGTH_AT: usize = 0;
const DIRECT_AT: usize = 4;
const INDIRECT_AT: usize = DIRECT_AT + DIRECT_ENTRIES * 4;
const DOUBLE_INDIRECT_AT: usize = INDIRECT_AT + 4;
const MAGIC_AT: usize = DOUBLE_INDIRECT_AT + 4;

const _: () = {
    assert!(INDIRECT_ENTRIES == 128);
    assert!(MAGIC_AT + 4 == SECTOR_SIZE);
};

/// The inode as stored in its sector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeRecord {
    /// File length in bytes.
    pub length: u32,
    pub direct: [Option<SectorNumber>; DIRECT_ENTRIES],
    pub indirect: Option<SectorNumber>,
    pub double_indirect: Option<SectorNumber>,
}

/// An indirect (or double-indirect) block: one sector full of pointers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexBlock {
    pub entries: [Option<SectorNumber>; INDIRECT_ENTRIES],
}

impl InodeRecord {
    /// A zero-length inode with no sectors.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            length: 0,
            direct: [None; DIRECT_ENTRIES],
            indirect: None,
            double_indirect: None,
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> SectorBuf {
        let mut bytes = [0; SECTOR_SIZE];
        put(&mut bytes, LENGTH_AT, self.length);
        for (i, sector) in self.direct.iter().enumerate() {
            put(&mut bytes, DIRECT_AT + i * 4, SectorNumber::encode(*sector));
        }
        put(&mut bytes, INDIRECT_AT, SectorNumber::encode(self.indirect));
        put(
            &mut bytes,
            DOUBLE_INDIRECT_AT,
            SectorNumber::encode(self.double_indirect),
        );
        put(&mut bytes, MAGIC_AT, INODE_MAGIC);
        bytes
    }

    /// Parse the inode stored in `sector`.
    ///
    /// # Errors
    /// [`FsError::BadMagic`] if the sector does not hold an inode.
    pub fn from_bytes(sector: SectorNumber, bytes: &SectorBuf) -> Result<Self, FsError> {
        let magic = get(bytes, MAGIC_AT);
        if magic != INODE_MAGIC {
            return Err(FsError::BadMagic { sector, magic });
        }
        let mut direct = [None; DIRECT_ENTRIES];
        for (i, slot) in direct.iter_mut().enumerate() {
            *slot = SectorNumber::decode(get(bytes, DIRECT_AT + i * 4));
        }
        Ok(Self {
            length: get(bytes, LENGTH_AT),
            direct,
            indirect: SectorNumber::decode(get(bytes, INDIRECT_AT)),
            double_indirect: SectorNumber::decode(get(bytes, DOUBLE_INDIRECT_AT)),
        })
    }
}

impl Default for InodeRecord {
    fn default() -> Self {
        Self::empty()
    }
}

impl IndexBlock {
    /// Every slot unallocated.
    pub const EMPTY: Self = Self {
        entries: [None; INDIRECT_ENTRIES],
    };

    #[must_use]
    pub fn to_bytes(&self) -> SectorBuf {
        let mut bytes = [0; SECTOR_SIZE];
        for (i, sector) in self.entries.iter().enumerate() {
            put(&mut bytes, i * 4, SectorNumber::encode(*sector));
        }
        bytes
    }

    #[must_use]
    pub fn from_bytes(bytes: &SectorBuf) -> Self {
        let mut block = Self::EMPTY;
        for (i, slot) in block.entries.iter_mut().enumerate() {
            *slot = SectorNumber::decode(get(bytes, i * 4));
        }
        block
    }
}

fn put(bytes: &mut SectorBuf, at: usize, value: u32) {
    bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn get(bytes: &SectorBuf, at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_inode_serializes_unallocated_pointers_as_all_ones() {
        let bytes = InodeRecord::empty().to_bytes();
        assert_eq!(&bytes[0..4], &[0; 4]);
        assert!(bytes[DIRECT_AT..MAGIC_AT].iter().all(|&b| b == 0xFF));
        assert_eq!(&bytes[MAGIC_AT..], &INODE_MAGIC.to_le_bytes());
    }

    #[test]
    fn sector_zero_survives_serialization() {
        let mut record = InodeRecord::empty();
        record.length = 1000;
        record.direct[0] = Some(SectorNumber::new(0));
        record.direct[1] = Some(SectorNumber::new(9));
        record.indirect = Some(SectorNumber::new(3));

        let parsed = InodeRecord::from_bytes(SectorNumber::new(1), &record.to_bytes()).unwrap();
        assert_eq!(parsed, record);
        assert_eq!(parsed.direct[2], None);
        assert_eq!(parsed.double_indirect, None);
    }

    #[test]
    fn foreign_sector_is_rejected() {
        let err = InodeRecord::from_bytes(SectorNumber::new(4), &[0; SECTOR_SIZE]).unwrap_err();
        assert_eq!(
            err,
            FsError::BadMagic {
                sector: SectorNumber::new(4),
                magic: 0
            }
        );
    }

    #[test]
    fn index_block_layout_is_little_endian_pointers() {
        let mut block = IndexBlock::EMPTY;
        block.entries[1] = Some(SectorNumber::new(0x0102_0304));
        let bytes = block.to_bytes();
        assert_eq!(&bytes[0..4], &[0xFF; 4]);
        assert_eq!(&bytes[4..8], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(IndexBlock::from_bytes(&bytes), block);
    }
}
