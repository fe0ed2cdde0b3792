use kernel_block::BlockDevice;
use kernel_fs::{File, FsError, Inode};

/// A file that pages can be loaded from and written back to.
pub trait BackingFile: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`; returns the count read.
    ///
    /// # Errors
    /// Any storage failure of the underlying file.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, FsError>;

    /// Write `buf` at `offset`; returns the count written, which is zero
    /// while writes are denied.
    ///
    /// # Errors
    /// Any storage failure of the underlying file.
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, FsError>;

    /// Length in bytes.
    ///
    /// # Errors
    /// Any storage failure of the underlying file.
    fn length(&self) -> Result<u64, FsError>;
}

impl<D: BlockDevice> BackingFile for File<D> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, FsError> {
        Self::read_at(self, buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, FsError> {
        Self::write_at(self, buf, offset)
    }

    fn length(&self) -> Result<u64, FsError> {
        Self::length(self)
    }
}

impl<D: BlockDevice> BackingFile for Inode<D> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, FsError> {
        Self::read_at(self, buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, FsError> {
        Self::write_at(self, buf, offset)
    }

    fn length(&self) -> Result<u64, FsError> {
        Self::length(self)
    }
}
