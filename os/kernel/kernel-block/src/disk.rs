use crate::{BlockError, SectorBuf, SectorNumber};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_sync::SpinLock;
use log::trace;

/// Raw sector access provided by a device driver.
pub trait BlockDevice: Send {
    /// Number of addressable sectors.
    fn sector_count(&self) -> u32;

    /// Read one sector into `buf`.
    ///
    /// # Errors
    /// [`BlockError`] if the sector is out of range or the transfer failed.
    fn read_sector(&mut self, sector: SectorNumber, buf: &mut SectorBuf) -> Result<(), BlockError>;

    /// Write one sector from `buf`.
    ///
    /// # Errors
    /// [`BlockError`] if the sector is out of range or the transfer failed.
    fn write_sector(&mut self, sector: SectorNumber, buf: &SectorBuf) -> Result<(), BlockError>;
}

/// Lock shared by every [`Disk`] attached to the same controller.
#[derive(Debug, Default)]
pub struct IoChannel {
    busy: SpinLock<()>,
}

impl IoChannel {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// Request counters of a [`Disk`].
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct DiskStats {
    pub reads: u64,
    pub writes: u64,
}

/// A block device together with its lock and request counters.
///
/// Every transfer takes the channel lock first and the device lock second.
pub struct Disk<D> {
    channel: Arc<IoChannel>,
    device: SpinLock<D>,
    sectors: u32,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl<D: BlockDevice> Disk<D> {
    /// Attach `device` on a channel of its own.
    pub fn new(device: D) -> Self {
        Self::on_channel(device, IoChannel::new())
    }

    /// Attach `device` to an existing controller channel.
    pub fn on_channel(device: D, channel: Arc<IoChannel>) -> Self {
        let sectors = device.sector_count();
        Self {
            channel,
            device: SpinLock::new(device),
            sectors,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    #[inline]
    #[must_use]
    pub const fn sector_count(&self) -> u32 {
        self.sectors
    }

    #[must_use]
    pub fn channel(&self) -> &Arc<IoChannel> {
        &self.channel
    }

    /// Read `sector` straight from the device.
    ///
    /// # Errors
    /// [`BlockError::OutOfRange`] past the end of the device, or whatever
    /// the driver reports.
    pub fn read(&self, sector: SectorNumber, buf: &mut SectorBuf) -> Result<(), BlockError> {
        self.check(sector)?;
        let _busy = self.channel.busy.lock();
        trace!("disk read sector {sector}");
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.device.lock().read_sector(sector, buf)
    }

    /// Write `sector` straight to the device.
    ///
    /// # Errors
    /// [`BlockError::OutOfRange`] past the end of the device, or whatever
    /// the driver reports.
    pub fn write(&self, sector: SectorNumber, buf: &SectorBuf) -> Result<(), BlockError> {
        self.check(sector)?;
        let _busy = self.channel.busy.lock();
        trace!("disk write sector {sector}");
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.device.lock().write_sector(sector, buf)
    }

    #[must_use]
    pub fn stats(&self) -> DiskStats {
        DiskStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }

    /// Exclusive access to the driver, e.g. for fault injection in tests.
    pub fn with_device<R>(&self, f: impl FnOnce(&mut D) -> R) -> R {
        self.device.with_lock(f)
    }

    const fn check(&self, sector: SectorNumber) -> Result<(), BlockError> {
        if sector.as_u32() < self.sectors {
            Ok(())
        } else {
            Err(BlockError::OutOfRange {
                sector,
                count: self.sectors,
            })
        }
    }
}
