//! Access to the contents of physical frames.

use alloc::boxed::Box;
use alloc::vec::Vec;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalPage};
use kernel_sync::SpinLock;

/// Byte access to physical frames.
///
/// In the kernel this is the direct map; hosted code uses [`RamFrames`].
pub trait FrameMemory: Send + Sync {
    /// Run `f` on the contents of `frame`. Returns `None` if the frame is
    /// not backed by this memory.
    fn with_frame<R>(&self, frame: PhysicalPage, f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R)
    -> Option<R>;
}

/// A run of heap-backed frames starting at a chosen frame number.
pub struct RamFrames {
    first: u64,
    frames: Box<[SpinLock<Box<[u8; PAGE_SIZE]>>]>,
}

impl RamFrames {
    /// `count` zeroed frames numbered from `first`.
    #[must_use]
    pub fn new(first: PhysicalPage, count: usize) -> Self {
        let frames: Vec<_> = (0..count)
            .map(|_| SpinLock::new(Box::new([0; PAGE_SIZE])))
            .collect();
        Self {
            first: first.number(),
            frames: frames.into_boxed_slice(),
        }
    }

    /// Every frame, in ascending order.
    pub fn pages(&self) -> impl Iterator<Item = PhysicalPage> + '_ {
        let first = self.first;
        (0..self.frames.len() as u64).map(move |i| PhysicalPage::from_number(first + i))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    fn slot(&self, frame: PhysicalPage) -> Option<&SpinLock<Box<[u8; PAGE_SIZE]>>> {
        let index = frame.number().checked_sub(self.first)?;
        self.frames.get(usize::try_from(index).ok()?)
    }
}

impl FrameMemory for RamFrames {
    fn with_frame<R>(
        &self,
        frame: PhysicalPage,
        f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R,
    ) -> Option<R> {
        let slot = self.slot(frame)?;
        let mut bytes = slot.lock();
        Some(f(&mut bytes))
    }
}

impl core::fmt::Debug for RamFrames {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RamFrames")
            .field("first", &self.first)
            .field("count", &self.frames.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_outside_the_run_are_not_backed() {
        let ram = RamFrames::new(PhysicalPage::from_number(0x100), 2);
        assert_eq!(
            ram.pages().collect::<Vec<_>>(),
            [
                PhysicalPage::from_number(0x100),
                PhysicalPage::from_number(0x101)
            ]
        );
        assert!(ram.with_frame(PhysicalPage::from_number(0xFF), |_| ()).is_none());
        assert!(ram.with_frame(PhysicalPage::from_number(0x102), |_| ()).is_none());

        ram.with_frame(PhysicalPage::from_number(0x101), |b| b[7] = 7);
        assert_eq!(
            ram.with_frame(PhysicalPage::from_number(0x101), |b| b[7]),
            Some(7)
        );
        assert_eq!(
            ram.with_frame(PhysicalPage::from_number(0x100), |b| b[7]),
            Some(0)
        );
    }
}
