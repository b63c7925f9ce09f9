//! Physical frame access
//!
//! Reading and writing the contents of a physical frame goes through a
//! temporary kernel mapping that the architecture layer provides. The VM
//! objects only need "copy this frame out" and "fill this frame", so that
//! primitive is a trait here.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use spin::Mutex;

use super::PAGE_SIZE;
use crate::types::PhysicalAddress;

/// Access to the bytes of physical frames
pub trait PhysicalMemoryAccess: Send + Sync {
    /// Copy a whole frame into `buffer`
    fn read_frame(&self, paddr: PhysicalAddress, buffer: &mut [u8; PAGE_SIZE]);

    /// Overwrite a whole frame with `data`
    fn write_frame(&self, paddr: PhysicalAddress, data: &[u8; PAGE_SIZE]);

    /// Fill a frame with zeroes
    fn zero_frame(&self, paddr: PhysicalAddress) {
        self.write_frame(paddr, &[0u8; PAGE_SIZE]);
    }
}

/// Frame contents kept on the heap, materialized on first write
///
/// Used by hosted builds where there is no physical memory to map. Frames
/// that were never written read back as zeroes.
#[derive(Default)]
pub struct RamPhysicalMemory {
    frames: Mutex<BTreeMap<u64, Box<[u8; PAGE_SIZE]>>>,
}

impl RamPhysicalMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of frames that hold data
    pub fn materialized_frames(&self) -> usize {
        self.frames.lock().len()
    }
}

impl PhysicalMemoryAccess for RamPhysicalMemory {
    fn read_frame(&self, paddr: PhysicalAddress, buffer: &mut [u8; PAGE_SIZE]) {
        match self.frames.lock().get(&paddr.page_base().get()) {
            Some(frame) => buffer.copy_from_slice(&frame[..]),
            None => buffer.fill(0),
        }
    }

    fn write_frame(&self, paddr: PhysicalAddress, data: &[u8; PAGE_SIZE]) {
        let mut frames = self.frames.lock();
        let frame = frames
            .entry(paddr.page_base().get())
            .or_insert_with(|| Box::new([0u8; PAGE_SIZE]));
        frame.copy_from_slice(data);
    }

    fn zero_frame(&self, paddr: PhysicalAddress) {
        // An absent frame already reads as zeroes.
        self.frames.lock().remove(&paddr.page_base().get());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwritten_frame_reads_zero() {
        let ram = RamPhysicalMemory::new();
        let mut buffer = [0xffu8; PAGE_SIZE];
        ram.read_frame(PhysicalAddress::new(0x4000), &mut buffer);
        assert!(buffer.iter().all(|&b| b == 0));
        assert_eq!(ram.materialized_frames(), 0);
    }

    #[test]
    fn test_write_then_zero() {
        let ram = RamPhysicalMemory::new();
        let mut data = [0u8; PAGE_SIZE];
        data[0] = 0xab;
        data[PAGE_SIZE - 1] = 0xcd;
        ram.write_frame(PhysicalAddress::new(0x4000), &data);

        let mut buffer = [0u8; PAGE_SIZE];
        ram.read_frame(PhysicalAddress::new(0x4123), &mut buffer);
        assert_eq!(buffer[0], 0xab);
        assert_eq!(buffer[PAGE_SIZE - 1], 0xcd);

        ram.zero_frame(PhysicalAddress::new(0x4000));
        ram.read_frame(PhysicalAddress::new(0x4000), &mut buffer);
        assert_eq!(buffer[0], 0);
    }
}
