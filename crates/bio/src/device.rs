//! The block device the cache reads from and writes to.

use crate::param::BLOCK_SIZE;

/// A synchronous block device. Each call returns once the transfer is complete.
pub trait BlockDevice: Send + Sync {
    /// Reads block `blockno` of device `dev` into `data`.
    fn read_block(&self, dev: u32, blockno: u32, data: &mut [u8; BLOCK_SIZE]);

    /// Writes `data` to block `blockno` of device `dev`.
    fn write_block(&self, dev: u32, blockno: u32, data: &[u8; BLOCK_SIZE]);
}

#[cfg(any(test, feature = "software-emulation"))]
pub use self::ram_disk::RamDisk;

#[cfg(any(test, feature = "software-emulation"))]
mod ram_disk {
    use alloc::boxed::Box;
    use alloc::collections::BTreeMap;
    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::BlockDevice;
    use crate::param::BLOCK_SIZE;

    /// An in-memory disk for tests. Blocks never written read as zeros.
    ///
    /// Counts transfers so tests can tell cache hits from misses.
    #[derive(Default)]
    pub struct RamDisk {
        blocks: spin::Mutex<BTreeMap<(u32, u32), Box<[u8; BLOCK_SIZE]>>>,
        reads: AtomicUsize,
        writes: AtomicUsize,
    }

    impl RamDisk {
        /// Creates an empty disk.
        pub fn new() -> Self {
            Self::default()
        }

        /// Returns the number of blocks read so far.
        pub fn reads(&self) -> usize {
            self.reads.load(Ordering::Relaxed)
        }

        /// Returns the number of blocks written so far.
        pub fn writes(&self) -> usize {
            self.writes.load(Ordering::Relaxed)
        }

        /// Returns the stored contents of a block without counting a transfer.
        pub fn block(&self, dev: u32, blockno: u32) -> [u8; BLOCK_SIZE] {
            self.blocks
                .lock()
                .get(&(dev, blockno))
                .map_or([0; BLOCK_SIZE], |block| **block)
        }
    }

    impl BlockDevice for RamDisk {
        fn read_block(&self, dev: u32, blockno: u32, data: &mut [u8; BLOCK_SIZE]) {
            self.reads.fetch_add(1, Ordering::Relaxed);
            *data = self.block(dev, blockno);
        }

        fn write_block(&self, dev: u32, blockno: u32, data: &[u8; BLOCK_SIZE]) {
            self.writes.fetch_add(1, Ordering::Relaxed);
            self.blocks.lock().insert((dev, blockno), Box::new(*data));
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn unwritten_blocks_are_zero() {
            let disk = RamDisk::new();
            let mut data = [0xFF; BLOCK_SIZE];
            disk.read_block(1, 7, &mut data);
            assert!(data.iter().all(|&b| b == 0));
            assert_eq!(disk.reads(), 1);
        }

        #[test]
        fn writes_are_kept_per_device() {
            let disk = RamDisk::new();
            disk.write_block(1, 3, &[0xAB; BLOCK_SIZE]);
            assert_eq!(disk.block(1, 3), [0xAB; BLOCK_SIZE]);
            assert_eq!(disk.block(2, 3), [0; BLOCK_SIZE]);
            assert_eq!(disk.writes(), 1);
            assert_eq!(disk.reads(), 0);
        }
    }
}
