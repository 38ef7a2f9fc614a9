//! Buffers and the handles callers hold on them.

use core::fmt;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::AtomicBool;

use ksync::{SleepLock, SleepLockGuard};

use crate::cache::BufferCache;
use crate::device::BlockDevice;
use crate::param::BLOCK_SIZE;

/// Identifies a disk block: device number and block number on that device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockKey {
    pub dev: u32,
    pub blockno: u32,
}

impl BlockKey {
    pub const fn new(dev: u32, blockno: u32) -> Self {
        Self { dev, blockno }
    }

    /// Returns the bucket this key hashes to among `buckets` buckets.
    pub(crate) fn bucket(self, buckets: usize) -> usize {
        let hash = ((self.dev as u64) << 27) | self.blockno as u64;
        (hash % buckets as u64) as usize
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dev, self.blockno)
    }
}

/// One slot of the buffer pool. Bookkeeping (key, reference count) lives in the buckets.
pub(crate) struct Buffer {
    /// The payload matches the block on disk. Only changed by the content lock holder, or by
    /// the eviction path while nobody references the buffer.
    pub(crate) valid: AtomicBool,
    /// The block payload, behind the content lock.
    pub(crate) data: SleepLock<[u8; BLOCK_SIZE]>,
}

impl Buffer {
    pub(crate) const fn new() -> Self {
        Self {
            valid: AtomicBool::new(false),
            data: SleepLock::new([0; BLOCK_SIZE], "buffer"),
        }
    }
}

/// Names a cached buffer without holding its content lock, for [`BufferCache::pin`] and
/// [`BufferCache::unpin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHandle {
    pub(crate) id: usize,
    pub(crate) key: BlockKey,
}

impl BufferHandle {
    /// Returns the block this buffer held when the handle was taken.
    pub fn key(&self) -> BlockKey {
        self.key
    }
}

/// A referenced buffer with its content lock held.
///
/// Dereferences to the block payload. Dropping the guard releases the buffer, exactly as
/// [`BufferCache::release`] does.
///
/// # Panics
///
/// Dropping the guard panics if the calling context is not the one that locked the buffer.
pub struct BufferGuard<'a, D: BlockDevice> {
    pub(crate) cache: &'a BufferCache<D>,
    pub(crate) handle: BufferHandle,
    pub(crate) data: ManuallyDrop<SleepLockGuard<'a, [u8; BLOCK_SIZE]>>,
}

impl<D: BlockDevice> BufferGuard<'_, D> {
    /// Returns the block held in this buffer.
    pub fn key(&self) -> BlockKey {
        self.handle.key
    }

    /// Returns a handle for pinning this buffer.
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    /// Returns true if the calling context is the one that locked the buffer.
    pub fn held_by_caller(&self) -> bool {
        self.data.held_by_caller()
    }
}

impl<D: BlockDevice> Deref for BufferGuard<'_, D> {
    type Target = [u8; BLOCK_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl<D: BlockDevice> DerefMut for BufferGuard<'_, D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

impl<D: BlockDevice> Drop for BufferGuard<'_, D> {
    fn drop(&mut self) {
        if !unwinding() && !self.held_by_caller() {
            panic!("release: buffer {} not locked by caller", self.handle.key);
        }
        // SAFETY: `data` is dropped here and never touched again.
        unsafe { ManuallyDrop::drop(&mut self.data) };
        self.cache.unreference(self.handle, "release", true);
    }
}

impl<D: BlockDevice> fmt::Debug for BufferGuard<'_, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferGuard")
            .field("key", &self.handle.key)
            .field("id", &self.handle.id)
            .finish()
    }
}

/// Returns true while the current thread unwinds from a panic.
///
/// A guard dropped during unwinding may belong to the context that failed the ownership check.
#[cfg(any(test, feature = "software-emulation"))]
fn unwinding() -> bool {
    std::thread::panicking()
}

#[cfg(not(any(test, feature = "software-emulation")))]
fn unwinding() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_mixes_device_into_hash() {
        let key = BlockKey::new(1, 5);
        assert_eq!(key.bucket(13), (((1u64 << 27) | 5) % 13) as usize);
        assert_eq!(BlockKey::new(0, 27).bucket(13), 1);
        assert_eq!(BlockKey::new(0, 12).bucket(1), 0);
    }

    #[test]
    fn key_display() {
        assert_eq!(BlockKey::new(2, 40).to_string(), "2:40");
    }
}
