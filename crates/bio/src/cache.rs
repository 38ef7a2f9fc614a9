//! The buffer cache.
//!
//! Lock order:
//! - Bucket locks are short-held spin locks over bookkeeping only. A context holds at most
//!   one, except the context holding the eviction lock, which may hold two while comparing
//!   candidates.
//! - The eviction lock is never taken while holding a bucket lock.
//! - Content locks are sleep locks and are only taken with no spin lock held.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::mem::ManuallyDrop;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::buf::{BlockKey, Buffer, BufferGuard, BufferHandle};
use crate::device::BlockDevice;
use crate::param::{BLOCK_SIZE, NBUCKET, NBUF};

/// Bookkeeping for one buffer.
struct Entry {
    id: usize,
    /// `None` until the buffer is first used.
    key: Option<BlockKey>,
    refcnt: usize,
    /// Release clock reading when `refcnt` last dropped to zero.
    last_release: u64,
}

/// The buffers whose keys hash to one bucket, most recently inserted first.
#[derive(Default)]
struct Bucket {
    entries: Vec<Entry>,
}

impl Bucket {
    /// Takes a reference to the buffer holding `key`, if it is here.
    fn reference(&mut self, key: BlockKey) -> Option<usize> {
        let entry = self.entries.iter_mut().find(|entry| entry.key == Some(key))?;
        entry.refcnt += 1;
        Some(entry.id)
    }

    /// Finds the entry for a buffer a caller holds a handle to.
    fn resident(&mut self, handle: BufferHandle) -> Option<&mut Entry> {
        self.entries
            .iter_mut()
            .find(|entry| entry.id == handle.id && entry.key == Some(handle.key))
    }

    /// Returns the position of the unreferenced entry released longest ago.
    fn oldest_unreferenced(&self) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.refcnt == 0)
            .min_by_key(|(_, entry)| entry.last_release)
            .map(|(position, _)| position)
    }
}

/// A fixed pool of disk block buffers in front of a [`BlockDevice`].
///
/// Created once at boot and shared by reference.
pub struct BufferCache<D: BlockDevice> {
    device: D,
    buffers: Box<[Buffer]>,
    buckets: Box<[spin::Mutex<Bucket>]>,
    eviction: spin::Mutex<()>,
    /// Ticks once per release, so no two releases share a timestamp.
    clock: AtomicU64,
}

impl<D: BlockDevice> BufferCache<D> {
    /// Creates a cache of [`NBUF`] buffers in [`NBUCKET`] buckets.
    pub fn new(device: D) -> Self {
        Self::with_geometry(device, NBUF, NBUCKET)
    }

    /// Creates a cache of `nbuf` buffers in `nbucket` buckets.
    ///
    /// # Panics
    ///
    /// Panics if either count is zero.
    pub fn with_geometry(device: D, nbuf: usize, nbucket: usize) -> Self {
        assert!(nbuf > 0, "bio: cache needs at least one buffer");
        assert!(nbucket > 0, "bio: cache needs at least one bucket");

        let mut buckets: Vec<Bucket> = (0..nbucket).map(|_| Bucket::default()).collect();
        for id in 0..nbuf {
            buckets[id % nbucket].entries.push(Entry {
                id,
                key: None,
                refcnt: 0,
                last_release: 0,
            });
        }

        log::info!("bio: {nbuf} buffers of {BLOCK_SIZE} bytes in {nbucket} buckets");
        Self {
            device,
            buffers: (0..nbuf).map(|_| Buffer::new()).collect(),
            buckets: buckets.into_iter().map(spin::Mutex::new).collect(),
            eviction: spin::Mutex::new(()),
            clock: AtomicU64::new(0),
        }
    }

    /// Returns the underlying block device.
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Returns the number of buffers in the pool.
    pub fn capacity(&self) -> usize {
        self.buffers.len()
    }

    /// Returns the block `(dev, blockno)` with its content lock held, reading it from the
    /// device unless the cached copy is already valid.
    ///
    /// # Panics
    ///
    /// Panics if the block is not cached and every buffer is referenced.
    pub fn read(&self, dev: u32, blockno: u32) -> BufferGuard<'_, D> {
        let mut buf = self.get(BlockKey::new(dev, blockno));
        let buffer = &self.buffers[buf.handle.id];
        if !buffer.valid.load(Ordering::Acquire) {
            self.device.read_block(dev, blockno, &mut buf);
            buffer.valid.store(true, Ordering::Release);
        }
        buf
    }

    /// Writes the buffer's contents to the device.
    ///
    /// # Panics
    ///
    /// Panics if the calling context does not hold the buffer's content lock.
    pub fn write(&self, buf: &BufferGuard<'_, D>) {
        if !buf.held_by_caller() {
            panic!("write: buffer {} not locked by caller", buf.key());
        }
        let key = buf.key();
        self.device.write_block(key.dev, key.blockno, buf);
    }

    /// Unlocks and releases a buffer. A buffer whose last reference goes becomes the newest
    /// eviction candidate.
    ///
    /// # Panics
    ///
    /// Panics if the calling context does not hold the buffer's content lock.
    pub fn release(&self, buf: BufferGuard<'_, D>) {
        if !buf.held_by_caller() {
            panic!("release: buffer {} not locked by caller", buf.key());
        }
        drop(buf);
    }

    /// Takes an extra reference to a cached buffer so it cannot be evicted.
    ///
    /// # Panics
    ///
    /// Panics if the buffer no longer holds the handle's block.
    pub fn pin(&self, handle: BufferHandle) {
        let mut bucket = self.buckets[handle.key.bucket(self.buckets.len())].lock();
        let Some(entry) = bucket.resident(handle) else {
            panic!("pin: buffer {} not resident", handle.key);
        };
        entry.refcnt += 1;
    }

    /// Drops a reference taken by [`pin`](Self::pin).
    ///
    /// # Panics
    ///
    /// Panics if the buffer no longer holds the handle's block or is not referenced.
    pub fn unpin(&self, handle: BufferHandle) {
        self.unreference(handle, "unpin", false);
    }

    /// Returns every block currently held by some buffer, in order.
    pub fn cached_keys(&self) -> Vec<BlockKey> {
        let mut keys: Vec<_> = self
            .buckets
            .iter()
            .flat_map(|bucket| {
                bucket
                    .lock()
                    .entries
                    .iter()
                    .filter_map(|entry| entry.key)
                    .collect::<Vec<_>>()
            })
            .collect();
        keys.sort_unstable();
        keys
    }

    /// Returns a referenced, locked buffer for `key`, recycling one if the key is not cached.
    /// The buffer's contents are only meaningful if it is valid.
    fn get(&self, key: BlockKey) -> BufferGuard<'_, D> {
        let target = key.bucket(self.buckets.len());
        let hit = self.buckets[target].lock().reference(key);
        if let Some(id) = hit {
            return self.lock_buffer(id, key);
        }

        let eviction = self.eviction.lock();

        // Another context may have brought the block in before the eviction lock was ours.
        let hit = self.buckets[target].lock().reference(key);
        if let Some(id) = hit {
            drop(eviction);
            return self.lock_buffer(id, key);
        }

        let Some((source, mut bucket, position)) = self.find_victim() else {
            panic!("get_buffer: no unpinned buffer for {key}");
        };

        let mut entry = bucket.entries.remove(position);
        let id = entry.id;
        if let Some(old) = entry.key {
            log::debug!("bio: evicting {old} from buffer {id} for {key}");
        }
        entry.key = Some(key);
        entry.refcnt = 1;
        self.buffers[id].valid.store(false, Ordering::Release);

        if source != target {
            drop(bucket);
            bucket = self.buckets[target].lock();
        }
        bucket.entries.insert(0, entry);
        drop(bucket);
        drop(eviction);

        self.lock_buffer(id, key)
    }

    /// Finds the unreferenced buffer released longest ago, returning its bucket index, the
    /// locked bucket and its position there.
    ///
    /// Must be called with the eviction lock held.
    fn find_victim(&self) -> Option<(usize, spin::MutexGuard<'_, Bucket>, usize)> {
        let mut best: Option<(usize, spin::MutexGuard<'_, Bucket>, usize)> = None;

        for (index, bucket) in self.buckets.iter().enumerate() {
            let bucket = bucket.lock();
            let Some(position) = bucket.oldest_unreferenced() else {
                continue;
            };
            let stamp = bucket.entries[position].last_release;
            let better = match &best {
                Some((_, current, at)) => stamp < current.entries[*at].last_release,
                None => true,
            };
            if better {
                // The previous best bucket is unlocked before the new one is kept.
                drop(best.take());
                best = Some((index, bucket, position));
            }
        }

        best
    }

    fn lock_buffer(&self, id: usize, key: BlockKey) -> BufferGuard<'_, D> {
        let data = self.buffers[id].data.lock();
        BufferGuard {
            cache: self,
            handle: BufferHandle { id, key },
            data: ManuallyDrop::new(data),
        }
    }

    /// Drops one reference to the buffer named by `handle`; a release that drops the last one
    /// stamps it with the next clock tick.
    pub(crate) fn unreference(&self, handle: BufferHandle, operation: &str, stamp: bool) {
        let mut bucket = self.buckets[handle.key.bucket(self.buckets.len())].lock();
        let Some(entry) = bucket.resident(handle) else {
            panic!("{operation}: buffer {} not resident", handle.key);
        };
        if entry.refcnt == 0 {
            panic!("{operation}: buffer {} not referenced", handle.key);
        }
        entry.refcnt -= 1;
        if entry.refcnt == 0 && stamp {
            entry.last_release = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        }
    }

    #[cfg(test)]
    fn reference_count(&self, key: BlockKey) -> Option<usize> {
        self.buckets[key.bucket(self.buckets.len())]
            .lock()
            .entries
            .iter()
            .find(|entry| entry.key == Some(key))
            .map(|entry| entry.refcnt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RamDisk;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn keys(dev: u32, blocks: impl IntoIterator<Item = u32>) -> Vec<BlockKey> {
        blocks.into_iter().map(|b| BlockKey::new(dev, b)).collect()
    }

    #[test]
    fn read_hits_after_first_miss() {
        let cache = BufferCache::new(RamDisk::new());
        let first = cache.read(1, 5);
        assert_eq!(first.key(), BlockKey::new(1, 5));
        cache.release(first);

        let again = cache.read(1, 5);
        drop(again);
        assert_eq!(cache.device().reads(), 1);
        assert_eq!(cache.reference_count(BlockKey::new(1, 5)), Some(0));
    }

    #[test]
    fn written_bytes_are_read_back() {
        let cache = BufferCache::new(RamDisk::new());
        let mut buf = cache.read(1, 9);
        buf[..5].copy_from_slice(b"hello");
        cache.write(&buf);
        cache.release(buf);

        assert_eq!(&cache.device().block(1, 9)[..5], b"hello");
        let buf = cache.read(1, 9);
        assert_eq!(&buf[..5], b"hello");
    }

    #[test]
    fn evicted_block_is_reread_from_device() {
        let cache = BufferCache::with_geometry(RamDisk::new(), 1, 1);
        let mut buf = cache.read(1, 1);
        buf[0] = 42;
        cache.write(&buf);
        cache.release(buf);

        cache.release(cache.read(1, 2));
        let buf = cache.read(1, 1);
        assert_eq!(buf[0], 42);
        assert_eq!(cache.device().reads(), 3);
    }

    #[test]
    fn capacity_plus_one_evicts_least_recently_released() {
        let cache = BufferCache::with_geometry(RamDisk::new(), 30, 13);
        for blockno in 0..30 {
            cache.release(cache.read(1, blockno));
        }
        assert_eq!(cache.cached_keys(), keys(1, 0..30));

        cache.release(cache.read(1, 30));
        assert_eq!(cache.cached_keys(), keys(1, 1..31));
    }

    #[test]
    fn recent_release_protects_block() {
        let cache = BufferCache::with_geometry(RamDisk::new(), 30, 13);
        for blockno in 0..30 {
            cache.release(cache.read(1, blockno));
        }
        cache.release(cache.read(1, 0));

        cache.release(cache.read(1, 30));
        let cached = cache.cached_keys();
        assert!(cached.contains(&BlockKey::new(1, 0)));
        assert!(!cached.contains(&BlockKey::new(1, 1)));
        assert_eq!(cached.len(), 30);
    }

    #[test]
    fn unused_buffers_are_taken_before_released_ones() {
        let cache = BufferCache::with_geometry(RamDisk::new(), 3, 2);
        cache.release(cache.read(2, 100));
        cache.release(cache.read(2, 101));
        cache.release(cache.read(2, 102));
        assert_eq!(cache.cached_keys(), keys(2, 100..103));
    }

    #[test]
    fn pinned_buffer_is_never_evicted() {
        let cache = BufferCache::with_geometry(RamDisk::new(), 2, 1);
        let buf = cache.read(1, 1);
        let handle = buf.handle();
        cache.pin(handle);
        cache.release(buf);
        cache.release(cache.read(1, 2));

        cache.release(cache.read(1, 3));
        assert_eq!(cache.cached_keys(), keys(1, [1, 3]));

        cache.unpin(handle);
        assert_eq!(cache.reference_count(BlockKey::new(1, 1)), Some(0));
    }

    #[test]
    #[should_panic(expected = "get_buffer: no unpinned buffer")]
    fn exhausted_cache_is_fatal() {
        let cache = BufferCache::with_geometry(RamDisk::new(), 2, 1);
        let _a = cache.read(1, 1);
        let _b = cache.read(1, 2);
        let _c = cache.read(1, 3);
    }

    #[test]
    #[should_panic(expected = "unpin: buffer 1:1 not referenced")]
    fn unpin_without_reference_is_fatal() {
        let cache = BufferCache::with_geometry(RamDisk::new(), 2, 1);
        let buf = cache.read(1, 1);
        let handle = buf.handle();
        cache.release(buf);
        cache.unpin(handle);
    }

    #[test]
    #[should_panic(expected = "pin: buffer 1:1 not resident")]
    fn pin_after_eviction_is_fatal() {
        let cache = BufferCache::with_geometry(RamDisk::new(), 1, 1);
        let buf = cache.read(1, 1);
        let handle = buf.handle();
        cache.release(buf);
        cache.release(cache.read(1, 2));
        cache.pin(handle);
    }

    #[test]
    #[should_panic(expected = "bio: cache needs at least one buffer")]
    fn empty_pool_is_fatal() {
        BufferCache::with_geometry(RamDisk::new(), 0, 13);
    }

    #[test]
    fn write_from_other_context_is_fatal() {
        let cache: &'static BufferCache<RamDisk> =
            Box::leak(Box::new(BufferCache::new(RamDisk::new())));
        let buf = cache.read(1, 1);
        let outcome = thread::spawn(move || cache.write(&buf)).join();
        assert!(outcome.is_err());
        assert_eq!(cache.device().writes(), 0);
    }

    #[test]
    fn release_from_other_context_is_fatal() {
        let cache: &'static BufferCache<RamDisk> =
            Box::leak(Box::new(BufferCache::new(RamDisk::new())));
        let buf = cache.read(1, 1);
        let outcome = thread::spawn(move || cache.release(buf)).join();
        assert!(outcome.is_err());
    }

    #[test]
    fn dropping_guard_in_other_context_is_fatal() {
        let cache: &'static BufferCache<RamDisk> =
            Box::leak(Box::new(BufferCache::new(RamDisk::new())));
        let buf = cache.read(1, 1);
        let outcome = thread::spawn(move || drop(buf)).join();
        assert!(outcome.is_err());
        assert_eq!(cache.reference_count(BlockKey::new(1, 1)), Some(1));
    }

    #[test]
    fn concurrent_misses_share_one_buffer() {
        const THREADS: usize = 8;

        let cache = Arc::new(BufferCache::new(RamDisk::new()));
        let start = Arc::new(Barrier::new(THREADS));
        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let start = Arc::clone(&start);
                thread::spawn(move || {
                    start.wait();
                    let buf = cache.read(3, 77);
                    let handle = buf.handle();
                    cache.pin(handle);
                    cache.release(buf);
                    handle
                })
            })
            .collect();

        let handles: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        assert!(handles.iter().all(|h| h.id == handles[0].id));
        assert_eq!(cache.cached_keys(), keys(3, [77]));
        assert_eq!(cache.reference_count(BlockKey::new(3, 77)), Some(THREADS));
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        const THREADS: usize = 8;
        const ROUNDS: u32 = 150;
        const BLOCKS: u32 = 40;

        let cache = Arc::new(BufferCache::new(RamDisk::new()));
        let workers: Vec<_> = (0..THREADS as u32)
            .map(|id| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for round in 0..ROUNDS {
                        let blockno = (round * 7 + id * 3) % BLOCKS;
                        let mut buf = cache.read(1, blockno);
                        let count = u32::from_le_bytes(buf[..4].try_into().unwrap());
                        buf[..4].copy_from_slice(&(count + 1).to_le_bytes());
                        cache.write(&buf);
                        cache.release(buf);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let total: u32 = (0..BLOCKS)
            .map(|blockno| {
                let buf = cache.read(1, blockno);
                u32::from_le_bytes(buf[..4].try_into().unwrap())
            })
            .sum();
        assert_eq!(total, THREADS as u32 * ROUNDS);
        assert!(cache.cached_keys().len() <= cache.capacity());
    }
}
