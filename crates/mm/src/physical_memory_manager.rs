//! Physical page allocator with per-CPU free lists and reference counts.
//!
//! Every managed page is either free (reference count 0, sitting in exactly one CPU's free
//! list) or owned (reference count ≥ 1, in no free list). Pages are handed out one at a time;
//! there is no notion of contiguous multi-page blocks.
//!
//! Free lists are linked through a side table of frame indices rather than through the
//! free pages themselves, so a page's bytes are never interpreted while it is free.
//!
//! Locking:
//! - Each CPU's free list has its own spin lock, taken with the caller pinned to that CPU.
//! - All reference counts share one spin lock. It is never held while a free-list lock is
//!   taken, and vice versa.
//! - A CPU whose list is empty steals up to [`STEAL_BATCH`] pages from the other CPUs, visiting
//!   them in a fixed order and holding one donor lock at a time (its own lock is not held
//!   meanwhile).

use alloc::boxed::Box;
use alloc::vec;
use core::sync::atomic::{AtomicU32, Ordering};

use ksync::MAX_CPUS;

use crate::address::PhysicalAddress;
use crate::memory::{FrameNumber, PhysicalMemory};

/// Maximum number of pages moved from other CPUs' free lists by one steal.
pub const STEAL_BATCH: usize = 16;

/// Written over a page when it is handed out, so readers of "fresh" memory see garbage.
const ALLOC_JUNK: u8 = 0x05;

/// Written over a page when it is freed, so dangling readers see garbage.
const FREE_JUNK: u8 = 0x01;

/// End-of-list marker in the link table.
const NIL: u32 = u32::MAX;

/// Free list for one CPU.
///
/// `links[frame]` holds the next frame in whichever list `frame` currently belongs to. A
/// frame is in at most one list, and only that list's lock holder touches its link.
struct FreeList {
    head: u32,
    count: usize,
}

impl FreeList {
    /// Creates an empty free list.
    const fn new() -> Self {
        Self { head: NIL, count: 0 }
    }

    /// Pushes a frame onto the free list.
    fn push(&mut self, links: &[AtomicU32], frame: FrameNumber) {
        links[frame.as_usize()].store(self.head, Ordering::Relaxed);
        self.head = frame.as_usize() as u32;
        self.count += 1;
    }

    /// Pops a frame from the free list, returning None if empty.
    fn pop(&mut self, links: &[AtomicU32]) -> Option<FrameNumber> {
        if self.head == NIL {
            return None;
        }
        let frame = FrameNumber::new(self.head as usize);
        self.head = links[frame.as_usize()].swap(NIL, Ordering::Relaxed);
        self.count -= 1;
        Some(frame)
    }

    /// Returns the number of frames in this free list.
    fn count(&self) -> usize {
        self.count
    }
}

/// The physical page allocator.
///
/// There is one instance for the whole system, created at boot and shared by reference with
/// everything that needs pages.
pub struct PhysicalMemoryManager {
    memory: PhysicalMemory,
    free_lists: [spin::Mutex<FreeList>; MAX_CPUS],
    links: Box<[AtomicU32]>,
    ref_counts: spin::Mutex<Box<[u32]>>,
}

impl PhysicalMemoryManager {
    /// Takes ownership of the arena and puts every page on the calling CPU's free list.
    ///
    /// # Panics
    ///
    /// Panics if the arena has more pages than a free-list link can index.
    pub fn new(memory: PhysicalMemory) -> Self {
        let pages = memory.pages();
        assert!(pages < NIL as usize, "pmm: arena too large ({pages} pages)");

        let pmm = Self {
            free_lists: core::array::from_fn(|_| spin::Mutex::new(FreeList::new())),
            links: (0..pages).map(|_| AtomicU32::new(NIL)).collect(),
            ref_counts: spin::Mutex::new(vec![0; pages].into_boxed_slice()),
            memory,
        };

        ksync::with_cpu(|cpu| {
            let mut list = pmm.free_lists[cpu].lock();
            // Pushed from the top so the lowest addresses are handed out first.
            for index in (0..pages).rev() {
                let frame = FrameNumber::new(index);
                pmm.memory.fill_page(pmm.memory.frame_address(frame), FREE_JUNK);
                list.push(&pmm.links, frame);
            }
        });

        log::info!(
            "pmm: managing {} pages at {}..{}, {} CPU free lists",
            pages,
            pmm.memory.base(),
            pmm.memory.end(),
            MAX_CPUS
        );
        pmm
    }

    /// Returns the arena this allocator manages.
    pub fn memory(&self) -> &PhysicalMemory {
        &self.memory
    }

    /// Returns the number of pages under management.
    pub fn total_pages(&self) -> usize {
        self.memory.pages()
    }

    /// Returns the number of free pages across all CPUs.
    ///
    /// The lists are counted one at a time, so the total is only a snapshot.
    pub fn free_pages(&self) -> usize {
        self.free_lists.iter().map(|list| list.lock().count()).sum()
    }

    /// Returns the reference count of the page at `pa`.
    ///
    /// # Panics
    ///
    /// Panics if `pa` is not a managed page.
    pub fn reference_count(&self, pa: PhysicalAddress) -> usize {
        let frame = self.checked_frame("reference_count", pa);
        self.ref_counts.lock()[frame.as_usize()] as usize
    }

    /// Allocates one page.
    ///
    /// The page comes from the calling CPU's free list, or from other CPUs' lists when that
    /// one is empty. Returns `None` if every list is empty. The page's reference count is 1
    /// and its contents are garbage.
    pub fn allocate(&self) -> Option<PhysicalAddress> {
        let frame = ksync::with_cpu(|cpu| {
            if let Some(frame) = self.free_lists[cpu].lock().pop(&self.links) {
                return Some(frame);
            }
            self.steal(cpu)
        });

        let Some(frame) = frame else {
            log::warn!("pmm: out of physical pages");
            return None;
        };

        self.ref_counts.lock()[frame.as_usize()] = 1;
        let pa = self.memory.frame_address(frame);
        self.memory.fill_page(pa, ALLOC_JUNK);
        Some(pa)
    }

    /// Allocates one page and clears it.
    pub fn allocate_zeroed(&self) -> Option<PhysicalAddress> {
        let pa = self.allocate()?;
        self.memory.fill_page(pa, 0);
        Some(pa)
    }

    /// Drops one reference to the page at `pa`, returning it to the calling CPU's free list
    /// when the last reference goes.
    ///
    /// # Panics
    ///
    /// Panics if `pa` is not the start of a managed page, or if the page is already free.
    pub fn free(&self, pa: PhysicalAddress) {
        let frame = self.checked_frame("free", pa);
        {
            let mut counts = self.ref_counts.lock();
            let count = &mut counts[frame.as_usize()];
            if *count == 0 {
                panic!("free: double free of {pa}");
            }
            *count -= 1;
            if *count > 0 {
                return;
            }
        }

        self.memory.fill_page(pa, FREE_JUNK);
        ksync::with_cpu(|cpu| self.free_lists[cpu].lock().push(&self.links, frame));
    }

    /// Adds a reference to the page at `pa`, for sharing it without copying.
    ///
    /// # Panics
    ///
    /// Panics if `pa` is not a managed page or if the page is free.
    pub fn add_reference(&self, pa: PhysicalAddress) {
        let frame = self.checked_frame("add_reference", pa);
        let mut counts = self.ref_counts.lock();
        let count = &mut counts[frame.as_usize()];
        if *count == 0 {
            panic!("add_reference: page {pa} is free");
        }
        *count += 1;
    }

    /// Returns a page the caller may write without disturbing other owners of `pa`.
    ///
    /// A sole owner gets `pa` back unchanged. Otherwise the contents are copied into a new
    /// page, the caller's reference to `pa` is dropped, and the copy is returned. Returns
    /// `None` if no page is available for the copy; the caller's reference to `pa` is kept.
    ///
    /// # Panics
    ///
    /// Panics if `pa` is not a managed page or if the page is free.
    pub fn duplicate_for_write(&self, pa: PhysicalAddress) -> Option<PhysicalAddress> {
        let frame = self.checked_frame("duplicate_for_write", pa);
        match self.ref_counts.lock()[frame.as_usize()] {
            0 => panic!("duplicate_for_write: page {pa} is free"),
            1 => return Some(pa),
            _ => {}
        }

        let copy = self.allocate()?;
        self.memory.copy_page(copy, pa);
        // The other owners may have let go since the check; `free` reclaims the page if so.
        self.free(pa);
        Some(copy)
    }

    fn checked_frame(&self, operation: &str, pa: PhysicalAddress) -> FrameNumber {
        if !self.memory.is_page(pa) {
            panic!("{operation}: bad physical address {pa}");
        }
        self.memory.frame_number(pa)
    }

    /// Moves up to [`STEAL_BATCH`] pages from other CPUs to `cpu`, returning one of them.
    ///
    /// Donors are visited in a fixed order starting after `cpu`; empty ones are skipped.
    fn steal(&self, cpu: usize) -> Option<FrameNumber> {
        let mut batch = [FrameNumber::new(0); STEAL_BATCH];
        let mut stolen = 0;

        for offset in 1..MAX_CPUS {
            let donor = (cpu + offset) % MAX_CPUS;
            let mut list = self.free_lists[donor].lock();
            while stolen < STEAL_BATCH {
                let Some(frame) = list.pop(&self.links) else {
                    break;
                };
                batch[stolen] = frame;
                stolen += 1;
            }
            drop(list);

            if stolen == STEAL_BATCH {
                break;
            }
        }

        let (&first, rest) = batch[..stolen].split_first()?;
        log::debug!("pmm: cpu {cpu} stole {stolen} pages");
        if !rest.is_empty() {
            let mut own = self.free_lists[cpu].lock();
            for &frame in rest {
                own.push(&self.links, frame);
            }
        }
        Some(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::PAGE_SIZE;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    const BASE: PhysicalAddress = PhysicalAddress::new(0x8000_0000);

    fn pmm(pages: usize) -> PhysicalMemoryManager {
        PhysicalMemoryManager::new(PhysicalMemory::emulated(BASE, pages))
    }

    /// Builds the allocator from a thread pinned to `cpu`, so all pages start on that CPU.
    fn pmm_on_cpu(pages: usize, cpu: usize) -> PhysicalMemoryManager {
        thread::spawn(move || {
            ksync::bind_cpu(cpu);
            pmm(pages)
        })
        .join()
        .unwrap()
    }

    fn read_byte(pmm: &PhysicalMemoryManager, pa: PhysicalAddress) -> u8 {
        let mut byte = [0u8];
        pmm.memory().read(pa, &mut byte);
        byte[0]
    }

    #[test]
    fn all_pages_start_free() {
        let pmm = pmm(32);
        assert_eq!(pmm.total_pages(), 32);
        assert_eq!(pmm.free_pages(), 32);
    }

    #[test]
    fn allocates_distinct_pages_until_exhausted() {
        let pmm = pmm(16);
        let mut seen = HashSet::new();
        while let Some(pa) = pmm.allocate() {
            assert!(pa.is_page_aligned());
            assert!(pmm.memory().is_page(pa));
            assert!(seen.insert(pa), "page {pa} handed out twice");
            assert_eq!(pmm.reference_count(pa), 1);
        }
        assert_eq!(seen.len(), 16);
        assert_eq!(pmm.free_pages(), 0);
        assert_eq!(pmm.allocate(), None);
    }

    #[test]
    fn freed_page_is_reused() {
        let pmm = pmm(1);
        let pa = pmm.allocate().unwrap();
        assert_eq!(pmm.allocate(), None);
        pmm.free(pa);
        assert_eq!(pmm.reference_count(pa), 0);
        assert_eq!(pmm.allocate(), Some(pa));
    }

    #[test]
    fn freed_page_is_scrubbed() {
        let pmm = pmm(2);
        let pa = pmm.allocate_zeroed().unwrap();
        assert_eq!(read_byte(&pmm, pa + 100), 0);
        pmm.free(pa);
        assert_eq!(read_byte(&pmm, pa + 100), FREE_JUNK);
    }

    #[test]
    fn shared_page_survives_until_last_reference() {
        let pmm = pmm(4);
        let pa = pmm.allocate().unwrap();
        pmm.add_reference(pa);
        assert_eq!(pmm.reference_count(pa), 2);

        pmm.free(pa);
        assert_eq!(pmm.reference_count(pa), 1);
        assert_eq!(pmm.free_pages(), 3);

        pmm.free(pa);
        assert_eq!(pmm.reference_count(pa), 0);
        assert_eq!(pmm.free_pages(), 4);
    }

    #[test]
    #[should_panic(expected = "free: double free")]
    fn double_free_is_fatal() {
        let pmm = pmm(2);
        let pa = pmm.allocate().unwrap();
        pmm.free(pa);
        pmm.free(pa);
    }

    #[test]
    #[should_panic(expected = "free: bad physical address")]
    fn misaligned_free_is_fatal() {
        let pmm = pmm(2);
        let pa = pmm.allocate().unwrap();
        pmm.free(pa + 8);
    }

    #[test]
    #[should_panic(expected = "free: bad physical address")]
    fn free_outside_arena_is_fatal() {
        let pmm = pmm(2);
        pmm.free(BASE + 2 * PAGE_SIZE);
    }

    #[test]
    #[should_panic(expected = "add_reference: page")]
    fn referencing_free_page_is_fatal() {
        let pmm = pmm(2);
        pmm.add_reference(BASE);
    }

    #[test]
    fn duplicate_for_write_keeps_sole_owner_page() {
        let pmm = pmm(4);
        let pa = pmm.allocate().unwrap();
        let free_before = pmm.free_pages();

        assert_eq!(pmm.duplicate_for_write(pa), Some(pa));
        assert_eq!(pmm.free_pages(), free_before);
        assert_eq!(pmm.reference_count(pa), 1);
    }

    #[test]
    fn duplicate_for_write_copies_shared_page() {
        let pmm = pmm(4);
        let pa = pmm.allocate().unwrap();
        pmm.memory().write(pa, b"shared contents");
        pmm.add_reference(pa);

        let copy = pmm.duplicate_for_write(pa).unwrap();
        assert_ne!(copy, pa);
        assert_eq!(pmm.reference_count(pa), 1);
        assert_eq!(pmm.reference_count(copy), 1);

        let mut original = [0u8; PAGE_SIZE];
        let mut duplicate = [0u8; PAGE_SIZE];
        pmm.memory().read(pa, &mut original);
        pmm.memory().read(copy, &mut duplicate);
        assert_eq!(original, duplicate);
    }

    #[test]
    fn duplicate_for_write_reports_exhaustion() {
        let pmm = pmm(1);
        let pa = pmm.allocate().unwrap();
        pmm.add_reference(pa);

        assert_eq!(pmm.duplicate_for_write(pa), None);
        assert_eq!(pmm.reference_count(pa), 2);
    }

    #[test]
    fn empty_cpu_steals_a_batch() {
        let pmm = Arc::new(pmm_on_cpu(64, 0));
        let remote = Arc::clone(&pmm);
        let pa = thread::spawn(move || {
            ksync::bind_cpu(1);
            remote.allocate()
        })
        .join()
        .unwrap();

        assert!(pa.is_some());
        assert_eq!(pmm.free_lists[1].lock().count(), STEAL_BATCH - 1);
        assert_eq!(pmm.free_lists[0].lock().count(), 64 - STEAL_BATCH);
    }

    #[test]
    fn steal_takes_what_is_left() {
        let pmm = Arc::new(pmm_on_cpu(3, 2));
        let remote = Arc::clone(&pmm);
        let pages: Vec<_> = thread::spawn(move || {
            ksync::bind_cpu(5);
            core::iter::from_fn(|| remote.allocate()).collect()
        })
        .join()
        .unwrap();

        assert_eq!(pages.len(), 3);
        assert_eq!(pmm.free_pages(), 0);
    }

    #[test]
    fn concurrent_owners_never_share_a_page() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 200;

        let pmm = Arc::new(pmm(64));
        let workers: Vec<_> = (0..THREADS)
            .map(|id| {
                let pmm = Arc::clone(&pmm);
                thread::spawn(move || {
                    ksync::bind_cpu(id % MAX_CPUS);
                    let stamp = [id as u8 + 1; 64];
                    for _ in 0..ROUNDS {
                        let mut held = Vec::new();
                        for _ in 0..4 {
                            if let Some(pa) = pmm.allocate() {
                                pmm.memory().write(pa, &stamp);
                                held.push(pa);
                            }
                        }
                        thread::yield_now();
                        for pa in held {
                            let mut seen = [0u8; 64];
                            pmm.memory().read(pa, &mut seen);
                            assert_eq!(seen, stamp, "page {pa} was handed to another owner");
                            pmm.free(pa);
                        }
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(pmm.free_pages(), 64);
    }
}
