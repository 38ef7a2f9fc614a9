//! The physical page arena.
//!
//! [`PhysicalMemory`] describes the range of physical memory the page allocator manages
//! (everything above the kernel image) and how the kernel reaches its bytes:
//!
//! - Direct map: physical memory is mapped at a fixed offset in the kernel's address space.
//! - Emulated: a page-aligned host buffer stands in for RAM (testing mode).
//!
//! All byte access to pages goes through this type, so page-table walks, page copies and
//! user copies never build pointers on their own.

use core::fmt;
use core::ptr;

use crate::address::{PAGE_SIZE, PhysicalAddress, page_round_down, page_round_up};

/// Dense index of a page within the arena (0 is the first managed page).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FrameNumber(usize);

impl FrameNumber {
    /// Creates a frame number.
    #[inline]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// Returns the raw index.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Debug for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameNumber({})", self.0)
    }
}

enum Backing {
    /// Hardware translation using a direct-map offset.
    DirectMap { offset: usize },
    /// Emulated translation using a simulated memory region.
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(EmulatedMemory),
}

/// The physical memory managed by the page allocator.
///
/// Created once at boot and never torn down.
pub struct PhysicalMemory {
    base: PhysicalAddress,
    pages: usize,
    backing: Backing,
}

impl PhysicalMemory {
    /// Describes the RAM in `[start, end)` reachable at `physical + offset`.
    ///
    /// `start` is rounded up and `end` down to page boundaries.
    ///
    /// # Safety
    ///
    /// The range must be RAM that nothing else uses (in particular, not the kernel image),
    /// and it must be mapped read-write at `offset` for as long as the returned value lives.
    pub unsafe fn direct_mapped(start: PhysicalAddress, end: PhysicalAddress, offset: usize) -> Self {
        let base = PhysicalAddress::new(page_round_up(start.as_usize()));
        let limit = page_round_down(end.as_usize());
        let pages = limit.saturating_sub(base.as_usize()) / PAGE_SIZE;
        Self {
            base,
            pages,
            backing: Backing::DirectMap { offset },
        }
    }

    /// Creates `pages` pages of emulated RAM starting at physical address `base`.
    ///
    /// # Panics
    ///
    /// Panics if `base` is not page-aligned.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(base: PhysicalAddress, pages: usize) -> Self {
        assert!(base.is_page_aligned(), "emulated memory base must be page-aligned");
        Self {
            base,
            pages,
            backing: Backing::Emulated(EmulatedMemory::new(pages * PAGE_SIZE)),
        }
    }

    /// Returns the first managed physical address.
    pub fn base(&self) -> PhysicalAddress {
        self.base
    }

    /// Returns one past the last managed physical address.
    pub fn end(&self) -> PhysicalAddress {
        self.base + self.pages * PAGE_SIZE
    }

    /// Returns the number of managed pages.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Returns true if `pa` is the start of a managed page.
    pub fn is_page(&self, pa: PhysicalAddress) -> bool {
        pa.is_page_aligned() && pa >= self.base && pa < self.end()
    }

    /// Returns the arena index of the page at `pa`.
    pub(crate) fn frame_number(&self, pa: PhysicalAddress) -> FrameNumber {
        debug_assert!(self.is_page(pa));
        FrameNumber::new((pa - self.base) / PAGE_SIZE)
    }

    /// Returns the physical address of the page with the given arena index.
    pub(crate) fn frame_address(&self, frame: FrameNumber) -> PhysicalAddress {
        debug_assert!(frame.as_usize() < self.pages);
        self.base + frame.as_usize() * PAGE_SIZE
    }

    /// Translates a physical address inside the arena to a kernel pointer.
    ///
    /// # Panics
    ///
    /// Panics if `pa..pa + len` is not inside the arena.
    pub(crate) fn pointer(&self, pa: PhysicalAddress, len: usize) -> *mut u8 {
        assert!(
            pa >= self.base && pa.as_usize() + len <= self.end().as_usize(),
            "physical range {pa}+{len:#x} outside managed memory"
        );
        match &self.backing {
            Backing::DirectMap { offset } => pa.as_usize().wrapping_add(*offset) as *mut u8,
            #[cfg(any(test, feature = "software-emulation"))]
            Backing::Emulated(memory) => memory.translate(pa - self.base),
        }
    }

    /// Fills the page at `pa` with `byte`.
    pub(crate) fn fill_page(&self, pa: PhysicalAddress, byte: u8) {
        let page = self.pointer(pa, PAGE_SIZE);
        // SAFETY: `pointer` checked the page lies in the arena; the caller owns the page.
        unsafe { ptr::write_bytes(page, byte, PAGE_SIZE) };
    }

    /// Copies the whole page at `src` over the page at `dst`.
    pub(crate) fn copy_page(&self, dst: PhysicalAddress, src: PhysicalAddress) {
        let to = self.pointer(dst, PAGE_SIZE);
        let from = self.pointer(src, PAGE_SIZE);
        // SAFETY: both pages are inside the arena and are distinct pages.
        unsafe { ptr::copy_nonoverlapping(from, to, PAGE_SIZE) };
    }

    /// Copies bytes starting at `pa` into `dst`.
    pub(crate) fn read(&self, pa: PhysicalAddress, dst: &mut [u8]) {
        let from = self.pointer(pa, dst.len());
        // SAFETY: the source range was bounds-checked and cannot overlap a kernel slice.
        unsafe { ptr::copy_nonoverlapping(from, dst.as_mut_ptr(), dst.len()) };
    }

    /// Copies `src` into memory starting at `pa`.
    pub(crate) fn write(&self, pa: PhysicalAddress, src: &[u8]) {
        let to = self.pointer(pa, src.len());
        // SAFETY: the destination range was bounds-checked and cannot overlap a kernel slice.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), to, src.len()) };
    }
}

impl fmt::Debug for PhysicalMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalMemory")
            .field("base", &self.base)
            .field("end", &self.end())
            .field("pages", &self.pages)
            .finish()
    }
}

/// Emulated memory for software simulation.
///
/// A zeroed, page-aligned host allocation; offset 0 corresponds to the arena base.
#[cfg(any(test, feature = "software-emulation"))]
struct EmulatedMemory {
    memory: ptr::NonNull<u8>,
    layout: std::alloc::Layout,
}

// SAFETY: the buffer is plain bytes; concurrent access is coordinated by page ownership.
#[cfg(any(test, feature = "software-emulation"))]
unsafe impl Send for EmulatedMemory {}
#[cfg(any(test, feature = "software-emulation"))]
unsafe impl Sync for EmulatedMemory {}

#[cfg(any(test, feature = "software-emulation"))]
impl EmulatedMemory {
    /// Creates a new emulated memory region of the specified size.
    fn new(size: usize) -> Self {
        let layout = std::alloc::Layout::from_size_align(size.max(PAGE_SIZE), PAGE_SIZE)
            .unwrap_or_else(|_| panic!("emulated memory of {size:#x} bytes has no valid layout"));
        // SAFETY: the layout has a non-zero size.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let memory =
            ptr::NonNull::new(raw).unwrap_or_else(|| std::alloc::handle_alloc_error(layout));
        Self { memory, layout }
    }

    /// Translates an offset from the arena base to a pointer into the buffer.
    fn translate(&self, offset: usize) -> *mut u8 {
        assert!(offset < self.layout.size(), "offset out of bounds");
        // SAFETY: the offset is within the allocation.
        unsafe { self.memory.as_ptr().add(offset) }
    }
}

#[cfg(any(test, feature = "software-emulation"))]
impl Drop for EmulatedMemory {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { std::alloc::dealloc(self.memory.as_ptr(), self.layout) };
    }
}
