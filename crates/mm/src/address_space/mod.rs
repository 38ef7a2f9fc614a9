//! Per-process virtual address spaces.
//!
//! An [`AddressSpace`] owns a three-level page table built from pages of the
//! [`PhysicalMemoryManager`] and a declared size: user memory is `[0, size)`. Every leaf it maps
//! holds one reference to its physical page, and dropping the address space releases all of
//! them along with the table nodes.
//!
//! Address spaces are single-owner (`&mut self` for anything that changes the tree), so the
//! tree itself needs no lock.

mod user_copy;

use core::fmt;

use crate::address::{
    ENTRIES_PER_TABLE, MAX_VIRTUAL_ADDRESS, PAGE_SIZE, PAGE_TABLE_LEVELS, PhysicalAddress,
    VirtualAddress, page_round_up,
};
use crate::error::MemoryError;
use crate::memory::PhysicalMemory;
use crate::page_table::{PageFlags, PageTable, PageTableEntry};
use crate::physical_memory_manager::PhysicalMemoryManager;

/// Most pages a single [`AddressSpace::query_accessed`] call may report on.
pub const MAX_ACCESS_QUERY: usize = 32;

/// Returns the page table node stored in the page at `pa`.
///
/// # Safety
///
/// `pa` must be a node of an address space the caller has exclusive access to, and no other
/// reference to that node may be live.
#[allow(clippy::mut_from_ref)]
unsafe fn node_mut(memory: &PhysicalMemory, pa: PhysicalAddress) -> &mut PageTable {
    // SAFETY: nodes are whole, page-aligned pages inside the arena; exclusivity is the
    // caller's obligation.
    unsafe { &mut *memory.pointer(pa, PAGE_SIZE).cast::<PageTable>() }
}

/// Shared view of the page table node stored in the page at `pa`.
///
/// # Safety
///
/// `pa` must be a node of an address space nobody is mutating for the returned lifetime.
unsafe fn node(memory: &PhysicalMemory, pa: PhysicalAddress) -> &PageTable {
    // SAFETY: see `node_mut`.
    unsafe { &*memory.pointer(pa, PAGE_SIZE).cast::<PageTable>() }
}

/// Returns true while the current thread unwinds from a panic.
///
/// Teardown is skipped then: a half-built address space may be what panicked.
#[cfg(any(test, feature = "software-emulation"))]
fn unwinding() -> bool {
    std::thread::panicking()
}

#[cfg(not(any(test, feature = "software-emulation")))]
fn unwinding() -> bool {
    false
}

/// A user address space: a page table root and the size of user memory.
pub struct AddressSpace<'a> {
    pmm: &'a PhysicalMemoryManager,
    root: PhysicalAddress,
    size: usize,
}

impl<'a> AddressSpace<'a> {
    /// Creates an empty address space with a zeroed root node.
    pub fn new(pmm: &'a PhysicalMemoryManager) -> Result<Self, MemoryError> {
        let root = pmm.allocate_zeroed().ok_or(MemoryError::OutOfMemory)?;
        Ok(Self { pmm, root, size: 0 })
    }

    /// Returns the physical address of the root node.
    pub fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// Returns the size of user memory in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Finds the leaf entry for `va`, optionally creating missing intermediate nodes.
    ///
    /// Returns `None` if a node is missing and `alloc` is false, or if a node could not be
    /// allocated. The returned entry may be invalid.
    ///
    /// # Panics
    ///
    /// Panics if `va` is at or above [`MAX_VIRTUAL_ADDRESS`].
    fn walk(&mut self, va: VirtualAddress, alloc: bool) -> Option<&mut PageTableEntry> {
        if !va.is_mappable() {
            panic!("walk: {va} beyond maximum virtual address");
        }

        let pmm = self.pmm;
        let mut table = self.root;
        for level in (1..PAGE_TABLE_LEVELS).rev() {
            // SAFETY: `table` belongs to this address space and `&mut self` excludes other walks.
            let entry = unsafe { node_mut(pmm.memory(), table) }.entry_mut(va.page_index(level));
            if entry.is_valid() {
                table = entry.address();
            } else {
                if !alloc {
                    return None;
                }
                let child = pmm.allocate_zeroed()?;
                *entry = PageTableEntry::new(child, PageFlags::VALID);
                table = child;
            }
        }

        // SAFETY: as above.
        Some(unsafe { node_mut(pmm.memory(), table) }.entry_mut(va.page_index(0)))
    }

    /// Returns a copy of the valid leaf entry for `va`, without allocating.
    fn lookup(&self, va: VirtualAddress) -> Option<PageTableEntry> {
        if !va.is_mappable() {
            return None;
        }

        let memory = self.pmm.memory();
        let mut table = self.root;
        for level in (1..PAGE_TABLE_LEVELS).rev() {
            // SAFETY: `&self` excludes mutation of this address space's nodes.
            let entry = unsafe { node(memory, table) }.entry(va.page_index(level));
            if !entry.is_table() {
                return None;
            }
            table = entry.address();
        }

        // SAFETY: as above.
        let entry = unsafe { node(memory, table) }.entry(va.page_index(0));
        entry.is_leaf().then_some(entry)
    }

    /// Returns the physical page behind user address `va`.
    ///
    /// `None` if the page is unmapped, not user-accessible, or `va` cannot be mapped at all.
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.lookup(va.page_base())
            .filter(|entry| entry.flags().contains(PageFlags::USER))
            .map(PageTableEntry::address)
    }

    /// Maps the pages covering `[va, va + len)` to consecutive physical pages starting at `pa`.
    ///
    /// Fails with [`MemoryError::OutOfMemory`] if a table node could not be allocated; pages
    /// mapped before the failure stay mapped and are the caller's to remove.
    ///
    /// # Panics
    ///
    /// Panics if `len` is zero, `perm` grants no access, `pa` is not page-aligned, or any page
    /// in the range is already mapped.
    pub fn map(
        &mut self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        len: usize,
        perm: PageFlags,
    ) -> Result<(), MemoryError> {
        assert!(len > 0, "map: zero-length mapping at {va}");
        assert!(perm.is_leaf(), "map: permissions {perm:?} at {va} grant no access");
        assert!(pa.is_page_aligned(), "map: physical address {pa} not page-aligned");

        let last = (va + (len - 1)).page_base();
        let mut page = va.page_base();
        let mut frame = pa;
        loop {
            let entry = self.walk(page, true).ok_or(MemoryError::OutOfMemory)?;
            if entry.is_valid() {
                panic!("map: remap at {page}");
            }
            *entry = PageTableEntry::new(frame, perm | PageFlags::VALID);
            log::trace!("map: {page} -> {frame} {perm:?}");

            if page == last {
                return Ok(());
            }
            page = page + PAGE_SIZE;
            frame = frame + PAGE_SIZE;
        }
    }

    /// Removes the leaf mappings of `npages` pages starting at `va`.
    ///
    /// Pages that were never mapped are skipped. With `free_backing`, each removed mapping
    /// drops its reference to the physical page.
    ///
    /// # Panics
    ///
    /// Panics if `va` is not page-aligned or an entry in the range points at a table node.
    pub fn unmap(&mut self, va: VirtualAddress, npages: usize, free_backing: bool) {
        assert!(va.is_page_aligned(), "unmap: {va} not page-aligned");

        let pmm = self.pmm;
        for index in 0..npages {
            let page = va + index * PAGE_SIZE;
            let Some(entry) = self.walk(page, false) else {
                continue;
            };
            if !entry.is_valid() {
                continue;
            }
            if !entry.is_leaf() {
                panic!("unmap: {page} is not a leaf");
            }

            let frame = entry.address();
            entry.clear();
            log::trace!("unmap: {page} -> {frame}");
            if free_backing {
                pmm.free(frame);
            }
        }
    }

    /// Allocates a zeroed page and maps it at `va`.
    fn map_fresh_page(
        &mut self,
        va: VirtualAddress,
        perm: PageFlags,
    ) -> Result<PhysicalAddress, MemoryError> {
        let pa = self.pmm.allocate_zeroed().ok_or(MemoryError::OutOfMemory)?;
        if let Err(err) = self.map(va, pa, PAGE_SIZE, perm) {
            self.pmm.free(pa);
            return Err(err);
        }
        Ok(pa)
    }

    /// Grows user memory to `new_size`, backing the new range with zeroed pages.
    ///
    /// On failure every page mapped by this call is released and the size is unchanged.
    /// Returns the new size; a `new_size` not above the current size changes nothing.
    pub fn grow(&mut self, new_size: usize) -> Result<usize, MemoryError> {
        let old_size = self.size;
        if new_size <= old_size {
            return Ok(old_size);
        }
        if new_size > MAX_VIRTUAL_ADDRESS {
            return Err(MemoryError::InvalidArgument);
        }

        let mut end = page_round_up(old_size);
        while end < new_size {
            if let Err(err) = self.map_fresh_page(VirtualAddress::new(end), PageFlags::USER_RWX) {
                log::warn!("grow: {err} at {end:#x}, unwinding to {old_size:#x}");
                self.deallocate(end, old_size);
                return Err(err);
            }
            end += PAGE_SIZE;
        }

        self.size = new_size;
        Ok(new_size)
    }

    /// Shrinks user memory to `new_size`, releasing pages no longer covered.
    ///
    /// A page still holding a byte below `new_size` is kept. Returns the new size; a
    /// `new_size` not below the current size changes nothing.
    pub fn shrink(&mut self, new_size: usize) -> usize {
        if new_size >= self.size {
            return self.size;
        }
        self.deallocate(self.size, new_size);
        self.size = new_size;
        new_size
    }

    /// Releases the pages covering `[new_size, old_size)`, leaving `size` alone.
    fn deallocate(&mut self, old_size: usize, new_size: usize) {
        let keep = page_round_up(new_size);
        let end = page_round_up(old_size);
        if keep < end {
            self.unmap(VirtualAddress::new(keep), (end - keep) / PAGE_SIZE, true);
        }
    }

    /// Changes the size of user memory without mapping anything.
    ///
    /// Growth is backed on demand by [`handle_lazy_fault`](Self::handle_lazy_fault);
    /// shrinking releases resident pages as [`shrink`](Self::shrink) does.
    pub fn reserve(&mut self, new_size: usize) -> Result<usize, MemoryError> {
        if new_size > MAX_VIRTUAL_ADDRESS {
            return Err(MemoryError::InvalidArgument);
        }
        if new_size < self.size {
            self.shrink(new_size);
        } else {
            self.size = new_size;
        }
        Ok(self.size)
    }

    /// Backs the reserved page containing `va` with a zeroed page.
    ///
    /// An error means the faulting process cannot continue; it is never fatal to the kernel.
    pub fn handle_lazy_fault(&mut self, va: VirtualAddress) -> Result<(), MemoryError> {
        if va.as_usize() >= self.size {
            return Err(MemoryError::BadAddress { va });
        }
        let page = va.page_base();
        if self.lookup(page).is_some() {
            return Err(MemoryError::BadAddress { va });
        }

        self.map_fresh_page(page, PageFlags::USER_RWX)
            .map(|_| ())
            .inspect_err(|err| log::warn!("lazy fault at {va}: {err}"))
    }

    /// Creates a new address space holding a private copy of every resident page in `[0, len)`.
    ///
    /// Pages never faulted in stay unmapped in the copy. On failure the partial copy is
    /// released and this address space is untouched.
    ///
    /// # Panics
    ///
    /// Panics if `len` is beyond [`MAX_VIRTUAL_ADDRESS`].
    pub fn fork_copy(&self, len: usize) -> Result<AddressSpace<'a>, MemoryError> {
        assert!(len <= MAX_VIRTUAL_ADDRESS, "fork_copy: length {len:#x} too large");

        let mut child = AddressSpace::new(self.pmm)?;
        child.size = len;

        for offset in (0..len).step_by(PAGE_SIZE) {
            let va = VirtualAddress::new(offset);
            let Some(entry) = self.lookup(va) else {
                continue;
            };

            // A private copy needs no copy-on-write tracking.
            let mut flags = entry.flags() - PageFlags::VALID;
            if flags.contains(PageFlags::COW) {
                flags = (flags - PageFlags::COW) | PageFlags::WRITE;
            }

            let Some(copy) = self.pmm.allocate() else {
                log::warn!("fork_copy: out of memory at {va}, releasing partial copy");
                return Err(MemoryError::OutOfMemory);
            };
            self.pmm.memory().copy_page(copy, entry.address());
            if let Err(err) = child.map(va, copy, PAGE_SIZE, flags) {
                self.pmm.free(copy);
                log::warn!("fork_copy: {err} at {va}, releasing partial copy");
                return Err(err);
            }
        }

        Ok(child)
    }

    /// Creates a new address space sharing every resident page in `[0, len)` copy-on-write.
    ///
    /// Writable pages lose their write permission in both address spaces and are marked
    /// [`PageFlags::COW`]; the first write through either side goes through
    /// [`handle_cow_fault`](Self::handle_cow_fault).
    ///
    /// # Panics
    ///
    /// Panics if `len` is beyond [`MAX_VIRTUAL_ADDRESS`].
    pub fn fork_share(&mut self, len: usize) -> Result<AddressSpace<'a>, MemoryError> {
        assert!(len <= MAX_VIRTUAL_ADDRESS, "fork_share: length {len:#x} too large");

        let pmm = self.pmm;
        let mut child = AddressSpace::new(pmm)?;
        child.size = len;

        for offset in (0..len).step_by(PAGE_SIZE) {
            let va = VirtualAddress::new(offset);
            let Some(entry) = self.walk(va, false).filter(|entry| entry.is_leaf()) else {
                continue;
            };

            let mut flags = entry.flags();
            if flags.contains(PageFlags::WRITE) {
                flags = (flags - PageFlags::WRITE) | PageFlags::COW;
            }
            let pa = entry.address();

            if let Err(err) = child.map(va, pa, PAGE_SIZE, flags - PageFlags::VALID) {
                log::warn!("fork_share: {err} at {va}, releasing partial copy");
                return Err(err);
            }
            pmm.add_reference(pa);
            entry.set_flags(flags);
        }

        Ok(child)
    }

    /// Gives this address space a private, writable copy of the shared page containing `va`.
    ///
    /// Fails with [`MemoryError::BadAddress`] if the page is not a copy-on-write user page.
    pub fn handle_cow_fault(&mut self, va: VirtualAddress) -> Result<(), MemoryError> {
        if !va.is_mappable() {
            return Err(MemoryError::BadAddress { va });
        }

        let pmm = self.pmm;
        let Some(entry) = self.walk(va.page_base(), false) else {
            return Err(MemoryError::BadAddress { va });
        };
        let flags = entry.flags();
        if !entry.is_leaf() || !flags.contains(PageFlags::USER | PageFlags::COW) {
            return Err(MemoryError::BadAddress { va });
        }

        let Some(copy) = pmm.duplicate_for_write(entry.address()) else {
            log::warn!("cow fault at {va}: out of memory");
            return Err(MemoryError::OutOfMemory);
        };
        *entry = PageTableEntry::new(copy, (flags - PageFlags::COW) | PageFlags::WRITE);
        Ok(())
    }

    /// Reports which of `count` pages starting at `va` were accessed since the last query.
    ///
    /// Bit `i` of the result is set if page `i` had its accessed bit set; the bits are cleared.
    /// Unmapped pages, including any at or above [`MAX_VIRTUAL_ADDRESS`], report 0.
    pub fn query_accessed(&mut self, va: VirtualAddress, count: usize) -> Result<u32, MemoryError> {
        if count > MAX_ACCESS_QUERY {
            return Err(MemoryError::InvalidArgument);
        }

        let base = va.page_base().as_usize();
        let mut bitmap = 0u32;
        for index in 0..count {
            let Some(page) = base
                .checked_add(index * PAGE_SIZE)
                .map(VirtualAddress::new)
                .filter(|page| page.is_mappable())
            else {
                break;
            };

            let Some(entry) = self.walk(page, false).filter(|entry| entry.is_leaf()) else {
                continue;
            };
            let flags = entry.flags();
            if flags.contains(PageFlags::ACCESSED) {
                bitmap |= 1 << index;
                entry.set_flags(flags - PageFlags::ACCESSED);
            }
        }
        Ok(bitmap)
    }

    /// Sets the accessed bit of the page containing `va`, as the MMU does on a user access.
    ///
    /// # Panics
    ///
    /// Panics if the page is not mapped.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn set_accessed(&mut self, va: VirtualAddress) {
        match self.walk(va.page_base(), false) {
            Some(entry) if entry.is_leaf() => {
                let flags = entry.flags() | PageFlags::ACCESSED;
                entry.set_flags(flags);
            }
            _ => panic!("set_accessed: {va} is not mapped"),
        }
    }

    /// Loads the first user program: `code` is copied into a fresh page mapped at address 0.
    ///
    /// # Panics
    ///
    /// Panics if `code` does not fit in one page.
    pub fn load_initial(&mut self, code: &[u8]) -> Result<(), MemoryError> {
        assert!(
            code.len() < PAGE_SIZE,
            "load_initial: {} bytes do not fit in one page",
            code.len()
        );
        let pa = self.map_fresh_page(VirtualAddress::new(0), PageFlags::USER_RWX)?;
        self.pmm.memory().write(pa, code);
        self.size = PAGE_SIZE;
        Ok(())
    }

    /// Makes the page containing `va` inaccessible to user mode. Used for stack guard pages.
    ///
    /// # Panics
    ///
    /// Panics if the page is not mapped.
    pub fn clear_user(&mut self, va: VirtualAddress) {
        let Some(entry) = self.walk(va.page_base(), false).filter(|entry| entry.is_valid()) else {
            panic!("clear_user: no mapping at {va}");
        };
        let flags = entry.flags() - PageFlags::USER;
        entry.set_flags(flags);
    }

    /// Tears down the address space. Equivalent to dropping it.
    pub fn destroy(self) {}

    /// Returns a printable rendering of the page table tree.
    pub fn dump(&self) -> PageTableDump<'_> {
        PageTableDump {
            memory: self.pmm.memory(),
            root: self.root,
        }
    }
}

/// Frees the node at `table` and every node below it.
///
/// # Panics
///
/// Panics if a leaf mapping is still present anywhere in the subtree.
fn free_walk(pmm: &PhysicalMemoryManager, table: PhysicalAddress) {
    // SAFETY: the node belongs to an address space being torn down by its owner.
    let node = unsafe { node_mut(pmm.memory(), table) };
    for index in 0..ENTRIES_PER_TABLE {
        let entry = node.entry_mut(index);
        if entry.is_leaf() {
            panic!("free_walk: leaf left at index {index} of node {table}");
        }
        if entry.is_table() {
            free_walk(pmm, entry.address());
            entry.clear();
        }
    }
    pmm.free(table);
}

impl Drop for AddressSpace<'_> {
    fn drop(&mut self) {
        if unwinding() {
            return;
        }
        if self.size > 0 {
            self.unmap(
                VirtualAddress::new(0),
                page_round_up(self.size) / PAGE_SIZE,
                true,
            );
        }
        free_walk(self.pmm, self.root);
    }
}

impl fmt::Debug for AddressSpace<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("root", &self.root)
            .field("size", &self.size)
            .finish()
    }
}

/// Rendering of a page table tree, one line per valid entry, indented by depth.
pub struct PageTableDump<'a> {
    memory: &'a PhysicalMemory,
    root: PhysicalAddress,
}

impl PageTableDump<'_> {
    fn node(&self, f: &mut fmt::Formatter<'_>, table: PhysicalAddress, depth: usize) -> fmt::Result {
        // SAFETY: the dump borrows the address space, so the tree cannot change.
        let node = unsafe { node(self.memory, table) };
        for (index, entry) in node.valid_entries() {
            for _ in 0..depth {
                f.write_str(" ..")?;
            }
            writeln!(f, "{index}: pte {:#x} pa {}", entry.raw(), entry.address())?;
            if entry.is_table() {
                self.node(f, entry.address(), depth + 1)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for PageTableDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "page table {}", self.root)?;
        self.node(f, self.root, 1)
    }
}
