//! Copying bytes between kernel buffers and user memory.
//!
//! Each user page is resolved separately, so a copy may span pages that are physically
//! scattered. Reserved pages that were never touched are faulted in, and copy-on-write pages
//! are made private before being written. Any other unmapped or kernel-only page ends the copy
//! with [`MemoryError::BadAddress`]; bytes already copied stay copied.

use super::AddressSpace;
use crate::address::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use crate::error::MemoryError;
use crate::page_table::PageFlags;

impl AddressSpace<'_> {
    /// Returns the physical page behind the user page `page`, readying it for a write if asked.
    fn user_page(&mut self, page: VirtualAddress, write: bool) -> Result<PhysicalAddress, MemoryError> {
        let bad = MemoryError::BadAddress { va: page };
        if !page.is_mappable() {
            return Err(bad);
        }

        let entry = match self.lookup(page) {
            Some(entry) => entry,
            None if page.as_usize() < self.size => {
                self.handle_lazy_fault(page)?;
                self.lookup(page).ok_or(bad)?
            }
            None => return Err(bad),
        };

        let flags = entry.flags();
        if !flags.contains(PageFlags::USER) {
            return Err(bad);
        }
        if write && !flags.contains(PageFlags::WRITE) {
            if !flags.contains(PageFlags::COW) {
                return Err(bad);
            }
            self.handle_cow_fault(page)?;
            return self.lookup(page).map(|entry| entry.address()).ok_or(bad);
        }
        Ok(entry.address())
    }

    /// Copies `src` to user memory at `dst`.
    pub fn copy_to_user(&mut self, dst: VirtualAddress, src: &[u8]) -> Result<(), MemoryError> {
        let mut va = dst;
        let mut rest = src;
        while !rest.is_empty() {
            let page = va.page_base();
            let pa = self.user_page(page, true)?;
            let offset = va.page_offset();
            let n = rest.len().min(PAGE_SIZE - offset);
            self.pmm.memory().write(pa + offset, &rest[..n]);
            rest = &rest[n..];
            va = page + PAGE_SIZE;
        }
        Ok(())
    }

    /// Fills `dst` from user memory at `src`.
    pub fn copy_from_user(&mut self, dst: &mut [u8], src: VirtualAddress) -> Result<(), MemoryError> {
        let mut va = src;
        let mut copied = 0;
        while copied < dst.len() {
            let page = va.page_base();
            let pa = self.user_page(page, false)?;
            let offset = va.page_offset();
            let n = (dst.len() - copied).min(PAGE_SIZE - offset);
            self.pmm.memory().read(pa + offset, &mut dst[copied..copied + n]);
            copied += n;
            va = page + PAGE_SIZE;
        }
        Ok(())
    }

    /// Copies a NUL-terminated string from user memory at `src` into `dst`.
    ///
    /// At most `max` bytes are read, terminator included. On success `dst` holds the string
    /// and its terminator, and the string's length (without the terminator) is returned.
    ///
    /// # Panics
    ///
    /// Panics if `dst` is shorter than `max`.
    pub fn copy_string_from_user(
        &mut self,
        dst: &mut [u8],
        src: VirtualAddress,
        max: usize,
    ) -> Result<usize, MemoryError> {
        assert!(
            dst.len() >= max,
            "copy_string_from_user: {}-byte buffer for a {max}-byte limit",
            dst.len()
        );

        let mut va = src;
        let mut copied = 0;
        while copied < max {
            let page = va.page_base();
            let pa = self.user_page(page, false)?;
            let offset = va.page_offset();
            let n = (max - copied).min(PAGE_SIZE - offset);
            let chunk = &mut dst[copied..copied + n];
            self.pmm.memory().read(pa + offset, chunk);
            if let Some(end) = chunk.iter().position(|&byte| byte == 0) {
                return Ok(copied + end);
            }
            copied += n;
            va = page + PAGE_SIZE;
        }
        Err(MemoryError::StringTooLong { max })
    }
}
