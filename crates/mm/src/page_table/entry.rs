//! Page table entry.

use core::fmt;

use super::flags::PageFlags;
use crate::address::{PAGE_SHIFT, PhysicalAddress};

/// A single page table entry.
///
/// The entry format:
/// - Bits 0-9: flags ([`PageFlags`], including the two software bits)
/// - Bits 10-53: physical page number
/// - Bits 54-63: reserved, always zero
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    const FLAGS_MASK: u64 = (1 << 10) - 1;
    const PPN_SHIFT: u64 = 10;
    const PPN_MASK: u64 = (1 << 44) - 1;

    /// Creates an entry pointing at the page `address` with the given flags.
    ///
    /// # Panics
    ///
    /// Panics if `address` is not page-aligned.
    pub fn new(address: PhysicalAddress, flags: PageFlags) -> Self {
        assert!(
            address.is_page_aligned(),
            "page table entry address {address} not page-aligned"
        );
        let ppn = (address.as_usize() >> PAGE_SHIFT) as u64;
        Self((ppn << Self::PPN_SHIFT) | (flags.bits() & Self::FLAGS_MASK))
    }

    /// Returns the physical page this entry points at.
    ///
    /// Meaningless unless the entry is valid.
    pub fn address(self) -> PhysicalAddress {
        let ppn = (self.0 >> Self::PPN_SHIFT) & Self::PPN_MASK;
        PhysicalAddress::new((ppn as usize) << PAGE_SHIFT)
    }

    /// Returns the flags for this entry.
    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & Self::FLAGS_MASK)
    }

    /// Replaces the flags, preserving the address.
    pub fn set_flags(&mut self, flags: PageFlags) {
        self.0 = (self.0 & !Self::FLAGS_MASK) | (flags.bits() & Self::FLAGS_MASK);
    }

    /// Returns whether this entry is valid.
    pub fn is_valid(self) -> bool {
        self.flags().contains(PageFlags::VALID)
    }

    /// Returns whether this entry maps a page, as opposed to pointing at the next node.
    pub fn is_leaf(self) -> bool {
        self.is_valid() && self.flags().is_leaf()
    }

    /// Returns whether this entry points at a lower-level node.
    pub fn is_table(self) -> bool {
        self.is_valid() && !self.flags().is_leaf()
    }

    /// Clears this entry.
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Returns the raw value of this entry.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "PageTableEntry({} {:?})", self.address(), self.flags())
        } else {
            write!(f, "PageTableEntry(invalid)")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_page_number_above_flags() {
        let pa = PhysicalAddress::new(0x8020_3000);
        let entry = PageTableEntry::new(pa, PageFlags::VALID | PageFlags::READ);
        assert_eq!(entry.raw(), (0x80203 << 10) | 0b11);
        assert_eq!(entry.address(), pa);
        assert!(entry.is_leaf());
        assert!(!entry.is_table());
    }

    #[test]
    fn interior_entry_has_no_permissions() {
        let entry = PageTableEntry::new(PhysicalAddress::new(0x1000), PageFlags::VALID);
        assert!(entry.is_table());
        assert!(!entry.is_leaf());
    }

    #[test]
    fn set_flags_keeps_address() {
        let pa = PhysicalAddress::new(0x4000);
        let mut entry = PageTableEntry::new(pa, PageFlags::VALID | PageFlags::USER_RWX);
        entry.set_flags(PageFlags::VALID | PageFlags::READ | PageFlags::COW);
        assert_eq!(entry.address(), pa);
        assert!(!entry.flags().contains(PageFlags::WRITE));
        assert!(entry.flags().contains(PageFlags::COW));
    }

    #[test]
    fn cleared_entry_is_invalid() {
        let mut entry = PageTableEntry::new(PhysicalAddress::new(0x4000), PageFlags::VALID);
        entry.clear();
        assert!(!entry.is_valid());
        assert_eq!(entry, PageTableEntry::default());
    }

    #[test]
    #[should_panic(expected = "not page-aligned")]
    fn rejects_unaligned_address() {
        PageTableEntry::new(PhysicalAddress::new(0x4010), PageFlags::VALID);
    }
}
