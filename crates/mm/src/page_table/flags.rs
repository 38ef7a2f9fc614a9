//! Page table entry flags.

use bitflags::bitflags;

bitflags! {
    /// Permission and status bits in the low ten bits of a page table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u64 {
        /// The entry is in use.
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        /// User mode may access the page.
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        /// Set by the MMU when the page is accessed.
        const ACCESSED = 1 << 6;
        /// Set by the MMU when the page is written.
        const DIRTY = 1 << 7;
        /// Software bit: the page is shared copy-on-write and its write permission was removed.
        const COW = 1 << 8;
    }
}

impl PageFlags {
    /// Bits that make an entry a leaf mapping rather than a pointer to the next node.
    pub const LEAF: Self = Self::READ.union(Self::WRITE).union(Self::EXECUTE);

    /// Full permissions for an ordinary user page.
    pub const USER_RWX: Self = Self::LEAF.union(Self::USER);

    /// Returns true if these flags describe a leaf mapping.
    pub const fn is_leaf(self) -> bool {
        self.intersects(Self::LEAF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_needs_a_permission_bit() {
        assert!(!PageFlags::VALID.is_leaf());
        assert!(!(PageFlags::VALID | PageFlags::USER).is_leaf());
        assert!((PageFlags::VALID | PageFlags::READ).is_leaf());
        assert!(PageFlags::EXECUTE.is_leaf());
    }

    #[test]
    fn bit_positions_match_hardware() {
        assert_eq!(PageFlags::USER_RWX.bits(), 0b1_1110);
        assert_eq!(PageFlags::COW.bits(), 0x100);
    }
}
