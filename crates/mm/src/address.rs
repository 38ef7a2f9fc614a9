//! Address types for physical and virtual memory management.
//!
//! This module provides wrappers around physical and virtual addresses, along with the
//! fixed layout of the three-level (Sv39-style) translation scheme: 4 KiB pages, 512 entries
//! per table node, 9 index bits per level.

use core::fmt;
use core::ops::{Add, Sub};

/// Page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Number of bits in the byte offset within a page.
pub const PAGE_SHIFT: usize = 12;

/// Number of entries in one page table node.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Number of index bits consumed by each page table level.
const INDEX_BITS: usize = 9;

/// Number of page table levels above the data pages (level 2 is the root, level 0 the leaf).
pub const PAGE_TABLE_LEVELS: usize = 3;

/// One past the highest virtual address a page table can map.
///
/// This is one bit less than the 39 bits the three levels could index, which avoids having to
/// sign-extend virtual addresses with the high bit set.
pub const MAX_VIRTUAL_ADDRESS: usize = 1 << (INDEX_BITS * PAGE_TABLE_LEVELS + PAGE_SHIFT - 1);

/// Number of bits in a physical address that a page table entry can hold.
pub const MAX_PHYSICAL_BITS: usize = 56;

/// Returns the index into the page table node at `level` that translates `address`.
///
/// Level 0 is the leaf level; level 2 indexes the root node.
///
/// # Panics
///
/// Panics if `level` is not a valid page table level.
#[inline]
pub const fn page_index(level: usize, address: usize) -> usize {
    assert!(level < PAGE_TABLE_LEVELS, "page table level out of range");
    let shift = PAGE_SHIFT + level * INDEX_BITS;
    (address >> shift) & (ENTRIES_PER_TABLE - 1)
}

/// Rounds `size` up to a whole number of pages.
#[inline]
pub const fn page_round_up(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Rounds `size` down to a page boundary.
#[inline]
pub const fn page_round_down(size: usize) -> usize {
    size & !(PAGE_SIZE - 1)
}

/// Macro to define common address type functionality.
///
/// This macro generates the basic structure and methods common to both physical
/// and virtual address types, reducing code duplication.
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Returns true if the address is at the start of a page.
            #[inline]
            pub const fn is_page_aligned(self) -> bool {
                self.is_aligned(PAGE_SIZE)
            }

            /// Aligns the address down to the start of its page.
            #[inline]
            pub const fn page_base(self) -> Self {
                Self(page_round_down(self.0))
            }

            /// Returns the byte offset within the page.
            #[inline]
            pub const fn page_offset(self) -> usize {
                self.0 & (PAGE_SIZE - 1)
            }
        }

        impl fmt::Pointer for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:p}", self.0 as *const u8)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl From<usize> for $name {
            #[inline]
            fn from(addr: usize) -> Self {
                Self::new(addr)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    "A physical memory address.\n\n\
     A page is identified by the physical address of its first byte."
);

impl PhysicalAddress {
    /// Creates a new physical address.
    ///
    /// # Panics
    ///
    /// Panics if the address does not fit in a page table entry.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            addr < (1usize << MAX_PHYSICAL_BITS),
            "physical address exceeds maximum width"
        );
        Self(addr)
    }
}

impl_address_common!(
    VirtualAddress,
    "A virtual address inside one address space.\n\n\
     Any value is representable, because user programs hand arbitrary addresses to the\n\
     kernel. Whether it can be translated is decided by the page table walk."
);

impl VirtualAddress {
    /// Creates a new virtual address.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Returns true if a page table can translate this address.
    #[inline]
    pub const fn is_mappable(self) -> bool {
        self.0 < MAX_VIRTUAL_ADDRESS
    }

    /// Returns the page table index at the specified level.
    #[inline]
    pub const fn page_index(self, level: usize) -> usize {
        page_index(level, self.0)
    }
}
