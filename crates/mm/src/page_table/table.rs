//! Page table node.

use super::entry::PageTableEntry;
use crate::address::{ENTRIES_PER_TABLE, PAGE_SIZE};

/// One node of the translation tree, laid out exactly as the MMU reads it.
///
/// Nodes are never constructed as Rust values; they are views over zeroed physical pages
/// handed out by the page allocator.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

const _: () = assert!(core::mem::size_of::<PageTable>() == PAGE_SIZE);

impl PageTable {
    /// Returns the entry at the given index.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not below [`ENTRIES_PER_TABLE`].
    pub fn entry(&self, index: usize) -> PageTableEntry {
        self.entries[index]
    }

    /// Returns a mutable reference to the entry at the given index.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not below [`ENTRIES_PER_TABLE`].
    pub fn entry_mut(&mut self, index: usize) -> &mut PageTableEntry {
        &mut self.entries[index]
    }

    /// Iterates over `(index, entry)` for every valid entry.
    pub fn valid_entries(&self) -> impl Iterator<Item = (usize, PageTableEntry)> + '_ {
        self.entries
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, entry)| entry.is_valid())
    }
}
