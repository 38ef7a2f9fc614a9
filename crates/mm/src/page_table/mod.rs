//! Sv39-style page table primitives.
//!
//! Every address space shares this layout: 3 levels of 512-entry nodes, each node exactly one
//! page. A node is a [`PageTable`]; each slot is a [`PageTableEntry`] holding a physical page
//! number and [`PageFlags`].

mod entry;
mod flags;
mod table;

pub use entry::PageTableEntry;
pub use flags::PageFlags;
pub use table::PageTable;
