#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Memory Manager
//!
//! The memory-management core of the kernel:
//!
//! - [`PhysicalMemoryManager`]: hands out and reclaims 4 KiB physical pages from per-CPU free
//!   lists, with a reference count per page so pages can be shared copy-on-write.
//! - [`AddressSpace`]: a per-process three-level page table, with the operations processes
//!   need (growth, lazy allocation, fork, copy-on-write faults) and the copies between kernel
//!   buffers and user memory.
//!
//! Recoverable failures (out of memory, bad user pointers) are reported as [`MemoryError`].
//! Broken invariants (double free, remapping a page) panic; the kernel's panic handler halts
//! the machine.
//!
//! With the `software-emulation` feature (and in tests) physical memory is a host allocation
//! and host threads act as CPUs.

extern crate alloc;

mod address;
mod address_space;
mod error;
mod memory;
mod page_table;
mod physical_memory_manager;

pub use address::{
    ENTRIES_PER_TABLE, MAX_VIRTUAL_ADDRESS, PAGE_SIZE, PAGE_TABLE_LEVELS, PhysicalAddress,
    VirtualAddress, page_round_down, page_round_up,
};
pub use address_space::{AddressSpace, MAX_ACCESS_QUERY, PageTableDump};
pub use error::MemoryError;
pub use memory::{FrameNumber, PhysicalMemory};
pub use page_table::{PageFlags, PageTable, PageTableEntry};
pub use physical_memory_manager::{PhysicalMemoryManager, STEAL_BATCH};
