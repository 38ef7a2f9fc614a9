#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Block I/O cache
//!
//! A fixed pool of in-memory copies of disk blocks, shared by everything above the disk
//! driver. Looking a block up returns a [`BufferGuard`] that holds the buffer's content lock,
//! so at most one context works on a given block at a time. Callers never see two buffers for
//! the same block.
//!
//! Buffers live in hash buckets keyed by `(device, block)`, each with its own spin lock.
//! Misses take a global eviction lock and recycle the unpinned buffer released longest ago.
//!
//! Writes are synchronous and only happen when the holder asks for them.

extern crate alloc;

mod buf;
mod cache;
mod device;
mod param;

pub use buf::{BlockKey, BufferGuard, BufferHandle};
pub use cache::BufferCache;
#[cfg(any(test, feature = "software-emulation"))]
pub use device::RamDisk;
pub use device::BlockDevice;
pub use param::{BLOCK_SIZE, NBUCKET, NBUF};
