use thiserror::Error;

use crate::VirtualAddress;

/// Recoverable memory-management failures.
///
/// These are conditions the environment can legitimately cause: running out of physical
/// pages, or a user program passing a bad pointer. Invariant violations are not represented
/// here; they halt the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// No physical page was available.
    #[error("out of physical memory")]
    OutOfMemory,
    /// A user address was unmapped, not user-accessible, or outside the address space.
    #[error("bad user address {va}")]
    BadAddress { va: VirtualAddress },
    /// A user string had no terminator within the allowed length.
    #[error("string exceeds {max} bytes")]
    StringTooLong { max: usize },
    /// A request argument was out of its allowed range.
    #[error("invalid argument")]
    InvalidArgument,
}
