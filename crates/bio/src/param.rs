/// Size of a disk block, and of every buffer's payload.
pub const BLOCK_SIZE: usize = 1024;

/// Number of buffers in the default cache.
pub const NBUF: usize = 30;

/// Number of hash buckets in the default cache. Prime, to spread consecutive block numbers.
pub const NBUCKET: usize = 13;
