/// log2 of the allocation granule. Object sizes and bump allocations are
/// rounded up to this, and the live map keeps one bit per granule.
pub const LOG_BYTES_IN_GRANULE: usize = 3;
pub const BYTES_IN_GRANULE: usize = 1 << LOG_BYTES_IN_GRANULE;

pub const BITS_IN_WORD: usize = usize::BITS as usize;

/// Default size of a small page. Overridable through `PoolOptions`.
pub const DEFAULT_PAGE_SIZE_SMALL: usize = 2 << 20;

/// Pages handed back to the external allocator are batched so the free-list
/// lock is not held across the allocator call.
pub const DEFAULT_FREE_BATCH: usize = 64;

/// Initial capacity of the from-space index.
pub const DEFAULT_FSP_CAPACITY: usize = 1024;
