use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, OffHeapError>;

#[derive(Debug, Error)]
pub enum OffHeapError {
    #[error("out of off-heap memory: requested {requested} bytes, {free} bytes free")]
    OutOfMemory { requested: usize, free: usize },
    #[error("off-heap value used after free")]
    UseAfterFree,
    #[error("allocator is closed")]
    AllocatorClosed,
    #[error("slab set has zero total capacity")]
    ZeroCapacity,
    #[error("slabs overlap in the address space")]
    SlabOverlap,
    #[error("slab size must be greater than zero")]
    ZeroSizeSlab,
    #[error("mmap failed: {0}")]
    MmapFailed(io::Error),
    #[error("cannot determine huge page size: Hugepagesize not found in /proc/meminfo")]
    HugePageSizeUnavailable,
    #[error("old value already imported")]
    ImportConflict,
    #[error("malformed blob: {0}")]
    MalformedBlob(&'static str),
}
