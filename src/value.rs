//! The two physical encodings of a stored value.
//!
//! Values at or below [`InlineValue::MAX_BYTES`] are packed, flags and
//! all, into a single word and copied by value. Larger values live in a
//! [`Chunk`] carved from a slab, shared between holders through an
//! explicit reference count. Callers work with [`OffHeapValue`] and do
//! not care which encoding was chosen.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use crate::allocator::PoolShared;
use crate::error::{OffHeapError, Result};

/// Flag bit: the stored bytes are a serialized blob, not a literal value.
const FLAG_SERIALIZED: u64 = 0x80;
/// Flag bit: the stored bytes are compressed. Carried for the compression
/// layer outside this crate; nothing here interprets it.
const FLAG_COMPRESSED: u64 = 0x40;
/// Mask for the inline data length in the flag byte.
const LEN_MASK: u64 = 0x07;
/// Bit position of the flag byte inside the packed word.
const FLAG_SHIFT: u32 = 56;

/// A small value packed directly into one word.
///
/// Layout: data bytes occupy the low 7 bytes (byte `i` of the value at
/// bits `8*i..8*i+8`); the top byte holds the length in its low 3 bits
/// plus the serialized and compressed flags. No separate allocation, no
/// reference counting: the value is copied by value and is always valid.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct InlineValue {
    packed: u64,
}

impl std::fmt::Debug for InlineValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InlineValue")
            .field("packed", &format_args!("{:#018x}", self.packed))
            .field("len", &self.data_len())
            .field("serialized", &self.is_serialized())
            .finish()
    }
}

impl InlineValue {
    /// Largest value that fits the inline encoding: one word minus the
    /// flag byte. Fixed by the word width, not configurable.
    pub const MAX_BYTES: usize = 7;

    /// Pack `bytes` into an inline value, or `None` if it does not fit.
    pub fn try_pack(bytes: &[u8], serialized: bool, compressed: bool) -> Option<Self> {
        if bytes.len() > Self::MAX_BYTES {
            return None;
        }
        let mut packed = 0u64;
        for (i, b) in bytes.iter().enumerate() {
            packed |= (*b as u64) << (8 * i as u32);
        }
        let mut flags = bytes.len() as u64;
        if serialized {
            flags |= FLAG_SERIALIZED;
        }
        if compressed {
            flags |= FLAG_COMPRESSED;
        }
        packed |= flags << FLAG_SHIFT;
        Some(Self { packed })
    }

    #[inline]
    pub fn data_len(&self) -> usize {
        ((self.packed >> FLAG_SHIFT) & LEN_MASK) as usize
    }

    #[inline]
    pub fn is_serialized(&self) -> bool {
        (self.packed >> FLAG_SHIFT) & FLAG_SERIALIZED != 0
    }

    #[inline]
    pub fn is_compressed(&self) -> bool {
        (self.packed >> FLAG_SHIFT) & FLAG_COMPRESSED != 0
    }

    /// Unpack the stored bytes.
    pub fn read_bytes(&self) -> Vec<u8> {
        (0..self.data_len())
            .map(|i| (self.packed >> (8 * i as u32)) as u8)
            .collect()
    }
}

/// Allocator-side metadata for one chunk: the header of the allocation.
///
/// The data pointer stays valid while the reference count is nonzero;
/// the count reaching zero returns the span to the free list.
pub(crate) struct ChunkMeta {
    pub(crate) ptr: NonNull<u8>,
    pub(crate) data_len: usize,
    pub(crate) serialized: bool,
    pub(crate) compressed: bool,
    pub(crate) refs: AtomicU32,
    pub(crate) id: u64,
    pub(crate) slab: u32,
    pub(crate) offset: usize,
    pub(crate) pool: Weak<PoolShared>,
}

// SAFETY: the data pointer targets slab memory whose lifecycle is tracked
// by the reference count; any thread may read the bytes while it holds a
// reference, and the free transition is a single atomic decrement-and-test.
unsafe impl Send for ChunkMeta {}
unsafe impl Sync for ChunkMeta {}

/// Handle to one off-heap allocation.
///
/// Cloning a handle aliases the same allocation without touching the
/// reference count; sharing between holders goes through the allocator's
/// `retain`/`release`. Two handles are equal iff they address the same
/// allocation.
#[derive(Clone)]
pub struct Chunk {
    meta: Arc<ChunkMeta>,
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("id", &self.meta.id)
            .field("ptr", &format!("{:p}", self.meta.ptr.as_ptr()))
            .field("len", &self.meta.data_len)
            .field("serialized", &self.meta.serialized)
            .field("refs", &self.meta.refs.load(Ordering::Relaxed))
            .finish()
    }
}

impl PartialEq for Chunk {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.meta, &other.meta)
    }
}

impl Eq for Chunk {}

impl Chunk {
    pub(crate) fn new(meta: Arc<ChunkMeta>) -> Self {
        Self { meta }
    }

    /// Copy the stored bytes out of the slab.
    ///
    /// The caller must hold a reference; a zero count means the span was
    /// already returned to the free pool and the read is a defect.
    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        if self.meta.refs.load(Ordering::Acquire) == 0 {
            return Err(OffHeapError::UseAfterFree);
        }
        // SAFETY: the count was observed nonzero and the caller holds one
        // of those references, so the span is not on the free list.
        let slice =
            unsafe { std::slice::from_raw_parts(self.meta.ptr.as_ptr(), self.meta.data_len) };
        Ok(slice.to_vec())
    }

    #[inline]
    pub fn data_len(&self) -> usize {
        self.meta.data_len
    }

    #[inline]
    pub fn is_serialized(&self) -> bool {
        self.meta.serialized
    }

    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.meta.compressed
    }

    /// Current reference count. Test/diagnostic use.
    pub fn ref_count(&self) -> u32 {
        self.meta.refs.load(Ordering::Relaxed)
    }

    /// Increment the reference count. Fails on a freed chunk: a count
    /// that reached zero can never be resurrected.
    pub(crate) fn retain(&self) -> Result<()> {
        let mut current = self.meta.refs.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return Err(OffHeapError::UseAfterFree);
            }
            match self.meta.refs.compare_exchange(
                current,
                current + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Decrement the reference count; the holder that observes the 1->0
    /// transition returns the span to the free list.
    pub(crate) fn release(&self) -> Result<()> {
        let mut current = self.meta.refs.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return Err(OffHeapError::UseAfterFree);
            }
            match self.meta.refs.compare_exchange(
                current,
                current - 1,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    if current == 1 {
                        std::sync::atomic::fence(Ordering::Acquire);
                        if let Some(pool) = self.meta.pool.upgrade() {
                            pool.reclaim(&self.meta);
                        }
                    }
                    return Ok(());
                }
                Err(actual) => current = actual,
            }
        }
    }
}

/// One stored value, whichever encoding the allocator chose for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OffHeapValue {
    Inline(InlineValue),
    Chunk(Chunk),
}

impl OffHeapValue {
    /// Copy the stored bytes out, regardless of encoding.
    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        match self {
            OffHeapValue::Inline(v) => Ok(v.read_bytes()),
            OffHeapValue::Chunk(c) => c.read_bytes(),
        }
    }

    pub fn data_len(&self) -> usize {
        match self {
            OffHeapValue::Inline(v) => v.data_len(),
            OffHeapValue::Chunk(c) => c.data_len(),
        }
    }

    /// True if the stored bytes are a serialized blob rather than a
    /// literal byte value.
    pub fn is_serialized(&self) -> bool {
        match self {
            OffHeapValue::Inline(v) => v.is_serialized(),
            OffHeapValue::Chunk(c) => c.is_serialized(),
        }
    }

    pub fn is_compressed(&self) -> bool {
        match self {
            OffHeapValue::Inline(v) => v.is_compressed(),
            OffHeapValue::Chunk(c) => c.is_compressed(),
        }
    }

    /// True if the value uses the inline word encoding.
    pub fn is_inline(&self) -> bool {
        matches!(self, OffHeapValue::Inline(_))
    }
}
