// ============================================================================
// OffHeapAllocator layout + reclamation notes:
// - One mutex guards the free-span map, the live-chunk table and the slab
//   set; chunk reference counts are lock-free atomics, so release only
//   takes the lock on the 1->0 transition and readers never take it.
// - Free spans are keyed by (slab, offset) in address order. Allocation is
//   first-fit: the first span large enough is split and the remainder goes
//   back to the map. Frees coalesce eagerly with both neighbors.
// - Out of memory is fail-fast: the listener is notified synchronously,
//   then the error is returned. Retry/eviction policy belongs to the
//   caller, not here.
// - free_all marks every live chunk freed (leaked handles then fail
//   deterministically instead of reading unmapped memory), drops the
//   slabs and closes the instance. A fresh allocator can be created
//   afterwards; there is no process-global instance.
// ============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytesize::ByteSize;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{OffHeapError, Result};
use crate::slab::Slab;
use crate::stats::{
    NullOffHeapStats, NullOutOfMemoryListener, OffHeapStats, OutOfMemoryEvent, OutOfMemoryListener,
};
use crate::value::{Chunk, ChunkMeta, InlineValue, OffHeapValue};

/// Pattern written over freed spans in debug builds.
#[cfg(debug_assertions)]
const FREED_PATTERN: u8 = 0xEF;

/// Configuration for the off-heap store.
#[derive(Debug, Clone)]
pub struct OffHeapConfig {
    /// Size of each slab in bytes.
    pub slab_size_bytes: usize,
    /// Number of slabs to map at startup.
    pub slab_count: usize,
    /// Back slabs with huge pages (requires system configuration).
    pub use_hugepages: bool,
}

impl Default for OffHeapConfig {
    fn default() -> Self {
        Self {
            slab_size_bytes: 64 * 1024 * 1024, // 64MB
            slab_count: 1,
            use_hugepages: false,
        }
    }
}

/// Free-space summary for admission control and fragmentation reporting.
#[derive(Debug, Clone, Copy)]
pub struct StorageReport {
    pub total_free_bytes: u64,
    pub largest_free_allocation_bytes: u64,
}

struct PoolState {
    slabs: Vec<Slab>,
    /// Address-ordered free spans: (slab, offset) -> span length.
    free: BTreeMap<(u32, usize), usize>,
    /// Live chunks by id, for free_all and leak reporting.
    live: HashMap<u64, Arc<ChunkMeta>>,
    used_bytes: usize,
}

impl PoolState {
    fn free_bytes(&self) -> usize {
        self.free.values().sum()
    }

    fn largest_free(&self) -> usize {
        self.free.values().copied().max().unwrap_or(0)
    }
}

/// State shared between the allocator handle and outstanding chunks.
pub(crate) struct PoolShared {
    state: Mutex<PoolState>,
    listener: Box<dyn OutOfMemoryListener>,
    stats: Box<dyn OffHeapStats>,
    closed: AtomicBool,
    next_chunk_id: AtomicU64,
    capacity: usize,
}

impl PoolShared {
    /// Return a span to the free pool. Called by the holder that observed
    /// the chunk's reference count reach zero.
    pub(crate) fn reclaim(&self, meta: &ChunkMeta) {
        let mut state = self.state.lock();
        if self.closed.load(Ordering::Acquire) {
            // free_all already tore the slabs down
            return;
        }
        state.live.remove(&meta.id);
        #[cfg(debug_assertions)]
        // SAFETY: the span is no longer reachable through any live handle
        // and has not been handed back to the free map yet.
        unsafe {
            std::ptr::write_bytes(meta.ptr.as_ptr(), FREED_PATTERN, meta.data_len);
        }
        insert_coalesced(&mut state.free, meta.slab, meta.offset, meta.data_len);
        state.used_bytes -= meta.data_len;
        drop(state);
        self.stats.record_free(meta.data_len);
        trace!(chunk = meta.id, len = meta.data_len, "freed off-heap chunk");
    }

    fn allocate_chunk(
        self: &Arc<Self>,
        bytes: &[u8],
        serialized: bool,
        compressed: bool,
    ) -> Result<Chunk> {
        let size = bytes.len();
        let meta = {
            let mut state = self.state.lock();
            let Some((slab, offset)) = take_first_fit(&mut state, size) else {
                let event = OutOfMemoryEvent {
                    requested: size,
                    free_bytes: state.free_bytes(),
                    largest_free_bytes: state.largest_free(),
                };
                drop(state);
                warn!(
                    "off-heap pool exhausted: requested {}, free {}, largest span {}",
                    ByteSize(event.requested as u64),
                    ByteSize(event.free_bytes as u64),
                    ByteSize(event.largest_free_bytes as u64)
                );
                self.listener.on_out_of_memory(&event);
                return Err(OffHeapError::OutOfMemory {
                    requested: size,
                    free: event.free_bytes,
                });
            };
            state.used_bytes += size;
            let base = state.slabs[slab as usize].base().as_ptr();
            // SAFETY: offset + size lies inside the slab; the span was just
            // removed from the free map so it is exclusively ours.
            let ptr = unsafe { base.add(offset) };
            let id = self.next_chunk_id.fetch_add(1, Ordering::Relaxed);
            let meta = Arc::new(ChunkMeta {
                ptr: std::ptr::NonNull::new(ptr).expect("slab offset produced null"),
                data_len: size,
                serialized,
                compressed,
                refs: std::sync::atomic::AtomicU32::new(1),
                id,
                slab,
                offset,
                pool: Arc::downgrade(self),
            });
            state.live.insert(id, Arc::clone(&meta));
            meta
        };
        // Copy outside the lock; nothing else can reach this span until the
        // handle is returned.
        // SAFETY: the span holds at least `size` writable bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), meta.ptr.as_ptr(), size);
        }
        self.stats.record_allocation(size);
        trace!(chunk = meta.id, len = size, serialized, "allocated off-heap chunk");
        Ok(Chunk::new(meta))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(OffHeapError::AllocatorClosed);
        }
        Ok(())
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.live.is_empty() {
            warn!(
                leaked = state.live.len(),
                "dropping off-heap allocator with live chunks"
            );
            // Leaked handles must fail instead of reading unmapped memory.
            for meta in state.live.values() {
                meta.refs.store(0, Ordering::Release);
            }
        }
    }
}

fn insert_coalesced(free: &mut BTreeMap<(u32, usize), usize>, slab: u32, offset: usize, len: usize) {
    let mut offset = offset;
    let mut len = len;
    if let Some(&next_len) = free.get(&(slab, offset + len)) {
        free.remove(&(slab, offset + len));
        len += next_len;
    }
    if let Some((&(prev_slab, prev_off), &prev_len)) = free.range(..(slab, offset)).next_back() {
        if prev_slab == slab && prev_off + prev_len == offset {
            free.remove(&(prev_slab, prev_off));
            offset = prev_off;
            len += prev_len;
        }
    }
    free.insert((slab, offset), len);
}

fn take_first_fit(state: &mut PoolState, size: usize) -> Option<(u32, usize)> {
    let (key, span_len) = state
        .free
        .iter()
        .find_map(|(&key, &len)| (len >= size).then_some((key, len)))?;
    state.free.remove(&key);
    if span_len > size {
        state.free.insert((key.0, key.1 + size), span_len - size);
    }
    Some(key)
}

/// The off-heap memory allocator: owns the slab set, carves chunks on
/// demand, and reclaims them through explicit reference counting.
///
/// Explicitly constructed and passed around; any number of instances may
/// coexist in one process.
pub struct OffHeapAllocator {
    shared: Arc<PoolShared>,
}

impl OffHeapAllocator {
    /// Initialize the allocator over pre-sized slabs.
    ///
    /// # Errors
    ///
    /// Fails if the slab set has zero total capacity or any two slabs
    /// overlap in the address space.
    pub fn create(
        listener: Box<dyn OutOfMemoryListener>,
        stats: Box<dyn OffHeapStats>,
        slabs: Vec<Slab>,
    ) -> Result<Self> {
        let capacity: usize = slabs.iter().map(Slab::size).sum();
        if capacity == 0 {
            return Err(OffHeapError::ZeroCapacity);
        }

        let mut ranges: Vec<(usize, usize)> = slabs
            .iter()
            .map(|s| (s.as_ptr() as usize, s.size()))
            .collect();
        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            if pair[0].0 + pair[0].1 > pair[1].0 {
                return Err(OffHeapError::SlabOverlap);
            }
        }

        let free = slabs
            .iter()
            .enumerate()
            .map(|(i, s)| ((i as u32, 0), s.size()))
            .collect();

        debug!(
            slabs = slabs.len(),
            capacity = ByteSize(capacity as u64).to_string(),
            "created off-heap allocator"
        );

        Ok(Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    slabs,
                    free,
                    live: HashMap::new(),
                    used_bytes: 0,
                }),
                listener,
                stats,
                closed: AtomicBool::new(false),
                next_chunk_id: AtomicU64::new(1),
                capacity,
            }),
        })
    }

    /// Convenience constructor: map slabs per `config` with the null
    /// listener and stats sink.
    pub fn with_config(config: &OffHeapConfig) -> Result<Self> {
        let mut slabs = Vec::with_capacity(config.slab_count);
        for _ in 0..config.slab_count {
            let slab = if config.use_hugepages {
                Slab::allocate_hugepages(config.slab_size_bytes)?
            } else {
                Slab::allocate(config.slab_size_bytes)?
            };
            slabs.push(slab);
        }
        Self::create(
            Box::new(NullOutOfMemoryListener),
            Box::new(NullOffHeapStats),
            slabs,
        )
    }

    /// Store `bytes` off-heap and return a handle holding one reference.
    ///
    /// Values at or below [`InlineValue::MAX_BYTES`] use the inline word
    /// encoding and never touch the free list. `compressed` is carried on
    /// the stored value but not interpreted here.
    ///
    /// # Errors
    ///
    /// Returns `OutOfMemory` when no slab has a large-enough contiguous
    /// span; the out-of-memory listener is notified first. Never blocks
    /// waiting for space and never retries.
    pub fn allocate_and_initialize(
        &self,
        bytes: &[u8],
        serialized: bool,
        compressed: bool,
    ) -> Result<OffHeapValue> {
        self.shared.ensure_open()?;
        if let Some(inline) = InlineValue::try_pack(bytes, serialized, compressed) {
            self.shared.stats.record_inline();
            return Ok(OffHeapValue::Inline(inline));
        }
        let chunk = self.shared.allocate_chunk(bytes, serialized, compressed)?;
        Ok(OffHeapValue::Chunk(chunk))
    }

    /// Add a reference for a second holder sharing `value` without
    /// copying bytes. No-op for inline values.
    pub fn retain(&self, value: &OffHeapValue) -> Result<()> {
        match value {
            OffHeapValue::Inline(_) => Ok(()),
            OffHeapValue::Chunk(chunk) => chunk.retain(),
        }
    }

    /// Drop one reference; the last release returns the span to the free
    /// pool. No-op for inline values.
    pub fn release(&self, value: &OffHeapValue) -> Result<()> {
        match value {
            OffHeapValue::Inline(_) => Ok(()),
            OffHeapValue::Chunk(chunk) => chunk.release(),
        }
    }

    /// (used bytes, total capacity).
    pub fn usage(&self) -> (u64, u64) {
        let state = self.shared.state.lock();
        (state.used_bytes as u64, self.shared.capacity as u64)
    }

    /// Free-space summary across all slabs.
    pub fn storage_report(&self) -> StorageReport {
        let state = self.shared.state.lock();
        StorageReport {
            total_free_bytes: state.free_bytes() as u64,
            largest_free_allocation_bytes: state.largest_free() as u64,
        }
    }

    /// Tear the store down: mark every live chunk freed, release all
    /// slabs, and reject further operations on this instance.
    ///
    /// Handles that were not released first fail deterministically with
    /// `UseAfterFree` from here on. A fresh allocator may be created
    /// afterwards.
    pub fn free_all(&self) -> Result<()> {
        self.shared.ensure_open()?;
        let slabs = {
            let mut state = self.shared.state.lock();
            self.shared.closed.store(true, Ordering::Release);
            let leaked = state.live.len();
            if leaked > 0 {
                warn!(leaked, "free_all with unreleased chunks");
            }
            for meta in state.live.values() {
                meta.refs.store(0, Ordering::Release);
            }
            state.live.clear();
            state.free.clear();
            state.used_bytes = 0;
            std::mem::take(&mut state.slabs)
        };
        // Unmap outside the lock; the closed flag is already visible.
        drop(slabs);
        debug!("off-heap allocator closed");
        Ok(())
    }
}
