//! Stats sink and memory-pressure listener wired into allocator creation.

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot handed to the out-of-memory listener before an allocation
/// failure is surfaced to the caller.
#[derive(Debug, Clone, Copy)]
pub struct OutOfMemoryEvent {
    /// Bytes the failed allocation asked for.
    pub requested: usize,
    /// Total free bytes across all slabs at the time of failure.
    pub free_bytes: usize,
    /// Largest contiguous free span at the time of failure.
    pub largest_free_bytes: usize,
}

/// Notified synchronously when the allocator cannot satisfy a request.
///
/// The callback runs on the allocating thread and must not block; it is
/// typically used to log or trigger eviction elsewhere. The allocator
/// never retries on its own.
pub trait OutOfMemoryListener: Send + Sync {
    fn on_out_of_memory(&self, event: &OutOfMemoryEvent);
}

/// Listener that ignores all events.
pub struct NullOutOfMemoryListener;

impl OutOfMemoryListener for NullOutOfMemoryListener {
    fn on_out_of_memory(&self, _event: &OutOfMemoryEvent) {}
}

/// Sink for allocator usage accounting, consumed by memory-pressure
/// reporting outside this crate.
pub trait OffHeapStats: Send + Sync {
    fn record_allocation(&self, bytes: usize);
    fn record_free(&self, bytes: usize);
    fn record_inline(&self);
}

/// Stats sink that ignores all events.
pub struct NullOffHeapStats;

impl OffHeapStats for NullOffHeapStats {
    fn record_allocation(&self, _bytes: usize) {}
    fn record_free(&self, _bytes: usize) {}
    fn record_inline(&self) {}
}

/// Atomic counter implementation with readable totals.
#[derive(Default)]
pub struct AtomicOffHeapStats {
    allocations: AtomicU64,
    frees: AtomicU64,
    allocated_bytes: AtomicU64,
    freed_bytes: AtomicU64,
    inline_values: AtomicU64,
}

impl AtomicOffHeapStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    pub fn frees(&self) -> u64 {
        self.frees.load(Ordering::Relaxed)
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes.load(Ordering::Relaxed)
    }

    pub fn freed_bytes(&self) -> u64 {
        self.freed_bytes.load(Ordering::Relaxed)
    }

    pub fn inline_values(&self) -> u64 {
        self.inline_values.load(Ordering::Relaxed)
    }

    /// Bytes currently held by live chunks according to this sink.
    pub fn live_bytes(&self) -> u64 {
        self.allocated_bytes()
            .saturating_sub(self.freed_bytes())
    }
}

impl OffHeapStats for AtomicOffHeapStats {
    fn record_allocation(&self, bytes: usize) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.allocated_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_free(&self, bytes: usize) {
        self.frees.fetch_add(1, Ordering::Relaxed);
        self.freed_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_inline(&self) {
        self.inline_values.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_stats_accounting() {
        let stats = AtomicOffHeapStats::new();
        stats.record_allocation(100);
        stats.record_allocation(50);
        stats.record_free(100);
        stats.record_inline();

        assert_eq!(stats.allocations(), 2);
        assert_eq!(stats.frees(), 1);
        assert_eq!(stats.allocated_bytes(), 150);
        assert_eq!(stats.freed_bytes(), 100);
        assert_eq!(stats.live_bytes(), 50);
        assert_eq!(stats.inline_values(), 1);
    }
}
