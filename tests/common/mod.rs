//! Common test utilities for embergrid-offheap tests.

use std::sync::Arc;

/// Deterministic payload derived from an index (for reproducible tests).
pub fn payload_from_index(index: usize, len: usize) -> Vec<u8> {
    let seed = index.to_le_bytes();
    (0..len).map(|i| seed[i % seed.len()] ^ (i as u8)).collect()
}

/// Random payload of the given length.
pub fn random_payload(len: usize) -> Vec<u8> {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let mut bytes = vec![0u8; len];
    rng.fill(&mut bytes[..]);
    bytes
}

/// Barrier helper for coordinating multiple threads.
pub struct TestBarrier {
    barrier: std::sync::Barrier,
}

impl TestBarrier {
    pub fn new(n: usize) -> Self {
        Self {
            barrier: std::sync::Barrier::new(n),
        }
    }

    pub fn wait(&self) {
        self.barrier.wait();
    }
}

/// Arc wrapper for sharing TestBarrier across threads.
pub type SharedBarrier = Arc<TestBarrier>;

/// Create a shared barrier for N threads.
pub fn shared_barrier(n: usize) -> SharedBarrier {
    Arc::new(TestBarrier::new(n))
}
