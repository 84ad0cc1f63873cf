//! Off-heap value storage for the EmberGrid in-memory data grid.
//!
//! Cache entry values live in memory mapped outside the managed heap so
//! large working sets do not stall collectors. Tiny values pack into a
//! single word ([`InlineValue`]); everything else is carved from raw
//! slabs and reference-counted ([`Chunk`]). The [`old_value`] module
//! defines the contract update/distribution messages use to capture a
//! replaced value in any source form and carry it across the wire
//! losslessly ([`wire`]).

pub mod allocator;
pub mod blob;
pub mod error;
mod logging;
pub mod old_value;
pub mod slab;
pub mod stats;
pub mod value;
pub mod wire;

pub use allocator::{OffHeapAllocator, OffHeapConfig, StorageReport};
pub use error::{OffHeapError, Result};
pub use old_value::{
    ExportedOldValue, OldValueCell, OldValueExporter, OldValueImporter, OldValueSource,
};
pub use value::{Chunk, InlineValue, OffHeapValue};

pub fn init_logging() {
    logging::ensure_initialized();
}
