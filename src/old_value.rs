//! The old-value capture contract.
//!
//! When a cache operation overwrites or invalidates an entry, the
//! distribution message carrying that operation absorbs the replaced
//! value in whichever form the caller has it: nothing, raw bytes, a
//! serialized blob, a live object, or an existing off-heap reference.
//! The cell normalizes at import time and re-exposes the value in a
//! form serialization code can write and remote readers can reconstruct.

use crate::blob::BlobValue;
use crate::error::{OffHeapError, Result};
use crate::value::OffHeapValue;

/// A replaced value in whichever form the cache operation holds it.
pub enum OldValueSource<'a> {
    /// No prior value.
    None,
    /// Raw bytes; the serialized flag decides literal vs. blob.
    Bytes(&'a [u8]),
    /// A live object, serialized eagerly at import.
    Object(&'a dyn BlobValue),
    /// An existing off-heap reference, adopted by retaining it.
    OffHeap(&'a OffHeapValue),
}

/// Normalized view of a captured old value, ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportedOldValue {
    Absent,
    /// The bytes are the literal value.
    Raw(Vec<u8>),
    /// The bytes are a serialized blob; readers deserialize to recover
    /// the original object.
    Serialized(Vec<u8>),
}

impl ExportedOldValue {
    pub fn is_absent(&self) -> bool {
        matches!(self, ExportedOldValue::Absent)
    }

    /// Payload bytes, if present.
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            ExportedOldValue::Absent => None,
            ExportedOldValue::Raw(b) | ExportedOldValue::Serialized(b) => Some(b),
        }
    }
}

/// Capability a message type exposes to cache-operation callers for
/// absorbing a replaced value. Importing twice, or mixing an import with
/// the absent setter, is a programming error reported immediately.
pub trait OldValueImporter {
    /// Absorb a raw byte value. `None` normalizes to absent regardless of
    /// the flag; an empty slice is a present, zero-length value.
    fn import_old_bytes(&mut self, bytes: Option<&[u8]>, serialized: bool) -> Result<()>;

    /// Absorb a value in any source form. Live objects are serialized on
    /// the spot; off-heap references are retained, never copied lazily.
    fn import_old_object(&mut self, source: OldValueSource<'_>, serialized: bool) -> Result<()>;

    /// Record that there is no old value.
    fn mark_old_value_absent(&mut self) -> Result<()>;
}

/// Capability exposed by a populated holder to serialization code.
pub trait OldValueExporter {
    /// The normalized (bytes, serialized/raw, absent) view. Off-heap
    /// backing is copied out here, while the holder still owns its
    /// retained reference.
    fn exported_old_value(&self) -> Result<ExportedOldValue>;
}

enum CellState {
    Unset,
    Absent,
    Bytes { bytes: Vec<u8>, serialized: bool },
    OffHeap(OffHeapValue),
}

/// The value cell a message or journal record embeds.
///
/// Exactly one import may populate the cell. An adopted off-heap
/// reference is released when the cell is dropped.
#[derive(Default)]
pub struct OldValueCell {
    state: CellState,
}

impl Default for CellState {
    fn default() -> Self {
        CellState::Unset
    }
}

impl OldValueCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once any import (including the absent setter) has run.
    pub fn is_populated(&self) -> bool {
        !matches!(self.state, CellState::Unset)
    }

    fn occupy(&mut self, state: CellState) -> Result<()> {
        if self.is_populated() {
            return Err(OffHeapError::ImportConflict);
        }
        self.state = state;
        Ok(())
    }
}

impl OldValueImporter for OldValueCell {
    fn import_old_bytes(&mut self, bytes: Option<&[u8]>, serialized: bool) -> Result<()> {
        match bytes {
            // The serialized flag on an absent value is not observable.
            None => self.occupy(CellState::Absent),
            Some(b) => self.occupy(CellState::Bytes {
                bytes: b.to_vec(),
                serialized,
            }),
        }
    }

    fn import_old_object(&mut self, source: OldValueSource<'_>, serialized: bool) -> Result<()> {
        match source {
            OldValueSource::None => self.occupy(CellState::Absent),
            OldValueSource::Bytes(b) => self.occupy(CellState::Bytes {
                bytes: b.to_vec(),
                serialized,
            }),
            OldValueSource::Object(obj) => {
                // A live object cannot cross the import boundary; capture
                // its blob now. The flag argument is moot: a blob is
                // serialized by definition.
                let blob = obj.to_blob()?;
                self.occupy(CellState::Bytes {
                    bytes: blob,
                    serialized: true,
                })
            }
            OldValueSource::OffHeap(value) => {
                if self.is_populated() {
                    return Err(OffHeapError::ImportConflict);
                }
                if let OffHeapValue::Chunk(chunk) = value {
                    chunk.retain()?;
                }
                self.state = CellState::OffHeap(value.clone());
                Ok(())
            }
        }
    }

    fn mark_old_value_absent(&mut self) -> Result<()> {
        self.occupy(CellState::Absent)
    }
}

impl OldValueExporter for OldValueCell {
    fn exported_old_value(&self) -> Result<ExportedOldValue> {
        match &self.state {
            CellState::Unset | CellState::Absent => Ok(ExportedOldValue::Absent),
            CellState::Bytes { bytes, serialized } => Ok(if *serialized {
                ExportedOldValue::Serialized(bytes.clone())
            } else {
                ExportedOldValue::Raw(bytes.clone())
            }),
            CellState::OffHeap(value) => {
                let bytes = value.read_bytes()?;
                Ok(if value.is_serialized() {
                    ExportedOldValue::Serialized(bytes)
                } else {
                    ExportedOldValue::Raw(bytes)
                })
            }
        }
    }
}

impl Drop for OldValueCell {
    fn drop(&mut self) {
        if let CellState::OffHeap(OffHeapValue::Chunk(chunk)) = &self.state {
            // Already-freed means the owner released out from under us;
            // nothing left to do either way.
            let _ = chunk.release();
        }
    }
}
