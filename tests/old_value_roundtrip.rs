//! End-to-end round-trip tests for the old-value capture contract.
//!
//! A small update message embeds an OldValueCell, serializes it through
//! the wire module, and a receiving message reconstructs it — the path a
//! replicated cache update takes when it carries the replaced value.

mod common;

use embergrid_offheap::blob::BlobValue;
use embergrid_offheap::slab::Slab;
use embergrid_offheap::stats::{NullOffHeapStats, NullOutOfMemoryListener};
use embergrid_offheap::wire::{decode_old_value, encode_old_value};
use embergrid_offheap::{
    ExportedOldValue, OffHeapAllocator, OldValueCell, OldValueExporter, OldValueImporter,
    OldValueSource,
};

/// Stand-in for a distribution message that captures a replaced value.
struct UpdateMessage {
    old_value: OldValueCell,
}

impl UpdateMessage {
    fn new() -> Self {
        Self {
            old_value: OldValueCell::new(),
        }
    }

    fn to_wire(&self) -> Vec<u8> {
        let exported = self.old_value.exported_old_value().expect("export");
        let mut out = Vec::new();
        encode_old_value(&exported, &mut out).expect("encode");
        out
    }

    fn from_wire(bytes: &[u8]) -> Self {
        let (value, rest) = decode_old_value(bytes).expect("decode");
        assert!(rest.is_empty(), "message fully consumed");

        let mut msg = Self::new();
        match value {
            ExportedOldValue::Absent => msg.old_value.mark_old_value_absent().unwrap(),
            ExportedOldValue::Raw(b) => msg.old_value.import_old_bytes(Some(&b), false).unwrap(),
            ExportedOldValue::Serialized(b) => {
                msg.old_value.import_old_bytes(Some(&b), true).unwrap()
            }
        }
        msg
    }
}

/// Send `msg` through the wire and return the receiver's exported view.
fn roundtrip(msg: &UpdateMessage) -> ExportedOldValue {
    let received = UpdateMessage::from_wire(&msg.to_wire());
    received.old_value.exported_old_value().expect("export")
}

fn test_allocator() -> OffHeapAllocator {
    OffHeapAllocator::create(
        Box::new(NullOutOfMemoryListener),
        Box::new(NullOffHeapStats),
        vec![Slab::allocate(1024 * 1024).unwrap()],
    )
    .unwrap()
}

#[test]
fn null_bytes_roundtrip_as_absent() {
    let mut msg = UpdateMessage::new();
    msg.old_value.import_old_bytes(None, false).unwrap();
    assert_eq!(roundtrip(&msg), ExportedOldValue::Absent);
}

#[test]
fn null_object_roundtrip_as_absent() {
    let mut msg = UpdateMessage::new();
    msg.old_value
        .import_old_object(OldValueSource::None, true)
        .unwrap();
    assert_eq!(roundtrip(&msg), ExportedOldValue::Absent);
}

#[test]
fn simple_byte_array_roundtrips_raw() {
    let ba_value = [1u8, 2, 3, 4, 5, 6, 7, 8, 9];
    let mut msg = UpdateMessage::new();
    msg.old_value.import_old_bytes(Some(&ba_value), false).unwrap();
    assert_eq!(roundtrip(&msg), ExportedOldValue::Raw(ba_value.to_vec()));
}

#[test]
fn zero_length_bytes_stay_distinct_from_absent() {
    let mut msg = UpdateMessage::new();
    msg.old_value.import_old_bytes(Some(&[]), false).unwrap();

    let exported = roundtrip(&msg);
    assert_eq!(exported, ExportedOldValue::Raw(Vec::new()));
    assert!(!exported.is_absent());
}

#[test]
fn string_in_serialized_form_roundtrips_as_blob() {
    let string_value = "1,2,3,4,5,6,7,8,9";
    let string_value_blob = string_value.to_blob().unwrap();

    let mut msg = UpdateMessage::new();
    msg.old_value
        .import_old_bytes(Some(&string_value_blob), true)
        .unwrap();
    assert_eq!(
        roundtrip(&msg),
        ExportedOldValue::Serialized(string_value_blob)
    );
}

#[test]
fn string_in_object_form_roundtrips_as_blob() {
    let string_value = "1,2,3,4,5,6,7,8,9".to_string();
    let string_value_blob = string_value.to_blob().unwrap();

    let mut msg = UpdateMessage::new();
    msg.old_value
        .import_old_object(OldValueSource::Object(&string_value), true)
        .unwrap();
    assert_eq!(
        roundtrip(&msg),
        ExportedOldValue::Serialized(string_value_blob)
    );
}

#[test]
fn offheap_inline_byte_array_roundtrips_raw() {
    let alloc = test_allocator();
    let ba_value = [1u8, 2];
    let stored = alloc.allocate_and_initialize(&ba_value, false, false).unwrap();
    assert!(stored.is_inline());

    let mut msg = UpdateMessage::new();
    msg.old_value
        .import_old_object(OldValueSource::OffHeap(&stored), false)
        .unwrap();
    assert_eq!(roundtrip(&msg), ExportedOldValue::Raw(ba_value.to_vec()));

    alloc.release(&stored).unwrap();
    alloc.free_all().unwrap();
}

#[test]
fn offheap_chunk_byte_array_roundtrips_raw() {
    let alloc = test_allocator();
    let ba_value: Vec<u8> = (1..=17).collect();
    let stored = alloc.allocate_and_initialize(&ba_value, false, false).unwrap();
    assert!(!stored.is_inline());

    let mut msg = UpdateMessage::new();
    msg.old_value
        .import_old_object(OldValueSource::OffHeap(&stored), false)
        .unwrap();
    assert_eq!(roundtrip(&msg), ExportedOldValue::Raw(ba_value));

    alloc.release(&stored).unwrap();
    drop(msg);
    let (used, _) = alloc.usage();
    assert_eq!(used, 0, "cell drop releases its adopted reference");
    alloc.free_all().unwrap();
}

#[test]
fn offheap_inline_string_blob_roundtrips_serialized() {
    let alloc = test_allocator();
    let blob = "12".to_blob().unwrap();
    let stored = alloc.allocate_and_initialize(&blob, true, false).unwrap();
    assert!(stored.is_inline());

    let mut msg = UpdateMessage::new();
    msg.old_value
        .import_old_object(OldValueSource::OffHeap(&stored), true)
        .unwrap();
    assert_eq!(roundtrip(&msg), ExportedOldValue::Serialized(blob));

    alloc.release(&stored).unwrap();
    alloc.free_all().unwrap();
}

#[test]
fn offheap_chunk_string_blob_roundtrips_serialized() {
    let alloc = test_allocator();
    let blob = "12345678".to_blob().unwrap();
    let stored = alloc.allocate_and_initialize(&blob, true, false).unwrap();
    assert!(!stored.is_inline());

    let mut msg = UpdateMessage::new();
    msg.old_value
        .import_old_object(OldValueSource::OffHeap(&stored), true)
        .unwrap();
    assert_eq!(roundtrip(&msg), ExportedOldValue::Serialized(blob));

    alloc.release(&stored).unwrap();
    alloc.free_all().unwrap();
}

/// The cell's retained reference keeps an adopted chunk readable after
/// the original holder releases it.
#[test]
fn adopted_reference_outlives_original_holder() {
    let alloc = test_allocator();
    let payload = common::payload_from_index(7, 512);
    let stored = alloc.allocate_and_initialize(&payload, false, false).unwrap();

    let mut msg = UpdateMessage::new();
    msg.old_value
        .import_old_object(OldValueSource::OffHeap(&stored), false)
        .unwrap();

    // The cache entry moves on; the in-flight message still owns a ref.
    alloc.release(&stored).unwrap();

    assert_eq!(
        msg.old_value.exported_old_value().unwrap(),
        ExportedOldValue::Raw(payload)
    );

    drop(msg);
    let (used, _) = alloc.usage();
    assert_eq!(used, 0);
}

/// Exporting after the backing chunk was fully released is a detected
/// defect, not garbage bytes.
#[test]
fn export_after_forced_free_is_detected() {
    use embergrid_offheap::error::OffHeapError;

    let alloc = test_allocator();
    let stored = alloc
        .allocate_and_initialize(&[0xAB; 64], false, false)
        .unwrap();

    let mut msg = UpdateMessage::new();
    msg.old_value
        .import_old_object(OldValueSource::OffHeap(&stored), false)
        .unwrap();

    // Defective caller releases both references out from under the cell.
    alloc.release(&stored).unwrap();
    alloc.release(&stored).unwrap();

    assert!(matches!(
        msg.old_value.exported_old_value(),
        Err(OffHeapError::UseAfterFree)
    ));
}
