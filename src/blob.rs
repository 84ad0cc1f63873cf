//! Self-describing object blobs.
//!
//! A captured live object travels as a blob the receiving side can
//! deserialize without out-of-band type knowledge: one type tag byte
//! followed by the payload.

use crate::error::{OffHeapError, Result};

const TAG_BYTES: u8 = 1;
const TAG_UTF8: u8 = 2;

/// A heap value that can be captured as a serialized blob.
pub trait BlobValue {
    fn to_blob(&self) -> Result<Vec<u8>>;
}

impl BlobValue for str {
    fn to_blob(&self) -> Result<Vec<u8>> {
        let mut blob = Vec::with_capacity(1 + self.len());
        blob.push(TAG_UTF8);
        blob.extend_from_slice(self.as_bytes());
        Ok(blob)
    }
}

impl BlobValue for String {
    fn to_blob(&self) -> Result<Vec<u8>> {
        self.as_str().to_blob()
    }
}

impl BlobValue for [u8] {
    fn to_blob(&self) -> Result<Vec<u8>> {
        let mut blob = Vec::with_capacity(1 + self.len());
        blob.push(TAG_BYTES);
        blob.extend_from_slice(self);
        Ok(blob)
    }
}

impl BlobValue for Vec<u8> {
    fn to_blob(&self) -> Result<Vec<u8>> {
        self.as_slice().to_blob()
    }
}

/// A deserialized blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobObject {
    Utf8(String),
    Bytes(Vec<u8>),
}

/// Decode a blob produced by [`BlobValue::to_blob`].
pub fn decode_blob(blob: &[u8]) -> Result<BlobObject> {
    let (&tag, payload) = blob
        .split_first()
        .ok_or(OffHeapError::MalformedBlob("empty blob"))?;
    match tag {
        TAG_BYTES => Ok(BlobObject::Bytes(payload.to_vec())),
        TAG_UTF8 => {
            let text = std::str::from_utf8(payload)
                .map_err(|_| OffHeapError::MalformedBlob("invalid utf8 payload"))?;
            Ok(BlobObject::Utf8(text.to_string()))
        }
        _ => Err(OffHeapError::MalformedBlob("unknown type tag")),
    }
}
