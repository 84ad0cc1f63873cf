//! Wire encoding for captured old values.
//!
//! One discriminant byte, then a length-prefixed payload for present
//! values. Decoding validates every length against the remaining input
//! and returns the unconsumed remainder so the field can sit inside a
//! larger message.

use thiserror::Error;

use crate::old_value::ExportedOldValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum OldValueTag {
    Absent = 0,
    Raw = 1,
    Serialized = 2,
}

impl OldValueTag {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Absent),
            1 => Some(Self::Raw),
            2 => Some(Self::Serialized),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("unknown old-value discriminant {0}")]
    UnknownDiscriminant(u8),
    #[error("old-value field truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("old-value payload too large for wire length prefix: {len} bytes")]
    PayloadTooLarge { len: usize },
}

fn put_payload(out: &mut Vec<u8>, tag: OldValueTag, payload: &[u8]) -> Result<(), WireError> {
    let len = u32::try_from(payload.len()).map_err(|_| WireError::PayloadTooLarge {
        len: payload.len(),
    })?;
    out.push(tag as u8);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

/// Append the wire form of `value` to `out`.
pub fn encode_old_value(value: &ExportedOldValue, out: &mut Vec<u8>) -> Result<(), WireError> {
    match value {
        ExportedOldValue::Absent => {
            out.push(OldValueTag::Absent as u8);
            Ok(())
        }
        ExportedOldValue::Raw(payload) => put_payload(out, OldValueTag::Raw, payload),
        ExportedOldValue::Serialized(payload) => put_payload(out, OldValueTag::Serialized, payload),
    }
}

/// Read one old-value field from the front of `bytes`; returns the value
/// and the unconsumed remainder. Never partially applied: any
/// inconsistency fails before anything is returned.
pub fn decode_old_value(bytes: &[u8]) -> Result<(ExportedOldValue, &[u8]), WireError> {
    let (&tag_byte, rest) = bytes
        .split_first()
        .ok_or(WireError::Truncated { need: 1, have: 0 })?;
    let tag = OldValueTag::from_u8(tag_byte).ok_or(WireError::UnknownDiscriminant(tag_byte))?;

    match tag {
        OldValueTag::Absent => Ok((ExportedOldValue::Absent, rest)),
        OldValueTag::Raw | OldValueTag::Serialized => {
            if rest.len() < 4 {
                return Err(WireError::Truncated {
                    need: 4,
                    have: rest.len(),
                });
            }
            let mut len_bytes = [0u8; 4];
            len_bytes.copy_from_slice(&rest[..4]);
            let len = u32::from_le_bytes(len_bytes) as usize;
            let rest = &rest[4..];
            if rest.len() < len {
                return Err(WireError::Truncated {
                    need: len,
                    have: rest.len(),
                });
            }
            let payload = rest[..len].to_vec();
            let value = match tag {
                OldValueTag::Raw => ExportedOldValue::Raw(payload),
                _ => ExportedOldValue::Serialized(payload),
            };
            Ok((value, &rest[len..]))
        }
    }
}
