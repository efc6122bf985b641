//! Broadcast framing.
//!
//! A frame is a 4-byte little-endian type tag followed by the encoded record.
//! Consumers read the tag first to pick the decoding type.

use crate::error::{Result, StoreError};
use crate::records::StoredRecord;
use crate::registry::TypeRegistry;
use crate::types::TypeTag;

const TAG_LEN: usize = 4;

/// Prefix `payload` with `tag`.
pub fn encode_frame(tag: TypeTag, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(TAG_LEN + payload.len());
    frame.extend_from_slice(&tag.to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Split a frame into its tag and payload. The tag must be registered.
pub fn decode_frame<'a>(registry: &TypeRegistry, frame: &'a [u8]) -> Result<(TypeTag, &'a [u8])> {
    if frame.len() < TAG_LEN {
        return Err(StoreError::InvalidFormat(format!(
            "frame of {} bytes has no type tag",
            frame.len()
        )));
    }

    let (head, payload) = frame.split_at(TAG_LEN);
    let tag = TypeTag::from_le_bytes([head[0], head[1], head[2], head[3]]);
    if !registry.contains(tag) {
        return Err(StoreError::UnknownTag(tag));
    }
    Ok((tag, payload))
}

/// Frame a record for broadcast.
pub fn encode_record(record: &StoredRecord) -> Result<Vec<u8>> {
    Ok(encode_frame(record.tag, &record.encode()?))
}

/// Decode a framed record, checking that the payload matches its tag.
pub fn decode_record(registry: &TypeRegistry, frame: &[u8]) -> Result<StoredRecord> {
    let (tag, payload) = decode_frame(registry, frame)?;
    let record = StoredRecord::decode(payload)?;
    if record.tag != tag {
        return Err(StoreError::Corruption(format!(
            "frame tagged {tag} carries a record tagged {}",
            record.tag
        )));
    }
    Ok(record)
}
