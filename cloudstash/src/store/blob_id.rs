//! Types and utilities for working with blob IDs.

use crate::util::encoding::ICASE_NOPAD_ALPHANUMERIC_ENCODING;

/// The size of a [BlobId] in bytes.
pub const BLOB_ID_SIZE: usize = 16;

/// A unique identifier for a payload blob in the cache.
///
/// Every write goes to a fresh blob, so readers of the previous entry are never affected.
pub type BlobId = [u8; BLOB_ID_SIZE];

pub fn new_blob_id() -> BlobId {
    rand::random()
}

pub fn encode_blob_id(blob_id: &BlobId) -> String {
    ICASE_NOPAD_ALPHANUMERIC_ENCODING.encode(blob_id)
}

/// Decodes a blob ID from its encoded form, returning `None` for anything else.
pub fn decode_blob_id(encoded: &str) -> Option<BlobId> {
    ICASE_NOPAD_ALPHANUMERIC_ENCODING
        .decode(encoded.as_bytes())
        .ok()?
        .try_into()
        .ok()
}
