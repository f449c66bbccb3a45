//! The metadata sidecar persisted next to each cached payload.
//!
//! Sidecars are small and serialized with `rkyv`, so validity checks never have to read the
//! potentially large payload.

use super::blob_id::BlobId;
use crate::hash::{CONTENT_HASH_SIZE, ContentHash};
use crate::value::KeySchema;
use chrono::{DateTime, Utc};
use rkyv::rancor;
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};

const META_VERSION: u16 = 1;

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
struct Timestamp {
    secs: i64,
    nsecs: u32,
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(value: DateTime<Utc>) -> Self {
        Self {
            secs: value.timestamp(),
            nsecs: value.timestamp_subsec_nanos(),
        }
    }
}

impl TryFrom<&Timestamp> for DateTime<Utc> {
    type Error = MetaError;

    fn try_from(value: &Timestamp) -> Result<Self, Self::Error> {
        DateTime::from_timestamp(value.secs, value.nsecs).ok_or(MetaError::InvalidTimestamp)
    }
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
enum OriginV1 {
    Object {
        remote_hash: Option<[u8; CONTENT_HASH_SIZE]>,
        etag: String,
        size: u64,
        last_modified: Timestamp,
    },
    Table {
        item_count: u64,
        table_mtime: Option<Timestamp>,
        partition_key: String,
        sort_key: Option<String>,
    },
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
struct MetaV1 {
    version: u16,
    key: String,
    blob_id: BlobId,
    payload_size: u64,
    payload_hash: [u8; CONTENT_HASH_SIZE],
    written_at: Timestamp,
    latest_access: Timestamp,
    origin: OriginV1,
}

/// Remote state observed when an object was cached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectOrigin {
    /// The content hash embedded in the remote object's metadata, if there was one.
    pub remote_hash: Option<ContentHash>,
    pub etag: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Remote state observed right before a table was scanned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableOrigin {
    pub item_count: u64,
    pub table_mtime: Option<DateTime<Utc>>,
    pub key_schema: KeySchema,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryOrigin {
    Object(ObjectOrigin),
    Table(TableOrigin),
}

/// Everything the cache knows about an entry without reading its payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheMetadataRecord {
    /// The logical key the entry was stored under.
    pub key: String,
    /// SHA-512 of the cached payload, computed when it was written.
    pub local_hash: ContentHash,
    pub payload_size: u64,
    pub written_at: DateTime<Utc>,
    pub latest_access: DateTime<Utc>,
    pub origin: EntryOrigin,
}

impl CacheMetadataRecord {
    pub fn object_origin(&self) -> Option<&ObjectOrigin> {
        match &self.origin {
            EntryOrigin::Object(origin) => Some(origin),
            EntryOrigin::Table(_) => None,
        }
    }

    pub fn table_origin(&self) -> Option<&TableOrigin> {
        match &self.origin {
            EntryOrigin::Table(origin) => Some(origin),
            EntryOrigin::Object(_) => None,
        }
    }
}

/// A decoded sidecar: the public record plus the location of the payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct StoredMeta {
    pub blob_id: BlobId,
    pub record: CacheMetadataRecord,
}

#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    #[error("unsupported metadata version {0}")]
    UnsupportedVersion(u16),
    #[error("metadata contains an out-of-range timestamp")]
    InvalidTimestamp,
    #[error("malformed metadata: {0}")]
    Malformed(String),
}

impl StoredMeta {
    pub fn encode(&self) -> Result<AlignedVec, MetaError> {
        let record = &self.record;
        let origin = match &record.origin {
            EntryOrigin::Object(origin) => OriginV1::Object {
                remote_hash: origin.remote_hash.map(|hash| *hash.as_bytes()),
                etag: origin.etag.clone(),
                size: origin.size,
                last_modified: origin.last_modified.into(),
            },
            EntryOrigin::Table(origin) => OriginV1::Table {
                item_count: origin.item_count,
                table_mtime: origin.table_mtime.map(Timestamp::from),
                partition_key: origin.key_schema.partition_key.clone(),
                sort_key: origin.key_schema.sort_key.clone(),
            },
        };
        let meta = MetaV1 {
            version: META_VERSION,
            key: record.key.clone(),
            blob_id: self.blob_id,
            payload_size: record.payload_size,
            payload_hash: *record.local_hash.as_bytes(),
            written_at: record.written_at.into(),
            latest_access: record.latest_access.into(),
            origin,
        };
        rkyv::to_bytes::<rancor::Error>(&meta).map_err(|err| MetaError::Malformed(err.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self, MetaError> {
        let mut aligned = AlignedVec::<16>::with_capacity(data.len());
        aligned.extend_from_slice(data);
        let meta = rkyv::from_bytes::<MetaV1, rancor::Error>(&aligned)
            .map_err(|err| MetaError::Malformed(err.to_string()))?;
        if meta.version != META_VERSION {
            return Err(MetaError::UnsupportedVersion(meta.version));
        }
        let origin = match &meta.origin {
            OriginV1::Object {
                remote_hash,
                etag,
                size,
                last_modified,
            } => EntryOrigin::Object(ObjectOrigin {
                remote_hash: remote_hash.map(ContentHash::from_bytes),
                etag: etag.clone(),
                size: *size,
                last_modified: last_modified.try_into()?,
            }),
            OriginV1::Table {
                item_count,
                table_mtime,
                partition_key,
                sort_key,
            } => EntryOrigin::Table(TableOrigin {
                item_count: *item_count,
                table_mtime: table_mtime.as_ref().map(DateTime::try_from).transpose()?,
                key_schema: KeySchema {
                    partition_key: partition_key.clone(),
                    sort_key: sort_key.clone(),
                },
            }),
        };
        Ok(Self {
            blob_id: meta.blob_id,
            record: CacheMetadataRecord {
                key: meta.key.clone(),
                local_hash: ContentHash::from_bytes(meta.payload_hash),
                payload_size: meta.payload_size,
                written_at: (&meta.written_at).try_into()?,
                latest_access: (&meta.latest_access).try_into()?,
                origin,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;

    fn timestamp(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339).unwrap().to_utc()
    }

    fn object_meta() -> StoredMeta {
        StoredMeta {
            blob_id: *b"0123456789012345",
            record: CacheMetadataRecord {
                key: "bucket/hello.txt".to_string(),
                local_hash: hash_bytes(b"hello"),
                payload_size: 5,
                written_at: timestamp("2025-01-24T20:47:33.123Z"),
                latest_access: timestamp("2025-01-25T08:00:00.5Z"),
                origin: EntryOrigin::Object(ObjectOrigin {
                    remote_hash: Some(hash_bytes(b"hello")),
                    etag: "abc".to_string(),
                    size: 5,
                    last_modified: timestamp("2025-01-24T20:47:32Z"),
                }),
            },
        }
    }

    #[test]
    fn test_object_meta_survives_encoding() {
        let meta = object_meta();
        let encoded = meta.encode().unwrap();
        assert_eq!(StoredMeta::decode(&encoded).unwrap(), meta);
    }

    #[test]
    fn test_table_meta_survives_encoding() {
        let meta = StoredMeta {
            blob_id: [7; 16],
            record: CacheMetadataRecord {
                key: "users".to_string(),
                local_hash: hash_bytes(b"[]"),
                payload_size: 2,
                written_at: timestamp("2025-01-24T20:47:33Z"),
                latest_access: timestamp("2025-01-24T20:47:33Z"),
                origin: EntryOrigin::Table(TableOrigin {
                    item_count: 0,
                    table_mtime: None,
                    key_schema: KeySchema::with_sort_key("user", "ts"),
                }),
            },
        };
        let encoded = meta.encode().unwrap();
        let decoded = StoredMeta::decode(&encoded).unwrap();
        assert_eq!(decoded, meta);
        assert!(decoded.record.object_origin().is_none());
        assert_eq!(decoded.record.table_origin().unwrap().item_count, 0);
    }

    #[test]
    fn test_decoding_garbage_fails() {
        assert!(StoredMeta::decode(b"definitely not rkyv").is_err());
        assert!(StoredMeta::decode(&[]).is_err());
    }

    #[test]
    fn test_decoding_truncated_data_fails() {
        let encoded = object_meta().encode().unwrap();
        assert!(StoredMeta::decode(&encoded[..encoded.len() / 2]).is_err());
    }
}
