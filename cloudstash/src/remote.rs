//! Capability interfaces of the remote collaborators the cache sits in front of.
//!
//! The cache engines only talk to an [ObjectStore] and a [TableService]. Real clients for a cloud
//! provider implement these traits outside of this crate; [in_memory] provides implementations
//! for tests and demonstrations, and [retry] wraps any implementation with retries of transient
//! failures.

use crate::hash::{ContentHash, HASH_METADATA_KEY};
use crate::value::{Item, KeySchema, KeyValue, PrimaryKey};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

pub mod in_memory;
pub mod retry;

pub type RemoteResult<T> = Result<T, RemoteError>;

/// An error reported by a remote collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// The bucket, object, table, or item does not exist.
    #[error("not found")]
    NotFound,
    /// A transient failure (network, throttling, timeouts). Worth retrying.
    #[error("service unavailable: {0}")]
    Unavailable(String),
    /// The call was cancelled before it completed.
    #[error("cancelled")]
    Cancelled,
    /// The request itself is invalid, e.g. an item without its key attributes.
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl RemoteError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable(reason.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// User-defined metadata attached to a remote object.
pub type ObjectMetadata = BTreeMap<String, String>;

/// Metadata of a remote object as returned by a lightweight head request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectHead {
    /// The true content hash, only present if the object was written with one embedded.
    pub content_hash: Option<ContentHash>,
    /// Vendor-assigned content identifier. Not necessarily a hash of the content.
    pub etag: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Extracts the embedded content hash from object metadata, ignoring malformed values.
pub fn content_hash_from_metadata(metadata: &ObjectMetadata) -> Option<ContentHash> {
    metadata
        .get(HASH_METADATA_KEY)
        .and_then(|hex| ContentHash::from_hex(hex).ok())
}

/// A fully downloaded remote object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteObject {
    pub body: Vec<u8>,
    pub head: ObjectHead,
}

/// Remote binary blob storage addressed by bucket and key.
pub trait ObjectStore {
    /// Returns the object's metadata without downloading it.
    fn head(&self, bucket: &str, key: &str) -> RemoteResult<ObjectHead>;

    /// Downloads the object together with its metadata.
    fn get(&self, bucket: &str, key: &str) -> RemoteResult<RemoteObject>;

    /// Uploads an object, replacing any existing one, and returns its new metadata.
    fn put(
        &self,
        bucket: &str,
        key: &str,
        body: &[u8],
        metadata: &ObjectMetadata,
    ) -> RemoteResult<ObjectHead>;

    fn delete(&self, bucket: &str, key: &str) -> RemoteResult<()>;

    /// Lists the keys in `bucket` starting with `prefix`.
    fn list(&self, bucket: &str, prefix: &str) -> RemoteResult<Vec<String>>;
}

/// Current state of a remote table as far as cache validation is concerned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableDescription {
    /// Item count statistic. Remote services may refresh it only every few hours.
    pub item_count: u64,
    /// Time of the latest modification, taken from a tracking record maintained alongside the
    /// table. `None` if the table was never modified through a tracked path.
    pub last_modified: Option<DateTime<Utc>>,
    pub key_schema: KeySchema,
}

/// Opaque continuation token of a paginated scan.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContinuationToken(pub String);

/// One page of a table scan.
#[derive(Clone, Debug, PartialEq)]
pub struct ScanPage {
    pub items: Vec<Item>,
    /// `None` once the scan is complete.
    pub next_token: Option<ContinuationToken>,
}

/// Remote document-oriented database addressed by table name and primary key.
pub trait TableService {
    fn describe(&self, table: &str) -> RemoteResult<TableDescription>;

    /// Returns the page following `token`, or the first page if `token` is `None`.
    fn scan_page(&self, table: &str, token: Option<&ContinuationToken>) -> RemoteResult<ScanPage>;

    fn put_item(&self, table: &str, item: Item) -> RemoteResult<()>;

    fn get_item(&self, table: &str, key: &PrimaryKey) -> RemoteResult<Item>;

    /// Returns all items with the given partition key value.
    fn query(&self, table: &str, partition: &KeyValue) -> RemoteResult<Vec<Item>>;
}
