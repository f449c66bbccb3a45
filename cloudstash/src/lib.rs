//! `cloudstash` is a local caching layer in front of remote object stores and document tables.
//!
//! Repeatedly reading the same object or scanning the same table is slow and costly. `cloudstash`
//! keeps a copy on the local disk and uses cheap metadata requests to decide whether that copy is
//! still fresh:
//!
//! - **Objects**: The [object::ObjectCacheEngine] compares a content hash embedded in the remote
//!   object's metadata with the hash of the cached payload. Objects written by other tools lack
//!   that hash; for those, an unchanged etag, size, and modification time count as fresh.
//! - **Tables**: The [table::TableScanCacheEngine] caches full scans and only rescans if the item
//!   count or the modification time of the table changed.
//!
//! Both engines store their entries in a [store::LocalCacheStore]. Remote services are reached
//! through the [remote::ObjectStore] and [remote::TableService] traits. A [context::CacheContext]
//! ties everything together based on the [config::CacheSettings].

pub mod config;
pub mod context;
pub mod error;
pub mod hash;
pub mod object;
pub mod remote;
pub mod store;
pub mod table;
pub mod value;

pub mod util {
    //! Collects traits, functions, etc. that are not directly related to the main concepts of
    //! `cloudstash`.

    pub mod cancel;
    pub mod clock;
    pub mod close;
    pub(crate) mod encoding;
    pub mod humanbytes;
}
