//! Caching of remote objects.
//!
//! Reading through an [ObjectCacheEngine] downloads an object only if the local copy is missing or
//! stale. Freshness is decided with a single head request, comparing true content hashes if the
//! remote object carries one, and falling back to etag, size, and modification time otherwise.
//!
//! Besides in-memory payloads, objects can be uploaded from and downloaded to local files, as well
//! as read and written as UTF-8 text or JSON.

use crate::error::{CacheError, CacheResult, WithPath};
use crate::hash::{ContentHash, HASH_METADATA_KEY, hash_bytes, hash_file};
use crate::remote::{ObjectHead, ObjectMetadata, ObjectStore, RemoteError, RemoteObject};
use crate::store::meta::{CacheMetadataRecord, EntryOrigin, ObjectOrigin};
use crate::store::staged_file::write_atomically;
use crate::store::{LocalCacheStore, ResourceClass};
use crate::util::clock::{Clock, SystemClock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

const JSON_SUFFIX: &str = ".json";

/// What to do when the remote service fails while a cached copy exists.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorPolicy {
    /// Return the error.
    #[default]
    Propagate,
    /// Return the cached copy without validating it and log a warning.
    ServeCached,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectCacheOptions {
    pub on_remote_error: RemoteErrorPolicy,
    /// Accept matching etag, size, and modification time as proof of freshness for objects
    /// without an embedded content hash.
    pub metadata_fallback: bool,
}

impl Default for ObjectCacheOptions {
    fn default() -> Self {
        Self {
            on_remote_error: RemoteErrorPolicy::default(),
            metadata_fallback: true,
        }
    }
}

/// How the returned payload was validated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Validation {
    /// The remote content hash equals the hash of the cached payload.
    ContentHash,
    /// The remote object has no content hash, but etag, size, and modification time are unchanged.
    MetadataFallback,
    /// The payload was just downloaded.
    Fetched,
    /// The remote service failed and the cached payload was served anyway.
    Unverified,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadStatus {
    /// The payload was served from the local cache.
    pub cache_hit: bool,
    /// The local cache was updated.
    pub cache_write: bool,
    pub validation: Validation,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectRead {
    pub payload: Vec<u8>,
    pub status: ReadStatus,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Upload even if the remote object already has the same content hash.
    pub force: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteOutcome {
    pub content_hash: ContentHash,
    /// `false` if the upload was skipped because the remote content was already identical.
    pub uploaded: bool,
}

/// Identifies the content of a remote object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fingerprint {
    /// The content hash embedded in the object's metadata.
    Content(ContentHash),
    /// A hash over bucket, key, size, modification time, and etag. Changes whenever the object
    /// changes, but equal substitutes do not prove equal content.
    Substitute(ContentHash),
}

impl Fingerprint {
    pub fn hash(&self) -> &ContentHash {
        match self {
            Self::Content(hash) | Self::Substitute(hash) => hash,
        }
    }
}

/// A read-through, write-through cache in front of an [ObjectStore].
///
/// # Examples
///
/// ```rust
/// # use cloudstash::error::CacheResult;
/// use std::sync::Arc;
/// use cloudstash::object::{ObjectCacheEngine, ObjectCacheOptions, Validation};
/// use cloudstash::remote::in_memory::InMemoryObjectStore;
/// use cloudstash::store::LocalCacheStore;
///
/// # fn main() -> CacheResult<()> {
/// # let tempdir = tempfile::tempdir().unwrap();
/// let remote = InMemoryObjectStore::new();
/// remote.create_bucket("bucket");
/// let store = Arc::new(LocalCacheStore::open(tempdir.path())?);
/// let engine = ObjectCacheEngine::new(remote, store, ObjectCacheOptions::default());
///
/// engine.write("bucket", "hello.txt", b"hello")?;
/// let read = engine.read_with_status("bucket", "hello.txt")?;
/// assert_eq!(read.payload, b"hello");
/// assert_eq!(read.status.validation, Validation::ContentHash);
/// # Ok(())
/// # }
/// ```
pub struct ObjectCacheEngine<S: ObjectStore, C: Clock = SystemClock> {
    remote: S,
    store: Arc<LocalCacheStore<C>>,
    options: ObjectCacheOptions,
}

/// Key of the local cache entry holding `key` of `bucket`.
pub fn cache_key(bucket: &str, key: &str) -> String {
    format!("{bucket}/{key}")
}

/// Splits a key produced by [cache_key] into bucket and object key.
pub fn split_cache_key(cache_key: &str) -> Option<(&str, &str)> {
    cache_key.split_once('/')
}

/// Appends the `.json` suffix unless already present.
pub fn json_key(key: &str) -> String {
    if key.ends_with(JSON_SUFFIX) {
        key.to_string()
    } else {
        format!("{key}{JSON_SUFFIX}")
    }
}

fn origin_of(head: &ObjectHead) -> EntryOrigin {
    EntryOrigin::Object(ObjectOrigin {
        remote_hash: head.content_hash,
        etag: head.etag.clone(),
        size: head.size,
        last_modified: head.last_modified,
    })
}

impl<S: ObjectStore, C: Clock> ObjectCacheEngine<S, C> {
    pub fn new(remote: S, store: Arc<LocalCacheStore<C>>, options: ObjectCacheOptions) -> Self {
        Self {
            remote,
            store,
            options,
        }
    }

    pub fn remote(&self) -> &S {
        &self.remote
    }

    pub fn read(&self, bucket: &str, key: &str) -> CacheResult<Vec<u8>> {
        self.read_with_status(bucket, key).map(|read| read.payload)
    }

    /// Returns the current content of the object, from the local cache if it is still fresh.
    pub fn read_with_status(&self, bucket: &str, key: &str) -> CacheResult<ObjectRead> {
        let cache_key = cache_key(bucket, key);
        let Some(record) = self.store.get_metadata(ResourceClass::Objects, &cache_key) else {
            debug!(bucket, key, "cache miss");
            return self.fetch(bucket, key, &cache_key);
        };

        let head = match self.remote.head(bucket, key) {
            Ok(head) => head,
            Err(err) => return self.serve_cached_or_fail(&cache_key, err),
        };
        if self.validate(&record, &head).is_none() {
            debug!(bucket, key, "cached copy is stale");
            return self.fetch(bucket, key, &cache_key);
        }

        // The entry may have been replaced since its metadata was read.
        if let Some(entry) = self.store.get(ResourceClass::Objects, &cache_key)
            && let Some(validation) = self.validate(&entry.metadata, &head)
        {
            debug!(bucket, key, ?validation, "cache hit");
            return Ok(ObjectRead {
                payload: entry.payload,
                status: ReadStatus {
                    cache_hit: true,
                    cache_write: false,
                    validation,
                },
            });
        }
        debug!(bucket, key, "cached payload is gone, fetching");
        self.fetch(bucket, key, &cache_key)
    }

    fn validate(&self, record: &CacheMetadataRecord, head: &ObjectHead) -> Option<Validation> {
        let origin = record.object_origin()?;
        match head.content_hash {
            Some(remote_hash) => {
                (remote_hash == record.local_hash).then_some(Validation::ContentHash)
            }
            None => (self.options.metadata_fallback
                && head.etag == origin.etag
                && head.size == origin.size
                && head.last_modified == origin.last_modified)
                .then_some(Validation::MetadataFallback),
        }
    }

    fn fetch(&self, bucket: &str, key: &str, cache_key: &str) -> CacheResult<ObjectRead> {
        let RemoteObject { body, head } = self
            .remote
            .get(bucket, key)
            .map_err(|err| self.remote_error(cache_key, err))?;
        let local_hash = hash_bytes(&body);
        let status = ReadStatus {
            cache_hit: false,
            cache_write: true,
            validation: Validation::Fetched,
        };

        if let Some(remote_hash) = head.content_hash
            && remote_hash != local_hash
        {
            warn!(
                bucket,
                key,
                %remote_hash,
                %local_hash,
                "downloaded content does not match its embedded hash, not caching it"
            );
            return Ok(ObjectRead {
                payload: body,
                status: ReadStatus {
                    cache_write: false,
                    ..status
                },
            });
        }

        self.store
            .put(ResourceClass::Objects, cache_key, &body, origin_of(&head))?;
        info!(bucket, key, size = body.len(), "fetched object into cache");
        Ok(ObjectRead {
            payload: body,
            status,
        })
    }

    fn serve_cached_or_fail(
        &self,
        cache_key: &str,
        err: RemoteError,
    ) -> CacheResult<ObjectRead> {
        if self.options.on_remote_error == RemoteErrorPolicy::ServeCached
            && err.is_transient()
            && let Some(entry) = self.store.get(ResourceClass::Objects, cache_key)
        {
            warn!(key = cache_key, error = %err, "remote unavailable, serving cached copy");
            return Ok(ObjectRead {
                payload: entry.payload,
                status: ReadStatus {
                    cache_hit: true,
                    cache_write: false,
                    validation: Validation::Unverified,
                },
            });
        }
        Err(self.remote_error(cache_key, err))
    }

    /// Classifies a remote failure, dropping the local copy of objects that no longer exist.
    fn remote_error(&self, cache_key: &str, err: RemoteError) -> CacheError {
        if err == RemoteError::NotFound {
            if let Err(invalidate_err) = self.store.invalidate(ResourceClass::Objects, cache_key) {
                warn!(key = cache_key, error = %invalidate_err, "could not invalidate cache entry");
            }
        }
        CacheError::from_remote(cache_key, err)
    }

    pub fn write(&self, bucket: &str, key: &str, payload: &[u8]) -> CacheResult<WriteOutcome> {
        self.write_with(bucket, key, payload, WriteOptions::default())
    }

    /// Uploads `payload` with its content hash embedded and updates the local cache.
    ///
    /// Unless forced, the upload is skipped if the remote object already has the same content hash.
    pub fn write_with(
        &self,
        bucket: &str,
        key: &str,
        payload: &[u8],
        options: WriteOptions,
    ) -> CacheResult<WriteOutcome> {
        let cache_key = cache_key(bucket, key);
        let content_hash = hash_bytes(payload);

        if !options.force
            && let Some(head) = self.identical_remote(bucket, key, &cache_key, content_hash)?
        {
            self.store
                .put(ResourceClass::Objects, &cache_key, payload, origin_of(&head))?;
            return Ok(WriteOutcome {
                content_hash,
                uploaded: false,
            });
        }
        self.upload(bucket, key, &cache_key, payload, content_hash)
    }

    /// Uploads the file at `path` with its content hash embedded and updates the local cache.
    ///
    /// Unless forced, the file is hashed first and the upload is skipped if the remote object
    /// already has the same content hash.
    pub fn upload_file(
        &self,
        bucket: &str,
        key: &str,
        path: impl AsRef<Path>,
        options: WriteOptions,
    ) -> CacheResult<WriteOutcome> {
        let path = path.as_ref();
        let cache_key = cache_key(bucket, key);

        if !options.force {
            let content_hash = hash_file(path)?;
            if let Some(head) = self.identical_remote(bucket, key, &cache_key, content_hash)? {
                let cached = self
                    .store
                    .get_metadata(ResourceClass::Objects, &cache_key)
                    .is_some_and(|record| record.local_hash == content_hash);
                if !cached {
                    let payload = fs::read(path).with_path(path)?;
                    self.store
                        .put(ResourceClass::Objects, &cache_key, &payload, origin_of(&head))?;
                }
                return Ok(WriteOutcome {
                    content_hash,
                    uploaded: false,
                });
            }
        }

        // Hashed again in case the file changed in the meantime.
        let payload = fs::read(path).with_path(path)?;
        self.upload(bucket, key, &cache_key, &payload, hash_bytes(&payload))
    }

    /// Writes the current content of an object to `dest`, reading through the local cache.
    ///
    /// `dest` is replaced atomically, so it never holds a partial download.
    pub fn download_cached_to(
        &self,
        bucket: &str,
        key: &str,
        dest: impl AsRef<Path>,
    ) -> CacheResult<ReadStatus> {
        let dest = dest.as_ref();
        let read = self.read_with_status(bucket, key)?;
        if let Some(parent) = dest.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).with_path(parent)?;
        }
        write_atomically(dest, &read.payload).with_path(dest)?;
        debug!(bucket, key, dest = %dest.display(), "materialized object");
        Ok(read.status)
    }

    /// Returns the head of the remote object if it already has `content_hash`.
    fn identical_remote(
        &self,
        bucket: &str,
        key: &str,
        cache_key: &str,
        content_hash: ContentHash,
    ) -> CacheResult<Option<ObjectHead>> {
        match self.remote.head(bucket, key) {
            Ok(head) if head.content_hash == Some(content_hash) => {
                debug!(bucket, key, "remote content is identical, skipping upload");
                Ok(Some(head))
            }
            Ok(_) | Err(RemoteError::NotFound) => Ok(None),
            Err(err) => Err(CacheError::from_remote(cache_key, err)),
        }
    }

    fn upload(
        &self,
        bucket: &str,
        key: &str,
        cache_key: &str,
        payload: &[u8],
        content_hash: ContentHash,
    ) -> CacheResult<WriteOutcome> {
        let metadata = ObjectMetadata::from([(HASH_METADATA_KEY.to_string(), content_hash.to_hex())]);
        let head = self
            .remote
            .put(bucket, key, payload, &metadata)
            .map_err(|err| self.remote_error(cache_key, err))?;
        self.store
            .put(ResourceClass::Objects, cache_key, payload, origin_of(&head))?;
        info!(bucket, key, size = payload.len(), "uploaded object");
        Ok(WriteOutcome {
            content_hash,
            uploaded: true,
        })
    }

    /// Reads an object as UTF-8 text.
    pub fn read_string(&self, bucket: &str, key: &str) -> CacheResult<String> {
        let payload = self.read(bucket, key)?;
        String::from_utf8(payload).map_err(|source| CacheError::InvalidUtf8 {
            resource: cache_key(bucket, key),
            source,
        })
    }

    /// Reads an object as UTF-8 text split into lines, without line terminators.
    pub fn read_lines(&self, bucket: &str, key: &str) -> CacheResult<Vec<String>> {
        Ok(self
            .read_string(bucket, key)?
            .lines()
            .map(str::to_string)
            .collect())
    }

    pub fn write_string(&self, bucket: &str, key: &str, text: &str) -> CacheResult<WriteOutcome> {
        self.write(bucket, key, text.as_bytes())
    }

    /// Reads and deserializes a JSON object. The `.json` suffix is appended to `key` if missing.
    pub fn read_json<T: DeserializeOwned>(&self, bucket: &str, key: &str) -> CacheResult<T> {
        let key = json_key(key);
        let payload = self.read(bucket, &key)?;
        serde_json::from_slice(&payload).map_err(|source| CacheError::Serialization {
            resource: cache_key(bucket, &key),
            source,
        })
    }

    /// Serializes and writes a JSON object. The `.json` suffix is appended to `key` if missing.
    pub fn write_json<T: Serialize + ?Sized>(
        &self,
        bucket: &str,
        key: &str,
        value: &T,
    ) -> CacheResult<WriteOutcome> {
        let key = json_key(key);
        let payload = serde_json::to_vec(value).map_err(|source| CacheError::Serialization {
            resource: cache_key(bucket, &key),
            source,
        })?;
        self.write(bucket, &key, &payload)
    }

    /// Drops the local copy of an object.
    pub fn invalidate(&self, bucket: &str, key: &str) -> CacheResult<()> {
        self.store
            .invalidate(ResourceClass::Objects, &cache_key(bucket, key))
    }

    /// Deletes an object remotely and drops its local copy.
    pub fn delete(&self, bucket: &str, key: &str) -> CacheResult<()> {
        let cache_key = cache_key(bucket, key);
        self.remote
            .delete(bucket, key)
            .map_err(|err| self.remote_error(&cache_key, err))?;
        self.store.invalidate(ResourceClass::Objects, &cache_key)
    }

    /// Lists the keys in `bucket` starting with `prefix`, sorted.
    pub fn keys(&self, bucket: &str, prefix: &str) -> CacheResult<Vec<String>> {
        let mut keys = self
            .remote
            .list(bucket, prefix)
            .map_err(|err| CacheError::from_remote(bucket, err))?;
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    /// Identifies the current remote content of an object without downloading it.
    pub fn fingerprint(&self, bucket: &str, key: &str) -> CacheResult<Fingerprint> {
        let head = self
            .remote
            .head(bucket, key)
            .map_err(|err| self.remote_error(&cache_key(bucket, key), err))?;
        Ok(match head.content_hash {
            Some(hash) => Fingerprint::Content(hash),
            None => Fingerprint::Substitute(ContentHash::substitute(
                bucket,
                key,
                head.size,
                head.last_modified,
                &head.etag,
            )),
        })
    }
}
