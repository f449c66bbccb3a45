//! The local, on-disk part of the cache.
//!
//! [LocalCacheStore] exclusively owns all cache files. Each entry consists of a payload blob and a
//! metadata sidecar:
//!
//! ```text
//! <root>/<class>/meta/<2 chars>/<encoded key hash>    sidecar
//! <root>/<class>/blob/<2 chars>/<encoded blob id>     payload
//! ```
//!
//! Every write goes to a fresh blob that is committed by an atomic rename before the sidecar
//! pointing to it is replaced the same way. Thus, readers observe either the complete previous
//! entry or the complete new one.

mod blob_id;
pub mod eviction;
mod key_lock;
pub mod meta;
pub(crate) mod staged_file;

use crate::error::{CacheResult, IoPathError, IoPathResult, WithPath};
use crate::hash::hash_bytes;
use crate::util::clock::{Clock, SystemClock};
use crate::util::encoding::ICASE_NOPAD_ALPHANUMERIC_ENCODING;
use blob_id::{BlobId, decode_blob_id, encode_blob_id, new_blob_id};
use chrono::{DateTime, TimeDelta, Utc};
use eviction::{EvictionCandidate, EvictionContext, EvictionPolicy};
use key_lock::KeyLocks;
use meta::{CacheMetadataRecord, EntryOrigin, StoredMeta};
use staged_file::{is_tmp_file_name, write_atomically};
use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Blobs not referenced by any sidecar are only removed once they are older than this, so that
/// blobs of writes in progress are left alone.
const ORPHAN_BLOB_GRACE_PERIOD: TimeDelta = TimeDelta::hours(1);

/// Separate namespaces of cache entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceClass {
    Objects,
    Tables,
}

impl ResourceClass {
    pub const ALL: [ResourceClass; 2] = [ResourceClass::Objects, ResourceClass::Tables];

    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Objects => "objects",
            Self::Tables => "tables",
        }
    }
}

impl Display for ResourceClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// A complete cache entry as read from disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredEntry {
    pub payload: Vec<u8>,
    pub metadata: CacheMetadataRecord,
}

/// Result of [LocalCacheStore::clean].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CleanStats {
    pub evicted_entries: usize,
    pub freed_bytes: u64,
    pub remaining_entries: usize,
    pub remaining_bytes: u64,
}

/// Local file system storage of cache entries.
///
/// Safe to use from multiple threads: writes and invalidations of a key are serialized, while
/// reads of a key may happen concurrently with each other. Multiple processes may share a cache
/// directory, but only atomic renames protect them from each other, so the last writer wins.
///
/// # Examples
///
/// ```rust
/// # use cloudstash::error::CacheResult;
/// use chrono::{DateTime, Utc};
/// use cloudstash::store::{LocalCacheStore, ResourceClass};
/// use cloudstash::store::meta::{EntryOrigin, ObjectOrigin};
///
/// # fn main() -> CacheResult<()> {
/// # let tempdir = tempfile::tempdir().unwrap();
/// let store = LocalCacheStore::open(tempdir.path())?;
/// let origin = EntryOrigin::Object(ObjectOrigin {
///     remote_hash: None,
///     etag: "etag".to_string(),
///     size: 13,
///     last_modified: DateTime::<Utc>::UNIX_EPOCH,
/// });
/// store.put(ResourceClass::Objects, "bucket/key", b"Hello, world!", origin)?;
/// let entry = store.get(ResourceClass::Objects, "bucket/key").unwrap();
/// assert_eq!(entry.payload, b"Hello, world!");
/// # Ok(())
/// # }
/// ```
pub struct LocalCacheStore<C: Clock = SystemClock> {
    root: PathBuf,
    clock: C,
    locks: KeyLocks,
}

impl LocalCacheStore<SystemClock> {
    /// Opens the cache in the `root` directory, creating it if necessary.
    pub fn open(root: impl Into<PathBuf>) -> CacheResult<Self> {
        Self::with_clock(root, SystemClock)
    }
}

impl<C: Clock> LocalCacheStore<C> {
    pub fn with_clock(root: impl Into<PathBuf>, clock: C) -> CacheResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).with_path(&root)?;
        Ok(Self {
            root,
            clock,
            locks: KeyLocks::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Returns the path of the sidecar of `key`.
    ///
    /// The file name is derived from a hash of the key, so that arbitrary keys map to valid file
    /// names.
    pub fn resolve_path(&self, class: ResourceClass, key: &str) -> PathBuf {
        let hash = ICASE_NOPAD_ALPHANUMERIC_ENCODING.encode(blake3::hash(key.as_bytes()).as_bytes());
        self.class_dir(class, "meta").join(&hash[..2]).join(&hash[2..])
    }

    fn blob_path(&self, class: ResourceClass, blob_id: &BlobId) -> PathBuf {
        let blob_id = encode_blob_id(blob_id);
        self.class_dir(class, "blob").join(&blob_id[..2]).join(&blob_id[2..])
    }

    fn class_dir(&self, class: ResourceClass, kind: &str) -> PathBuf {
        self.root.join(class.dir_name()).join(kind)
    }

    /// Returns the entry stored under `key` without any remote interaction.
    ///
    /// Entries that cannot be read completely or whose payload does not match the recorded hash
    /// are treated as absent.
    pub fn get(&self, class: ResourceClass, key: &str) -> Option<StoredEntry> {
        let meta_path = self.resolve_path(class, key);
        let lock = self.locks.get(&meta_path);
        let _guard = lock.read();

        let mut meta = self.read_meta(&meta_path, key)?;
        let blob_path = self.blob_path(class, &meta.blob_id);
        let payload = match fs::read(&blob_path) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%class, key, path = %blob_path.display(), error = %err, "cache entry without readable payload, treating as miss");
                return None;
            }
        };
        if payload.len() as u64 != meta.record.payload_size
            || hash_bytes(&payload) != meta.record.local_hash
        {
            warn!(%class, key, "cached payload does not match its recorded hash, treating as miss");
            return None;
        }

        meta.record.latest_access = self.clock.now();
        if let Err(err) = self.write_meta(&meta_path, &meta) {
            debug!(%class, key, error = %err, "could not update latest access time");
        }
        Some(StoredEntry {
            payload,
            metadata: meta.record,
        })
    }

    /// Returns the metadata of the entry stored under `key` without reading its payload.
    pub fn get_metadata(&self, class: ResourceClass, key: &str) -> Option<CacheMetadataRecord> {
        let meta_path = self.resolve_path(class, key);
        let lock = self.locks.get(&meta_path);
        let _guard = lock.read();
        self.read_meta(&meta_path, key).map(|meta| meta.record)
    }

    /// Atomically replaces the entry stored under `key`.
    pub fn put(
        &self,
        class: ResourceClass,
        key: &str,
        payload: &[u8],
        origin: EntryOrigin,
    ) -> CacheResult<CacheMetadataRecord> {
        let meta_path = self.resolve_path(class, key);
        let lock = self.locks.get(&meta_path);
        let _guard = lock.write();

        let previous_blob = self.read_meta_quietly(&meta_path).map(|meta| meta.blob_id);
        let now = self.clock.now();
        let meta = StoredMeta {
            blob_id: new_blob_id(),
            record: CacheMetadataRecord {
                key: key.to_string(),
                local_hash: hash_bytes(payload),
                payload_size: payload.len() as u64,
                written_at: now,
                latest_access: now,
                origin,
            },
        };

        let blob_path = self.blob_path(class, &meta.blob_id);
        create_parent_dir(&blob_path)?;
        write_atomically(&blob_path, payload).with_path(&blob_path)?;
        if let Err(err) =
            create_parent_dir(&meta_path).and_then(|_| self.write_meta(&meta_path, &meta))
        {
            remove_file_if_exists(&blob_path)?;
            return Err(err.into());
        }
        if let Some(previous_blob) = previous_blob {
            remove_file_if_exists(&self.blob_path(class, &previous_blob))?;
        }

        info!(%class, key, size = payload.len(), "committed cache entry");
        Ok(meta.record)
    }

    /// Removes the entry stored under `key`, if any.
    pub fn invalidate(&self, class: ResourceClass, key: &str) -> CacheResult<()> {
        let meta_path = self.resolve_path(class, key);
        let lock = self.locks.get(&meta_path);
        let _guard = lock.write();

        let blob_id = self.read_meta_quietly(&meta_path).map(|meta| meta.blob_id);
        if remove_file_if_exists(&meta_path)? {
            debug!(%class, key, "invalidated cache entry");
        }
        if let Some(blob_id) = blob_id {
            remove_file_if_exists(&self.blob_path(class, &blob_id))?;
        }
        Ok(())
    }

    /// Returns the metadata of all readable entries of `class`, ordered by key.
    pub fn entries(&self, class: ResourceClass) -> CacheResult<Vec<CacheMetadataRecord>> {
        let mut entries: Vec<_> = self
            .stored_metas(class)?
            .into_iter()
            .map(|(_, meta)| meta.record)
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    /// Removes the entries selected by `policy` across all resource classes.
    ///
    /// Also removes sidecars whose payload is missing and stale blobs no sidecar refers to.
    pub fn clean(&self, policy: &dyn EvictionPolicy) -> CacheResult<CleanStats> {
        let mut candidates = vec![];
        for class in ResourceClass::ALL {
            let metas = self.stored_metas(class)?;
            let referenced: HashSet<BlobId> = metas.iter().map(|(_, meta)| meta.blob_id).collect();
            for (meta_path, meta) in metas {
                let blob_path = self.blob_path(class, &meta.blob_id);
                match fs::metadata(&blob_path) {
                    Ok(blob) => candidates.push(EvictionCandidate {
                        class,
                        key: meta.record.key,
                        size: blob.len(),
                        latest_access: meta.record.latest_access,
                        blob_id: meta.blob_id,
                    }),
                    Err(err) if err.kind() == ErrorKind::NotFound => {
                        debug!(%class, key = meta.record.key, "removing sidecar without payload");
                        let lock = self.locks.get(&meta_path);
                        let _guard = lock.write();
                        if self.read_meta_quietly(&meta_path).map(|m| m.blob_id) == Some(meta.blob_id) {
                            remove_file_if_exists(&meta_path)?;
                        }
                    }
                    Err(err) => return Err(IoPathError::new(err, blob_path).into()),
                }
            }
            self.remove_orphan_blobs(class, &referenced)?;
        }

        let context = EvictionContext {
            now: self.clock.now(),
            available_space: fs2::available_space(&self.root).ok(),
        };
        let total_entries = candidates.len();
        let total_bytes: u64 = candidates.iter().map(|candidate| candidate.size).sum();
        let mut stats = CleanStats::default();
        for candidate in policy.select(candidates, &context) {
            if self.evict(&candidate)? {
                stats.evicted_entries += 1;
                stats.freed_bytes += candidate.size;
            }
        }
        stats.remaining_entries = total_entries - stats.evicted_entries;
        stats.remaining_bytes = total_bytes - stats.freed_bytes;
        info!(
            evicted = stats.evicted_entries,
            freed_bytes = stats.freed_bytes,
            remaining = stats.remaining_entries,
            "cleaned cache"
        );
        Ok(stats)
    }

    /// Removes an entry selected for eviction unless it was replaced in the meantime.
    fn evict(&self, candidate: &EvictionCandidate) -> CacheResult<bool> {
        let meta_path = self.resolve_path(candidate.class, &candidate.key);
        let lock = self.locks.get(&meta_path);
        let _guard = lock.write();
        let current = self.read_meta_quietly(&meta_path);
        if current.as_ref().map(|meta| meta.blob_id) != Some(candidate.blob_id) {
            return Ok(false);
        }
        remove_file_if_exists(&meta_path)?;
        remove_file_if_exists(&self.blob_path(candidate.class, &candidate.blob_id))?;
        debug!(class = %candidate.class, key = candidate.key, "evicted cache entry");
        Ok(true)
    }

    fn remove_orphan_blobs(&self, class: ResourceClass, referenced: &HashSet<BlobId>) -> CacheResult<()> {
        let cutoff = self.clock.now() - ORPHAN_BLOB_GRACE_PERIOD;
        for (path, name) in subdir_files(&self.class_dir(class, "blob"))? {
            let Some(blob_id) = decode_blob_id(&name) else {
                continue;
            };
            if referenced.contains(&blob_id) {
                continue;
            }
            let modified = fs::metadata(&path)
                .and_then(|metadata| metadata.modified())
                .with_path(&path)?;
            if DateTime::<Utc>::from(modified) < cutoff {
                debug!(%class, path = %path.display(), "removing orphaned blob");
                remove_file_if_exists(&path)?;
            }
        }
        Ok(())
    }

    /// Removes temporary files left behind by processes killed while writing to the cache.
    pub fn clean_leftover_tmp_files(&self) -> CacheResult<usize> {
        let removed = staged_file::clean_leftover_tmp_files(&self.root).with_path(&self.root)?;
        if removed > 0 {
            info!(removed, "removed leftover temporary files");
        }
        Ok(removed)
    }

    /// Removes all cache entries of all resource classes.
    pub fn purge(&self) -> CacheResult<()> {
        for class in ResourceClass::ALL {
            let path = self.root.join(class.dir_name());
            match fs::remove_dir_all(&path) {
                Err(err) if err.kind() != ErrorKind::NotFound => {
                    return Err(IoPathError::new(err, path).into());
                }
                _ => {}
            }
        }
        info!(root = %self.root.display(), "purged cache");
        Ok(())
    }

    fn stored_metas(&self, class: ResourceClass) -> CacheResult<Vec<(PathBuf, StoredMeta)>> {
        let mut metas = vec![];
        for (path, _) in subdir_files(&self.class_dir(class, "meta"))? {
            if let Some(meta) = self.read_meta_quietly(&path) {
                metas.push((path, meta));
            } else {
                warn!(%class, path = %path.display(), "skipping unreadable cache metadata");
            }
        }
        Ok(metas)
    }

    fn read_meta(&self, path: &Path, key: &str) -> Option<StoredMeta> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(key, path = %path.display(), error = %err, "could not read cache metadata, treating as miss");
                return None;
            }
        };
        match StoredMeta::decode(&data) {
            Ok(meta) if meta.record.key == key => Some(meta),
            Ok(meta) => {
                warn!(key, stored_key = meta.record.key, "cache metadata belongs to another key, treating as miss");
                None
            }
            Err(err) => {
                warn!(key, path = %path.display(), error = %err, "corrupt cache metadata, treating as miss");
                None
            }
        }
    }

    fn read_meta_quietly(&self, path: &Path) -> Option<StoredMeta> {
        fs::read(path)
            .ok()
            .and_then(|data| StoredMeta::decode(&data).ok())
    }

    fn write_meta(&self, path: &Path, meta: &StoredMeta) -> IoPathResult<()> {
        let data = meta
            .encode()
            .map_err(std::io::Error::other)
            .with_path(path)?;
        write_atomically(path, &data).with_path(path)
    }

    #[cfg(test)]
    pub(crate) fn blob_paths(&self, class: ResourceClass) -> Vec<PathBuf> {
        subdir_files(&self.class_dir(class, "blob"))
            .unwrap()
            .into_iter()
            .map(|(path, _)| path)
            .collect()
    }
}

fn create_parent_dir(path: &Path) -> IoPathResult<()> {
    match path.parent() {
        Some(parent) => fs::create_dir_all(parent).with_path(parent),
        None => Ok(()),
    }
}

/// Removes a file, returning whether it existed.
fn remove_file_if_exists(path: &Path) -> IoPathResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_path(path),
    }
}

/// Lists the files in the subdirectories of `dir` as `(path, subdir name + file name)`, skipping
/// temporary files.
fn subdir_files(dir: &Path) -> IoPathResult<Vec<(PathBuf, String)>> {
    let subdirs = match fs::read_dir(dir) {
        Ok(subdirs) => subdirs,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(vec![]),
        Err(err) => return Err(err).with_path(dir),
    };
    let mut files = vec![];
    for subdir in subdirs {
        let subdir = subdir.with_path(dir)?;
        if !subdir.file_type().with_path(subdir.path())?.is_dir() {
            continue;
        }
        let subdir_path = subdir.path();
        for entry in fs::read_dir(&subdir_path).with_path(&subdir_path)? {
            let entry = entry.with_path(&subdir_path)?;
            if !entry.file_type().with_path(entry.path())?.is_file()
                || is_tmp_file_name(&entry.file_name())
            {
                continue;
            }
            let name = format!(
                "{}{}",
                subdir.file_name().to_string_lossy(),
                entry.file_name().to_string_lossy()
            );
            files.push((entry.path(), name));
        }
    }
    Ok(files)
}
