//! Ties the local store, the settings, and remote collaborators together.

use crate::config::CacheSettings;
use crate::error::CacheResult;
use crate::object::ObjectCacheEngine;
use crate::remote::retry::Retrying;
use crate::remote::{ObjectStore, TableService};
use crate::store::{CleanStats, LocalCacheStore};
use crate::table::TableScanCacheEngine;
use crate::util::clock::{Clock, SystemClock};
use std::sync::Arc;

/// A cache directory together with the settings to use it with.
///
/// Create one per process (or per test) and hand out engines from it. All engines created from the
/// same context share the local store.
///
/// # Examples
///
/// ```rust
/// use cloudstash::config::{ConfigLoader, CacheSettings};
/// use cloudstash::context::CacheContext;
/// use cloudstash::remote::in_memory::InMemoryObjectStore;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// # let tempdir = tempfile::tempdir().unwrap();
/// let mut config = ConfigLoader::new().load()?;
/// config.cache_dir = tempdir.path().display().to_string();
/// let context = CacheContext::open(CacheSettings::try_from(config)?)?;
///
/// let remote = InMemoryObjectStore::new();
/// remote.create_bucket("bucket");
/// let objects = context.object_engine(remote);
/// objects.write("bucket", "greeting.txt", b"Hello, world!")?;
/// assert_eq!(objects.read("bucket", "greeting.txt")?, b"Hello, world!");
///
/// context.purge()?;
/// # Ok(())
/// # }
/// ```
pub struct CacheContext<C: Clock = SystemClock> {
    store: Arc<LocalCacheStore<C>>,
    settings: CacheSettings,
}

impl CacheContext<SystemClock> {
    /// Opens the cache directory named in `settings`.
    pub fn open(settings: CacheSettings) -> CacheResult<Self> {
        let store = Arc::new(LocalCacheStore::open(&settings.cache_dir)?);
        Ok(Self::with_store(store, settings))
    }
}

impl<C: Clock> CacheContext<C> {
    /// Uses an already opened `store`. The `cache_dir` of `settings` is ignored.
    pub fn with_store(store: Arc<LocalCacheStore<C>>, settings: CacheSettings) -> Self {
        Self { store, settings }
    }

    pub fn store(&self) -> &Arc<LocalCacheStore<C>> {
        &self.store
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Returns an engine caching objects from `remote`, retrying transient failures.
    pub fn object_engine<S: ObjectStore>(&self, remote: S) -> ObjectCacheEngine<Retrying<S>, C> {
        ObjectCacheEngine::new(
            Retrying::new(remote, self.settings.retry.clone()),
            Arc::clone(&self.store),
            self.settings.object_options(),
        )
    }

    /// Returns an engine caching scans of tables in `remote`, retrying transient failures.
    pub fn table_engine<S: TableService>(
        &self,
        remote: S,
    ) -> TableScanCacheEngine<Retrying<S>, C> {
        TableScanCacheEngine::new(
            Retrying::new(remote, self.settings.retry.clone()),
            Arc::clone(&self.store),
            self.settings.table_options(),
        )
    }

    /// Removes leftover temporary files and evicts entries according to the configured limits.
    pub fn clean(&self) -> CacheResult<CleanStats> {
        self.store.clean_leftover_tmp_files()?;
        self.store.clean(&self.settings.eviction)
    }

    /// Removes all cached entries.
    pub fn purge(&self) -> CacheResult<()> {
        self.store.purge()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::RemoteErrorPolicy;
    use crate::remote::RemoteError;
    use crate::remote::in_memory::{InMemoryObjectStore, InMemoryTableService};
    use crate::remote::retry::RetryPolicy;
    use crate::store::ResourceClass;
    use crate::store::eviction::LruPolicy;
    use crate::util::clock::test_fakes::ControlledClock;
    use crate::value::{KeySchema, item};
    use chrono::TimeDelta;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    fn settings(tempdir: &TempDir) -> CacheSettings {
        CacheSettings {
            cache_dir: tempdir.path().to_path_buf(),
            table_cache_life: None,
            eviction: LruPolicy {
                max_unused_age: Some(TimeDelta::days(7)),
                ..LruPolicy::default()
            },
            on_remote_error: RemoteErrorPolicy::Propagate,
            metadata_fallback: true,
            retry: RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
                multiplier: 1.0,
                jitter: false,
            },
        }
    }

    #[test]
    fn test_engines_share_the_store() {
        let tempdir = tempdir().unwrap();
        let context = CacheContext::open(settings(&tempdir)).unwrap();

        let objects = InMemoryObjectStore::new();
        objects.create_bucket("bucket");
        context
            .object_engine(objects)
            .write("bucket", "key", b"payload")
            .unwrap();

        let tables = InMemoryTableService::new();
        tables.create_table("table", KeySchema::partition_only("id"));
        tables.put_item("table", item([("id", "a")])).unwrap();
        tables.refresh_statistics("table").unwrap();
        context.table_engine(tables).scan("table").unwrap();

        assert_eq!(context.store().entries(ResourceClass::Objects).unwrap().len(), 1);
        assert_eq!(context.store().entries(ResourceClass::Tables).unwrap().len(), 1);
    }

    #[test]
    fn test_engines_retry_transient_failures() {
        let tempdir = tempdir().unwrap();
        let context = CacheContext::open(settings(&tempdir)).unwrap();
        let remote = InMemoryObjectStore::new();
        remote.create_bucket("bucket");
        let engine = context.object_engine(remote.clone());
        engine.write("bucket", "key", b"payload").unwrap();
        engine.invalidate("bucket", "key").unwrap();

        remote.fail_next_calls(2, RemoteError::unavailable("throttled"));
        assert_eq!(engine.read("bucket", "key").unwrap(), b"payload");
    }

    #[test]
    fn test_clean_applies_configured_eviction() {
        let tempdir = tempdir().unwrap();
        let clock = ControlledClock::default();
        let store = Arc::new(LocalCacheStore::with_clock(tempdir.path(), clock.clone()).unwrap());
        let context = CacheContext::with_store(store, settings(&tempdir));
        let remote = InMemoryObjectStore::new();
        remote.create_bucket("bucket");
        let engine = context.object_engine(remote);
        engine.write("bucket", "old", b"old").unwrap();
        clock.advance_by(TimeDelta::days(8));
        engine.write("bucket", "new", b"new").unwrap();

        let stats = context.clean().unwrap();
        assert_eq!(stats.evicted_entries, 1);
        let keys: Vec<_> = context
            .store()
            .entries(ResourceClass::Objects)
            .unwrap()
            .into_iter()
            .map(|record| record.key)
            .collect();
        assert_eq!(keys, vec!["bucket/new"]);
    }

    #[test]
    fn test_purge_removes_all_entries() {
        let tempdir = tempdir().unwrap();
        let context = CacheContext::open(settings(&tempdir)).unwrap();
        let remote = InMemoryObjectStore::new();
        remote.create_bucket("bucket");
        context
            .object_engine(remote)
            .write("bucket", "key", b"payload")
            .unwrap();

        context.purge().unwrap();
        assert!(context.store().entries(ResourceClass::Objects).unwrap().is_empty());
    }
}
