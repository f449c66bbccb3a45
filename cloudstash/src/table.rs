//! Caching of full table scans.
//!
//! Scanning a large table is slow and costly, so a [TableScanCacheEngine] keeps the result of the
//! latest scan and only rescans if the table changed. Because the item count reported by
//! document databases is a statistic updated only every few hours, a change is detected if the
//! item count differs OR the modification time from the table's tracking record is newer than
//! the cached one.

use crate::error::{CacheError, CacheResult};
use crate::object::RemoteErrorPolicy;
use crate::remote::{ContinuationToken, RemoteError, TableDescription, TableService};
use crate::store::meta::{CacheMetadataRecord, EntryOrigin, TableOrigin};
use crate::store::{LocalCacheStore, ResourceClass};
use crate::util::cancel::CancelToken;
use crate::util::clock::{Clock, SystemClock};
use crate::value::{Item, KeySchema, PrimaryKey};
use chrono::TimeDelta;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableCacheOptions {
    /// Maximum age of a cached scan, regardless of whether the table changed.
    pub cache_life: Option<TimeDelta>,
    pub on_remote_error: RemoteErrorPolicy,
}

#[derive(Clone, Debug, Default)]
pub struct ScanOptions {
    /// Rescan even if the cached scan is still valid.
    pub force_refresh: bool,
    /// Checked before requesting each page and once more before committing the scan.
    pub cancel: Option<CancelToken>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ScanOutcome {
    pub items: Vec<Item>,
    /// The items were served from the local cache.
    pub cache_hit: bool,
}

/// A cache of full scans of tables in a [TableService].
///
/// # Examples
///
/// ```rust
/// # use cloudstash::error::CacheResult;
/// use std::sync::Arc;
/// use cloudstash::remote::TableService;
/// use cloudstash::remote::in_memory::InMemoryTableService;
/// use cloudstash::store::LocalCacheStore;
/// use cloudstash::table::{TableCacheOptions, TableScanCacheEngine};
/// use cloudstash::value::{KeySchema, item};
///
/// # fn main() -> CacheResult<()> {
/// # let tempdir = tempfile::tempdir().unwrap();
/// let remote = InMemoryTableService::new();
/// remote.create_table("users", KeySchema::partition_only("name"));
/// remote.put_item("users", item([("name", "alice")])).unwrap();
/// remote.refresh_statistics("users").unwrap();
///
/// let store = Arc::new(LocalCacheStore::open(tempdir.path())?);
/// let engine = TableScanCacheEngine::new(remote, store, TableCacheOptions::default());
/// assert_eq!(engine.scan("users")?.len(), 1);
/// # Ok(())
/// # }
/// ```
pub struct TableScanCacheEngine<S: TableService, C: Clock = SystemClock> {
    remote: S,
    store: Arc<LocalCacheStore<C>>,
    options: TableCacheOptions,
}

impl<S: TableService, C: Clock> TableScanCacheEngine<S, C> {
    pub fn new(remote: S, store: Arc<LocalCacheStore<C>>, options: TableCacheOptions) -> Self {
        Self {
            remote,
            store,
            options,
        }
    }

    pub fn remote(&self) -> &S {
        &self.remote
    }

    /// Returns all items of `table` in scan order.
    pub fn scan(&self, table: &str) -> CacheResult<Vec<Item>> {
        self.scan_with(table, &ScanOptions::default())
            .map(|outcome| outcome.items)
    }

    pub fn scan_with(&self, table: &str, options: &ScanOptions) -> CacheResult<ScanOutcome> {
        self.scan_with_schema(table, options)
            .map(|(outcome, _)| outcome)
    }

    /// Returns all items of `table` keyed and ordered by their primary key.
    pub fn scan_as_map(&self, table: &str) -> CacheResult<BTreeMap<PrimaryKey, Item>> {
        let (outcome, key_schema) = self.scan_with_schema(table, &ScanOptions::default())?;
        outcome
            .items
            .into_iter()
            .map(|item| {
                let key = key_schema
                    .primary_key(&item)
                    .map_err(|reason| CacheError::InvalidItem {
                        table: table.to_string(),
                        reason,
                    })?;
                Ok((key, item))
            })
            .collect()
    }

    /// Drops the cached scan of `table`.
    pub fn invalidate(&self, table: &str) -> CacheResult<()> {
        self.store.invalidate(ResourceClass::Tables, table)
    }

    fn scan_with_schema(
        &self,
        table: &str,
        options: &ScanOptions,
    ) -> CacheResult<(ScanOutcome, KeySchema)> {
        let cached = if options.force_refresh {
            None
        } else {
            self.store.get_metadata(ResourceClass::Tables, table)
        };

        let description = match self.remote.describe(table) {
            Ok(description) => description,
            Err(err) => return self.serve_cached_or_fail(table, cached, err),
        };

        if let Some(record) = cached {
            if self.is_fresh(&record, &description) {
                if let Some(items) = self.cached_items(table) {
                    debug!(table, items = items.len(), "cache hit");
                    return Ok((
                        ScanOutcome {
                            items,
                            cache_hit: true,
                        },
                        description.key_schema,
                    ));
                }
            } else {
                debug!(table, "cached scan is stale");
            }
        } else if options.force_refresh {
            debug!(table, "forced rescan");
        } else {
            debug!(table, "cache miss");
        }

        let items = self.full_scan(table, options.cancel.as_ref())?;
        let payload = serde_json::to_vec(&items).map_err(|source| CacheError::Serialization {
            resource: table.to_string(),
            source,
        })?;
        let TableDescription {
            item_count,
            last_modified,
            key_schema,
        } = description;
        self.store.put(
            ResourceClass::Tables,
            table,
            &payload,
            EntryOrigin::Table(TableOrigin {
                item_count,
                table_mtime: last_modified,
                key_schema: key_schema.clone(),
            }),
        )?;
        info!(table, items = items.len(), "cached table scan");
        Ok((
            ScanOutcome {
                items,
                cache_hit: false,
            },
            key_schema,
        ))
    }

    fn is_fresh(&self, record: &CacheMetadataRecord, description: &TableDescription) -> bool {
        let Some(origin) = record.table_origin() else {
            return false;
        };
        if origin.item_count != description.item_count {
            return false;
        }
        let modified_since = match (description.last_modified, origin.table_mtime) {
            (Some(current), Some(cached)) => current > cached,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if modified_since {
            return false;
        }
        match self.options.cache_life {
            Some(cache_life) => self.store.now() - record.written_at <= cache_life,
            None => true,
        }
    }

    /// Reads and parses the cached scan of `table`. Unreadable scans count as missing.
    fn cached_items(&self, table: &str) -> Option<Vec<Item>> {
        let entry = self.store.get(ResourceClass::Tables, table)?;
        match serde_json::from_slice::<Vec<Item>>(&entry.payload) {
            Ok(items) => Some(items),
            Err(err) => {
                warn!(table, error = %err, "cached scan is unreadable, rescanning");
                None
            }
        }
    }

    /// Scans all pages. Nothing is returned unless the scan completed without being cancelled.
    fn full_scan(&self, table: &str, cancel: Option<&CancelToken>) -> CacheResult<Vec<Item>> {
        let mut items = vec![];
        let mut token: Option<ContinuationToken> = None;
        let mut pages = 0;
        let check_cancelled = |pages: usize| {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                info!(table, pages, "scan cancelled, discarding partial results");
                return Err(CacheError::Cancelled {
                    resource: table.to_string(),
                });
            }
            Ok(())
        };
        loop {
            check_cancelled(pages)?;
            let page = self
                .remote
                .scan_page(table, token.as_ref())
                .map_err(|err| self.remote_error(table, err))?;
            pages += 1;
            items.extend(page.items);
            match page.next_token {
                Some(next_token) => token = Some(next_token),
                None => break,
            }
        }
        check_cancelled(pages)?;
        debug!(table, pages, items = items.len(), "scanned table");
        Ok(items)
    }

    fn serve_cached_or_fail(
        &self,
        table: &str,
        cached: Option<CacheMetadataRecord>,
        err: RemoteError,
    ) -> CacheResult<(ScanOutcome, KeySchema)> {
        if self.options.on_remote_error == RemoteErrorPolicy::ServeCached
            && err.is_transient()
            && let Some(record) = cached
            && let Some(origin) = record.table_origin()
            && let Some(items) = self.cached_items(table)
        {
            warn!(table, error = %err, "remote unavailable, serving cached scan");
            return Ok((
                ScanOutcome {
                    items,
                    cache_hit: true,
                },
                origin.key_schema.clone(),
            ));
        }
        Err(self.remote_error(table, err))
    }

    /// Classifies a remote failure, dropping the cached scan of tables that no longer exist.
    fn remote_error(&self, table: &str, err: RemoteError) -> CacheError {
        if err == RemoteError::NotFound {
            if let Err(invalidate_err) = self.store.invalidate(ResourceClass::Tables, table) {
                warn!(table, error = %invalidate_err, "could not invalidate cached scan");
            }
        }
        CacheError::from_remote(table, err)
    }
}
