//! In-memory implementations of the remote collaborators.
//!
//! Both keep their state behind an [Arc], so clones share the same buckets and tables. This allows
//! to hand one clone to a cache engine while using another one to mutate the remote state
//! out-of-band, inspect call counts, or inject failures.

use super::{
    ContinuationToken, ObjectHead, ObjectMetadata, ObjectStore, RemoteError, RemoteObject,
    RemoteResult, ScanPage, TableDescription, TableService, content_hash_from_metadata,
};
use crate::util::cancel::CancelToken;
use crate::util::clock::{Clock, SystemClock};
use crate::value::{Item, KeySchema, KeyValue, PrimaryKey};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Number of calls made to each [ObjectStore] operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObjectCallCounts {
    pub head: usize,
    pub get: usize,
    pub put: usize,
    pub delete: usize,
    pub list: usize,
}

struct StoredObject {
    body: Vec<u8>,
    metadata: ObjectMetadata,
    etag: String,
    last_modified: DateTime<Utc>,
}

impl StoredObject {
    fn head(&self) -> ObjectHead {
        ObjectHead {
            content_hash: content_hash_from_metadata(&self.metadata),
            etag: self.etag.clone(),
            size: self.body.len() as u64,
            last_modified: self.last_modified,
        }
    }
}

#[derive(Default)]
struct ObjectStoreState {
    buckets: HashMap<String, BTreeMap<String, StoredObject>>,
    calls: ObjectCallCounts,
    failures: VecDeque<RemoteError>,
}

impl ObjectStoreState {
    fn take_failure(&mut self) -> RemoteResult<()> {
        self.failures.pop_front().map_or(Ok(()), Err)
    }

    fn bucket(&self, bucket: &str) -> RemoteResult<&BTreeMap<String, StoredObject>> {
        self.buckets.get(bucket).ok_or(RemoteError::NotFound)
    }

    fn object(&self, bucket: &str, key: &str) -> RemoteResult<&StoredObject> {
        self.bucket(bucket)?.get(key).ok_or(RemoteError::NotFound)
    }
}

/// An [ObjectStore] keeping all objects in memory.
///
/// Etags are derived from the content, like the ones of simple uploads to common object stores.
/// Objects carry an embedded content hash only if the uploader put one into the metadata.
#[derive(Clone)]
pub struct InMemoryObjectStore {
    state: Arc<Mutex<ObjectStoreState>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Uses `clock` for the last-modified times of uploaded objects.
    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        Self {
            state: Arc::default(),
            clock: Arc::new(clock),
        }
    }

    pub fn create_bucket(&self, bucket: &str) {
        self.lock().buckets.entry(bucket.to_string()).or_default();
    }

    /// Makes the next `count` calls (of any operation) fail with `error`.
    pub fn fail_next_calls(&self, count: usize, error: RemoteError) {
        self.lock()
            .failures
            .extend(std::iter::repeat_n(error, count));
    }

    pub fn calls(&self) -> ObjectCallCounts {
        self.lock().calls
    }

    /// Returns the user-defined metadata of an object, bypassing call counting.
    pub fn metadata(&self, bucket: &str, key: &str) -> Option<ObjectMetadata> {
        self.lock()
            .object(bucket, key)
            .ok()
            .map(|object| object.metadata.clone())
    }

    fn lock(&self) -> MutexGuard<'_, ObjectStoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn etag(body: &[u8]) -> String {
    blake3::hash(body).to_hex()[..32].to_string()
}

impl ObjectStore for InMemoryObjectStore {
    fn head(&self, bucket: &str, key: &str) -> RemoteResult<ObjectHead> {
        let mut state = self.lock();
        state.calls.head += 1;
        state.take_failure()?;
        Ok(state.object(bucket, key)?.head())
    }

    fn get(&self, bucket: &str, key: &str) -> RemoteResult<RemoteObject> {
        let mut state = self.lock();
        state.calls.get += 1;
        state.take_failure()?;
        let object = state.object(bucket, key)?;
        Ok(RemoteObject {
            body: object.body.clone(),
            head: object.head(),
        })
    }

    fn put(
        &self,
        bucket: &str,
        key: &str,
        body: &[u8],
        metadata: &ObjectMetadata,
    ) -> RemoteResult<ObjectHead> {
        let last_modified = self.clock.now();
        let mut state = self.lock();
        state.calls.put += 1;
        state.take_failure()?;
        let objects = state.buckets.get_mut(bucket).ok_or(RemoteError::NotFound)?;
        let object = StoredObject {
            body: body.to_vec(),
            metadata: metadata.clone(),
            etag: etag(body),
            last_modified,
        };
        let head = object.head();
        objects.insert(key.to_string(), object);
        Ok(head)
    }

    fn delete(&self, bucket: &str, key: &str) -> RemoteResult<()> {
        let mut state = self.lock();
        state.calls.delete += 1;
        state.take_failure()?;
        state
            .buckets
            .get_mut(bucket)
            .ok_or(RemoteError::NotFound)?
            .remove(key);
        Ok(())
    }

    fn list(&self, bucket: &str, prefix: &str) -> RemoteResult<Vec<String>> {
        let mut state = self.lock();
        state.calls.list += 1;
        state.take_failure()?;
        Ok(state
            .bucket(bucket)?
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Number of calls made to each [TableService] operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableCallCounts {
    pub describe: usize,
    pub scan_page: usize,
    pub put_item: usize,
    pub get_item: usize,
    pub query: usize,
}

struct StoredTable {
    key_schema: KeySchema,
    items: BTreeMap<PrimaryKey, Item>,
    reported_item_count: u64,
    last_modified: Option<DateTime<Utc>>,
}

enum ScanInterruption {
    Fail { page: usize, error: RemoteError },
    Cancel { page: usize, token: CancelToken },
}

#[derive(Default)]
struct TableServiceState {
    tables: HashMap<String, StoredTable>,
    calls: TableCallCounts,
    failures: VecDeque<RemoteError>,
    scan_interruption: Option<ScanInterruption>,
}

impl TableServiceState {
    fn take_failure(&mut self) -> RemoteResult<()> {
        self.failures.pop_front().map_or(Ok(()), Err)
    }

    fn table(&self, table: &str) -> RemoteResult<&StoredTable> {
        self.tables.get(table).ok_or(RemoteError::NotFound)
    }

    fn table_mut(&mut self, table: &str) -> RemoteResult<&mut StoredTable> {
        self.tables.get_mut(table).ok_or(RemoteError::NotFound)
    }

    /// Applies a pending interruption if it targets `page`.
    fn interrupt(&mut self, page: usize) -> RemoteResult<()> {
        match self.scan_interruption.take() {
            Some(ScanInterruption::Fail { page: at, error }) if at == page => Err(error),
            Some(ScanInterruption::Cancel { page: at, token }) if at == page => {
                token.cancel();
                Ok(())
            }
            pending => {
                self.scan_interruption = pending;
                Ok(())
            }
        }
    }
}

/// A [TableService] keeping all tables in memory.
///
/// Like real document databases, the reported item count is a statistic that lags behind writes.
/// It only catches up when [InMemoryTableService::refresh_statistics] is called. The modification
/// time, on the other hand, is tracked on every write.
#[derive(Clone)]
pub struct InMemoryTableService {
    state: Arc<Mutex<TableServiceState>>,
    clock: Arc<dyn Clock>,
    page_size: usize,
}

impl Default for InMemoryTableService {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTableService {
    pub const DEFAULT_PAGE_SIZE: usize = 100;

    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Uses `clock` for the modification times of tables.
    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        Self {
            state: Arc::default(),
            clock: Arc::new(clock),
            page_size: Self::DEFAULT_PAGE_SIZE,
        }
    }

    /// Sets the maximum number of items returned per scan page.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn create_table(&self, table: &str, key_schema: KeySchema) {
        self.lock().tables.insert(
            table.to_string(),
            StoredTable {
                key_schema,
                items: BTreeMap::new(),
                reported_item_count: 0,
                last_modified: None,
            },
        );
    }

    /// Removes an item, bypassing call counting.
    pub fn delete_item(&self, table: &str, key: &PrimaryKey) -> RemoteResult<()> {
        let now = self.clock.now();
        let mut state = self.lock();
        let table = state.table_mut(table)?;
        table.items.remove(key);
        table.last_modified = Some(now);
        Ok(())
    }

    /// Brings the reported item count up to date.
    pub fn refresh_statistics(&self, table: &str) -> RemoteResult<()> {
        let mut state = self.lock();
        let table = state.table_mut(table)?;
        table.reported_item_count = table.items.len() as u64;
        Ok(())
    }

    /// Makes the next `count` calls (of any operation) fail with `error`.
    pub fn fail_next_calls(&self, count: usize, error: RemoteError) {
        self.lock()
            .failures
            .extend(std::iter::repeat_n(error, count));
    }

    /// Makes the request for the zero-based scan page `page` fail with `error`, once.
    pub fn fail_scan_at_page(&self, page: usize, error: RemoteError) {
        self.lock().scan_interruption = Some(ScanInterruption::Fail { page, error });
    }

    /// Cancels `token` while serving the zero-based scan page `page`, once. The page itself is
    /// still returned.
    pub fn cancel_during_page(&self, page: usize, token: CancelToken) {
        self.lock().scan_interruption = Some(ScanInterruption::Cancel { page, token });
    }

    pub fn calls(&self) -> TableCallCounts {
        self.lock().calls
    }

    fn lock(&self) -> MutexGuard<'_, TableServiceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TableService for InMemoryTableService {
    fn describe(&self, table: &str) -> RemoteResult<TableDescription> {
        let mut state = self.lock();
        state.calls.describe += 1;
        state.take_failure()?;
        let table = state.table(table)?;
        Ok(TableDescription {
            item_count: table.reported_item_count,
            last_modified: table.last_modified,
            key_schema: table.key_schema.clone(),
        })
    }

    fn scan_page(&self, table: &str, token: Option<&ContinuationToken>) -> RemoteResult<ScanPage> {
        let mut state = self.lock();
        state.calls.scan_page += 1;
        state.take_failure()?;
        let offset = match token {
            Some(ContinuationToken(token)) => token
                .parse::<usize>()
                .map_err(|_| RemoteError::Rejected(format!("invalid continuation token {token:?}")))?,
            None => 0,
        };
        state.table(table)?;
        state.interrupt(offset / self.page_size)?;
        let table = state.table(table)?;
        let items: Vec<Item> = table
            .items
            .values()
            .skip(offset)
            .take(self.page_size)
            .cloned()
            .collect();
        let next_offset = offset + items.len();
        let next_token = (next_offset < table.items.len())
            .then(|| ContinuationToken(next_offset.to_string()));
        Ok(ScanPage { items, next_token })
    }

    fn put_item(&self, table: &str, item: Item) -> RemoteResult<()> {
        let now = self.clock.now();
        let mut state = self.lock();
        state.calls.put_item += 1;
        state.take_failure()?;
        let table = state.table_mut(table)?;
        let key = table
            .key_schema
            .primary_key(&item)
            .map_err(RemoteError::Rejected)?;
        table.items.insert(key, item);
        table.last_modified = Some(now);
        Ok(())
    }

    fn get_item(&self, table: &str, key: &PrimaryKey) -> RemoteResult<Item> {
        let mut state = self.lock();
        state.calls.get_item += 1;
        state.take_failure()?;
        state
            .table(table)?
            .items
            .get(key)
            .cloned()
            .ok_or(RemoteError::NotFound)
    }

    fn query(&self, table: &str, partition: &KeyValue) -> RemoteResult<Vec<Item>> {
        let mut state = self.lock();
        state.calls.query += 1;
        state.take_failure()?;
        Ok(state
            .table(table)?
            .items
            .iter()
            .filter(|(key, _)| &key.partition == partition)
            .map(|(_, item)| item.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{HASH_METADATA_KEY, hash_bytes};
    use crate::value::{AttributeValue, item};

    fn numbered_item(id: i64) -> Item {
        item([("id", AttributeValue::from(id))])
    }

    #[test]
    fn test_object_roundtrip_with_embedded_hash() {
        let store = InMemoryObjectStore::new();
        store.create_bucket("bucket");
        let hash = hash_bytes(b"hello");
        let metadata = ObjectMetadata::from([(HASH_METADATA_KEY.to_string(), hash.to_hex())]);

        let head = store.put("bucket", "hello.txt", b"hello", &metadata).unwrap();
        assert_eq!(head.content_hash, Some(hash));
        assert_eq!(head.size, 5);

        let object = store.get("bucket", "hello.txt").unwrap();
        assert_eq!(object.body, b"hello");
        assert_eq!(object.head, head);
        assert_eq!(store.calls().put, 1);
        assert_eq!(store.calls().get, 1);
    }

    #[test]
    fn test_etag_changes_with_content_only() {
        let store = InMemoryObjectStore::new();
        store.create_bucket("bucket");
        let first = store.put("bucket", "a", b"one", &ObjectMetadata::new()).unwrap();
        let same = store.put("bucket", "b", b"one", &ObjectMetadata::new()).unwrap();
        let other = store.put("bucket", "a", b"two", &ObjectMetadata::new()).unwrap();
        assert_eq!(first.etag, same.etag);
        assert_ne!(first.etag, other.etag);
        assert_eq!(other.content_hash, None);
    }

    #[test]
    fn test_missing_bucket_and_key_are_not_found() {
        let store = InMemoryObjectStore::new();
        assert_eq!(store.head("nope", "key"), Err(RemoteError::NotFound));
        store.create_bucket("bucket");
        assert_eq!(store.head("bucket", "key"), Err(RemoteError::NotFound));
        assert_eq!(store.delete("bucket", "key"), Ok(()));
    }

    #[test]
    fn test_list_filters_by_prefix_in_sorted_order() {
        let store = InMemoryObjectStore::new();
        store.create_bucket("bucket");
        for key in ["b/2", "a/1", "b/1"] {
            store.put("bucket", key, b"", &ObjectMetadata::new()).unwrap();
        }
        assert_eq!(store.list("bucket", "b/").unwrap(), vec!["b/1", "b/2"]);
    }

    #[test]
    fn test_scan_pages_through_all_items() {
        let service = InMemoryTableService::new().with_page_size(2);
        service.create_table("table", KeySchema::partition_only("id"));
        for id in 0..5 {
            service.put_item("table", numbered_item(id)).unwrap();
        }

        let mut token = None;
        let mut items = vec![];
        loop {
            let page = service.scan_page("table", token.as_ref()).unwrap();
            items.extend(page.items);
            token = page.next_token;
            if token.is_none() {
                break;
            }
        }
        assert_eq!(items, (0..5).map(numbered_item).collect::<Vec<_>>());
        assert_eq!(service.calls().scan_page, 3);
    }

    #[test]
    fn test_item_count_lags_until_statistics_are_refreshed() {
        let service = InMemoryTableService::new();
        service.create_table("table", KeySchema::partition_only("id"));
        service.put_item("table", numbered_item(1)).unwrap();

        let description = service.describe("table").unwrap();
        assert_eq!(description.item_count, 0);
        assert!(description.last_modified.is_some());

        service.refresh_statistics("table").unwrap();
        assert_eq!(service.describe("table").unwrap().item_count, 1);
    }

    #[test]
    fn test_put_item_rejects_items_without_key() {
        let service = InMemoryTableService::new();
        service.create_table("table", KeySchema::partition_only("id"));
        assert!(matches!(
            service.put_item("table", item([("name", "x")])),
            Err(RemoteError::Rejected(_))
        ));
    }

    #[test]
    fn test_get_item_and_query() {
        let service = InMemoryTableService::new();
        service.create_table("table", KeySchema::with_sort_key("user", "n"));
        for (user, n) in [("alice", 1), ("alice", 2), ("bob", 1)] {
            service
                .put_item(
                    "table",
                    item([
                        ("user", AttributeValue::from(user)),
                        ("n", AttributeValue::from(n)),
                    ]),
                )
                .unwrap();
        }

        let key = PrimaryKey {
            partition: KeyValue::String("bob".into()),
            sort: Some(KeyValue::Integer(1)),
        };
        assert_eq!(
            service.get_item("table", &key).unwrap()["user"].as_str(),
            Some("bob")
        );
        assert_eq!(
            service
                .query("table", &KeyValue::String("alice".into()))
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn test_scan_interruptions_fire_once() {
        let service = InMemoryTableService::new().with_page_size(1);
        service.create_table("table", KeySchema::partition_only("id"));
        for id in 0..2 {
            service.put_item("table", numbered_item(id)).unwrap();
        }
        let first = service.scan_page("table", None).unwrap();

        service.fail_scan_at_page(1, RemoteError::unavailable("timeout"));
        assert!(service.scan_page("table", first.next_token.as_ref()).is_err());
        assert!(service.scan_page("table", first.next_token.as_ref()).is_ok());

        let token = CancelToken::new();
        service.cancel_during_page(0, token.clone());
        assert!(service.scan_page("table", None).is_ok());
        assert!(token.is_cancelled());
    }
}
