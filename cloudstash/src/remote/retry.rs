//! Retries of transient remote failures as a decorator around any collaborator.

use super::{
    ContinuationToken, ObjectHead, ObjectMetadata, ObjectStore, RemoteObject, RemoteResult,
    ScanPage, TableDescription, TableService,
};
use crate::value::{Item, KeyValue, PrimaryKey};
use rand::Rng;
use std::time::Duration;
use tracing::{debug, warn};

/// Exponential backoff schedule.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts including the first one. `1` disables retries.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Randomize each delay within `[delay / 2, delay]`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn no_retries() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (zero-based), before jitter is applied.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry.min(i32::MAX as u32) as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        if !delay.is_finite() || delay >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(delay)
        }
    }

    fn delay(&self, retry: u32) -> Duration {
        let delay = self.backoff(retry);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let nanos = delay.as_nanos().min(u64::MAX as u128) as u64;
        Duration::from_nanos(rand::rng().random_range(nanos / 2..=nanos))
    }
}

/// Puts the current thread to sleep. Injectable to keep tests fast.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration)
    }
}

/// Wraps a collaborator and retries calls failing with a transient error.
///
/// `NotFound` and `Cancelled` are returned immediately.
///
/// # Examples
///
/// ```rust
/// use cloudstash::remote::ObjectStore;
/// use cloudstash::remote::in_memory::InMemoryObjectStore;
/// use cloudstash::remote::retry::{RetryPolicy, Retrying};
///
/// let store = Retrying::new(InMemoryObjectStore::new(), RetryPolicy::default());
/// assert!(store.list("no-such-bucket", "").is_err());
/// ```
#[derive(Debug, Clone)]
pub struct Retrying<S, Z: Sleeper = ThreadSleeper> {
    inner: S,
    policy: RetryPolicy,
    sleeper: Z,
}

impl<S> Retrying<S, ThreadSleeper> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self::with_sleeper(inner, policy, ThreadSleeper)
    }
}

impl<S, Z: Sleeper> Retrying<S, Z> {
    pub fn with_sleeper(inner: S, policy: RetryPolicy, sleeper: Z) -> Self {
        Self {
            inner,
            policy,
            sleeper,
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn call<T>(&self, operation: &str, mut f: impl FnMut(&S) -> RemoteResult<T>) -> RemoteResult<T> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match f(&self.inner) {
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.policy.delay(attempt - 1);
                    warn!(operation, attempt, max_attempts, ?delay, error = %err, "transient remote failure, retrying");
                    self.sleeper.sleep(delay);
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_transient() {
                        debug!(operation, attempt, "giving up after transient failures");
                    }
                    return Err(err);
                }
                ok => return ok,
            }
        }
    }
}

impl<S: ObjectStore, Z: Sleeper> ObjectStore for Retrying<S, Z> {
    fn head(&self, bucket: &str, key: &str) -> RemoteResult<ObjectHead> {
        self.call("head", |inner| inner.head(bucket, key))
    }

    fn get(&self, bucket: &str, key: &str) -> RemoteResult<RemoteObject> {
        self.call("get", |inner| inner.get(bucket, key))
    }

    fn put(
        &self,
        bucket: &str,
        key: &str,
        body: &[u8],
        metadata: &ObjectMetadata,
    ) -> RemoteResult<ObjectHead> {
        self.call("put", |inner| inner.put(bucket, key, body, metadata))
    }

    fn delete(&self, bucket: &str, key: &str) -> RemoteResult<()> {
        self.call("delete", |inner| inner.delete(bucket, key))
    }

    fn list(&self, bucket: &str, prefix: &str) -> RemoteResult<Vec<String>> {
        self.call("list", |inner| inner.list(bucket, prefix))
    }
}

impl<S: TableService, Z: Sleeper> TableService for Retrying<S, Z> {
    fn describe(&self, table: &str) -> RemoteResult<TableDescription> {
        self.call("describe", |inner| inner.describe(table))
    }

    fn scan_page(&self, table: &str, token: Option<&ContinuationToken>) -> RemoteResult<ScanPage> {
        self.call("scan_page", |inner| inner.scan_page(table, token))
    }

    fn put_item(&self, table: &str, item: Item) -> RemoteResult<()> {
        self.call("put_item", |inner| inner.put_item(table, item.clone()))
    }

    fn get_item(&self, table: &str, key: &PrimaryKey) -> RemoteResult<Item> {
        self.call("get_item", |inner| inner.get_item(table, key))
    }

    fn query(&self, table: &str, partition: &KeyValue) -> RemoteResult<Vec<Item>> {
        self.call("query", |inner| inner.query(table, partition))
    }
}
