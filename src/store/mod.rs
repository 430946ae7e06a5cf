//! Coordination store adapter
//!
//! The coordination store is the only transport between peers: an external,
//! shared, eventually-consistent record store that neither side owns. This
//! module wraps it behind the [`RecordStore`] trait — versioned records,
//! conditional writes, equality queries, and a best-effort notification
//! channel. Push signals are never guaranteed or ordered, so every consumer
//! pairs them with a polling fallback.

pub mod http;
pub mod memory;
pub mod retry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::{Error, Result};

pub use http::HttpStore;
pub use memory::MemoryStore;
pub use retry::{RetryPolicy, delay_for_attempt};

/// Kinds of records exchanged through the coordination store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Host presence and capability announcements
    Announcement,
    /// Client-published relay requests
    Request,
    /// Host-published relay responses
    Response,
}

impl RecordKind {
    /// All record kinds, for subscription setup and housekeeping sweeps
    pub const ALL: [Self; 3] = [Self::Announcement, Self::Request, Self::Response];

    /// Stable wire name for this kind
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Announcement => "announcement",
            Self::Request => "request",
            Self::Response => "response",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A versioned record envelope as held by the store
///
/// `version` increments on every successful write and is the token for
/// conditional updates; the `body` is the record's JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    /// Record identifier, unique within its kind
    pub id: String,

    /// Record kind
    pub kind: RecordKind,

    /// Monotonic version, starting at 1 on publish
    pub version: u64,

    /// When the record was first published
    pub created_at: DateTime<Utc>,

    /// When the record was last written
    pub modified_at: DateTime<Utc>,

    /// Record payload
    pub body: Value,
}

impl StoredRecord {
    /// Deserialize the body into a concrete record type
    ///
    /// # Errors
    ///
    /// Returns error if the body does not match the target type
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

/// Equality filter over top-level body fields
///
/// The store is addressed by record kind plus predicate, not by a fixed API
/// surface; equality on scalar fields is the only predicate the relay needs.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    fields: Vec<(String, Value)>,
}

impl QueryFilter {
    /// An empty filter matching every record of the kind
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `field` to equal `value`
    #[must_use]
    pub fn field_eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.fields.push((field.to_string(), value.into()));
        self
    }

    /// Whether a record body satisfies every clause
    #[must_use]
    pub fn matches(&self, body: &Value) -> bool {
        self.fields
            .iter()
            .all(|(field, value)| body.get(field) == Some(value))
    }

    /// The filter's clauses, for adapters that push predicates server-side
    #[must_use]
    pub fn clauses(&self) -> &[(String, Value)] {
        &self.fields
    }
}

/// Best-effort wake-up signal from the store's notification channel
///
/// Delivery is neither guaranteed nor ordered; a signal means "something of
/// this kind may have changed, check now", nothing more.
#[derive(Debug, Clone, Copy)]
pub struct StoreSignal {
    /// Kind of record that changed
    pub kind: RecordKind,
}

/// Contract for any record store offering conditional-write semantics and a
/// best-effort notification channel
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create a record; fails with [`Error::Conflict`] if the id exists
    async fn publish(&self, kind: RecordKind, id: &str, body: Value) -> Result<StoredRecord>;

    /// Conditionally overwrite a record
    ///
    /// Fails with [`Error::Conflict`] when `expected_version` does not match
    /// the store's current version — the caller must re-read, re-apply its
    /// mutation, and try again rather than blindly overwrite.
    async fn compare_and_swap(
        &self,
        kind: RecordKind,
        id: &str,
        expected_version: u64,
        body: Value,
    ) -> Result<StoredRecord>;

    /// Fetch a single record by id
    async fn fetch(&self, kind: RecordKind, id: &str) -> Result<Option<StoredRecord>>;

    /// Query records of a kind matching an equality filter
    async fn query(&self, kind: RecordKind, filter: &QueryFilter) -> Result<Vec<StoredRecord>>;

    /// Delete a record; returns whether it existed
    async fn delete(&self, kind: RecordKind, id: &str) -> Result<bool>;

    /// Subscribe to best-effort wake-up signals for a record kind
    fn subscribe(&self, kind: RecordKind) -> broadcast::Receiver<StoreSignal>;
}

/// Read-modify-write a record under optimistic concurrency.
///
/// Fetches the record, applies `mutate` to a copy of its body, and writes it
/// back with [`RecordStore::compare_and_swap`]. On conflict (or a transient
/// transport failure) the whole cycle repeats against the store's current
/// version, up to `policy.max_retries` times with backoff.
///
/// `mutate` returns `Ok(false)` to abort without writing — the record is no
/// longer in the state the caller wanted to transition from. Returns
/// `Ok(None)` when the record is missing or the mutation aborted, and
/// `Ok(Some(record))` with the written record on success.
///
/// # Errors
///
/// Returns error if retries are exhausted or `mutate` fails
pub async fn update_with_retry<F>(
    store: &dyn RecordStore,
    kind: RecordKind,
    id: &str,
    policy: &RetryPolicy,
    mut mutate: F,
) -> Result<Option<StoredRecord>>
where
    F: FnMut(&mut Value) -> Result<bool> + Send,
{
    let mut attempt = 0u32;

    loop {
        let fetched = match store.fetch(kind, id).await {
            Ok(record) => record,
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                backoff(policy, attempt, &e).await;
                attempt += 1;
                continue;
            }
            Err(e) => return Err(e),
        };

        let Some(current) = fetched else {
            return Ok(None);
        };

        let mut body = current.body.clone();
        if !mutate(&mut body)? {
            return Ok(None);
        }

        match store.compare_and_swap(kind, id, current.version, body).await {
            Ok(record) => return Ok(Some(record)),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                backoff(policy, attempt, &e).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn backoff(policy: &RetryPolicy, attempt: u32, error: &Error) {
    let retry_after = match error {
        Error::RateLimited { retry_after } => *retry_after,
        _ => None,
    };
    let delay = delay_for_attempt(policy, attempt, retry_after);
    tracing::debug!(attempt, ?delay, %error, "store operation failed, backing off");
    tokio::time::sleep(delay).await;
}
