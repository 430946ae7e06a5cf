//! In-process coordination store
//!
//! Backs tests and same-machine loopback setups. Mutations fire subscription
//! signals immediately, which makes this the most generous store the relay
//! will ever run against — the polling fallbacks still get exercised because
//! signals are droppable (bounded broadcast channel).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast;

use super::{QueryFilter, RecordKind, RecordStore, StoreSignal, StoredRecord};
use crate::{Error, Result};

/// Subscription channel capacity per record kind
const SIGNAL_CAPACITY: usize = 64;

#[derive(Default)]
struct Shelf {
    records: HashMap<String, StoredRecord>,
}

struct Inner {
    shelves: Mutex<HashMap<RecordKind, Shelf>>,
    signals: HashMap<RecordKind, broadcast::Sender<StoreSignal>>,
}

/// In-memory [`RecordStore`] with versioned conditional writes
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        let mut signals = HashMap::new();
        for kind in RecordKind::ALL {
            let (tx, _) = broadcast::channel(SIGNAL_CAPACITY);
            signals.insert(kind, tx);
        }

        Self {
            inner: Arc::new(Inner {
                shelves: Mutex::new(HashMap::new()),
                signals,
            }),
        }
    }

    fn notify(&self, kind: RecordKind) {
        if let Some(tx) = self.inner.signals.get(&kind) {
            // No receivers is fine; signals are best-effort
            let _ = tx.send(StoreSignal { kind });
        }
    }

    /// Number of records of a kind currently held (test helper)
    #[must_use]
    pub fn len(&self, kind: RecordKind) -> usize {
        let shelves = self.inner.shelves.lock().expect("store lock poisoned");
        shelves.get(&kind).map_or(0, |s| s.records.len())
    }

    /// Whether the store holds no records of a kind
    #[must_use]
    pub fn is_empty(&self, kind: RecordKind) -> bool {
        self.len(kind) == 0
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn publish(&self, kind: RecordKind, id: &str, body: Value) -> Result<StoredRecord> {
        let record = {
            let mut shelves = self.inner.shelves.lock().expect("store lock poisoned");
            let shelf = shelves.entry(kind).or_default();

            if shelf.records.contains_key(id) {
                return Err(Error::Conflict(format!("{kind} record {id} already exists")));
            }

            let now = Utc::now();
            let record = StoredRecord {
                id: id.to_string(),
                kind,
                version: 1,
                created_at: now,
                modified_at: now,
                body,
            };
            shelf.records.insert(id.to_string(), record.clone());
            record
        };

        self.notify(kind);
        Ok(record)
    }

    async fn compare_and_swap(
        &self,
        kind: RecordKind,
        id: &str,
        expected_version: u64,
        body: Value,
    ) -> Result<StoredRecord> {
        let record = {
            let mut shelves = self.inner.shelves.lock().expect("store lock poisoned");
            let shelf = shelves.entry(kind).or_default();

            // A record deleted under us reads as a conflict: the caller
            // re-fetches and observes the deletion on the next cycle.
            let Some(current) = shelf.records.get_mut(id) else {
                return Err(Error::Conflict(format!("{kind} record {id} is gone")));
            };

            if current.version != expected_version {
                return Err(Error::Conflict(format!(
                    "{kind} record {id}: expected version {expected_version}, have {}",
                    current.version
                )));
            }

            current.version += 1;
            current.modified_at = Utc::now();
            current.body = body;
            current.clone()
        };

        self.notify(kind);
        Ok(record)
    }

    async fn fetch(&self, kind: RecordKind, id: &str) -> Result<Option<StoredRecord>> {
        let shelves = self.inner.shelves.lock().expect("store lock poisoned");
        Ok(shelves
            .get(&kind)
            .and_then(|shelf| shelf.records.get(id))
            .cloned())
    }

    async fn query(&self, kind: RecordKind, filter: &QueryFilter) -> Result<Vec<StoredRecord>> {
        let shelves = self.inner.shelves.lock().expect("store lock poisoned");
        Ok(shelves.get(&kind).map_or_else(Vec::new, |shelf| {
            shelf
                .records
                .values()
                .filter(|r| filter.matches(&r.body))
                .cloned()
                .collect()
        }))
    }

    async fn delete(&self, kind: RecordKind, id: &str) -> Result<bool> {
        let existed = {
            let mut shelves = self.inner.shelves.lock().expect("store lock poisoned");
            shelves
                .get_mut(&kind)
                .is_some_and(|shelf| shelf.records.remove(id).is_some())
        };

        if existed {
            self.notify(kind);
        }
        Ok(existed)
    }

    fn subscribe(&self, kind: RecordKind) -> broadcast::Receiver<StoreSignal> {
        self.inner.signals[&kind].subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_then_fetch() {
        let store = MemoryStore::new();
        store
            .publish(RecordKind::Request, "r1", json!({ "status": "pending" }))
            .await
            .unwrap();

        let record = store
            .fetch(RecordKind::Request, "r1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.body["status"], "pending");
    }

    #[tokio::test]
    async fn duplicate_publish_conflicts() {
        let store = MemoryStore::new();
        store
            .publish(RecordKind::Request, "r1", json!({}))
            .await
            .unwrap();

        let err = store
            .publish(RecordKind::Request, "r1", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn cas_rejects_stale_version() {
        let store = MemoryStore::new();
        store
            .publish(RecordKind::Request, "r1", json!({ "n": 0 }))
            .await
            .unwrap();

        store
            .compare_and_swap(RecordKind::Request, "r1", 1, json!({ "n": 1 }))
            .await
            .unwrap();

        // Stale writer still holds version 1
        let err = store
            .compare_and_swap(RecordKind::Request, "r1", 1, json!({ "n": 99 }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let record = store
            .fetch(RecordKind::Request, "r1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.body["n"], 1);
        assert_eq!(record.version, 2);
    }

    #[tokio::test]
    async fn query_applies_filter() {
        let store = MemoryStore::new();
        for (id, status) in [("a", "pending"), ("b", "claimed"), ("c", "pending")] {
            store
                .publish(RecordKind::Request, id, json!({ "status": status }))
                .await
                .unwrap();
        }

        let pending = store
            .query(
                RecordKind::Request,
                &QueryFilter::new().field_eq("status", "pending"),
            )
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn mutations_fire_signals() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe(RecordKind::Response);

        store
            .publish(RecordKind::Response, "r1", json!({}))
            .await
            .unwrap();

        let signal = rx.recv().await.unwrap();
        assert!(matches!(signal.kind, RecordKind::Response));
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let store = MemoryStore::new();
        store
            .publish(RecordKind::Announcement, "d1", json!({}))
            .await
            .unwrap();

        assert!(store.delete(RecordKind::Announcement, "d1").await.unwrap());
        assert!(!store.delete(RecordKind::Announcement, "d1").await.unwrap());
    }

    #[tokio::test]
    async fn update_with_retry_converges_under_interleaving() {
        use super::super::{RetryPolicy, update_with_retry};

        let store = MemoryStore::new();
        store
            .publish(RecordKind::Request, "r1", json!({ "n": 0 }))
            .await
            .unwrap();

        // Two writers increment concurrently; both must land.
        let mut handles = Vec::new();
        for _ in 0..2 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                update_with_retry(
                    &store,
                    RecordKind::Request,
                    "r1",
                    &RetryPolicy::default(),
                    |body| {
                        let n = body["n"].as_u64().unwrap_or(0);
                        body["n"] = serde_json::json!(n + 1);
                        Ok(true)
                    },
                )
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let record = store
            .fetch(RecordKind::Request, "r1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.body["n"], 2);
    }
}
