//! HTTP-backed coordination store
//!
//! Adapter for any record-store facade that exposes records over HTTP with
//! conditional-write semantics:
//!
//! - `PUT /records/{kind}/{id}` with `If-None-Match: *` — create (`409` if it
//!   exists)
//! - `PUT /records/{kind}/{id}` with `If-Match: <version>` — conditional
//!   overwrite (`412` on version mismatch)
//! - `GET /records/{kind}/{id}` — fetch (`404` when absent)
//! - `GET /records/{kind}?field=value` — equality query
//! - `DELETE /records/{kind}/{id}`
//!
//! Rate limiting (`429`) surfaces as [`Error::RateLimited`] with any
//! `Retry-After` the server offers. Subscription signals fire for mutations
//! made through this process only; changes made by the remote peer are picked
//! up by the callers' polling fallbacks.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use tokio::sync::broadcast;

use super::{QueryFilter, RecordKind, RecordStore, StoreSignal, StoredRecord};
use crate::{Error, Result};

/// Subscription channel capacity per record kind
const SIGNAL_CAPACITY: usize = 64;

/// Per-call HTTP timeout
const CALL_TIMEOUT: Duration = Duration::from_secs(20);

/// [`RecordStore`] backed by a remote HTTP record-store facade
pub struct HttpStore {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
    signals: HashMap<RecordKind, broadcast::Sender<StoreSignal>>,
}

impl HttpStore {
    /// Create a store client for the given base URL
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be constructed
    pub fn new(base_url: &str, api_token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(CALL_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("failed to build store client: {e}")))?;

        let mut signals = HashMap::new();
        for kind in RecordKind::ALL {
            let (tx, _) = broadcast::channel(SIGNAL_CAPACITY);
            signals.insert(kind, tx);
        }

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
            signals,
        })
    }

    fn record_url(&self, kind: RecordKind, id: &str) -> String {
        format!("{}/records/{kind}/{id}", self.base_url)
    }

    fn collection_url(&self, kind: RecordKind) -> String {
        format!("{}/records/{kind}", self.base_url)
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn notify(&self, kind: RecordKind) {
        if let Some(tx) = self.signals.get(&kind) {
            let _ = tx.send(StoreSignal { kind });
        }
    }

    /// Map a non-success response onto the error taxonomy
    async fn fail(kind: RecordKind, id: &str, resp: reqwest::Response) -> Error {
        let status = resp.status();
        let retry_after = parse_retry_after(&resp);
        let body = resp.text().await.unwrap_or_default();

        match status {
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
                Error::Conflict(format!("{kind} record {id}: {body}"))
            }
            StatusCode::TOO_MANY_REQUESTS => Error::RateLimited { retry_after },
            s if s.is_server_error() => {
                Error::Transport(format!("store returned {s} for {kind}/{id}: {body}"))
            }
            s => Error::Transport(format!("unexpected store status {s} for {kind}/{id}: {body}")),
        }
    }

    async fn decode(resp: reqwest::Response) -> Result<StoredRecord> {
        resp.json::<StoredRecord>()
            .await
            .map_err(|e| Error::Transport(format!("malformed store response: {e}")))
    }
}

/// Extract a `Retry-After` delay (seconds form) from a response
fn parse_retry_after(resp: &reqwest::Response) -> Option<Duration> {
    let secs = resp
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()?;
    Some(Duration::from_secs(secs))
}

/// Network-level failures are always retryable transport errors
fn transport(e: &reqwest::Error) -> Error {
    Error::Transport(format!("store unreachable: {e}"))
}

#[async_trait]
impl RecordStore for HttpStore {
    async fn publish(&self, kind: RecordKind, id: &str, body: Value) -> Result<StoredRecord> {
        let resp = self
            .request(self.client.put(self.record_url(kind, id)))
            .header(reqwest::header::IF_NONE_MATCH, "*")
            .json(&body)
            .send()
            .await
            .map_err(|e| transport(&e))?;

        if !resp.status().is_success() {
            return Err(Self::fail(kind, id, resp).await);
        }

        let record = Self::decode(resp).await?;
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
        let resp = self
            .request(self.client.put(self.record_url(kind, id)))
            .header(reqwest::header::IF_MATCH, expected_version.to_string())
            .json(&body)
            .send()
            .await
            .map_err(|e| transport(&e))?;

        if !resp.status().is_success() {
            return Err(Self::fail(kind, id, resp).await);
        }

        let record = Self::decode(resp).await?;
        self.notify(kind);
        Ok(record)
    }

    async fn fetch(&self, kind: RecordKind, id: &str) -> Result<Option<StoredRecord>> {
        let resp = self
            .request(self.client.get(self.record_url(kind, id)))
            .send()
            .await
            .map_err(|e| transport(&e))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Self::fail(kind, id, resp).await);
        }

        Ok(Some(Self::decode(resp).await?))
    }

    async fn query(&self, kind: RecordKind, filter: &QueryFilter) -> Result<Vec<StoredRecord>> {
        let mut request = self.request(self.client.get(self.collection_url(kind)));
        for (field, value) in filter.clauses() {
            // Scalars travel as bare strings; the facade compares on equality
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            request = request.query(&[(field.as_str(), rendered)]);
        }

        let resp = request.send().await.map_err(|e| transport(&e))?;
        if !resp.status().is_success() {
            return Err(Self::fail(kind, "*", resp).await);
        }

        let records = resp
            .json::<Vec<StoredRecord>>()
            .await
            .map_err(|e| Error::Transport(format!("malformed store response: {e}")))?;

        // The facade may ignore unknown filter fields; re-check locally so
        // query semantics match the in-memory store exactly.
        Ok(records
            .into_iter()
            .filter(|r| filter.matches(&r.body))
            .collect())
    }

    async fn delete(&self, kind: RecordKind, id: &str) -> Result<bool> {
        let resp = self
            .request(self.client.delete(self.record_url(kind, id)))
            .send()
            .await
            .map_err(|e| transport(&e))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => {
                self.notify(kind);
                Ok(true)
            }
            _ => Err(Self::fail(kind, id, resp).await),
        }
    }

    fn subscribe(&self, kind: RecordKind) -> broadcast::Receiver<StoreSignal> {
        self.signals[&kind].subscribe()
    }
}
