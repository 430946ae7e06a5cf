//! Client-side request/response correlator
//!
//! `send` publishes a relay request and waits for the matching response,
//! correlating purely on the immutable request id. Push wake-ups from the
//! store subscription and a polling fallback feed the same wait loop, since
//! push delivery is best-effort. Transport trouble mid-wait retries the wait
//! with the *same* id — immutability of the id is what makes the whole
//! exchange idempotent for the host.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::stats::{RelayEvent, StatsRecorder};
use super::types::{RelayRequest, RelayResponse, ResponseStatus};
use crate::security::PayloadCipher;
use crate::store::{QueryFilter, RecordKind, RecordStore, RetryPolicy, delay_for_attempt};
use crate::{Error, Result};

/// Default wait budget for a typical call
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Wait budget suited to long-running generation calls
pub const LONG_WAIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Client correlator configuration
#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    /// Overall wait budget per call (client-authoritative)
    pub wait_timeout: Duration,
    /// Polling fallback interval while waiting
    pub poll_interval: Duration,
    /// Backoff policy for transient store failures
    pub retry: RetryPolicy,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            poll_interval: Duration::from_secs(2),
            retry: RetryPolicy::default(),
        }
    }
}

/// Client side of the relay: send a request, await its response
pub struct RelayClient {
    store: Arc<dyn RecordStore>,
    config: RelayClientConfig,
    cipher: Option<Arc<PayloadCipher>>,
    stats: Option<Arc<StatsRecorder>>,
}

impl RelayClient {
    /// Create a client over a coordination store
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>, config: RelayClientConfig) -> Self {
        Self {
            store,
            config,
            cipher: None,
            stats: None,
        }
    }

    /// Encrypt request payloads and decrypt response payloads
    #[must_use]
    pub fn with_cipher(mut self, cipher: Arc<PayloadCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Record terminal outcomes into a statistics recorder
    #[must_use]
    pub fn with_stats(mut self, stats: Arc<StatsRecorder>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Publish a request and wait for its response
    ///
    /// # Errors
    ///
    /// - [`Error::Conflict`] if the request id already exists in the store
    /// - [`Error::Timeout`] if no response lands within the wait budget
    /// - [`Error::Transport`] only when the request could not be published
    ///   at all (pre-publish failures are the one case surfaced locally)
    pub async fn send(&self, mut request: RelayRequest) -> Result<RelayResponse> {
        if let Some(cipher) = &self.cipher {
            request.payload = cipher.seal(&request.payload)?;
        }

        let started = Instant::now();
        self.publish(&request).await?;
        tracing::debug!(request_id = %request.id, target = %request.target_device_id, "relay request published");

        let outcome = self.await_response(&request.id, self.config.wait_timeout).await;

        if let Some(stats) = &self.stats {
            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            let success = matches!(
                &outcome,
                Ok(response) if response.status == ResponseStatus::Success
            );
            stats.record(RelayEvent::now(success, duration_ms));
        }

        let mut response = outcome?;
        if let Some(cipher) = &self.cipher {
            response.payload = cipher.open(&response.payload)?;
        }
        Ok(response)
    }

    /// Wait for the response matching a request id
    ///
    /// The wait survives transient store failures by retrying against the
    /// same id; abandoning the wait (dropping the future) stops the polling
    /// but never retracts the request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] when the budget elapses first
    pub async fn await_response(&self, request_id: &str, budget: Duration) -> Result<RelayResponse> {
        let deadline = Instant::now() + budget;
        let mut signals = self.store.subscribe(RecordKind::Response);

        loop {
            match self.store.fetch(RecordKind::Response, request_id).await {
                Ok(Some(record)) => return record.decode::<RelayResponse>(),
                Ok(None) => {}
                Err(e) if e.is_retryable() => {
                    tracing::debug!(request_id, error = %e, "store hiccup while waiting, retrying");
                }
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(format!(
                    "no response for request {request_id} within {budget:?}"
                )));
            }

            let nap = self.config.poll_interval.min(deadline - now);
            tokio::select! {
                () = tokio::time::sleep(nap) => {}
                signal = signals.recv() => {
                    if signal.is_err() {
                        // Lagged or closed; resubscribe and fall back to polling
                        signals = self.store.subscribe(RecordKind::Response);
                    }
                }
            }
        }
    }

    async fn publish(&self, request: &RelayRequest) -> Result<()> {
        let body = serde_json::to_value(request)?;
        let mut attempt = 0u32;

        loop {
            match self
                .store
                .publish(RecordKind::Request, &request.id, body.clone())
                .await
            {
                Ok(_) => return Ok(()),
                // A duplicate id must be rejected loudly, never silently
                // merged away — and retrying would never succeed.
                Err(e @ Error::Conflict(_)) => return Err(e),
                Err(e) if e.is_retryable() && attempt < self.config.retry.max_retries => {
                    let retry_after = match &e {
                        Error::RateLimited { retry_after } => *retry_after,
                        _ => None,
                    };
                    let delay = delay_for_attempt(&self.config.retry, attempt, retry_after);
                    tracing::debug!(request_id = %request.id, attempt, ?delay, error = %e, "publish failed, backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Find the response for a request id, if one exists (single probe)
///
/// # Errors
///
/// Returns error if the store query fails
pub async fn probe_response(
    store: &dyn RecordStore,
    request_id: &str,
) -> Result<Option<RelayResponse>> {
    let records = store
        .query(
            RecordKind::Response,
            &QueryFilter::new().field_eq("request_id", request_id),
        )
        .await?;

    records
        .first()
        .map(|record| record.decode::<RelayResponse>())
        .transpose()
}
