//! Host-side request dispatch
//!
//! One loop, woken by store signals and a polling fallback feeding the same
//! "check now" path. Every eligible request is claimed with a conditional
//! `pending -> claimed` update before any work happens, which is what
//! guarantees at-most-one live execution per request id even when two
//! dispatcher instances overlap (a host restart racing its predecessor).
//!
//! A claim carries a lease. If the claiming host dies mid-execution, the
//! lease expires and any dispatcher may reclaim the request, so the client
//! eventually gets a terminal response instead of a permanent hang.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};

use super::stats::{RelayEvent, StatsRecorder};
use super::types::{
    DEFAULT_CLAIM_LEASE_SECS, RelayRequest, RelayResponse, RequestStatus, ResponseStatus,
};
use crate::announce::ServiceCatalog;
use crate::sandbox::{ExecLimits, Outcome, Sandbox, executor};
use crate::security::PayloadCipher;
use crate::store::{
    QueryFilter, RecordKind, RecordStore, RetryPolicy, delay_for_attempt, update_with_retry,
};
use crate::{Error, Result};

/// Default polling fallback interval for the dispatch loop
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Ceiling for one proxied service call (long generation calls included)
const PROXY_TIMEOUT: Duration = Duration::from_secs(300);

/// Default body cap for proxied service responses (image payloads are big)
const PROXY_OUTPUT_CAP: usize = 8 * 1024 * 1024;

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Polling fallback interval
    pub poll_interval: Duration,
    /// Claim lease duration
    pub claim_lease: Duration,
    /// Backoff policy for store writes
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            claim_lease: Duration::from_secs(DEFAULT_CLAIM_LEASE_SECS),
            retry: RetryPolicy::default(),
        }
    }
}

/// Payload shape for the built-in `/tools/run` endpoint
#[derive(Debug, Deserialize)]
struct ToolRunPayload {
    tool: String,
    #[serde(default)]
    args: Map<String, Value>,
}

/// Host side of the relay: scans, claims, executes, responds
///
/// Cheap to clone; every clone shares the same store, sandbox, and recorder.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn RecordStore>,
    device_id: String,
    sandbox: Arc<Sandbox>,
    catalog: Arc<ServiceCatalog>,
    cipher: Option<Arc<PayloadCipher>>,
    stats: Arc<StatsRecorder>,
    config: DispatcherConfig,
}

impl Dispatcher {
    /// Create a dispatcher for a host device
    #[must_use]
    pub fn new(
        store: Arc<dyn RecordStore>,
        device_id: &str,
        sandbox: Arc<Sandbox>,
        catalog: Arc<ServiceCatalog>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            device_id: device_id.to_string(),
            sandbox,
            catalog,
            cipher: None,
            stats: Arc::new(StatsRecorder::new()),
            config,
        }
    }

    /// Decrypt request payloads and encrypt response payloads
    #[must_use]
    pub fn with_cipher(mut self, cipher: Arc<PayloadCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Share a statistics recorder
    #[must_use]
    pub fn with_stats(mut self, stats: Arc<StatsRecorder>) -> Self {
        self.stats = stats;
        self
    }

    /// Statistics recorder observing this dispatcher
    #[must_use]
    pub fn stats(&self) -> &Arc<StatsRecorder> {
        &self.stats
    }

    /// Run the dispatch loop until the task is aborted
    ///
    /// Push signals and the polling fallback are merged into one "check now"
    /// stream, so the sweep logic is written once. A lagged subscription
    /// still counts as a wake-up — there is no reason to be picky about why
    /// we are checking.
    pub async fn run(self: Arc<Self>) {
        let signals = BroadcastStream::new(self.store.subscribe(RecordKind::Request)).map(|_| ());
        let mut tick = tokio::time::interval(self.config.poll_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let ticks = IntervalStream::new(tick).map(|_| ());

        let mut wake = futures::stream::select(signals, ticks);

        while wake.next().await.is_some() {
            match self.sweep().await {
                Ok(0) => {}
                Ok(claimed) => tracing::debug!(claimed, "dispatch sweep claimed requests"),
                Err(e) => tracing::warn!(error = %e, "dispatch sweep failed"),
            }
        }
    }

    /// Scan for eligible requests and claim them; returns how many were
    /// claimed. Claimed requests execute concurrently on their own tasks.
    ///
    /// # Errors
    ///
    /// Returns error if the scan query fails; per-request failures are
    /// handled by publishing error responses
    pub async fn sweep(&self) -> Result<usize> {
        let records = self
            .store
            .query(
                RecordKind::Request,
                &QueryFilter::new().field_eq("target_device_id", self.device_id.as_str()),
            )
            .await?;

        let now = Utc::now();
        let mut claimed = 0usize;

        for record in records {
            let request: RelayRequest = match record.decode() {
                Ok(request) => request,
                Err(e) => {
                    tracing::warn!(id = %record.id, error = %e, "skipping malformed request record");
                    continue;
                }
            };

            let eligible = request.status == RequestStatus::Pending || request.claim_expired(now);
            if !eligible {
                continue;
            }

            if request.claim_expired(now) {
                tracing::info!(
                    request_id = %request.id,
                    previous = ?request.claimed_by,
                    "reclaiming request with expired lease"
                );
            }

            match self.claim(&request.id).await {
                Ok(Some(owned)) => {
                    claimed += 1;
                    let this = self.clone();
                    tokio::spawn(async move { this.process(owned).await });
                }
                Ok(None) => {
                    // Lost the race to another dispatcher; at-most-one wins
                    tracing::debug!(request_id = %request.id, "claim lost to another dispatcher");
                }
                Err(e) => {
                    tracing::warn!(request_id = %request.id, error = %e, "claim failed");
                }
            }
        }

        Ok(claimed)
    }

    /// Atomically transition a request to claimed-by-us
    ///
    /// The conditional update retries on version conflicts, re-checking
    /// eligibility each time; a request that is no longer pending (or whose
    /// lease was renewed by someone else) aborts the claim.
    async fn claim(&self, request_id: &str) -> Result<Option<RelayRequest>> {
        let device_id = self.device_id.clone();
        let lease = chrono::Duration::from_std(self.config.claim_lease)
            .unwrap_or(chrono::Duration::MAX);

        let updated = update_with_retry(
            self.store.as_ref(),
            RecordKind::Request,
            request_id,
            &self.config.retry,
            move |body| {
                let mut request: RelayRequest = serde_json::from_value(body.clone())?;
                let now = Utc::now();

                if request.status != RequestStatus::Pending && !request.claim_expired(now) {
                    return Ok(false);
                }

                request.status = RequestStatus::Claimed;
                request.claimed_by = Some(device_id.clone());
                request.claim_expires_at =
                    Some(now.checked_add_signed(lease).unwrap_or(chrono::DateTime::<Utc>::MAX_UTC));
                *body = serde_json::to_value(&request)?;
                Ok(true)
            },
        )
        .await?;

        updated.map(|record| record.decode()).transpose()
    }

    /// Execute a claimed request and publish its terminal response
    ///
    /// Never returns an error: every failure path reduces to an error
    /// response so the client is never left hanging past its own timeout.
    async fn process(&self, request: RelayRequest) {
        let started = Instant::now();
        let response = self.execute(&request).await;
        let success = response.status == ResponseStatus::Success;

        self.publish_response(&response).await;
        self.finalize_request(&request.id, success).await;

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.stats.record(RelayEvent::now(success, duration_ms));

        tracing::info!(
            request_id = %request.id,
            endpoint = %request.endpoint,
            success,
            duration_ms,
            "request processed"
        );
    }

    async fn execute(&self, request: &RelayRequest) -> RelayResponse {
        let payload = match &self.cipher {
            Some(cipher) => match cipher.open(&request.payload) {
                Ok(payload) => payload,
                Err(e) => {
                    return self.sealed(RelayResponse::failure(
                        &request.id,
                        400,
                        "crypto",
                        &e.to_string(),
                    ));
                }
            },
            None => request.payload.clone(),
        };

        let response = match request.service_id {
            Some(service_id) => self.proxy_service(request, service_id, payload).await,
            None => self.builtin(request, &payload).await,
        };

        self.sealed(response)
    }

    /// Encrypt an outgoing payload when transport encryption is on
    fn sealed(&self, mut response: RelayResponse) -> RelayResponse {
        if let Some(cipher) = &self.cipher {
            match cipher.seal(&response.payload) {
                Ok(sealed) => response.payload = sealed,
                Err(e) => {
                    tracing::error!(request_id = %response.request_id, error = %e, "payload seal failed");
                    response = RelayResponse::failure(
                        &response.request_id,
                        500,
                        "crypto",
                        "response encryption failed",
                    );
                }
            }
        }
        response
    }

    /// Forward the payload to a locally announced service port
    async fn proxy_service(
        &self,
        request: &RelayRequest,
        service_id: uuid::Uuid,
        payload: Vec<u8>,
    ) -> RelayResponse {
        let Some(service) = self.catalog.find(service_id) else {
            return RelayResponse::failure(
                &request.id,
                404,
                "not_found",
                &format!("unknown service {service_id}"),
            );
        };

        let url = format!("http://127.0.0.1:{}{}", service.port, request.endpoint);
        let limits = ExecLimits {
            timeout: PROXY_TIMEOUT,
            output_cap: PROXY_OUTPUT_CAP,
        };
        let body = if payload.is_empty() { None } else { Some(payload) };

        tracing::debug!(service = %service.name, %url, "proxying request to local service");

        match executor::run_http(&url, &request.method, &HashMap::new(), body, &limits).await {
            Ok(out) if (200..300).contains(&out.status) => {
                RelayResponse::success(&request.id, out.status, out.body)
            }
            Ok(out) => RelayResponse {
                request_id: request.id.clone(),
                payload: out.body,
                status_code: out.status,
                completed_at: Utc::now(),
                status: ResponseStatus::Error,
            },
            Err(Error::Timeout(message)) => {
                RelayResponse::failure(&request.id, 504, "timeout", &message)
            }
            Err(e) => RelayResponse::failure(&request.id, 502, "execution", &e.to_string()),
        }
    }

    /// Built-in host endpoints (no service id)
    async fn builtin(&self, request: &RelayRequest, payload: &[u8]) -> RelayResponse {
        match request.endpoint.as_str() {
            "/tools/run" => self.run_tool(request, payload).await,
            "/tools/list" => {
                let tools = self.sandbox.registry().list();
                let tools: Vec<_> = tools.iter().map(AsRef::as_ref).collect();
                match serde_json::to_vec(&tools) {
                    Ok(body) => RelayResponse::success(&request.id, 200, body),
                    Err(e) => RelayResponse::failure(&request.id, 500, "internal", &e.to_string()),
                }
            }
            "/tools/reload" => match self.sandbox.registry().reload() {
                Ok(count) => RelayResponse::success(
                    &request.id,
                    200,
                    serde_json::json!({ "reloaded": count }).to_string().into_bytes(),
                ),
                Err(e) => RelayResponse::failure(&request.id, 500, "internal", &e.to_string()),
            },
            "/ping" => RelayResponse::success(
                &request.id,
                200,
                serde_json::json!({
                    "device_id": self.device_id,
                    "time": Utc::now().to_rfc3339(),
                })
                .to_string()
                .into_bytes(),
            ),
            other => RelayResponse::failure(
                &request.id,
                404,
                "not_found",
                &format!("unknown endpoint {other}"),
            ),
        }
    }

    async fn run_tool(&self, request: &RelayRequest, payload: &[u8]) -> RelayResponse {
        let invocation: ToolRunPayload = match serde_json::from_slice(payload) {
            Ok(invocation) => invocation,
            Err(e) => {
                return RelayResponse::failure(
                    &request.id,
                    400,
                    "validation",
                    &format!("malformed tool invocation: {e}"),
                );
            }
        };

        let result = self.sandbox.run(&invocation.tool, &invocation.args).await;
        let status_code = result.status_code();
        let status = if result.outcome == Outcome::Ok {
            ResponseStatus::Success
        } else {
            ResponseStatus::Error
        };

        match serde_json::to_vec(&result) {
            Ok(body) => RelayResponse {
                request_id: request.id.clone(),
                payload: body,
                status_code,
                completed_at: Utc::now(),
                status,
            },
            Err(e) => RelayResponse::failure(&request.id, 500, "internal", &e.to_string()),
        }
    }

    /// Publish the response, retrying transient failures
    ///
    /// A conflict means a response for this id already exists (a reclaim
    /// racing a zombie that finished after all) — the first answer stands.
    async fn publish_response(&self, response: &RelayResponse) {
        let body = match serde_json::to_value(response) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(request_id = %response.request_id, error = %e, "response serialization failed");
                return;
            }
        };

        let mut attempt = 0u32;
        loop {
            match self
                .store
                .publish(RecordKind::Response, &response.request_id, body.clone())
                .await
            {
                Ok(_) => return,
                Err(Error::Conflict(_)) => {
                    tracing::info!(request_id = %response.request_id, "response already published elsewhere");
                    return;
                }
                Err(e) if e.is_retryable() && attempt < self.config.retry.max_retries => {
                    let retry_after = match &e {
                        Error::RateLimited { retry_after } => *retry_after,
                        _ => None,
                    };
                    tokio::time::sleep(delay_for_attempt(&self.config.retry, attempt, retry_after))
                        .await;
                    attempt += 1;
                }
                Err(e) => {
                    // The claim lease will expire and another sweep retries
                    tracing::error!(request_id = %response.request_id, error = %e, "response publish failed");
                    return;
                }
            }
        }
    }

    /// Move the request record to its terminal status
    async fn finalize_request(&self, request_id: &str, success: bool) {
        let device_id = self.device_id.clone();
        let final_status = if success {
            RequestStatus::Completed
        } else {
            RequestStatus::Failed
        };

        let result = update_with_retry(
            self.store.as_ref(),
            RecordKind::Request,
            request_id,
            &self.config.retry,
            move |body| {
                let mut request: RelayRequest = serde_json::from_value(body.clone())?;

                // Only the current claim holder finalizes; a reclaimer that
                // took over after our lease expired owns the record now
                if request.status != RequestStatus::Claimed
                    || request.claimed_by.as_deref() != Some(device_id.as_str())
                {
                    return Ok(false);
                }

                request.status = final_status;
                *body = serde_json::to_value(&request)?;
                Ok(true)
            },
        )
        .await;

        if let Err(e) = result {
            tracing::warn!(request_id, error = %e, "failed to finalize request status");
        }
    }
}
