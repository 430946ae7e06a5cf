#![allow(dead_code)]

//! Shared test utilities

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use courier_relay::announce::ServiceCatalog;
use courier_relay::relay::{Dispatcher, DispatcherConfig, RelayClient, RelayClientConfig};
use courier_relay::sandbox::{Sandbox, SandboxLimits, ToolRegistry};
use courier_relay::store::{QueryFilter, RetryPolicy, StoreSignal};
use courier_relay::{MemoryStore, RecordKind, RecordStore, Result, StoredRecord};

/// Standard tool fixtures used across the relay and sandbox tests
pub const SYSTEM_INFO: &str = r#"{
    "name": "system_info",
    "description": "Kernel and architecture",
    "parameters": { "type": "object", "properties": {}, "required": [] },
    "execution": { "type": "script", "command": "uname -a", "timeout": 10 }
}"#;

pub const MARK: &str = r#"{
    "name": "mark",
    "description": "Create a marker file",
    "parameters": {
        "type": "object",
        "properties": { "path": { "type": "string" } },
        "required": ["path"]
    },
    "execution": { "type": "script", "command": "touch {path}", "timeout": 10 }
}"#;

pub const SLOW: &str = r#"{
    "name": "slow",
    "description": "Sleep for a while",
    "parameters": { "type": "object", "properties": {}, "required": [] },
    "execution": { "type": "script", "command": "sleep 30", "timeout": 1 }
}"#;

/// Write tool fixtures into a fresh temp dir and load a sandbox over them
pub fn sandbox_with_tools(tools: &[&str]) -> (tempfile::TempDir, Arc<Sandbox>) {
    let dir = tempfile::tempdir().expect("tempdir");
    for (i, tool) in tools.iter().enumerate() {
        std::fs::write(dir.path().join(format!("tool{i}.json")), tool).expect("write tool");
    }
    let registry = Arc::new(ToolRegistry::load(dir.path()).expect("load registry"));
    let sandbox = Arc::new(Sandbox::new(registry, SandboxLimits::default()));
    (dir, sandbox)
}

/// A dispatcher over a memory store with fast test timings
pub fn dispatcher_for(
    store: &MemoryStore,
    device_id: &str,
    sandbox: Arc<Sandbox>,
) -> Arc<Dispatcher> {
    Arc::new(Dispatcher::new(
        Arc::new(store.clone()),
        device_id,
        sandbox,
        Arc::new(ServiceCatalog::new(vec![])),
        DispatcherConfig {
            poll_interval: Duration::from_millis(50),
            claim_lease: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        },
    ))
}

/// A relay client over a memory store with fast test timings
pub fn client_for(store: &MemoryStore, wait: Duration) -> RelayClient {
    RelayClient::new(
        Arc::new(store.clone()),
        RelayClientConfig {
            wait_timeout: wait,
            poll_interval: Duration::from_millis(25),
            retry: RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
            },
        },
    )
}

/// Store wrapper that fails reads with a transport error until `failures`
/// calls have been burned; exercises the retry-the-wait paths
pub struct FlakyStore {
    inner: MemoryStore,
    failures: AtomicU32,
}

impl FlakyStore {
    pub fn new(inner: MemoryStore, failures: u32) -> Self {
        Self {
            inner,
            failures: AtomicU32::new(failures),
        }
    }

    fn trip(&self) -> Result<()> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(courier_relay::Error::Transport(
                "injected store failure".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for FlakyStore {
    async fn publish(&self, kind: RecordKind, id: &str, body: Value) -> Result<StoredRecord> {
        self.trip()?;
        self.inner.publish(kind, id, body).await
    }

    async fn compare_and_swap(
        &self,
        kind: RecordKind,
        id: &str,
        expected_version: u64,
        body: Value,
    ) -> Result<StoredRecord> {
        self.trip()?;
        self.inner.compare_and_swap(kind, id, expected_version, body).await
    }

    async fn fetch(&self, kind: RecordKind, id: &str) -> Result<Option<StoredRecord>> {
        self.trip()?;
        self.inner.fetch(kind, id).await
    }

    async fn query(&self, kind: RecordKind, filter: &QueryFilter) -> Result<Vec<StoredRecord>> {
        self.trip()?;
        self.inner.query(kind, filter).await
    }

    async fn delete(&self, kind: RecordKind, id: &str) -> Result<bool> {
        self.trip()?;
        self.inner.delete(kind, id).await
    }

    fn subscribe(&self, kind: RecordKind) -> broadcast::Receiver<StoreSignal> {
        self.inner.subscribe(kind)
    }
}
