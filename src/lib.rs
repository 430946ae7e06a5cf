//! Courier Relay - record-store relay between mobile clients and host-side
//! AI services and tools
//!
//! A mobile client invokes AI services and user-defined command-line tools
//! running on a remote host without ever opening a direct connection to it:
//! an intermediary cloud record store is the only transport.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   RelayRequest    ┌─────────────────────┐
//! │    Client    │ ────────────────► │  Coordination Store │
//! │  (discover,  │                   │  (push + poll, CAS) │
//! │ send, await) │ ◄──────────────── │                     │
//! └──────────────┘   RelayResponse   └──────────┬──────────┘
//!                                               │ claim
//! ┌──────────────────────────────────────────────▼─────────┐
//! │                     Courier Host                        │
//! │  Announcer │ Dispatcher │ Sandbox │ Service proxy      │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod announce;
pub mod config;
pub mod daemon;
pub mod db;
pub mod discovery;
pub mod error;
pub mod relay;
pub mod sandbox;
pub mod security;
pub mod store;

use std::sync::Arc;

pub use config::Config;
pub use daemon::Daemon;
pub use db::{DbConn, DbPool};
pub use discovery::{AdaptiveCadence, DiscoveredDevice, DiscoveryClient, Presence};
pub use error::{Error, Result};
pub use relay::{
    Dispatcher, DispatcherConfig, RelayClient, RelayClientConfig, RelayRequest, RelayResponse,
    RelayStatsSnapshot, StatsRecorder,
};
pub use sandbox::{ExecutionResult, Outcome, Sandbox, SandboxLimits, ToolDefinition, ToolRegistry};
pub use security::{DeviceIdentity, DeviceRegistry, PairingPayload, PayloadCipher, Side};
pub use store::{MemoryStore, QueryFilter, RecordKind, RecordStore, StoredRecord};

/// Build the configured coordination store adapter
///
/// A configured URL selects the HTTP-backed store; without one the
/// in-process store is used, which only reaches peers inside this process.
///
/// # Errors
///
/// Returns error if the HTTP store client cannot be built
pub fn connect_store(config: &Config) -> Result<Arc<dyn RecordStore>> {
    match &config.store.url {
        Some(url) => Ok(Arc::new(store::HttpStore::new(
            url,
            config.store.api_token.clone(),
        )?)),
        None => {
            tracing::warn!("no store URL configured; records stay in this process only");
            Ok(Arc::new(store::MemoryStore::new()))
        }
    }
}
