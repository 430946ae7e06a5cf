//! Request/response relay over the coordination store
//!
//! One request record in, one response record out, correlated by the
//! immutable request id. The client and host never connect to each other;
//! both talk only to the store.

pub mod client;
pub mod dispatch;
pub mod stats;
pub mod types;

pub use client::{
    DEFAULT_WAIT_TIMEOUT, LONG_WAIT_TIMEOUT, RelayClient, RelayClientConfig, probe_response,
};
pub use dispatch::{DEFAULT_POLL_INTERVAL, Dispatcher, DispatcherConfig};
pub use stats::{RelayEvent, RelayStatsSnapshot, StatsRecorder};
pub use types::{
    DeviceAnnouncement, DeviceStatus, PROTOCOL_VERSION, RelayRequest, RelayResponse,
    RequestStatus, ResponseStatus, ServiceDescriptor, ServiceKind,
};
