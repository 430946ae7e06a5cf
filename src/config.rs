//! Configuration management for the Courier relay
//!
//! Settings come from `<data_dir>/config.toml` with environment-variable
//! overrides (`COURIER_DATA_DIR`, `COURIER_STORE_URL`, `COURIER_STORE_TOKEN`,
//! `COURIER_DEVICE_NAME`, `COURIER_ENCRYPTION`). A missing file means
//! defaults everywhere — the host runs against an in-memory store for
//! same-machine experiments until a store URL is configured.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use uuid::Uuid;

use crate::relay::types::{
    DEFAULT_CLAIM_LEASE_SECS, STALENESS_THRESHOLD_SECS, ServiceDescriptor, ServiceKind,
};
use crate::{Error, Result};

/// Resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory (identity, database, tools)
    pub data_dir: PathBuf,

    /// Human-readable device name
    pub device_name: String,

    /// Coordination store settings
    pub store: StoreConfig,

    /// Host daemon settings
    pub host: HostConfig,

    /// Discovery thresholds and cadence bounds
    pub discovery: DiscoveryConfig,

    /// Client correlator settings
    pub client: ClientConfig,

    /// Sandbox caps
    pub sandbox: SandboxConfig,

    /// Transport encryption toggle
    pub encryption: EncryptionConfig,
}

/// Coordination store settings
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// Record-store facade base URL; `None` selects the in-memory store
    pub url: Option<String>,

    /// Bearer token for the facade (converted to a secret at use)
    pub api_token: Option<String>,
}

/// Host daemon settings
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Directory of tool definition files
    pub tools_dir: PathBuf,

    /// Announcement heartbeat interval
    pub heartbeat: Duration,

    /// Claim lease duration
    pub claim_lease: Duration,

    /// Dispatch polling fallback interval
    pub poll_interval: Duration,

    /// Housekeeping sweep interval
    pub housekeeping_interval: Duration,

    /// Services to announce
    pub services: Vec<ServiceDescriptor>,
}

/// Discovery thresholds and cadence bounds
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Staleness threshold for rendering a device inactive
    pub staleness: Duration,

    /// Fast polling interval
    pub fast_interval: Duration,

    /// Polling interval cap
    pub max_interval: Duration,
}

/// Client correlator settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Overall wait budget per call
    pub wait_timeout: Duration,

    /// Response polling fallback interval
    pub poll_interval: Duration,
}

/// Sandbox caps
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Captured-output byte cap per stream
    pub output_cap: usize,
}

/// Transport encryption toggle
#[derive(Debug, Clone, Default)]
pub struct EncryptionConfig {
    /// Encrypt payloads before they enter the store
    pub enabled: bool,
}

// --- raw TOML shapes -------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    device_name: Option<String>,
    #[serde(default)]
    store: RawStore,
    #[serde(default)]
    host: RawHost,
    #[serde(default)]
    discovery: RawDiscovery,
    #[serde(default)]
    client: RawClient,
    #[serde(default)]
    sandbox: RawSandbox,
    #[serde(default)]
    encryption: RawEncryption,
}

#[derive(Debug, Default, Deserialize)]
struct RawStore {
    url: Option<String>,
    api_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawHost {
    tools_dir: Option<PathBuf>,
    heartbeat_secs: Option<u64>,
    claim_lease_secs: Option<u64>,
    poll_secs: Option<u64>,
    housekeeping_secs: Option<u64>,
    #[serde(default)]
    services: Vec<RawService>,
}

#[derive(Debug, Deserialize)]
struct RawService {
    id: Uuid,
    name: String,
    kind: ServiceKind,
    port: u16,
    api_format: Option<String>,
    workflows: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDiscovery {
    staleness_secs: Option<u64>,
    fast_secs: Option<u64>,
    max_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawClient {
    wait_secs: Option<u64>,
    poll_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSandbox {
    output_cap_bytes: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RawEncryption {
    enabled: Option<bool>,
}

impl Config {
    /// Load configuration from the data directory, applying env overrides
    ///
    /// # Errors
    ///
    /// Returns error if the config file exists but cannot be parsed
    pub fn load() -> Result<Self> {
        let data_dir = resolve_data_dir();
        Self::load_from(&data_dir)
    }

    /// Load configuration rooted at an explicit data directory
    ///
    /// # Errors
    ///
    /// Returns error if the config file exists but cannot be parsed
    pub fn load_from(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join("config.toml");
        let raw: RawConfig = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content)
                .map_err(|e| Error::Config(format!("{}: {e}", config_path.display())))?
        } else {
            RawConfig::default()
        };

        let device_name = std::env::var("COURIER_DEVICE_NAME")
            .ok()
            .or(raw.device_name)
            .unwrap_or_else(default_device_name);

        let store_url = std::env::var("COURIER_STORE_URL").ok().or(raw.store.url);
        let api_token = std::env::var("COURIER_STORE_TOKEN")
            .ok()
            .or(raw.store.api_token);

        let encryption_enabled = std::env::var("COURIER_ENCRYPTION")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .ok()
            .or(raw.encryption.enabled)
            .unwrap_or(false);

        let services = raw
            .host
            .services
            .into_iter()
            .map(|s| ServiceDescriptor {
                id: s.id,
                name: s.name,
                kind: s.kind,
                port: s.port,
                api_format: s.api_format.unwrap_or_else(|| "openai".to_string()),
                is_running: false,
                workflows: s.workflows,
            })
            .collect();

        Ok(Self {
            device_name,
            store: StoreConfig {
                url: store_url,
                api_token,
            },
            host: HostConfig {
                tools_dir: raw
                    .host
                    .tools_dir
                    .unwrap_or_else(|| data_dir.join("tools")),
                heartbeat: secs(raw.host.heartbeat_secs, 30),
                claim_lease: secs(raw.host.claim_lease_secs, DEFAULT_CLAIM_LEASE_SECS),
                poll_interval: secs(raw.host.poll_secs, 3),
                housekeeping_interval: secs(raw.host.housekeeping_secs, 3600),
                services,
            },
            discovery: DiscoveryConfig {
                staleness: secs(raw.discovery.staleness_secs, STALENESS_THRESHOLD_SECS),
                fast_interval: secs(raw.discovery.fast_secs, 5),
                max_interval: secs(raw.discovery.max_secs, 30),
            },
            client: ClientConfig {
                wait_timeout: secs(raw.client.wait_secs, 30),
                poll_interval: secs(raw.client.poll_secs, 2),
            },
            sandbox: SandboxConfig {
                output_cap: raw
                    .sandbox
                    .output_cap_bytes
                    .unwrap_or(crate::sandbox::DEFAULT_OUTPUT_CAP),
            },
            encryption: EncryptionConfig {
                enabled: encryption_enabled,
            },
            data_dir: data_dir.to_path_buf(),
        })
    }

    /// Path of the device identity file
    #[must_use]
    pub fn identity_path(&self) -> PathBuf {
        crate::security::DeviceIdentity::path_under(&self.data_dir)
    }

    /// Path of the pairing database
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("courier.db")
    }
}

fn secs(value: Option<u64>, default: u64) -> Duration {
    Duration::from_secs(value.unwrap_or(default))
}

fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("COURIER_DATA_DIR") {
        return PathBuf::from(dir);
    }

    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".local/share/omni/courier"),
        |dirs| dirs.data_dir().join("omni").join("courier"),
    )
}

fn default_device_name() -> String {
    hostname::get().map_or_else(
        |_| "courier-host".to_string(),
        |h| h.to_string_lossy().to_string(),
    )
}
