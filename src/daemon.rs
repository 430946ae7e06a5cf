//! Host daemon — wires identity, announcements, dispatch, and housekeeping
//!
//! Runs until interrupted. Shutdown marks the announcement offline
//! best-effort; clients never rely on the marker, only on staleness.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::announce::{Announcer, ServiceCatalog};
use crate::config::Config;
use crate::relay::types::ServiceDescriptor;
use crate::relay::{Dispatcher, DispatcherConfig, StatsRecorder};
use crate::sandbox::{Sandbox, SandboxLimits, ToolRegistry};
use crate::security::{DeviceIdentity, PairingPayload, PayloadCipher, Side, generate_master_key};
use crate::store::RecordStore;
use crate::{Error, Result, connect_store};

/// How long a service liveness probe waits before calling a port dead
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// The Courier host daemon
pub struct Daemon {
    config: Config,
    identity: DeviceIdentity,
    store: Arc<dyn RecordStore>,
    db: crate::db::DbPool,
}

impl Daemon {
    /// Create a daemon instance from configuration
    ///
    /// # Errors
    ///
    /// Returns error if identity, database, or store initialization fails
    pub fn new(config: Config) -> Result<Self> {
        let identity = DeviceIdentity::load_or_create(&config.identity_path(), &config.device_name)?;

        std::fs::create_dir_all(&config.data_dir)?;
        let db = crate::db::init(config.db_path())?;
        let store = connect_store(&config)?;

        tracing::info!(
            device_id = %identity.device_id,
            name = %identity.name,
            "host identity ready"
        );

        Ok(Self {
            config,
            identity,
            store,
            db,
        })
    }

    /// This host's device identity
    #[must_use]
    pub const fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Paired-device registry backed by the daemon's database
    #[must_use]
    pub fn device_registry(&self) -> crate::security::DeviceRegistry {
        crate::security::DeviceRegistry::new(self.db.clone())
    }

    /// Build the signed pairing payload for out-of-band transfer
    ///
    /// Includes the transport master key when encryption is enabled.
    ///
    /// # Errors
    ///
    /// Returns error if the master key or signature cannot be produced
    pub async fn pairing_payload(&self) -> Result<PairingPayload> {
        let master_key = if self.config.encryption.enabled {
            Some(self.load_or_create_master_key()?.expose_secret().to_string())
        } else {
            None
        };

        let services = probe_services(self.config.host.services.clone()).await;
        PairingPayload::build(&self.identity, services, master_key)
    }

    /// Run the daemon until interrupted
    ///
    /// # Errors
    ///
    /// Returns error if startup wiring fails; runtime loops log and carry on
    pub async fn run(self) -> Result<()> {
        let registry = Arc::new(ToolRegistry::load(&self.config.host.tools_dir)?);
        let sandbox = Arc::new(Sandbox::new(
            registry,
            SandboxLimits {
                output_cap: self.config.sandbox.output_cap,
            },
        ));

        let catalog = Arc::new(ServiceCatalog::new(
            probe_services(self.config.host.services.clone()).await,
        ));

        let cipher = if self.config.encryption.enabled {
            let key = self.load_or_create_master_key()?;
            Some(Arc::new(PayloadCipher::from_master_key(
                key.expose_secret(),
                Side::Host,
            )?))
        } else {
            None
        };

        let stats = Arc::new(StatsRecorder::new());

        let announcer = Arc::new(Announcer::new(
            Arc::clone(&self.store),
            &self.identity.device_id,
            &self.identity.name,
            Arc::clone(&catalog),
            self.config.host.heartbeat,
        ));

        let mut dispatcher = Dispatcher::new(
            Arc::clone(&self.store),
            &self.identity.device_id,
            sandbox,
            Arc::clone(&catalog),
            DispatcherConfig {
                poll_interval: self.config.host.poll_interval,
                claim_lease: self.config.host.claim_lease,
                ..DispatcherConfig::default()
            },
        )
        .with_stats(Arc::clone(&stats));
        if let Some(cipher) = cipher {
            dispatcher = dispatcher.with_cipher(cipher);
        }
        let dispatcher = Arc::new(dispatcher);

        tracing::info!(
            device_id = %self.identity.device_id,
            services = catalog.current().len(),
            encryption = self.config.encryption.enabled,
            "courier host running"
        );

        let announce_task = tokio::spawn(Arc::clone(&announcer).run());
        let dispatch_task = tokio::spawn(Arc::clone(&dispatcher).run());
        let housekeeping_task = tokio::spawn(
            Arc::clone(&announcer).run_housekeeping(self.config.host.housekeeping_interval),
        );
        let probe_task = tokio::spawn(probe_loop(
            Arc::clone(&catalog),
            self.config.host.services.clone(),
            self.config.host.heartbeat,
        ));

        tokio::signal::ctrl_c()
            .await
            .map_err(|e| Error::Config(format!("failed to install signal handler: {e}")))?;
        tracing::info!("shutting down");

        // Stop the loops first so nothing republishes after the offline mark
        announce_task.abort();
        dispatch_task.abort();
        housekeeping_task.abort();
        probe_task.abort();

        announcer.mark_offline().await;

        let snapshot = stats.snapshot();
        tracing::info!(
            total = snapshot.total_requests,
            success = snapshot.successful_requests,
            failed = snapshot.failed_requests,
            "final relay statistics"
        );

        Ok(())
    }

    fn master_key_path(&self) -> PathBuf {
        self.config.data_dir.join("identity").join("master.key")
    }

    /// Load the transport master key, creating and persisting one if absent
    fn load_or_create_master_key(&self) -> Result<SecretString> {
        let path = self.master_key_path();
        if path.exists() {
            let key = std::fs::read_to_string(&path)?;
            return Ok(SecretString::from(key.trim().to_string()));
        }

        let key = generate_master_key();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, &key)?;
        tracing::info!(path = %path.display(), "created transport master key");
        Ok(SecretString::from(key))
    }
}

/// Re-probe service liveness until the catalog is dropped
async fn probe_loop(
    catalog: Arc<ServiceCatalog>,
    configured: Vec<ServiceDescriptor>,
    interval: Duration,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tick.tick().await;
        let probed = probe_services(configured.clone()).await;
        if catalog.set_if_changed(probed) {
            tracing::info!("service liveness changed");
        }
    }
}

/// Check each service port on loopback and record reachability
async fn probe_services(mut services: Vec<ServiceDescriptor>) -> Vec<ServiceDescriptor> {
    for service in &mut services {
        service.is_running = port_reachable(service.port).await;
    }
    services
}

async fn port_reachable(port: u16) -> bool {
    matches!(
        tokio::time::timeout(
            PROBE_TIMEOUT,
            tokio::net::TcpStream::connect(("127.0.0.1", port)),
        )
        .await,
        Ok(Ok(_))
    )
}
