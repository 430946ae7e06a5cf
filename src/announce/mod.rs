//! Host presence announcements and store housekeeping
//!
//! The host publishes one `DeviceAnnouncement` record keyed by its device id,
//! refreshes it on a heartbeat and on every service-set change, and marks it
//! offline best-effort at shutdown — clients never rely on the offline
//! marker, only on staleness. Any live host also garbage-collects records
//! past the absolute retention cutoff.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::relay::types::{
    ABSOLUTE_CUTOFF_SECS, DeviceAnnouncement, DeviceStatus, PROTOCOL_VERSION, ServiceDescriptor,
};
use crate::store::{QueryFilter, RecordKind, RecordStore, RetryPolicy, update_with_retry};
use crate::{Error, Result};

/// Default heartbeat interval between announcement refreshes
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

/// Default interval between housekeeping sweeps
pub const DEFAULT_HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(3600);

/// The host's current service set, shared and watchable
///
/// The announcer republishes on every change; the dispatcher reads it to
/// proxy requests onto local service ports. Service ids are stable across
/// updates for the same logical service — the catalog only carries what the
/// host configuration says.
pub struct ServiceCatalog {
    tx: watch::Sender<Vec<ServiceDescriptor>>,
}

impl ServiceCatalog {
    /// Create a catalog with an initial service set
    #[must_use]
    pub fn new(initial: Vec<ServiceDescriptor>) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Replace the service set, waking the announcer
    pub fn set(&self, services: Vec<ServiceDescriptor>) {
        self.tx.send_replace(services);
    }

    /// Replace the service set only if it differs, returning whether it did
    ///
    /// Used by liveness probing so an unchanged probe result does not wake
    /// the announcer every tick.
    pub fn set_if_changed(&self, services: Vec<ServiceDescriptor>) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == services {
                false
            } else {
                *current = services;
                true
            }
        })
    }

    /// Snapshot of the current service set
    #[must_use]
    pub fn current(&self) -> Vec<ServiceDescriptor> {
        self.tx.borrow().clone()
    }

    /// Find a service by its stable id
    #[must_use]
    pub fn find(&self, id: Uuid) -> Option<ServiceDescriptor> {
        self.tx.borrow().iter().find(|s| s.id == id).cloned()
    }

    /// Subscribe to service-set changes
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Vec<ServiceDescriptor>> {
        self.tx.subscribe()
    }
}

/// Publishes and refreshes this host's presence record
pub struct Announcer {
    store: Arc<dyn RecordStore>,
    device_id: String,
    device_name: String,
    catalog: Arc<ServiceCatalog>,
    heartbeat: Duration,
    retry: RetryPolicy,
}

impl Announcer {
    /// Create an announcer for a host identity
    #[must_use]
    pub fn new(
        store: Arc<dyn RecordStore>,
        device_id: &str,
        device_name: &str,
        catalog: Arc<ServiceCatalog>,
        heartbeat: Duration,
    ) -> Self {
        Self {
            store,
            device_id: device_id.to_string(),
            device_name: device_name.to_string(),
            catalog,
            heartbeat,
            retry: RetryPolicy::default(),
        }
    }

    /// Publish or refresh the announcement with the given status
    ///
    /// # Errors
    ///
    /// Returns error if the store rejects the write after retries
    pub async fn publish_now(&self, status: DeviceStatus) -> Result<()> {
        let announcement = DeviceAnnouncement {
            device_id: self.device_id.clone(),
            device_name: self.device_name.clone(),
            services: self.catalog.current(),
            last_seen: Utc::now(),
            status,
            protocol_version: PROTOCOL_VERSION,
        };
        announcement.validate()?;
        let body = serde_json::to_value(&announcement)?;

        // Refresh in place when the record exists, create it otherwise. The
        // create can still lose to a concurrent refresh of our own record
        // (e.g. overlapping restart), in which case one more update wins.
        let updated = update_with_retry(
            self.store.as_ref(),
            RecordKind::Announcement,
            &self.device_id,
            &self.retry,
            |current| {
                current.clone_from(&body);
                Ok(true)
            },
        )
        .await?;

        if updated.is_none() {
            match self
                .store
                .publish(RecordKind::Announcement, &self.device_id, body.clone())
                .await
            {
                Ok(_) => {}
                Err(Error::Conflict(_)) => {
                    update_with_retry(
                        self.store.as_ref(),
                        RecordKind::Announcement,
                        &self.device_id,
                        &self.retry,
                        |current| {
                            current.clone_from(&body);
                            Ok(true)
                        },
                    )
                    .await?;
                }
                Err(e) => return Err(e),
            }
        }

        tracing::debug!(device_id = %self.device_id, %status, "announcement published");
        Ok(())
    }

    /// Run the heartbeat loop, republishing on ticks and service changes
    ///
    /// After a failed refresh, the first publish that gets through announces
    /// `reconnecting` so clients can tell a recovering host from a steadily
    /// live one; the beat after that returns to `active`.
    pub async fn run(self: Arc<Self>) {
        let mut changes = self.catalog.watch();
        let mut tick = tokio::time::interval(self.heartbeat);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut healthy = true;

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                changed = changes.changed() => {
                    if changed.is_err() {
                        tracing::debug!("service catalog dropped, stopping announcer");
                        return;
                    }
                    tracing::info!("service set changed, republishing announcement");
                }
            }

            let status = if healthy {
                DeviceStatus::Active
            } else {
                DeviceStatus::Reconnecting
            };

            match self.publish_now(status).await {
                Ok(()) => healthy = true,
                Err(e) => {
                    healthy = false;
                    tracing::warn!(error = %e, "failed to refresh announcement");
                }
            }
        }
    }

    /// Best-effort offline marker for shutdown paths
    ///
    /// Not guaranteed to run or land; clients treat staleness as the truth.
    pub async fn mark_offline(&self) {
        if let Err(e) = self.publish_now(DeviceStatus::Offline).await {
            tracing::warn!(error = %e, "failed to mark announcement offline");
        }
    }

    /// Delete records past the absolute retention cutoff
    ///
    /// Own announcement is exempt (it is refreshed continuously anyway);
    /// everything else older than the cutoff is fair game for any live host.
    ///
    /// # Errors
    ///
    /// Returns error if a store query fails; individual delete failures are
    /// logged and skipped
    pub async fn sweep_expired(&self) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::seconds(i64::try_from(ABSOLUTE_CUTOFF_SECS).unwrap_or(i64::MAX));
        let mut deleted = 0usize;

        for kind in RecordKind::ALL {
            let records = self.store.query(kind, &QueryFilter::new()).await?;
            for record in records {
                if !sweep_eligible(kind, &record.id, record.modified_at, &self.device_id, cutoff) {
                    continue;
                }

                match self.store.delete(kind, &record.id).await {
                    Ok(true) => deleted += 1,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(%kind, id = %record.id, error = %e, "housekeeping delete failed");
                    }
                }
            }
        }

        if deleted > 0 {
            tracing::info!(deleted, "housekeeping sweep removed expired records");
        }
        Ok(deleted)
    }

    /// Run the periodic housekeeping loop
    pub async fn run_housekeeping(self: Arc<Self>, interval: Duration) {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tick.tick().await;
            if let Err(e) = self.sweep_expired().await {
                tracing::warn!(error = %e, "housekeeping sweep failed");
            }
        }
    }
}

/// Whether a record is past retention and deletable by this agent
///
/// A host never deletes its own announcement; everything else older than the
/// absolute cutoff is eligible.
fn sweep_eligible(
    kind: RecordKind,
    record_id: &str,
    modified_at: chrono::DateTime<Utc>,
    own_device_id: &str,
    cutoff: chrono::DateTime<Utc>,
) -> bool {
    if kind == RecordKind::Announcement && record_id == own_device_id {
        return false;
    }
    modified_at < cutoff
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::types::ServiceKind;
    use crate::store::MemoryStore;

    fn service(name: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            id: Uuid::new_v4(),
            name: name.to_string(),
            kind: ServiceKind::LanguageModel,
            port: 11434,
            api_format: "ollama".to_string(),
            is_running: true,
            workflows: None,
        }
    }

    fn announcer(store: &MemoryStore, catalog: Arc<ServiceCatalog>) -> Announcer {
        Announcer::new(
            Arc::new(store.clone()),
            "dev-1",
            "studio",
            catalog,
            DEFAULT_HEARTBEAT,
        )
    }

    #[tokio::test]
    async fn publish_creates_then_refreshes() {
        let store = MemoryStore::new();
        let catalog = Arc::new(ServiceCatalog::new(vec![service("chat")]));
        let announcer = announcer(&store, catalog);

        announcer.publish_now(DeviceStatus::Active).await.unwrap();
        let first = store
            .fetch(RecordKind::Announcement, "dev-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.version, 1);

        announcer.publish_now(DeviceStatus::Active).await.unwrap();
        let second = store
            .fetch(RecordKind::Announcement, "dev-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.version, 2);

        let announcement: DeviceAnnouncement = second.decode().unwrap();
        assert_eq!(announcement.device_name, "studio");
        assert_eq!(announcement.services.len(), 1);
    }

    #[tokio::test]
    async fn offline_marker_is_recorded() {
        let store = MemoryStore::new();
        let catalog = Arc::new(ServiceCatalog::new(vec![]));
        let announcer = announcer(&store, catalog);

        announcer.publish_now(DeviceStatus::Active).await.unwrap();
        announcer.mark_offline().await;

        let record = store
            .fetch(RecordKind::Announcement, "dev-1")
            .await
            .unwrap()
            .unwrap();
        let announcement: DeviceAnnouncement = record.decode().unwrap();
        assert_eq!(announcement.status, DeviceStatus::Offline);
    }

    #[tokio::test]
    async fn catalog_find_by_stable_id() {
        let chat = service("chat");
        let catalog = ServiceCatalog::new(vec![chat.clone(), service("draw")]);

        assert_eq!(catalog.find(chat.id).unwrap().name, "chat");
        assert!(catalog.find(Uuid::new_v4()).is_none());
    }

    #[tokio::test]
    async fn sweep_spares_fresh_and_own_records() {
        let store = MemoryStore::new();
        let catalog = Arc::new(ServiceCatalog::new(vec![]));
        let announcer = announcer(&store, catalog);

        announcer.publish_now(DeviceStatus::Active).await.unwrap();
        store
            .publish(RecordKind::Request, "r1", serde_json::json!({ "status": "pending" }))
            .await
            .unwrap();

        // Everything is fresh; nothing to delete
        assert_eq!(announcer.sweep_expired().await.unwrap(), 0);
        assert_eq!(store.len(RecordKind::Request), 1);
        assert_eq!(store.len(RecordKind::Announcement), 1);
    }

    #[test]
    fn sweep_eligibility_honors_cutoff_and_ownership() {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::hours(24);
        let old = now - chrono::Duration::hours(25);
        let fresh = now - chrono::Duration::hours(1);

        // Another device's stale announcement is deletable
        assert!(sweep_eligible(RecordKind::Announcement, "dev-2", old, "dev-1", cutoff));
        // Own announcement never is
        assert!(!sweep_eligible(RecordKind::Announcement, "dev-1", old, "dev-1", cutoff));
        // Fresh records survive
        assert!(!sweep_eligible(RecordKind::Announcement, "dev-2", fresh, "dev-1", cutoff));
        // Old relay records go regardless of ownership
        assert!(sweep_eligible(RecordKind::Request, "r1", old, "dev-1", cutoff));
        assert!(sweep_eligible(RecordKind::Response, "r1", old, "dev-1", cutoff));
    }
}
