//! Client-side device discovery
//!
//! Polls the coordination store for host announcements, de-duplicates by
//! device id, and classifies each entry by freshness. The polling cadence
//! adapts: fast until a healthy link is established, exponentially slower
//! toward a cap while it stays healthy, snapped back to fast on any failure.
//! The loop awaits each query before sleeping again, so two discovery
//! queries never overlap, and dropping the task cancels the loop cleanly.

pub mod cadence;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::Result;
use crate::relay::types::{
    ABSOLUTE_CUTOFF_SECS, DeviceAnnouncement, DeviceStatus, STALENESS_THRESHOLD_SECS,
};
use crate::store::{QueryFilter, RecordKind, RecordStore};

pub use cadence::{AdaptiveCadence, FAST_INTERVAL, MAX_INTERVAL};

/// How a discovered device renders in the client's device list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    /// Seen within the staleness threshold
    Active,
    /// Not seen recently; kept in the list until the absolute cutoff
    Stale,
    /// Host marked itself offline on shutdown
    Offline,
}

/// One de-duplicated discovery result
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredDevice {
    /// The freshest announcement for this device id
    pub announcement: DeviceAnnouncement,
    /// Rendered presence
    pub presence: Presence,
}

/// Discovery thresholds
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Age past which a device renders stale
    pub staleness: Duration,
    /// Age past which an entry leaves the list entirely
    pub cutoff: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            staleness: Duration::from_secs(STALENESS_THRESHOLD_SECS),
            cutoff: Duration::from_secs(ABSOLUTE_CUTOFF_SECS),
        }
    }
}

/// Polls announcements and maintains the device list
pub struct DiscoveryClient {
    store: Arc<dyn RecordStore>,
    config: DiscoveryConfig,
}

impl DiscoveryClient {
    /// Create a discovery client over a coordination store
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>, config: DiscoveryConfig) -> Self {
        Self { store, config }
    }

    /// Query, de-duplicate, and classify all announcements once
    ///
    /// # Errors
    ///
    /// Returns error if the store query fails
    pub async fn refresh(&self) -> Result<Vec<DiscoveredDevice>> {
        let records = self
            .store
            .query(RecordKind::Announcement, &QueryFilter::new())
            .await?;
        let now = Utc::now();

        // De-duplicate by device id, keeping the freshest announcement
        let mut freshest: HashMap<String, DeviceAnnouncement> = HashMap::new();
        for record in records {
            let announcement: DeviceAnnouncement = match record.decode() {
                Ok(announcement) => announcement,
                Err(e) => {
                    tracing::warn!(id = %record.id, error = %e, "skipping malformed announcement");
                    continue;
                }
            };

            match freshest.get(&announcement.device_id) {
                Some(existing) if existing.last_seen >= announcement.last_seen => {}
                _ => {
                    freshest.insert(announcement.device_id.clone(), announcement);
                }
            }
        }

        let mut devices: Vec<DiscoveredDevice> = freshest
            .into_values()
            .filter(|a| age_of(a, now) < self.config.cutoff)
            .map(|announcement| {
                let presence = classify(&announcement, now, self.config.staleness);
                DiscoveredDevice {
                    announcement,
                    presence,
                }
            })
            .collect();

        // Active devices first, then by name for a stable rendering
        devices.sort_by(|a, b| {
            (a.presence != Presence::Active)
                .cmp(&(b.presence != Presence::Active))
                .then_with(|| a.announcement.device_name.cmp(&b.announcement.device_name))
        });

        Ok(devices)
    }

    /// Run the discovery loop, publishing each snapshot into a watch channel
    ///
    /// The cadence speeds up on failure and decays toward its cap while
    /// healthy. Dropping the returned future (or aborting its task) stops
    /// the loop; no query is ever left overlapping another.
    pub async fn run(self, snapshots: watch::Sender<Vec<DiscoveredDevice>>) {
        let mut cadence = AdaptiveCadence::default();

        loop {
            match self.refresh().await {
                Ok(devices) => {
                    cadence.on_success();
                    if snapshots.send(devices).is_err() {
                        tracing::debug!("discovery watcher gone, stopping loop");
                        return;
                    }
                }
                Err(e) => {
                    cadence.on_failure();
                    tracing::warn!(error = %e, "discovery query failed");
                }
            }

            tokio::time::sleep(cadence.current()).await;
        }
    }
}

fn age_of(announcement: &DeviceAnnouncement, now: DateTime<Utc>) -> Duration {
    announcement.age(now).to_std().unwrap_or(Duration::ZERO)
}

/// Classify one announcement against the staleness threshold
fn classify(
    announcement: &DeviceAnnouncement,
    now: DateTime<Utc>,
    staleness: Duration,
) -> Presence {
    if announcement.status == DeviceStatus::Offline {
        Presence::Offline
    } else if announcement.is_live(now, staleness) {
        Presence::Active
    } else {
        Presence::Stale
    }
}
