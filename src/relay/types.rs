//! Relay record types exchanged through the coordination store

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Relay protocol version carried in every announcement
pub const PROTOCOL_VERSION: u32 = 1;

/// Age past which a presence announcement is treated as no-longer-live
pub const STALENESS_THRESHOLD_SECS: u64 = 45;

/// Absolute age past which records belonging to another device are eligible
/// for deletion by any host's housekeeping pass
pub const ABSOLUTE_CUTOFF_SECS: u64 = 24 * 60 * 60;

/// Default claim lease; an expired lease makes a claimed request
/// reclaimable. Sized past the tool timeout cap so a healthy host never
/// loses a claim mid-execution.
pub const DEFAULT_CLAIM_LEASE_SECS: u64 = 360;

/// Host liveness as advertised in its announcement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    /// Host is up and heartbeating
    #[default]
    Active,
    /// Host noticed store trouble and is re-establishing itself
    Reconnecting,
    /// Host marked itself gone on shutdown (best-effort; absence of this
    /// value says nothing — clients must fall back to staleness)
    Offline,
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// What kind of service a host advertises
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    /// Chat/completion-style language model endpoint
    LanguageModel,
    /// Image generation endpoint
    ImageGeneration,
    /// Anything else the host owner wired up
    Custom,
}

/// One service a host exposes to paired clients
///
/// `id` is the client's primary key for the logical service: it must stay
/// identical across announcements, and a changed id is a different service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Stable identity of the logical service
    pub id: Uuid,

    /// Human-readable name
    pub name: String,

    /// Service category
    pub kind: ServiceKind,

    /// Local port the service listens on (host side only ever dials loopback)
    pub port: u16,

    /// Wire format the service speaks (e.g. "openai", "ollama")
    pub api_format: String,

    /// Whether the service process was reachable at announcement time
    pub is_running: bool,

    /// Optional named workflows the service supports
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflows: Option<Vec<String>>,
}

/// Host presence and capability record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAnnouncement {
    /// Stable opaque device identifier, generated once and persisted
    pub device_id: String,

    /// Human-readable device name
    pub device_name: String,

    /// Services currently offered
    pub services: Vec<ServiceDescriptor>,

    /// Refreshed on every publish; staleness is judged against this
    pub last_seen: DateTime<Utc>,

    /// Advertised liveness
    pub status: DeviceStatus,

    /// Protocol version for forward compatibility
    pub protocol_version: u32,
}

impl DeviceAnnouncement {
    /// Validate the announcement's internal invariants
    ///
    /// # Errors
    ///
    /// Returns error if two services share an id
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for service in &self.services {
            if !seen.insert(service.id) {
                return Err(Error::Validation(format!(
                    "duplicate service id {} in announcement for {}",
                    service.id, self.device_id
                )));
            }
        }
        Ok(())
    }

    /// Age of the announcement relative to `now`
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> ChronoDuration {
        now - self.last_seen
    }

    /// Whether the announcement is fresh enough to render the device active
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>, staleness: std::time::Duration) -> bool {
        self.status != DeviceStatus::Offline
            && self.age(now) < ChronoDuration::from_std(staleness).unwrap_or(ChronoDuration::MAX)
    }
}

/// Lifecycle of a relay request record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Published by the client, not yet picked up
    Pending,
    /// A host holds the claim lease and is working on it
    Claimed,
    /// Terminal: response published, execution succeeded
    Completed,
    /// Terminal: response published, execution failed
    Failed,
}

/// A client-published request addressed to one host
///
/// The id is generated client-side, globally unique, and immutable — it
/// doubles as the idempotency key. The client owns the record until a host
/// claims it; ownership of the mutable status fields transfers at claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRequest {
    /// Immutable request id (idempotency key)
    pub id: String,

    /// Device that should execute this request
    pub target_device_id: String,

    /// Service to proxy to; `None` routes to the host's built-in endpoints
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_id: Option<Uuid>,

    /// What the host should do with the payload
    pub endpoint: String,

    /// HTTP-equivalent method for the endpoint
    pub method: String,

    /// Opaque payload bytes, optionally encrypted
    #[serde(with = "b64")]
    pub payload: Vec<u8>,

    /// When the client published the request
    pub created_at: DateTime<Utc>,

    /// Request lifecycle state
    pub status: RequestStatus,

    /// Claiming host's device id, set at claim
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,

    /// Claim lease expiry; an expired lease makes the request reclaimable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_expires_at: Option<DateTime<Utc>>,
}

impl RelayRequest {
    /// Build a new pending request with a fresh id
    #[must_use]
    pub fn new(
        target_device_id: &str,
        service_id: Option<Uuid>,
        endpoint: &str,
        method: &str,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            target_device_id: target_device_id.to_string(),
            service_id,
            endpoint: endpoint.to_string(),
            method: method.to_string(),
            payload,
            created_at: Utc::now(),
            status: RequestStatus::Pending,
            claimed_by: None,
            claim_expires_at: None,
        }
    }

    /// Whether a claim on this request has lapsed
    #[must_use]
    pub fn claim_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == RequestStatus::Claimed
            && self.claim_expires_at.is_some_and(|expiry| now > expiry)
    }
}

/// Terminal disposition of a relay response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    /// The requested operation produced a usable payload
    Success,
    /// The operation failed; the payload carries a structured error
    Error,
}

/// Host-published response, keyed by the request id it answers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayResponse {
    /// Foreign key to the request; never changes
    pub request_id: String,

    /// Response payload bytes, optionally encrypted
    #[serde(with = "b64")]
    pub payload: Vec<u8>,

    /// HTTP-equivalent status code
    pub status_code: u16,

    /// When the host finished the operation
    pub completed_at: DateTime<Utc>,

    /// Terminal disposition
    pub status: ResponseStatus,
}

impl RelayResponse {
    /// Build a success response
    #[must_use]
    pub fn success(request_id: &str, status_code: u16, payload: Vec<u8>) -> Self {
        Self {
            request_id: request_id.to_string(),
            payload,
            status_code,
            completed_at: Utc::now(),
            status: ResponseStatus::Success,
        }
    }

    /// Build an error response with a structured error payload
    ///
    /// The client must always receive a terminal signal; this is the shape
    /// every failure path reduces to.
    #[must_use]
    pub fn failure(request_id: &str, status_code: u16, kind: &str, message: &str) -> Self {
        let payload = serde_json::json!({
            "error": { "kind": kind, "message": message }
        });
        Self {
            request_id: request_id.to_string(),
            payload: payload.to_string().into_bytes(),
            status_code,
            completed_at: Utc::now(),
            status: ResponseStatus::Error,
        }
    }
}

/// Base64 (standard alphabet) serde adapter for payload bytes
pub(crate) mod b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn announcement_rejects_duplicate_service_ids() {
        let mut a = service("chat");
        let b = service("draw");
        let mut announcement = DeviceAnnouncement {
            device_id: "dev-1".to_string(),
            device_name: "studio".to_string(),
            services: vec![a.clone(), b],
            last_seen: Utc::now(),
            status: DeviceStatus::Active,
            protocol_version: PROTOCOL_VERSION,
        };
        announcement.validate().unwrap();

        a.name = "chat-2".to_string();
        announcement.services.push(a);
        assert!(announcement.validate().is_err());
    }

    #[test]
    fn liveness_respects_staleness_threshold() {
        let now = Utc::now();
        let staleness = std::time::Duration::from_secs(STALENESS_THRESHOLD_SECS);

        let mut announcement = DeviceAnnouncement {
            device_id: "dev-1".to_string(),
            device_name: "studio".to_string(),
            services: vec![],
            last_seen: now - ChronoDuration::seconds(10),
            status: DeviceStatus::Active,
            protocol_version: PROTOCOL_VERSION,
        };
        assert!(announcement.is_live(now, staleness));

        announcement.last_seen = now - ChronoDuration::seconds(46);
        assert!(!announcement.is_live(now, staleness));

        // An explicit offline marker wins even when fresh
        announcement.last_seen = now;
        announcement.status = DeviceStatus::Offline;
        assert!(!announcement.is_live(now, staleness));
    }

    #[test]
    fn request_ids_are_unique_and_pending() {
        let a = RelayRequest::new("dev-1", None, "/tools/run", "POST", vec![]);
        let b = RelayRequest::new("dev-1", None, "/tools/run", "POST", vec![]);
        assert_ne!(a.id, b.id);
        assert_eq!(a.status, RequestStatus::Pending);
        assert!(a.claimed_by.is_none());
    }

    #[test]
    fn claim_expiry() {
        let now = Utc::now();
        let mut request = RelayRequest::new("dev-1", None, "/tools/run", "POST", vec![]);
        assert!(!request.claim_expired(now));

        request.status = RequestStatus::Claimed;
        request.claim_expires_at = Some(now - ChronoDuration::seconds(1));
        assert!(request.claim_expired(now));

        request.claim_expires_at = Some(now + ChronoDuration::seconds(60));
        assert!(!request.claim_expired(now));
    }

    #[test]
    fn payload_round_trips_as_base64() {
        let request = RelayRequest::new("dev-1", None, "/tools/run", "POST", vec![0, 159, 146, 150]);
        let value = serde_json::to_value(&request).unwrap();
        assert!(value["payload"].is_string());

        let back: RelayRequest = serde_json::from_value(value).unwrap();
        assert_eq!(back.payload, vec![0, 159, 146, 150]);
    }

    #[test]
    fn failure_response_carries_structured_error() {
        let response = RelayResponse::failure("req-1", 422, "validation", "missing argument: path");
        assert_eq!(response.status, ResponseStatus::Error);

        let body: serde_json::Value = serde_json::from_slice(&response.payload).unwrap();
        assert_eq!(body["error"]["kind"], "validation");
    }
}
