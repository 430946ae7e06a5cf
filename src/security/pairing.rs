//! Pairing payload exchanged once, out of band
//!
//! The host builds and signs this payload; the excluded UI layer renders it
//! as a scannable code. A client that imports it learns the host's identity,
//! its services, and (when transport encryption is enabled) the shared
//! master key. The Ed25519 signature binds the master key to the host's
//! public key so a tampered payload fails to import.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::identity::{DeviceIdentity, verify_signature};
use crate::relay::types::{PROTOCOL_VERSION, ServiceDescriptor};
use crate::{Error, Result};

/// One-shot pairing payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingPayload {
    /// Host's stable device identifier
    pub device_id: String,

    /// Host's Ed25519 public key (base64)
    pub public_key: String,

    /// Host's human-readable name
    pub device_name: String,

    /// Services offered at pairing time
    pub services: Vec<ServiceDescriptor>,

    /// Shared transport master key (base64); present only when payload
    /// encryption is enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_key: Option<String>,

    /// When the payload was generated
    pub timestamp: DateTime<Utc>,

    /// Relay protocol version
    pub version: u32,

    /// Ed25519 signature over the payload minus this field
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl PairingPayload {
    /// Build and sign a pairing payload for a host identity
    ///
    /// # Errors
    ///
    /// Returns error if the identity cannot sign
    pub fn build(
        identity: &DeviceIdentity,
        services: Vec<ServiceDescriptor>,
        master_key: Option<String>,
    ) -> Result<Self> {
        let mut payload = Self {
            device_id: identity.device_id.clone(),
            public_key: identity.public_key.clone(),
            device_name: identity.name.clone(),
            services,
            master_key,
            timestamp: Utc::now(),
            version: PROTOCOL_VERSION,
            signature: None,
        };

        let signature = identity.sign(&payload.signable_bytes()?)?;
        payload.signature = Some(signature);
        Ok(payload)
    }

    /// Encode as a single base64 blob for out-of-band transfer
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn encode(&self) -> Result<String> {
        Ok(STANDARD.encode(serde_json::to_vec(self)?))
    }

    /// Decode a base64 blob back into a payload (signature not yet checked)
    ///
    /// # Errors
    ///
    /// Returns error if the blob is not valid base64 JSON
    pub fn decode(encoded: &str) -> Result<Self> {
        let raw = STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::Auth(format!("invalid pairing payload encoding: {e}")))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Verify the payload's signature against its embedded public key
    ///
    /// # Errors
    ///
    /// Returns error if the signature is missing, malformed, or wrong
    pub fn verify(&self) -> Result<()> {
        let Some(signature) = &self.signature else {
            return Err(Error::Auth("pairing payload is unsigned".to_string()));
        };

        let mut unsigned = self.clone();
        unsigned.signature = None;

        if verify_signature(&self.public_key, &unsigned.signable_bytes()?, signature)? {
            Ok(())
        } else {
            Err(Error::Auth("pairing payload signature mismatch".to_string()))
        }
    }

    /// Canonical bytes the signature covers (payload with signature absent)
    fn signable_bytes(&self) -> Result<Vec<u8>> {
        debug_assert!(self.signature.is_none(), "sign over unsigned form only");
        Ok(serde_json::to_vec(self)?)
    }
}
