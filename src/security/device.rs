//! Paired device registry
//!
//! Devices accepted through the pairing flow, persisted in the local
//! database. The client keeps the hosts it paired with (including any
//! transport master key); the host keeps the clients it accepted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::DbPool;
use crate::{Error, Result};

/// A paired device record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairedDevice {
    /// Peer's stable device identifier
    pub id: String,

    /// Peer's Ed25519 public key (base64 encoded)
    pub public_key: String,

    /// Human-readable device name
    pub name: String,

    /// Shared transport master key (base64), present only when the pairing
    /// enabled payload encryption
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_key: Option<String>,

    /// When the device was paired
    pub paired_at: DateTime<Utc>,

    /// When the device was last seen
    pub last_seen: DateTime<Utc>,
}

/// Storage and lookup for paired devices
#[derive(Clone)]
pub struct DeviceRegistry {
    pool: DbPool,
}

impl DeviceRegistry {
    /// Create a registry over a database pool
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Register a newly paired device
    ///
    /// # Errors
    ///
    /// Returns error if the device is already paired or the database fails
    pub fn register(
        &self,
        device_id: &str,
        public_key: &str,
        name: &str,
        master_key: Option<&str>,
    ) -> Result<PairedDevice> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let now = Utc::now();

        conn.execute(
            "INSERT INTO paired_devices (id, public_key, name, master_key, paired_at, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                device_id,
                public_key,
                name,
                master_key,
                now.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )
        .map_err(|e| {
            if e.to_string().contains("UNIQUE constraint") {
                Error::Auth("device already paired".to_string())
            } else {
                Error::Database(e.to_string())
            }
        })?;

        tracing::info!(device_id, name, "device paired");

        Ok(PairedDevice {
            id: device_id.to_string(),
            public_key: public_key.to_string(),
            name: name.to_string(),
            master_key: master_key.map(ToString::to_string),
            paired_at: now,
            last_seen: now,
        })
    }

    /// Get a device by ID
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get(&self, device_id: &str) -> Result<Option<PairedDevice>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let result = conn.query_row(
            "SELECT id, public_key, name, master_key, paired_at, last_seen
             FROM paired_devices WHERE id = ?1",
            [device_id],
            row_to_device,
        );

        match result {
            Ok(device) => Ok(Some(device)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::Database(e.to_string())),
        }
    }

    /// Update last seen timestamp for a device
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn touch(&self, device_id: &str) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        conn.execute(
            "UPDATE paired_devices SET last_seen = ?1 WHERE id = ?2",
            [&Utc::now().to_rfc3339(), device_id],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    /// Remove a device
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn remove(&self, device_id: &str) -> Result<bool> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let rows = conn
            .execute("DELETE FROM paired_devices WHERE id = ?1", [device_id])
            .map_err(|e| Error::Database(e.to_string()))?;

        if rows > 0 {
            tracing::info!(device_id, "device unpaired");
        }

        Ok(rows > 0)
    }

    /// List all paired devices, most recently seen first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list(&self) -> Result<Vec<PairedDevice>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut stmt = conn
            .prepare(
                "SELECT id, public_key, name, master_key, paired_at, last_seen
                 FROM paired_devices ORDER BY last_seen DESC",
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        let devices = stmt
            .query_map([], row_to_device)
            .map_err(|e| Error::Database(e.to_string()))?
            .filter_map(std::result::Result::ok)
            .collect();

        Ok(devices)
    }

    /// Check if a device is paired
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn is_paired(&self, device_id: &str) -> Result<bool> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let exists: bool = conn
            .query_row(
                "SELECT 1 FROM paired_devices WHERE id = ?1",
                [device_id],
                |_| Ok(true),
            )
            .unwrap_or(false);

        Ok(exists)
    }
}

fn row_to_device(row: &rusqlite::Row<'_>) -> rusqlite::Result<PairedDevice> {
    Ok(PairedDevice {
        id: row.get(0)?,
        public_key: row.get(1)?,
        name: row.get(2)?,
        master_key: row.get(3)?,
        paired_at: parse_datetime(&row.get::<_, String>(4)?),
        last_seen: parse_datetime(&row.get::<_, String>(5)?),
    })
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;

    fn setup() -> DeviceRegistry {
        let pool = init_memory().unwrap();
        DeviceRegistry::new(pool)
    }

    #[test]
    fn register_and_get() {
        let registry = setup();

        let device = registry
            .register("device123", "pk_base64", "Studio Mac", Some("mk_base64"))
            .unwrap();
        assert_eq!(device.id, "device123");
        assert_eq!(device.master_key.as_deref(), Some("mk_base64"));

        let loaded = registry.get("device123").unwrap().unwrap();
        assert_eq!(loaded.name, "Studio Mac");
        assert!(registry.get("nonexistent").unwrap().is_none());
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = setup();

        registry
            .register("device789", "pk789", "Device 1", None)
            .unwrap();

        // Same ID should fail
        assert!(
            registry
                .register("device789", "pk_other", "Device 2", None)
                .is_err()
        );

        // Same public key should fail
        assert!(
            registry
                .register("different_id", "pk789", "Device 3", None)
                .is_err()
        );
    }

    #[test]
    fn remove_device() {
        let registry = setup();

        registry.register("deviceB", "pkB", "Test", None).unwrap();

        assert!(registry.is_paired("deviceB").unwrap());
        assert!(registry.remove("deviceB").unwrap());
        assert!(!registry.is_paired("deviceB").unwrap());

        // Removing non-existent device returns false
        assert!(!registry.remove("nonexistent").unwrap());
    }

    #[test]
    fn list_devices() {
        let registry = setup();

        registry.register("d1", "pk1", "Device 1", None).unwrap();
        registry.register("d2", "pk2", "Device 2", None).unwrap();

        let devices = registry.list().unwrap();
        assert_eq!(devices.len(), 2);
    }

    #[test]
    fn master_key_absent_without_encryption() {
        let registry = setup();
        registry.register("d1", "pk1", "Device 1", None).unwrap();

        let device = registry.get("d1").unwrap().unwrap();
        assert!(device.master_key.is_none());
    }
}
