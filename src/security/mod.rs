//! Identity, pairing, and payload encryption

pub mod crypto;
pub mod device;
pub mod identity;
pub mod pairing;

pub use crypto::{PayloadCipher, Side, generate_master_key};
pub use device::{DeviceRegistry, PairedDevice};
pub use identity::{DeviceIdentity, verify_signature};
pub use pairing::PairingPayload;
