//! Optional transport encryption for relay payloads
//!
//! Payload blobs are encrypted before they enter the coordination store and
//! decrypted after they leave it; the store only ever carries opaque bytes.
//!
//! Scheme: a 32-byte master key is shared once at pairing time, and two
//! direction-specific ChaCha20-Poly1305 keys are derived from it with
//! HKDF-SHA256 so each direction has an independent nonce space:
//!
//! - info = `courier-c2h-v1`: client→host (host decrypts)
//! - info = `courier-h2c-v1`: host→client (host encrypts)
//!
//! Sealed payload layout: `nonce_12 || ciphertext`. Nonces are random —
//! records in the store are unordered, so counter nonces would need
//! per-record bookkeeping the protocol does not have.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit},
};
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;

use crate::{Error, Result};

/// Master key length in bytes
pub const MASTER_KEY_LEN: usize = 32;

/// Nonce length prepended to every sealed payload
const NONCE_LEN: usize = 12;

const INFO_C2H: &[u8] = b"courier-c2h-v1";
const INFO_H2C: &[u8] = b"courier-h2c-v1";

/// Which end of the relay this process is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Mobile client: seals requests, opens responses
    Client,
    /// Host: opens requests, seals responses
    Host,
}

/// Generate a fresh master key, base64 encoded for the pairing payload
#[must_use]
pub fn generate_master_key() -> String {
    let mut key = [0u8; MASTER_KEY_LEN];
    OsRng.fill_bytes(&mut key);
    STANDARD.encode(key)
}

/// Symmetric payload cipher derived from a shared master key
pub struct PayloadCipher {
    seal_cipher: ChaCha20Poly1305,
    open_cipher: ChaCha20Poly1305,
}

impl PayloadCipher {
    /// Build a cipher pair for one side of the relay
    ///
    /// # Errors
    ///
    /// Returns error if the master key is not valid base64 of 32 bytes
    pub fn from_master_key(master_key_b64: &str, side: Side) -> Result<Self> {
        let raw = STANDARD
            .decode(master_key_b64)
            .map_err(|e| Error::Crypto(format!("invalid master key encoding: {e}")))?;
        if raw.len() != MASTER_KEY_LEN {
            return Err(Error::Crypto(format!(
                "master key must be {MASTER_KEY_LEN} bytes, got {}",
                raw.len()
            )));
        }

        let c2h = derive_cipher(&raw, INFO_C2H)?;
        let h2c = derive_cipher(&raw, INFO_H2C)?;

        let (seal_cipher, open_cipher) = match side {
            Side::Client => (c2h, h2c),
            Side::Host => (h2c, c2h),
        };

        Ok(Self {
            seal_cipher,
            open_cipher,
        })
    }

    /// Encrypt a payload for the outgoing direction
    ///
    /// # Errors
    ///
    /// Returns error if encryption fails
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .seal_cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| Error::Crypto("AEAD encrypt failed".to_string()))?;

        let mut sealed = nonce_bytes.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt a payload from the incoming direction
    ///
    /// # Errors
    ///
    /// Returns error if the payload is malformed or fails authentication
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(Error::Crypto("sealed payload too short".to_string()));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);

        self.open_cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| Error::Crypto("AEAD decrypt failed".to_string()))
    }
}

fn derive_cipher(ikm: &[u8], info: &[u8]) -> Result<ChaCha20Poly1305> {
    let hk = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm)
        .map_err(|_| Error::Crypto("HKDF expand failed".to_string()))?;
    Ok(ChaCha20Poly1305::new(Key::from_slice(&okm)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_client_to_host() {
        let key = generate_master_key();
        let client = PayloadCipher::from_master_key(&key, Side::Client).unwrap();
        let host = PayloadCipher::from_master_key(&key, Side::Host).unwrap();

        let sealed = client.seal(b"run system_info").unwrap();
        assert_ne!(sealed, b"run system_info");

        let opened = host.open(&sealed).unwrap();
        assert_eq!(opened, b"run system_info");
    }

    #[test]
    fn round_trip_host_to_client() {
        let key = generate_master_key();
        let client = PayloadCipher::from_master_key(&key, Side::Client).unwrap();
        let host = PayloadCipher::from_master_key(&key, Side::Host).unwrap();

        let sealed = host.seal(b"exit 0").unwrap();
        assert_eq!(client.open(&sealed).unwrap(), b"exit 0");
    }

    #[test]
    fn directions_are_independent() {
        let key = generate_master_key();
        let client = PayloadCipher::from_master_key(&key, Side::Client).unwrap();

        // A client cannot open its own sealed output; that direction belongs
        // to the host
        let sealed = client.seal(b"request").unwrap();
        assert!(client.open(&sealed).is_err());
    }

    #[test]
    fn wrong_key_fails_cleanly() {
        let client = PayloadCipher::from_master_key(&generate_master_key(), Side::Client).unwrap();
        let host = PayloadCipher::from_master_key(&generate_master_key(), Side::Host).unwrap();

        let sealed = client.seal(b"secret").unwrap();
        let err = host.open(&sealed).unwrap_err();
        assert!(matches!(err, Error::Crypto(_)));
    }

    #[test]
    fn rejects_malformed_master_key() {
        assert!(PayloadCipher::from_master_key("not base64!!", Side::Client).is_err());

        let short = STANDARD.encode([0u8; 16]);
        assert!(PayloadCipher::from_master_key(&short, Side::Client).is_err());
    }

    #[test]
    fn rejects_truncated_payload() {
        let key = generate_master_key();
        let cipher = PayloadCipher::from_master_key(&key, Side::Host).unwrap();
        assert!(cipher.open(&[1, 2, 3]).is_err());
    }
}
