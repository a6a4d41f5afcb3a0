//! Sync credentials stored on company rows.
//!
//! A `sync_api_key` is `base64(nonce || AES-256-GCM("<username>:<password>"))`,
//! sealed with the process-wide [`SyncKey`].

use std::fmt;

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;

use crate::error::{Error, Result};

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
/// Length of a [`KEY_SIZE`] key in padded standard base64.
pub const ENCODED_KEY_LEN: usize = 44;

/// The symmetric secret that seals `sync_api_key` values.
#[derive(Clone)]
pub struct SyncKey {
    bytes: [u8; KEY_SIZE],
}

impl SyncKey {
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Parses the 44-character standard base64 form.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let encoded = encoded.trim();
        if encoded.len() != ENCODED_KEY_LEN {
            return Err(Error::Config(format!(
                "sync key must be {ENCODED_KEY_LEN} base64 characters, got {}",
                encoded.len()
            )));
        }
        let decoded = STANDARD
            .decode(encoded)
            .map_err(|e| Error::Config(format!("sync key is not valid base64: {e}")))?;
        let bytes: [u8; KEY_SIZE] = decoded
            .try_into()
            .map_err(|_| Error::Config(format!("sync key must decode to {KEY_SIZE} bytes")))?;
        Ok(Self { bytes })
    }

    #[must_use]
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.bytes)
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(GenericArray::from_slice(&self.bytes))
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| Error::Crypto("encryption failed".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(sealed))
    }

    pub fn open(&self, sealed: &str) -> Result<Vec<u8>> {
        let sealed = STANDARD
            .decode(sealed.trim())
            .map_err(|e| Error::Crypto(format!("sealed value is not valid base64: {e}")))?;
        if sealed.len() <= NONCE_SIZE {
            return Err(Error::Crypto("sealed value too short".to_string()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.cipher()
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::Crypto("decryption failed".to_string()))
    }
}

impl fmt::Debug for SyncKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Login credentials for a remote primary.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Decrypts a company's `sync_api_key`.
    pub fn decrypt(api_key: &str, key: &SyncKey) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("company has no sync api key".to_string()));
        }
        let plain = String::from_utf8(key.open(api_key)?)
            .map_err(|_| Error::Crypto("sync api key is not UTF-8".to_string()))?;
        let (username, password) = plain
            .split_once(':')
            .ok_or_else(|| Error::Crypto("sync api key is malformed".to_string()))?;
        Ok(Self::new(username, password))
    }

    pub fn encrypt(&self, key: &SyncKey) -> Result<String> {
        if self.username.contains(':') {
            return Err(Error::BadRequest("username cannot contain ':'".to_string()));
        }
        key.seal(format!("{}:{}", self.username, self.password).as_bytes())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_base64_is_44_chars() {
        let key = SyncKey::generate();
        let encoded = key.to_base64();
        assert_eq!(encoded.len(), ENCODED_KEY_LEN);
        let parsed = SyncKey::from_base64(&encoded).unwrap();
        assert_eq!(parsed.bytes, key.bytes);
    }

    #[test]
    fn test_key_rejects_wrong_length() {
        assert!(matches!(
            SyncKey::from_base64("c2hvcnQ="),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_credentials_round_trip() {
        let key = SyncKey::generate();
        let creds = Credentials::new("acme-sync", "pa:ss");
        let api_key = creds.encrypt(&key).unwrap();
        assert!(!api_key.contains("acme-sync"));
        assert_eq!(Credentials::decrypt(&api_key, &key).unwrap(), creds);
    }

    #[test]
    fn test_wrong_key_fails() {
        let api_key = Credentials::new("u", "p")
            .encrypt(&SyncKey::generate())
            .unwrap();
        assert!(matches!(
            Credentials::decrypt(&api_key, &SyncKey::generate()),
            Err(Error::Crypto(_))
        ));
    }

    #[test]
    fn test_nonce_varies() {
        let key = SyncKey::generate();
        let creds = Credentials::new("u", "p");
        assert_ne!(creds.encrypt(&key).unwrap(), creds.encrypt(&key).unwrap());
    }

    #[test]
    fn test_debug_redacts_password() {
        let shown = format!("{:?}", Credentials::new("u", "hunter2"));
        assert!(!shown.contains("hunter2"));
    }
}
