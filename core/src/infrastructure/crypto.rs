// Copyright (c) 2026 Termflux
// SPDX-License-Identifier: AGPL-3.0

//! Envelope encryption for workspace secrets.
//!
//! Each write derives a fresh AES-256 key from the process master key via
//! PBKDF2-HMAC-SHA-256 over a per-write 16-byte salt, then seals with
//! AES-256-GCM under a per-write 12-byte nonce. A decryption failure is
//! fatal for that secret only; corrupted plaintext is never returned.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use rand::RngCore;
use sha2::Sha256;

use crate::domain::errors::CoreError;
use crate::domain::secret::{SecretEnvelope, ENVELOPE_ALG_ID};

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KDF_ITERATIONS: u32 = 100_000;

/// Process-wide master key. Initialized once at startup; tests construct
/// their own.
#[derive(Clone)]
pub struct MasterKey(Vec<u8>);

impl MasterKey {
    pub fn new(material: impl Into<Vec<u8>>) -> Result<Self, CoreError> {
        let material = material.into();
        if material.len() < 16 {
            return Err(CoreError::Validation(
                "master key must be at least 16 bytes".into(),
            ));
        }
        Ok(Self(material))
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

/// Seals and opens secret envelopes under the master key.
pub struct EnvelopeCipher {
    master_key: MasterKey,
}

impl EnvelopeCipher {
    pub fn new(master_key: MasterKey) -> Self {
        Self { master_key }
    }

    fn derive_key(&self, salt: &[u8]) -> [u8; 32] {
        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(
            self.master_key.as_bytes(),
            salt,
            KDF_ITERATIONS,
            &mut key,
        );
        key
    }

    /// Encrypt plaintext with fresh salt and nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<SecretEnvelope, CoreError> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut nonce);

        let key = self.derive_key(&salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CoreError::Backend("secret encryption failed".into()))?;

        Ok(SecretEnvelope {
            alg_id: ENVELOPE_ALG_ID.to_string(),
            salt_b64: B64.encode(salt),
            nonce_b64: B64.encode(nonce),
            ct_b64: B64.encode(ciphertext),
        })
    }

    /// Decrypt an envelope. Refuses unknown algorithm ids and any
    /// authentication failure.
    pub fn open(&self, envelope: &SecretEnvelope) -> Result<Vec<u8>, CoreError> {
        if envelope.alg_id != ENVELOPE_ALG_ID {
            return Err(CoreError::Backend(format!(
                "unknown secret envelope algorithm '{}'",
                envelope.alg_id
            )));
        }

        let salt = B64
            .decode(&envelope.salt_b64)
            .map_err(|e| CoreError::Backend(format!("corrupt envelope salt: {e}")))?;
        let nonce = B64
            .decode(&envelope.nonce_b64)
            .map_err(|e| CoreError::Backend(format!("corrupt envelope nonce: {e}")))?;
        let ciphertext = B64
            .decode(&envelope.ct_b64)
            .map_err(|e| CoreError::Backend(format!("corrupt envelope ciphertext: {e}")))?;
        if nonce.len() != NONCE_LEN {
            return Err(CoreError::Backend("corrupt envelope nonce length".into()));
        }

        let key = self.derive_key(&salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| CoreError::Backend("secret decryption failed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> EnvelopeCipher {
        EnvelopeCipher::new(MasterKey::new("test-master-key-material").unwrap())
    }

    #[test]
    fn seal_open_round_trip() {
        let cipher = cipher();
        let envelope = cipher.seal(b"s3cret!").unwrap();
        assert_eq!(cipher.open(&envelope).unwrap(), b"s3cret!");
    }

    #[test]
    fn every_seal_uses_fresh_salt_and_nonce() {
        let cipher = cipher();
        let a = cipher.seal(b"same").unwrap();
        let b = cipher.seal(b"same").unwrap();
        assert_ne!(a.salt_b64, b.salt_b64);
        assert_ne!(a.nonce_b64, b.nonce_b64);
        assert_ne!(a.ct_b64, b.ct_b64);
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let cipher = cipher();
        let mut envelope = cipher.seal(b"payload").unwrap();
        let mut ct = B64.decode(&envelope.ct_b64).unwrap();
        ct[0] ^= 0xff;
        envelope.ct_b64 = B64.encode(ct);
        assert!(cipher.open(&envelope).is_err());
    }

    #[test]
    fn wrong_master_key_fails_to_open() {
        let envelope = cipher().seal(b"payload").unwrap();
        let other = EnvelopeCipher::new(MasterKey::new("another-master-key-value").unwrap());
        assert!(other.open(&envelope).is_err());
    }

    #[test]
    fn unknown_algorithm_is_refused() {
        let cipher = cipher();
        let mut envelope = cipher.seal(b"x").unwrap();
        envelope.alg_id = "rot13".to_string();
        assert!(cipher.open(&envelope).is_err());
    }

    #[test]
    fn short_master_keys_are_rejected() {
        assert!(MasterKey::new("short").is_err());
    }
}
