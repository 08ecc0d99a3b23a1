//! At-rest encryption envelope
//!
//! `EnvelopeService::seal` and `EnvelopeService::open` are the only routines
//! that turn record content into ciphertext and back. Both backends go
//! through [`seal_content`] / [`reveal_content`]; the backfill engine calls
//! `seal_record` / `open_record` directly, so a live write and a migration
//! produce identical envelopes.
//!
//! Each seal draws a fresh AES-256-GCM data key. The data key is wrapped for
//! the long-lived X25519 public key: an ephemeral X25519 secret is agreed with
//! it, HKDF-SHA256 turns the shared secret into a key-encryption key, and
//! AES-256-GCM wraps the data key under that.

mod keys;

pub use keys::{KeyPair, PRIVATE_KEY_FILE, PUBLIC_KEY_FILE};

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::path::Path;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::error::{Result, VaultError};
use crate::types::{is_sealed, Metadata, ENCRYPTED_FLAG, ENVELOPE_KEY};

/// Algorithm identifier stored with every envelope
pub const ENVELOPE_ALG: &str = "x25519-hkdf-sha256+aes-256-gcm";

const HKDF_INFO: &[u8] = b"memvault envelope v1";
const NONCE_LEN: usize = 12;

/// Encrypted content plus its wrapped data key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub alg: String,
    pub ephemeral_key: String,
    pub wrapped_key: String,
    pub key_nonce: String,
    pub nonce: String,
    #[serde(skip)]
    pub ciphertext: String,
}

/// Wraps and unwraps record content with the service's key pair
pub struct EnvelopeService {
    keys: KeyPair,
}

impl EnvelopeService {
    pub fn new(keys: KeyPair) -> Self {
        Self { keys }
    }

    /// Load the key pair from `key_dir`, creating it on first use
    pub fn from_key_dir(key_dir: &Path) -> Result<Self> {
        Ok(Self::new(KeyPair::load_or_generate(key_dir)?))
    }

    /// Encrypt `plaintext` under a fresh data key
    pub fn seal(&self, plaintext: &str) -> Result<Envelope> {
        let mut data_key = [0u8; 32];
        OsRng.fill_bytes(&mut data_key);
        let (nonce, ciphertext) = aead_encrypt(&data_key, plaintext.as_bytes())?;

        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(self.keys.public());
        let kek = derive_kek(shared.as_bytes(), &ephemeral_public, self.keys.public())?;
        let (key_nonce, wrapped_key) = aead_encrypt(&kek, &data_key)?;

        Ok(Envelope {
            alg: ENVELOPE_ALG.to_string(),
            ephemeral_key: STANDARD.encode(ephemeral_public.as_bytes()),
            wrapped_key: STANDARD.encode(wrapped_key),
            key_nonce: STANDARD.encode(key_nonce),
            nonce: STANDARD.encode(nonce),
            ciphertext: STANDARD.encode(ciphertext),
        })
    }

    /// Unwrap the data key and decrypt
    pub fn open(&self, envelope: &Envelope) -> Result<String> {
        if envelope.alg != ENVELOPE_ALG {
            return Err(VaultError::Encryption(format!(
                "unsupported envelope algorithm: {}",
                envelope.alg
            )));
        }

        let ephemeral_bytes: [u8; 32] = decode(&envelope.ephemeral_key)?
            .try_into()
            .map_err(|_| VaultError::Encryption("bad ephemeral key length".to_string()))?;
        let ephemeral_public = PublicKey::from(ephemeral_bytes);
        let shared = self.keys.secret().diffie_hellman(&ephemeral_public);
        let kek = derive_kek(shared.as_bytes(), &ephemeral_public, self.keys.public())?;

        let data_key = aead_decrypt(
            &kek,
            &decode(&envelope.key_nonce)?,
            &decode(&envelope.wrapped_key)?,
        )?;
        let plaintext = aead_decrypt(
            &data_key,
            &decode(&envelope.nonce)?,
            &decode(&envelope.ciphertext)?,
        )?;

        String::from_utf8(plaintext).map_err(|e| VaultError::Encryption(e.to_string()))
    }

    /// Seal content for storage, recording the envelope in `metadata`.
    ///
    /// Returns the value to store in the content column.
    pub fn seal_record(&self, plaintext: &str, metadata: &mut Metadata) -> Result<String> {
        let envelope = self.seal(plaintext)?;
        metadata.insert(ENCRYPTED_FLAG.to_string(), serde_json::Value::Bool(true));
        metadata.insert(ENVELOPE_KEY.to_string(), serde_json::to_value(&envelope)?);
        Ok(envelope.ciphertext)
    }

    /// Decrypt a stored record. Unsealed content is returned unchanged.
    pub fn open_record(&self, stored: &str, metadata: &Metadata) -> Result<String> {
        if !is_sealed(metadata) {
            return Ok(stored.to_string());
        }
        let mut envelope: Envelope = metadata
            .get(ENVELOPE_KEY)
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .ok_or_else(|| VaultError::Encryption("envelope missing from metadata".to_string()))?;
        envelope.ciphertext = stored.to_string();
        self.open(&envelope)
    }
}

/// Prepare content for storage through the optional envelope service
pub fn seal_content(
    envelope: Option<&EnvelopeService>,
    plaintext: &str,
    metadata: &mut Metadata,
) -> Result<String> {
    match envelope {
        Some(service) => service.seal_record(plaintext, metadata),
        None => Ok(plaintext.to_string()),
    }
}

/// Turn stored content back into plaintext for a read.
///
/// Never fails: a sealed record that cannot be opened is logged and returned
/// as stored. On success the wrapped-key material is dropped from `metadata`,
/// leaving only the `encrypted` flag visible to callers.
pub fn reveal_content(
    envelope: Option<&EnvelopeService>,
    stored: String,
    metadata: &mut Metadata,
) -> String {
    if !is_sealed(metadata) {
        return stored;
    }
    let Some(service) = envelope else {
        tracing::warn!("Record is sealed but encryption is not configured; returning stored value");
        return stored;
    };
    match service.open_record(&stored, metadata) {
        Ok(plaintext) => {
            metadata.remove(ENVELOPE_KEY);
            plaintext
        }
        Err(e) => {
            tracing::warn!("Failed to decrypt record content, returning stored value: {}", e);
            stored
        }
    }
}

fn derive_kek(shared: &[u8], ephemeral: &PublicKey, recipient: &PublicKey) -> Result<[u8; 32]> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral.as_bytes());
    salt[32..].copy_from_slice(recipient.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut kek = [0u8; 32];
    hk.expand(HKDF_INFO, &mut kek)
        .map_err(|e| VaultError::Encryption(e.to_string()))?;
    Ok(kek)
}

fn aead_encrypt(key: &[u8], data: &[u8]) -> Result<([u8; NONCE_LEN], Vec<u8>)> {
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| VaultError::Encryption(e.to_string()))?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), data)
        .map_err(|e| VaultError::Encryption(e.to_string()))?;
    Ok((nonce_bytes, ciphertext))
}

fn aead_decrypt(key: &[u8], nonce: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if nonce.len() != NONCE_LEN {
        return Err(VaultError::Encryption("bad nonce length".to_string()));
    }
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| VaultError::Encryption(e.to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), data)
        .map_err(|e| VaultError::Encryption(e.to_string()))
}

fn decode(value: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(value)
        .map_err(|e| VaultError::Encryption(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn service() -> EnvelopeService {
        EnvelopeService::new(KeyPair::generate())
    }

    #[test]
    fn test_round_trip() {
        let svc = service();
        let envelope = svc.seal("hello world").unwrap();
        assert_ne!(envelope.ciphertext, "hello world");
        assert_eq!(svc.open(&envelope).unwrap(), "hello world");
    }

    #[test]
    fn test_each_seal_uses_fresh_key_material() {
        let svc = service();
        let a = svc.seal("same text").unwrap();
        let b = svc.seal("same text").unwrap();
        assert_ne!(a.ciphertext, b.ciphertext);
        assert_ne!(a.wrapped_key, b.wrapped_key);
        assert_ne!(a.ephemeral_key, b.ephemeral_key);
    }

    #[test]
    fn test_record_round_trip_and_flag() {
        let svc = service();
        let mut metadata = Metadata::from([("source".to_string(), json!("chat"))]);
        let stored = svc.seal_record("hello world", &mut metadata).unwrap();

        assert_eq!(metadata[ENCRYPTED_FLAG], json!(true));
        assert!(metadata.contains_key(ENVELOPE_KEY));
        assert!(!stored.contains("hello"));

        let plaintext = reveal_content(Some(&svc), stored, &mut metadata);
        assert_eq!(plaintext, "hello world");
        assert!(!metadata.contains_key(ENVELOPE_KEY));
        assert_eq!(metadata[ENCRYPTED_FLAG], json!(true));
    }

    #[test]
    fn test_unflagged_record_unchanged() {
        let svc = service();
        let mut metadata = Metadata::new();
        assert_eq!(
            reveal_content(Some(&svc), "plain text".to_string(), &mut metadata),
            "plain text"
        );

        let mut explicit_false = Metadata::from([(ENCRYPTED_FLAG.to_string(), json!(false))]);
        assert_eq!(
            svc.open_record("still plain", &explicit_false).unwrap(),
            "still plain"
        );
        assert_eq!(
            reveal_content(None, "still plain".to_string(), &mut explicit_false),
            "still plain"
        );
    }

    #[test]
    fn test_decrypt_failure_falls_back_to_stored_value() {
        let svc = service();
        let mut metadata = Metadata::new();
        let stored = svc.seal_record("secret", &mut metadata).unwrap();

        // Wrong key pair
        let other = service();
        let mut copy = metadata.clone();
        assert_eq!(reveal_content(Some(&other), stored.clone(), &mut copy), stored);
        assert!(copy.contains_key(ENVELOPE_KEY));

        // Corrupt ciphertext
        let mut copy = metadata.clone();
        assert_eq!(
            reveal_content(Some(&svc), "AAAA".to_string(), &mut copy),
            "AAAA"
        );

        // Missing envelope
        let mut flag_only = Metadata::from([(ENCRYPTED_FLAG.to_string(), json!(true))]);
        assert_eq!(reveal_content(Some(&svc), stored.clone(), &mut flag_only), stored);

        // Encryption disabled
        let mut copy = metadata.clone();
        assert_eq!(reveal_content(None, stored.clone(), &mut copy), stored);
    }

    #[test]
    fn test_reloaded_keys_open_earlier_records() {
        let dir = tempdir().unwrap();
        let mut metadata = Metadata::new();
        let stored = {
            let svc = EnvelopeService::from_key_dir(dir.path()).unwrap();
            svc.seal_record("survives restarts", &mut metadata).unwrap()
        };

        let reloaded = EnvelopeService::from_key_dir(dir.path()).unwrap();
        assert_eq!(
            reloaded.open_record(&stored, &metadata).unwrap(),
            "survives restarts"
        );
    }

    #[test]
    fn test_seal_content_without_service_is_identity() {
        let mut metadata = Metadata::new();
        assert_eq!(seal_content(None, "abc", &mut metadata).unwrap(), "abc");
        assert!(metadata.is_empty());
    }
}
