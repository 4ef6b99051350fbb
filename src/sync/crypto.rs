use crate::models::ThreadEntry;
use crate::{PerchError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use subtle::ConstantTimeEq;
use tracing::info;

const KEY_LEN: usize = 32;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// On-disk form of the wrapped sync data key
#[derive(Debug, Serialize, Deserialize)]
struct KeyFile {
    salt: String,
    nonce: String,
    wrapped_key: String,
    key_hash: String,
}

/// The unwrapped 32-byte symmetric sync key
#[derive(Clone)]
pub struct SyncKey([u8; KEY_LEN]);

impl SyncKey {
    /// Generates a fresh data key and persists it wrapped by a
    /// passphrase-derived key with a per-install random salt.
    pub async fn init(path: &Path, passphrase: &str) -> Result<Self> {
        let mut data_key = [0u8; KEY_LEN];
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut data_key);
        rand::rngs::OsRng.fill_bytes(&mut salt);
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let kek = derive_kek(passphrase, &salt)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&kek));
        let wrapped = cipher
            .encrypt(Nonce::from_slice(&nonce), data_key.as_slice())
            .map_err(|_| PerchError::Crypto("cannot wrap sync key".to_string()))?;

        let key_file = KeyFile {
            salt: BASE64.encode(salt),
            nonce: BASE64.encode(nonce),
            wrapped_key: BASE64.encode(&wrapped),
            key_hash: BASE64.encode(Sha256::digest(data_key)),
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, serde_json::to_vec_pretty(&key_file)?).await?;
        info!("Sync key initialized at {}", path.display());

        Ok(Self(data_key))
    }

    /// Unwraps the persisted key with the passphrase; a wrong passphrase is
    /// detected by comparing the decrypted key's hash in constant time.
    pub async fn unlock(path: &Path, passphrase: &str) -> Result<Self> {
        let raw = tokio::fs::read(path).await.map_err(|e| {
            PerchError::Crypto(format!("cannot read key file {}: {e}", path.display()))
        })?;
        let key_file: KeyFile = serde_json::from_slice(&raw)?;

        let salt = decode_b64(&key_file.salt, "salt")?;
        let nonce = decode_b64(&key_file.nonce, "nonce")?;
        let wrapped = decode_b64(&key_file.wrapped_key, "wrapped key")?;
        let stored_hash = decode_b64(&key_file.key_hash, "key hash")?;

        let kek = derive_kek(passphrase, &salt)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&kek));
        let data_key = cipher
            .decrypt(Nonce::from_slice(&nonce), wrapped.as_slice())
            .map_err(|_| PerchError::Crypto("wrong passphrase".to_string()))?;

        let hash = Sha256::digest(&data_key);
        if hash.as_slice().ct_eq(&stored_hash).unwrap_u8() != 1 {
            return Err(PerchError::Crypto("sync key hash mismatch".to_string()));
        }

        let key: [u8; KEY_LEN] = data_key
            .try_into()
            .map_err(|_| PerchError::Crypto("sync key has wrong length".to_string()))?;
        Ok(Self(key))
    }
}

/// Symmetric wrapper applied to synced payloads in transit
///
/// File bytes and the `summary`/`user_input` fields of thread entries are
/// sealed with AES-256-GCM; ciphertexts travel base64-encoded with the
/// nonce prepended. Decryption inverts exactly.
pub struct EncryptedEngine {
    cipher: Aes256Gcm,
}

impl EncryptedEngine {
    pub fn new(key: &SyncKey) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0)),
        }
    }

    pub fn encrypt_bytes(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| PerchError::Crypto("encryption failed".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn decrypt_bytes(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(PerchError::Crypto("ciphertext too short".to_string()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| PerchError::Crypto("decryption failed".to_string()))
    }

    pub fn encrypt_text(&self, plaintext: &str) -> Result<String> {
        Ok(BASE64.encode(self.encrypt_bytes(plaintext.as_bytes())?))
    }

    pub fn decrypt_text(&self, sealed: &str) -> Result<String> {
        let raw = decode_b64(sealed, "ciphertext")?;
        let plaintext = self.decrypt_bytes(&raw)?;
        String::from_utf8(plaintext)
            .map_err(|_| PerchError::Crypto("decrypted text is not UTF-8".to_string()))
    }

    /// Seals the free-text fields of a thread entry for transport.
    pub fn seal_entry(&self, entry: &ThreadEntry) -> Result<ThreadEntry> {
        let mut sealed = entry.clone();
        sealed.summary = self.encrypt_text(&entry.summary)?;
        sealed.user_input = entry
            .user_input
            .as_deref()
            .map(|input| self.encrypt_text(input))
            .transpose()?;
        Ok(sealed)
    }

    /// Inverts [`Self::seal_entry`].
    pub fn open_entry(&self, entry: &ThreadEntry) -> Result<ThreadEntry> {
        let mut opened = entry.clone();
        opened.summary = self.decrypt_text(&entry.summary)?;
        opened.user_input = entry
            .user_input
            .as_deref()
            .map(|input| self.decrypt_text(input))
            .transpose()?;
        Ok(opened)
    }
}

fn derive_kek(passphrase: &str, salt: &[u8]) -> Result<[u8; KEY_LEN]> {
    let mut kek = [0u8; KEY_LEN];
    argon2::Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt, &mut kek)
        .map_err(|e| PerchError::Crypto(format!("key derivation failed: {e}")))?;
    Ok(kek)
}

fn decode_b64(value: &str, what: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(value)
        .map_err(|e| PerchError::Crypto(format!("invalid base64 {what}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn init_then_unlock_round_trips_the_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync_key.json");

        let key = SyncKey::init(&path, "hunter2").await.unwrap();
        let unlocked = SyncKey::unlock(&path, "hunter2").await.unwrap();
        assert_eq!(key.0, unlocked.0);
    }

    #[tokio::test]
    async fn wrong_passphrase_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync_key.json");

        SyncKey::init(&path, "hunter2").await.unwrap();
        assert!(SyncKey::unlock(&path, "hunter3").await.is_err());
    }

    #[tokio::test]
    async fn encrypt_decrypt_inverts_exactly() {
        let dir = TempDir::new().unwrap();
        let key = SyncKey::init(&dir.path().join("k.json"), "pw").await.unwrap();
        let engine = EncryptedEngine::new(&key);

        for plaintext in ["", "short", "a longer payload with unicode: éß漢"] {
            let sealed = engine.encrypt_text(plaintext).unwrap();
            assert_ne!(sealed, plaintext);
            assert_eq!(engine.decrypt_text(&sealed).unwrap(), plaintext);
        }

        let bytes = vec![0u8, 1, 2, 255, 254, 0];
        let sealed = engine.encrypt_bytes(&bytes).unwrap();
        assert_eq!(engine.decrypt_bytes(&sealed).unwrap(), bytes);
    }

    #[tokio::test]
    async fn different_keys_cannot_decrypt() {
        let dir = TempDir::new().unwrap();
        let a = SyncKey::init(&dir.path().join("a.json"), "pw").await.unwrap();
        let b = SyncKey::init(&dir.path().join("b.json"), "pw").await.unwrap();

        let sealed = EncryptedEngine::new(&a).encrypt_text("secret").unwrap();
        assert!(EncryptedEngine::new(&b).decrypt_text(&sealed).is_err());
    }

    #[tokio::test]
    async fn thread_entries_seal_and_open() {
        let dir = TempDir::new().unwrap();
        let key = SyncKey::init(&dir.path().join("k.json"), "pw").await.unwrap();
        let engine = EncryptedEngine::new(&key);

        let entry = ThreadEntry {
            id: 7,
            timestamp: Utc::now(),
            machine_id: "mac".to_string(),
            task_id: Some("t1".to_string()),
            agent: Some("mock".to_string()),
            skill: None,
            user_input: Some("how did it go?".to_string()),
            summary: "finished the deploy".to_string(),
            tokens_used: Some(12),
        };

        let sealed = engine.seal_entry(&entry).unwrap();
        assert_ne!(sealed.summary, entry.summary);
        assert_ne!(sealed.user_input, entry.user_input);
        // Structural fields stay in the clear.
        assert_eq!(sealed.machine_id, entry.machine_id);
        assert_eq!(sealed.timestamp, entry.timestamp);

        let opened = engine.open_entry(&sealed).unwrap();
        assert_eq!(opened.summary, entry.summary);
        assert_eq!(opened.user_input, entry.user_input);
    }
}
