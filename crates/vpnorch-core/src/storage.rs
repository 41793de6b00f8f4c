//! Key-value persistence and encrypted certificate storage

use crate::certificate::CertInfo;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::warn;

const NONCE_LEN: usize = 12;
const ENCRYPTED_PREFIX: &str = "enc:";
const PLAIN_PREFIX: &str = "plain:";

/// Storage errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Encryption failed")]
    Encryption,

    #[error("Decryption failed")]
    Decryption,
}

/// String key-value persistence
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn put(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Process-local store
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<HashMap<String, String>>,
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StorageError> {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), value.to_string());
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
        Ok(())
    }
}

/// Store persisted as one JSON object, rewritten on every change
#[derive(Debug)]
pub struct FileKeyValueStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl FileKeyValueStore {
    /// Open `path`; a missing file starts empty
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| StorageError::Serialization(e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(StorageError::Io(e.to_string())),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn write(&self, entries: &HashMap<String, String>) -> Result<(), StorageError> {
        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json).map_err(|e| StorageError::Io(e.to_string()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| StorageError::Io(e.to_string()))
    }

    fn modify(&self, f: impl FnOnce(&mut HashMap<String, String>)) -> Result<(), StorageError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StorageError::Io("store lock poisoned".into()))?;
        f(&mut entries);
        self.write(&entries)
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.modify(|entries| {
            entries.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.modify(|entries| {
            entries.remove(key);
        })
    }
}

/// Symmetric encryption for values at rest
pub trait SecretCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, StorageError>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, StorageError>;
}

/// ChaCha20-Poly1305 with a random nonce prepended to each value
pub struct ChaChaCipher {
    cipher: ChaCha20Poly1305,
}

impl ChaChaCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }
}

impl SecretCipher for ChaChaCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, StorageError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| StorageError::Encryption)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, StorageError> {
        if ciphertext.len() < NONCE_LEN {
            return Err(StorageError::Decryption);
        }
        let (nonce, body) = ciphertext.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| StorageError::Decryption)
    }
}

/// Per-session certificate persistence.
///
/// Values are encrypted when a cipher is available and stored in plain
/// text when encryption fails. Values that cannot be decrypted or parsed
/// read as absent.
#[derive(Clone)]
pub struct CertificateStorage {
    store: Arc<dyn KeyValueStore>,
    cipher: Option<Arc<dyn SecretCipher>>,
}

impl CertificateStorage {
    pub fn new(store: Arc<dyn KeyValueStore>, cipher: Option<Arc<dyn SecretCipher>>) -> Self {
        Self { store, cipher }
    }

    fn key(session_id: &str) -> String {
        format!("cert:{}", session_id)
    }

    pub fn get(&self, session_id: &str) -> Option<CertInfo> {
        let raw = self.store.get(&Self::key(session_id))?;
        let json = if let Some(encoded) = raw.strip_prefix(ENCRYPTED_PREFIX) {
            let cipher = self.cipher.as_ref()?;
            let bytes = BASE64.decode(encoded).ok()?;
            match cipher.decrypt(&bytes) {
                Ok(plain) => String::from_utf8(plain).ok()?,
                Err(e) => {
                    warn!("Stored certificate unreadable, treating as missing: {}", e);
                    return None;
                }
            }
        } else {
            raw.strip_prefix(PLAIN_PREFIX)?.to_string()
        };

        match serde_json::from_str(&json) {
            Ok(info) => Some(info),
            Err(e) => {
                warn!("Stored certificate malformed, treating as missing: {}", e);
                None
            }
        }
    }

    pub fn put(&self, session_id: &str, info: &CertInfo) -> Result<(), StorageError> {
        let json =
            serde_json::to_string(info).map_err(|e| StorageError::Serialization(e.to_string()))?;

        let value = match self.cipher.as_ref().map(|c| c.encrypt(json.as_bytes())) {
            Some(Ok(bytes)) => format!("{}{}", ENCRYPTED_PREFIX, BASE64.encode(bytes)),
            Some(Err(e)) => {
                warn!("Certificate encryption failed, storing unencrypted: {}", e);
                format!("{}{}", PLAIN_PREFIX, json)
            }
            None => format!("{}{}", PLAIN_PREFIX, json),
        };
        self.store.put(&Self::key(session_id), &value)
    }

    pub fn remove(&self, session_id: &str) -> Result<(), StorageError> {
        self.store.remove(&Self::key(session_id))
    }
}
