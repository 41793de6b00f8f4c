//! Certificate Key Management
//!
//! Ed25519 key pairs used for certificate requests, plus the X25519 key
//! derived from the same secret that WireGuard uses as its tunnel key.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use ed25519_dalek::SigningKey;
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey};
use rand::rngs::OsRng;
use std::fmt;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

/// Key pair bound to a session certificate
#[derive(Clone)]
pub struct CertKeyPair {
    signing: SigningKey,
}

impl CertKeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore from a PKCS#8 PEM private key
    pub fn from_private_pem(pem: &str) -> Result<Self, KeyError> {
        let signing =
            SigningKey::from_pkcs8_pem(pem).map_err(|e| KeyError::Encoding(e.to_string()))?;
        Ok(Self { signing })
    }

    /// PKCS#8 PEM private key
    pub fn private_key_pem(&self) -> Result<String, KeyError> {
        self.signing
            .to_pkcs8_pem(LineEnding::LF)
            .map(|pem| pem.to_string())
            .map_err(|e| KeyError::Encoding(e.to_string()))
    }

    /// SPKI PEM public key, sent with certificate requests
    pub fn public_key_pem(&self) -> Result<String, KeyError> {
        self.signing
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| KeyError::Encoding(e.to_string()))
    }

    /// X25519 private key derived from the Ed25519 secret, base64
    pub fn x25519_base64(&self) -> String {
        BASE64.encode(self.x25519_secret().to_bytes())
    }

    /// X25519 public key matching [`Self::x25519_base64`]
    pub fn x25519_public_base64(&self) -> String {
        BASE64.encode(X25519Public::from(&self.x25519_secret()).as_bytes())
    }

    fn x25519_secret(&self) -> StaticSecret {
        StaticSecret::from(self.signing.to_scalar_bytes())
    }
}

impl fmt::Debug for CertKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertKeyPair")
            .field("x25519_public", &self.x25519_public_base64())
            .finish()
    }
}

/// Key encoding errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid base64 encoding")]
    InvalidBase64,

    #[error("Invalid key length (expected 32 bytes)")]
    InvalidLength,

    #[error("Key encoding error: {0}")]
    Encoding(String),
}

/// Decode a base64 X25519 public key
pub fn decode_x25519_public(s: &str) -> Result<[u8; 32], KeyError> {
    let bytes = BASE64.decode(s).map_err(|_| KeyError::InvalidBase64)?;
    bytes.try_into().map_err(|_| KeyError::InvalidLength)
}
