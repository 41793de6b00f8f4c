//! VPN API client interface

use crate::server::ConnectingDomain;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// HTTP status returned for domains in maintenance
pub const HTTP_UNPROCESSABLE_ENTITY: u16 = 422;

pub type ApiResult<T> = Result<T, ApiError>;

/// API call failures
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP {code}: {message}")]
    Http {
        code: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Connection failed")]
    Connection,

    #[error("Request timed out")]
    Timeout,

    #[error("Malformed response: {0}")]
    Parse(String),
}

impl ApiError {
    pub fn http_code(&self) -> Option<u16> {
        match self {
            ApiError::Http { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::Http { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Certificate request body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CertificateRequest {
    pub client_public_key: String,
    pub client_public_key_mode: String,
    pub device_name: Option<String>,
}

impl CertificateRequest {
    pub fn new(public_key_pem: impl Into<String>) -> Self {
        Self {
            client_public_key: public_key_pem.into(),
            client_public_key_mode: "EC".into(),
            device_name: None,
        }
    }
}

/// Issued certificate; times are epoch seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CertificateResponse {
    pub certificate: String,
    pub expiration_time: i64,
    pub refresh_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConnectingDomainResponse {
    pub connecting_domain: ConnectingDomain,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Session {
    #[serde(rename = "SessionID")]
    pub session_id: String,
    #[serde(rename = "ExitIP")]
    pub exit_ip: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionListResponse {
    pub code: i32,
    pub sessions: Vec<Session>,
}

/// Remote API used by the connection core
#[async_trait]
pub trait VpnApi: Send + Sync {
    async fn get_certificate(
        &self,
        session_id: &str,
        request: &CertificateRequest,
    ) -> ApiResult<CertificateResponse>;

    async fn get_connecting_domain(&self, domain_id: &str) -> ApiResult<ConnectingDomainResponse>;

    async fn get_session(&self) -> ApiResult<SessionListResponse>;
}
