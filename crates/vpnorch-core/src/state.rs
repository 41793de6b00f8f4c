//! Connection state model

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error kinds carried by [`VpnState::Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    /// Transient credential problem, retried after a server round-trip
    AuthFailedInternal,
    AuthFailed,
    PeerAuthFailed,
    /// Control channel unreachable, subject to backoff and fallback
    UnreachableInternal,
    Unreachable,
    MaxSessions,
    PolicyViolationLowPlan,
    PolicyViolationDelinquent,
    PolicyViolationBadBehavior,
    TorrentNotAllowed,
    KeyUsedMultipleTimes,
    ServerError,
    ServerInMaintenance,
    LocalAgentError,
    NoProfileFallbackAvailable,
    GenericError,
}

impl ErrorType {
    /// Errors routed through the fallback handler instead of being shown
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorType::AuthFailedInternal
                | ErrorType::UnreachableInternal
                | ErrorType::PolicyViolationLowPlan
                | ErrorType::ServerError
        )
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// VPN connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VpnState {
    Disabled,
    ScanningPorts,
    CheckingAvailability,
    WaitingForNetwork,
    Connecting,
    Reconnecting,
    Connected,
    Disconnecting,
    Error { kind: ErrorType, is_final: bool },
}

impl VpnState {
    /// Non-final error of the given kind
    pub fn error(kind: ErrorType) -> Self {
        VpnState::Error { kind, is_final: false }
    }

    /// Final error of the given kind
    pub fn final_error(kind: ErrorType) -> Self {
        VpnState::Error { kind, is_final: true }
    }

    /// Stable name used when the state is persisted
    pub fn name(&self) -> &'static str {
        match self {
            VpnState::Disabled => "DISABLED",
            VpnState::ScanningPorts => "SCANNING_PORTS",
            VpnState::CheckingAvailability => "CHECKING_AVAILABILITY",
            VpnState::WaitingForNetwork => "WAITING_FOR_NETWORK",
            VpnState::Connecting => "CONNECTING",
            VpnState::Reconnecting => "RECONNECTING",
            VpnState::Connected => "CONNECTED",
            VpnState::Disconnecting => "DISCONNECTING",
            VpnState::Error { .. } => "ERROR",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, VpnState::Connected)
    }

    /// Any state where a tunnel is being set up
    pub fn is_establishing_connection(&self) -> bool {
        matches!(
            self,
            VpnState::Connecting
                | VpnState::WaitingForNetwork
                | VpnState::Reconnecting
                | VpnState::ScanningPorts
                | VpnState::CheckingAvailability
        )
    }

    pub fn error_kind(&self) -> Option<ErrorType> {
        match self {
            VpnState::Error { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn is_final_error(&self) -> bool {
        matches!(self, VpnState::Error { is_final: true, .. })
    }
}

impl fmt::Display for VpnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VpnState::Error { kind, is_final } => {
                write!(f, "ERROR({}{})", kind, if *is_final { ", final" } else { "" })
            }
            other => f.write_str(other.name()),
        }
    }
}
