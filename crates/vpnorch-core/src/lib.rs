//! vpnorch - VPN Connection Orchestration
//!
//! Drives opaque protocol backends (WireGuard, OpenVPN, IKEv2) through a
//! single connection state machine with automatic fallback.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   connect/disconnect   ┌──────────────────────────┐
//! │  UI / API    │───────────────────────▶│  VpnConnectionManager    │
//! │  GuestHole   │                        │  (one control sequence)  │
//! └──────────────┘                        └────┬───────────┬─────────┘
//!        ▲                                     │           │ states
//!        │ Status                    prepare / │           ▼
//! ┌──────┴───────────┐               connect   │   ┌───────────────────┐
//! │ VpnStateMonitor  │◀────────────────────────┼───│ VpnBackend        │
//! └──────────────────┘                         │   │ (+ local agent)   │
//!                                              ▼   └───────────────────┘
//!                         ┌──────────────────────────────┐
//!                         │ VpnBackendProvider           │
//!                         │ PrepareForConnection + probe │
//!                         └──────────────────────────────┘
//! ```
//!
//! Backend errors go to the [`VpnConnectionErrorHandler`], whose switches
//! re-enter the manager. The local agent path is fed by the
//! [`CertificateRepository`] and the unreachable backoff tracker.
//!
//! # Features
//!
//! - **Smart Protocol**: scan every enabled transport, fall back unscanned
//! - **Fallbacks**: server, protocol and plan based switches
//! - **Certificates**: collapsed refreshes, encrypted at rest
//! - **Guest Hole**: reference counted temporary tunnel for blocked APIs

mod agent;
mod api;
mod backend;
mod certificate;
mod config;
mod delegate;
mod error_handler;
mod guest_hole;
mod intent;
mod keys;
mod manager;
mod monitor;
mod platform;
mod prepare;
mod provider;
mod server;
mod settings;
mod state;
mod storage;
mod telemetry;
mod unreachable;
mod user;

#[cfg(test)]
mod test_support;

pub use api::{
    ApiError, ApiResult, CertificateRequest, CertificateResponse, ConnectingDomainResponse, Session,
    SessionListResponse, VpnApi,
};
pub use backend::{
    AgentConnection, AgentCredentials, AgentError, AgentErrorAction, AgentErrorCode, AgentEvent, AgentFeatures,
    AgentListener, AgentState, BackendError, PrepareResult, VpnBackend,
};
pub use certificate::{
    next_refresh_delay, CertInfo, CertRefreshScheduler, CertificateRepository, CertificateResult, CertificateUpdate,
};
pub use config::{
    CertificateConfig, ConfigError, ConnectionConfig, CoreConfig, FeatureFlags, GuestHoleConfig, PortsConfig,
    SmartConfig, UnreachableConfig,
};
pub use delegate::{
    BackgroundUiDelegate, GuestHoleUiDelegate, PermissionGranted, ServerRestrictedReason, VpnPermissionDelegate,
    VpnUiDelegate,
};
pub use error_handler::{
    ErrorHandlerDeps, StuckConnectionHandler, Switch, SwitchServerReason, VpnConnectionErrorHandler,
    VpnFallbackResult,
};
pub use guest_hole::{GuestHole, GuestHoleLease, GuestHoleScope, LAST_SERVER_KEY};
pub use intent::{
    AnyConnectIntent, ConnectIntent, IntentTarget, NetShieldProtocol, ServerFeature, ServerId, SettingsOverrides,
};
pub use keys::{decode_x25519_public, CertKeyPair, KeyError};
pub use manager::{ManagerDeps, VpnConnectionManager};
pub use monitor::{STATE_NAME_KEY, Status, StatusTransition, VpnStateMonitor};
pub use platform::{
    Clock, ManualClock, NetworkMonitor, NetworkStatus, NoWakeLock, SystemClock, WakeLock, WakeLockGuard,
};
pub use prepare::{AvailabilityProbe, IKEV2_PORT, PrepareForConnection};
pub use provider::{PingResult, SmartProtocolProvider, VpnBackendProvider};
pub use server::{
    tier, ConnectingDomain, ConnectionParams, PhysicalServer, ProtocolEntry, ProtocolInfo, ProtocolSelection, Server,
    ServerListUpdater, ServerManager, TransmissionProtocol, VpnProtocol, VpnUser,
};
pub use settings::{LocalUserSettings, SettingsForConnection};
pub use state::{ErrorType, VpnState};
pub use storage::{
    CertificateStorage, ChaChaCipher, FileKeyValueStore, KeyValueStore, MemoryKeyValueStore, SecretCipher,
    StorageError,
};
pub use telemetry::{ConnectTrigger, DisconnectTrigger, LogTelemetry, VpnConnectionTelemetry};
pub use unreachable::{LocalAgentUnreachableTracker, UnreachableAction};
pub use user::{CurrentUser, InfoChange, SessionId, UserPlanManager};
