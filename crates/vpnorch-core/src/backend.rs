//! Tunnel backends
//!
//! A backend drives one tunnel protocol. The core never looks at concrete
//! backend types: it resolves entry points through
//! [`VpnBackend::prepare_for_connection`], starts and stops tunnels and
//! watches the raw tunnel states a backend broadcasts.
//!
//! Backends that authenticate sessions over the tunnel also open a local
//! agent connection. Agent callbacks arrive through an [`AgentListener`]
//! tagged with the generation of the connection that produced them, so
//! late events of a closed agent can be told apart from current ones.

use crate::certificate::CertificateResult;
use crate::intent::{AnyConnectIntent, NetShieldProtocol};
use crate::server::{ConnectionParams, ProtocolInfo, Server, TransmissionProtocol, VpnProtocol};
use crate::settings::LocalUserSettings;
use crate::state::{ErrorType, VpnState};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Backend errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("Local agent not supported by {0:?}")]
    AgentUnsupported(VpnProtocol),

    #[error("Local agent error: {0}")]
    Agent(String),

    #[error("Tunnel error: {0}")]
    Tunnel(String),
}

/// Certificate and key handed to the local agent
#[derive(Clone, PartialEq)]
pub struct AgentCredentials {
    pub certificate_pem: String,
    pub private_key_pem: String,
}

impl AgentCredentials {
    pub fn from_result(result: &CertificateResult) -> Option<Self> {
        match result {
            CertificateResult::Success { certificate_pem, private_key_pem } => Some(Self {
                certificate_pem: certificate_pem.clone(),
                private_key_pem: private_key_pem.clone(),
            }),
            CertificateResult::Error(_) => None,
        }
    }
}

impl fmt::Debug for AgentCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AgentCredentials([redacted])")
    }
}

/// Features negotiated with the server over the local agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentFeatures {
    pub netshield: NetShieldProtocol,
    pub randomized_nat: bool,
    /// Exit label of a Secure Core or bounced connection
    pub bouncing: Option<String>,
}

impl AgentFeatures {
    pub fn from_settings(settings: &LocalUserSettings, bouncing: Option<String>) -> Self {
        Self {
            netshield: settings.netshield,
            randomized_nat: settings.randomized_nat,
            bouncing,
        }
    }
}

/// State reported by a local agent connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Connecting,
    Connected,
    SoftJailed,
    HardJailed,
    ConnectionError,
    ServerUnreachable,
    ClientCertificateExpired,
    ClientCertificateUnknownCa,
    ServerCertificateError,
    WaitingForNetwork,
    Disconnected,
}

/// Error codes sent by the server over the local agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentErrorCode {
    /// Session limit of the plan reached, whatever the tier
    MaxSessions,
    BadCertSignature,
    CertificateRevoked,
    CertificateExpired,
    KeyUsedMultipleTimes,
    TorrentNotAllowed,
    BadBehavior,
    PolicyViolationLowPlan,
    PolicyViolationDelinquent,
    ServerError,
    RestrictedServer,
    Unknown,
    Other(i32),
}

/// What the core does about an agent error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentErrorAction {
    /// Tear the tunnel down and report a final error
    Disable(ErrorType),
    /// Report a non-final error and leave the decision to the error handler
    Report(ErrorType),
    /// New key pair, new certificate and a full reconnect
    RevokeAndReconnect,
    /// Refresh the certificate and reconnect only the agent
    RefreshCertificate,
    /// Nothing to do but wait for the next state
    Wait,
}

impl AgentErrorCode {
    pub fn action(&self) -> AgentErrorAction {
        use AgentErrorCode::*;
        match self {
            MaxSessions => AgentErrorAction::Disable(ErrorType::MaxSessions),
            BadCertSignature | CertificateRevoked => AgentErrorAction::RevokeAndReconnect,
            CertificateExpired => AgentErrorAction::RefreshCertificate,
            KeyUsedMultipleTimes => AgentErrorAction::Disable(ErrorType::KeyUsedMultipleTimes),
            TorrentNotAllowed => AgentErrorAction::Disable(ErrorType::TorrentNotAllowed),
            BadBehavior => AgentErrorAction::Disable(ErrorType::PolicyViolationBadBehavior),
            PolicyViolationLowPlan => AgentErrorAction::Report(ErrorType::PolicyViolationLowPlan),
            PolicyViolationDelinquent => AgentErrorAction::Disable(ErrorType::PolicyViolationDelinquent),
            ServerError | Unknown => AgentErrorAction::Report(ErrorType::ServerError),
            RestrictedServer => AgentErrorAction::Wait,
            Other(_) => AgentErrorAction::Wait,
        }
    }
}

/// Error reported by a local agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentError {
    pub code: AgentErrorCode,
    pub description: String,
    /// The agent gave up on the session
    pub is_final: bool,
}

/// Callback from a local agent connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    State(AgentState),
    Error(AgentError),
}

#[derive(Debug)]
pub(crate) struct AgentSignal {
    pub generation: u64,
    pub event: AgentEvent,
}

/// Where an agent connection reports to
#[derive(Debug, Clone)]
pub struct AgentListener {
    generation: u64,
    tx: mpsc::UnboundedSender<AgentSignal>,
}

impl AgentListener {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<AgentSignal>) -> Self {
        Self { generation, tx }
    }

    pub fn on_state(&self, state: AgentState) {
        self.send(AgentEvent::State(state));
    }

    pub fn on_error(&self, error: AgentError) {
        self.send(AgentEvent::Error(error));
    }

    fn send(&self, event: AgentEvent) {
        // The supervisor may already be gone
        let _ = self.tx.send(AgentSignal {
            generation: self.generation,
            event,
        });
    }
}

/// An open local agent connection
pub trait AgentConnection: Send + Sync {
    fn set_features(&self, features: &AgentFeatures);

    fn set_connectivity(&self, connected: bool);

    fn close(&self);
}

/// A tunnel protocol engine
#[async_trait]
pub trait VpnBackend: Send + Sync {
    fn protocol(&self) -> VpnProtocol;

    /// Entry points usable for `server` over the given transports.
    ///
    /// With `scan` the entry points are probed first and only answering
    /// ones are returned, at most `number_of_ports` ports per transport.
    /// `wait_for_all` collects every answering port instead of the first.
    async fn prepare_for_connection(
        &self,
        intent: &AnyConnectIntent,
        server: &Server,
        transmissions: &[TransmissionProtocol],
        scan: bool,
        number_of_ports: usize,
        wait_for_all: bool,
    ) -> Vec<ProtocolInfo>;

    async fn connect(&self, params: &ConnectionParams);

    /// Stop the tunnel. The backend ends up in `Disabled`.
    async fn disconnect(&self);

    /// Raw tunnel states
    fn subscribe_state(&self) -> broadcast::Receiver<VpnState>;

    /// Current raw tunnel state
    fn state(&self) -> VpnState;

    fn supports_local_agent(&self) -> bool {
        false
    }

    async fn create_agent_connection(
        &self,
        _credentials: &AgentCredentials,
        _hostname: &str,
        _listener: AgentListener,
        _features: AgentFeatures,
    ) -> Result<Box<dyn AgentConnection>, BackendError> {
        Err(BackendError::AgentUnsupported(self.protocol()))
    }
}

/// A backend and the parameters it connects with
#[derive(Clone)]
pub struct PrepareResult {
    pub backend: Arc<dyn VpnBackend>,
    pub params: ConnectionParams,
}

impl PartialEq for PrepareResult {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.backend, &other.backend) && self.params == other.params
    }
}

impl fmt::Debug for PrepareResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrepareResult")
            .field("backend", &self.backend.protocol())
            .field("params", &self.params)
            .finish()
    }
}
