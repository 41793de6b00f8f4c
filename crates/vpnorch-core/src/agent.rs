//! Local Agent Supervisor
//!
//! Runs next to an active tunnel and turns the raw backend states plus the
//! local agent callbacks into the single state stream the connection
//! manager consumes.
//!
//! While the tunnel is up and the connection authenticates over a local
//! agent, the combined state follows the agent: the connection only counts
//! as `Connected` once the agent says so. Agent errors are mapped to
//! certificate refreshes, key revocations, unreachable handling or errors
//! that take the tunnel down.
//!
//! Helper jobs (certificate fetches, agent opens, reconnects) run as tasks
//! owned by the supervisor and report back over an internal channel, so
//! dropping the supervisor cancels all of them and closes the agent.

use crate::backend::{AgentConnection, AgentCredentials, AgentEvent, AgentFeatures, AgentListener, AgentSignal, AgentState, AgentErrorAction, VpnBackend};
use crate::certificate::{CertificateRepository, CertificateUpdate};
use crate::server::ConnectionParams;
use crate::settings::SettingsForConnection;
use crate::state::{ErrorType, VpnState};
use crate::unreachable::{LocalAgentUnreachableTracker, UnreachableAction};
use crate::platform::NetworkMonitor;
use crate::user::SessionId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// What a supervisor needs besides the backend
#[derive(Clone)]
pub(crate) struct AgentContext {
    pub certificates: CertificateRepository,
    pub tracker: Arc<LocalAgentUnreachableTracker>,
    pub settings: SettingsForConnection,
    pub network: NetworkMonitor,
    pub session_id: Option<SessionId>,
    /// How long to wait for the tunnel to go down after a disabling error
    pub disconnect_settle: Duration,
}

/// Handle of a running supervisor; dropping it stops supervision
pub(crate) struct LocalAgentSupervisor {
    task: JoinHandle<()>,
}

impl LocalAgentSupervisor {
    /// Start supervising `backend` for `params`.
    ///
    /// Subscribes to the backend before returning, so no state emitted by a
    /// subsequent `connect` is missed.
    pub fn start(
        ctx: AgentContext,
        backend: Arc<dyn VpnBackend>,
        params: ConnectionParams,
    ) -> (Self, mpsc::UnboundedReceiver<VpnState>) {
        let use_agent =
            ctx.session_id.is_some() && backend.supports_local_agent() && !params.intent.is_guest_hole();
        debug!("Supervising {} (local agent: {})", params, use_agent);

        let (out, states) = mpsc::unbounded_channel();
        let (agent_tx, agent_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let tunnel_rx = backend.subscribe_state();

        let supervision = Supervision {
            tunnel: backend.state(),
            ctx,
            backend,
            params,
            use_agent,
            out,
            internal: internal_tx,
            agent_tx,
            agent: None,
            agent_state: None,
            credentials: None,
            generation: 0,
            opening: false,
            disabling: false,
            revoking: false,
            last_emitted: None,
            jobs: JoinSet::new(),
        };
        let task = tokio::spawn(supervision.run(tunnel_rx, agent_rx, internal_rx));
        (Self { task }, states)
    }
}

impl Drop for LocalAgentSupervisor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// An agent connection, closed when dropped
struct OpenAgent {
    connection: Box<dyn AgentConnection>,
    credentials: AgentCredentials,
}

impl Drop for OpenAgent {
    fn drop(&mut self) {
        self.connection.close();
    }
}

enum Internal {
    Opened { generation: u64, agent: OpenAgent },
    OpenFailed { generation: u64 },
    /// Credentials the agent should run with
    Credentials(AgentCredentials),
    CertificateFailed,
    /// The tunnel was taken down because of an error
    Disabled(ErrorType),
}

struct Supervision {
    ctx: AgentContext,
    backend: Arc<dyn VpnBackend>,
    params: ConnectionParams,
    use_agent: bool,
    out: mpsc::UnboundedSender<VpnState>,
    internal: mpsc::UnboundedSender<Internal>,
    agent_tx: mpsc::UnboundedSender<AgentSignal>,
    tunnel: VpnState,
    agent: Option<OpenAgent>,
    agent_state: Option<AgentState>,
    /// Credentials of the current or pending agent
    credentials: Option<AgentCredentials>,
    generation: u64,
    opening: bool,
    /// Tunnel states are hidden until the disabling error is published
    disabling: bool,
    revoking: bool,
    last_emitted: Option<VpnState>,
    jobs: JoinSet<()>,
}

impl Supervision {
    async fn run(
        mut self,
        mut tunnel_rx: broadcast::Receiver<VpnState>,
        mut agent_rx: mpsc::UnboundedReceiver<AgentSignal>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
    ) {
        let mut certificates = self.ctx.certificates.subscribe_updates();
        let mut network = self.ctx.network.subscribe();
        let mut settings = self.ctx.settings.subscribe();
        let (mut certificates_open, mut network_open, mut settings_open) = (true, true, true);

        // State the backend was in before we subscribed
        self.on_tunnel_state(self.tunnel);

        loop {
            tokio::select! {
                state = tunnel_rx.recv() => match state {
                    Ok(state) => self.on_tunnel_state(state),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Missed {} tunnel states", skipped);
                        let current = self.backend.state();
                        self.on_tunnel_state(current);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some(signal) = agent_rx.recv() => {
                    if signal.generation == self.generation && !self.disabling {
                        self.on_agent_event(signal.event);
                    }
                }
                Some(message) = internal_rx.recv() => self.on_internal(message),
                update = certificates.recv(), if certificates_open => match update {
                    Ok(update) => self.on_certificate_update(update),
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => certificates_open = false,
                },
                changed = network.changed(), if network_open => {
                    if changed.is_err() {
                        network_open = false;
                        continue;
                    }
                    let connected = network.borrow_and_update().is_connected();
                    self.ctx.tracker.on_network_changed();
                    if let Some(agent) = &self.agent {
                        agent.connection.set_connectivity(connected);
                    }
                }
                changed = settings.changed(), if settings_open => {
                    if changed.is_err() {
                        settings_open = false;
                        continue;
                    }
                    let _ = settings.borrow_and_update();
                    if let Some(agent) = &self.agent {
                        agent.connection.set_features(&self.features());
                    }
                }
            }
            while self.jobs.try_join_next().is_some() {}
        }
    }

    fn features(&self) -> AgentFeatures {
        let settings = self.ctx.settings.get_for(&self.params.intent);
        let bouncing = self.params.server.secure_core.then(|| self.params.domain.id.clone());
        AgentFeatures::from_settings(&settings, bouncing)
    }

    fn emit(&mut self, state: VpnState) {
        // Errors are events: repeat them even if unchanged
        if self.last_emitted == Some(state) && state.error_kind().is_none() {
            return;
        }
        self.last_emitted = Some(state);
        let _ = self.out.send(state);
    }

    fn on_tunnel_state(&mut self, state: VpnState) {
        self.tunnel = state;
        if state == VpnState::Connecting {
            self.disabling = false;
            self.revoking = false;
        }
        if self.disabling {
            debug!("Hiding tunnel state {} while disabling", state);
            return;
        }

        if state != VpnState::Connected {
            self.close_agent();
            self.emit(state);
            return;
        }
        if !self.use_agent {
            self.emit(state);
            return;
        }
        if self.agent.is_none() && !self.opening {
            self.open_agent(None);
        }
        let combined = match self.agent_state {
            Some(AgentState::Connected) => VpnState::Connected,
            _ => VpnState::Connecting,
        };
        self.emit(combined);
    }

    fn on_agent_event(&mut self, event: AgentEvent) {
        if self.tunnel != VpnState::Connected {
            return;
        }
        match event {
            AgentEvent::State(state) => self.on_agent_state(state),
            AgentEvent::Error(error) => {
                warn!("Local agent error {:?}: {}", error.code, error.description);
                match error.code.action() {
                    AgentErrorAction::Disable(kind) => self.set_error(kind),
                    AgentErrorAction::Report(kind) => self.emit(VpnState::error(kind)),
                    AgentErrorAction::RevokeAndReconnect => self.revoke(),
                    AgentErrorAction::RefreshCertificate => self.refresh_certificate(),
                    AgentErrorAction::Wait => debug!("Waiting for the next agent state"),
                }
            }
        }
    }

    fn on_agent_state(&mut self, state: AgentState) {
        debug!("Local agent state: {:?}", state);
        self.agent_state = Some(state);
        let silent = self.ctx.tracker.is_silent_reconnect();
        match state {
            AgentState::Connected => {
                if !silent {
                    self.ctx.tracker.reset(true);
                }
                self.emit(VpnState::Connected);
            }
            AgentState::Connecting | AgentState::Disconnected => {
                self.emit(if silent { VpnState::Connected } else { VpnState::Connecting });
            }
            AgentState::SoftJailed | AgentState::HardJailed => self.emit(VpnState::Connecting),
            AgentState::WaitingForNetwork => self.emit(VpnState::WaitingForNetwork),
            AgentState::ConnectionError | AgentState::ServerUnreachable => self.on_unreachable(),
            AgentState::ClientCertificateExpired | AgentState::ClientCertificateUnknownCa => {
                self.refresh_certificate()
            }
            AgentState::ServerCertificateError => self.set_error(ErrorType::PeerAuthFailed),
        }
    }

    fn on_unreachable(&mut self) {
        match self.ctx.tracker.on_unreachable() {
            UnreachableAction::SilentReconnect => {
                info!("Local agent unreachable, reconnecting silently");
                let credentials = self.credentials.clone();
                self.open_agent(credentials);
                self.emit(VpnState::Connected);
            }
            UnreachableAction::Error => self.emit(VpnState::error(ErrorType::Unreachable)),
            UnreachableAction::Fallback => {
                self.ctx.tracker.on_fallback_triggered();
                self.emit(VpnState::error(ErrorType::UnreachableInternal));
            }
        }
    }

    fn on_internal(&mut self, message: Internal) {
        match message {
            Internal::Opened { generation, agent } => {
                if generation != self.generation || self.tunnel != VpnState::Connected || self.disabling {
                    return;
                }
                agent.connection.set_connectivity(self.ctx.network.is_connected());
                self.credentials = Some(agent.credentials.clone());
                self.agent = Some(agent);
                self.opening = false;
            }
            Internal::OpenFailed { generation } => {
                if generation == self.generation {
                    self.opening = false;
                    self.set_error(ErrorType::LocalAgentError);
                }
            }
            Internal::Credentials(credentials) => {
                if self.tunnel == VpnState::Connected
                    && !self.disabling
                    && self.credentials.as_ref() != Some(&credentials)
                {
                    info!("Reconnecting local agent with a new certificate");
                    self.open_agent(Some(credentials));
                }
            }
            Internal::CertificateFailed => self.set_error(ErrorType::LocalAgentError),
            Internal::Disabled(kind) => self.emit(VpnState::final_error(kind)),
        }
    }

    fn on_certificate_update(&mut self, update: CertificateUpdate) {
        if !self.use_agent || self.revoking || self.tunnel != VpnState::Connected {
            return;
        }
        let Some(session_id) = self.ctx.session_id.clone() else { return };
        if update.session_id != session_id
            || self
                .credentials
                .as_ref()
                .is_some_and(|c| c.certificate_pem == update.certificate_pem)
        {
            return;
        }
        let certificates = self.ctx.certificates.clone();
        let internal = self.internal.clone();
        self.jobs.spawn(async move {
            let stored = certificates.get_certificate_without_refresh(&session_id).await;
            if let Some(credentials) = stored.as_ref().and_then(AgentCredentials::from_result) {
                let _ = internal.send(Internal::Credentials(credentials));
            }
        });
    }

    /// Drop the agent without touching unreachable tracking
    fn drop_agent(&mut self) {
        self.generation += 1;
        self.agent = None;
        self.agent_state = None;
        self.opening = false;
    }

    fn close_agent(&mut self) {
        if self.agent.is_some() || self.opening {
            debug!("Closing local agent");
            self.ctx.tracker.reset(false);
        }
        self.drop_agent();
    }

    /// Open a new agent connection, fetching a certificate if none is given
    fn open_agent(&mut self, credentials: Option<AgentCredentials>) {
        let Some(session_id) = self.ctx.session_id.clone() else { return };
        self.drop_agent();
        self.opening = true;
        if credentials.is_some() {
            self.credentials = credentials.clone();
        }

        let generation = self.generation;
        let certificates = self.ctx.certificates.clone();
        let backend = self.backend.clone();
        let hostname = self.params.domain.entry_domain.clone();
        let listener = AgentListener::new(generation, self.agent_tx.clone());
        let features = self.features();
        let internal = self.internal.clone();
        self.jobs.spawn(async move {
            let credentials = match credentials {
                Some(credentials) => credentials,
                None => {
                    let result = certificates.get_certificate(&session_id, false).await;
                    match AgentCredentials::from_result(&result) {
                        Some(credentials) => credentials,
                        None => {
                            warn!("No certificate for the local agent: {:?}", result);
                            let _ = internal.send(Internal::OpenFailed { generation });
                            return;
                        }
                    }
                }
            };
            match backend
                .create_agent_connection(&credentials, &hostname, listener, features)
                .await
            {
                Ok(connection) => {
                    let agent = OpenAgent { connection, credentials };
                    let _ = internal.send(Internal::Opened { generation, agent });
                }
                Err(e) => {
                    warn!("Local agent connection failed: {}", e);
                    let _ = internal.send(Internal::OpenFailed { generation });
                }
            }
        });
    }

    /// Refresh the certificate unless a newer one is already stored, then
    /// reconnect the agent
    fn refresh_certificate(&mut self) {
        let Some(session_id) = self.ctx.session_id.clone() else { return };
        let certificates = self.ctx.certificates.clone();
        let internal = self.internal.clone();
        let used = self.credentials.clone();
        self.jobs.spawn(async move {
            let stored = certificates.get_certificate_without_refresh(&session_id).await;
            let newer = used.as_ref().and_then(|used| {
                stored
                    .as_ref()
                    .and_then(AgentCredentials::from_result)
                    .filter(|stored| stored != used)
            });
            let credentials = match newer {
                Some(credentials) => Some(credentials),
                None => AgentCredentials::from_result(&certificates.update_certificate(&session_id, false).await),
            };
            let _ = internal.send(match credentials {
                Some(credentials) => Internal::Credentials(credentials),
                None => Internal::CertificateFailed,
            });
        });
    }

    /// New key, new certificate and a full tunnel reconnect
    fn revoke(&mut self) {
        let Some(session_id) = self.ctx.session_id.clone() else { return };
        info!("Certificate rejected, generating a new key");
        self.revoking = true;
        let certificates = self.ctx.certificates.clone();
        let backend = self.backend.clone();
        let params = self.params.clone();
        let internal = self.internal.clone();
        self.jobs.spawn(async move {
            certificates.generate_new_key(&session_id).await;
            if !certificates.update_certificate(&session_id, true).await.is_success() {
                let _ = internal.send(Internal::CertificateFailed);
                return;
            }
            backend.disconnect().await;
            backend.connect(&params).await;
        });
    }

    /// Take the tunnel down and report a final error once it is down
    fn set_error(&mut self, kind: ErrorType) {
        if self.disabling {
            return;
        }
        warn!("Disabling VPN: {}", kind);
        self.disabling = true;
        self.close_agent();

        let backend = self.backend.clone();
        let settle = self.ctx.disconnect_settle;
        let internal = self.internal.clone();
        self.jobs.spawn(async move {
            let mut states = backend.subscribe_state();
            backend.disconnect().await;
            if backend.state() != VpnState::Disabled {
                let disabled = async {
                    loop {
                        match states.recv().await {
                            Ok(VpnState::Disabled) | Err(broadcast::error::RecvError::Closed) => break,
                            _ => {}
                        }
                    }
                };
                if tokio::time::timeout(settle, disabled).await.is_err() {
                    warn!("Backend did not settle after disconnect");
                }
            }
            let _ = internal.send(Internal::Disabled(kind));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AgentError, AgentErrorCode};
    use crate::intent::ConnectIntent;
    use crate::test_support::{TestHarness, next_state, test_server};

    fn start(harness: &TestHarness, session: Option<&str>) -> (LocalAgentSupervisor, mpsc::UnboundedReceiver<VpnState>, ConnectionParams) {
        let server = test_server("CH#1", "CH");
        let params = harness.wireguard_params(ConnectIntent::fastest().into(), &server);
        let (supervisor, states) =
            LocalAgentSupervisor::start(harness.agent_context(session), harness.wireguard.clone(), params.clone());
        (supervisor, states, params)
    }

    async fn wait_for(states: &mut mpsc::UnboundedReceiver<VpnState>, expected: VpnState) -> Vec<VpnState> {
        let mut seen = Vec::new();
        loop {
            let state = next_state(states).await;
            seen.push(state);
            if state == expected {
                return seen;
            }
        }
    }

    #[tokio::test]
    async fn test_without_session_forwards_tunnel_states() {
        let harness = TestHarness::new();
        harness.wireguard.set_local_agent(true);
        let (_supervisor, mut states, params) = start(&harness, None);

        harness.wireguard.connect(&params).await;

        assert_eq!(next_state(&mut states).await, VpnState::Disabled);
        assert_eq!(next_state(&mut states).await, VpnState::Connecting);
        assert_eq!(next_state(&mut states).await, VpnState::Connected);
        assert_eq!(harness.wireguard.agents_created(), 0);
    }

    #[tokio::test]
    async fn test_connected_only_after_agent() {
        let harness = TestHarness::new();
        harness.wireguard.set_local_agent(true);
        let (_supervisor, mut states, params) = start(&harness, Some("s1"));

        harness.wireguard.connect(&params).await;
        let seen = wait_for(&mut states, VpnState::Connected).await;

        assert_eq!(seen, vec![VpnState::Disabled, VpnState::Connecting, VpnState::Connected]);
        assert_eq!(harness.wireguard.agents_created(), 1);
        assert_eq!(harness.api.certificate_calls(), 1);
    }

    #[tokio::test]
    async fn test_expired_certificate_reconnects_agent_only() {
        let harness = TestHarness::new();
        harness.wireguard.set_local_agent(true);
        let (_supervisor, mut states, params) = start(&harness, Some("s1"));
        harness.wireguard.connect(&params).await;
        wait_for(&mut states, VpnState::Connected).await;

        let listener = harness.wireguard.agent_listener().unwrap();
        listener.on_state(AgentState::HardJailed);
        listener.on_error(AgentError {
            code: AgentErrorCode::CertificateExpired,
            description: "expired".into(),
            is_final: false,
        });
        assert_eq!(next_state(&mut states).await, VpnState::Connecting);
        wait_for(&mut states, VpnState::Connected).await;

        assert_eq!(harness.api.certificate_calls(), 2);
        assert_eq!(harness.wireguard.agents_created(), 2);
        assert_eq!(harness.wireguard.disconnects(), 0);
        let credentials = harness.wireguard.agent_credentials();
        assert_eq!(credentials[0].private_key_pem, credentials[1].private_key_pem);
        assert_ne!(credentials[0].certificate_pem, credentials[1].certificate_pem);
    }

    #[tokio::test]
    async fn test_disabling_error_hides_tunnel_states() {
        let harness = TestHarness::new();
        harness.wireguard.set_local_agent(true);
        let (_supervisor, mut states, params) = start(&harness, Some("s1"));
        harness.wireguard.connect(&params).await;
        wait_for(&mut states, VpnState::Connected).await;

        harness.wireguard.agent_listener().unwrap().on_error(AgentError {
            code: AgentErrorCode::MaxSessions,
            description: "too many sessions".into(),
            is_final: true,
        });

        assert_eq!(next_state(&mut states).await, VpnState::final_error(ErrorType::MaxSessions));
        assert_eq!(harness.wireguard.disconnects(), 1);
        assert_eq!(harness.wireguard.agent_log().closed(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_after_connect_is_silent_then_falls_back() {
        let harness = TestHarness::new();
        harness.wireguard.set_local_agent(true);
        let (_supervisor, mut states, params) = start(&harness, Some("s1"));
        harness.wireguard.connect(&params).await;
        wait_for(&mut states, VpnState::Connected).await;

        harness.wireguard.agent_listener().unwrap().on_state(AgentState::ServerUnreachable);
        // Silent reconnect: the new agent reports Connected again, nothing else is shown
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(states.try_recv().is_err());
        assert_eq!(harness.wireguard.agents_created(), 2);

        harness.wireguard.agent_listener().unwrap().on_state(AgentState::ServerUnreachable);
        assert_eq!(next_state(&mut states).await, VpnState::error(ErrorType::UnreachableInternal));
    }
}
