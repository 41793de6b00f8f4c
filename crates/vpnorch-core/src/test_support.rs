//! Fakes and fixtures shared by the unit tests

use crate::agent::AgentContext;
use crate::api::{
    ApiError, ApiResult, CertificateRequest, CertificateResponse, ConnectingDomainResponse, SessionListResponse,
    VpnApi,
};
use crate::backend::{
    AgentConnection, AgentCredentials, AgentFeatures, AgentListener, AgentState, BackendError, VpnBackend,
};
use crate::certificate::CertificateRepository;
use crate::config::{CertificateConfig, CoreConfig, FeatureFlags, PortsConfig};
use crate::delegate::{ServerRestrictedReason, VpnPermissionDelegate, VpnUiDelegate};
use crate::error_handler::{ErrorHandlerDeps, VpnConnectionErrorHandler};
use crate::intent::{AnyConnectIntent, IntentTarget};
use crate::keys::CertKeyPair;
use crate::manager::{ManagerDeps, VpnConnectionManager};
use crate::monitor::{Status, StatusTransition, VpnStateMonitor};
use crate::platform::{Clock, ManualClock, NetworkMonitor, WakeLock};
use crate::prepare::{AvailabilityProbe, IKEV2_PORT, PrepareForConnection};
use crate::provider::SmartProtocolProvider;
use crate::server::{
    ConnectingDomain, ConnectionParams, ProtocolInfo, ProtocolSelection, Server, ServerListUpdater, ServerManager,
    TransmissionProtocol, VpnProtocol, VpnUser, tier,
};
use crate::settings::{LocalUserSettings, SettingsForConnection};
use crate::state::VpnState;
use crate::storage::{CertificateStorage, MemoryKeyValueStore};
use crate::telemetry::{ConnectTrigger, DisconnectTrigger, VpnConnectionTelemetry};
use crate::unreachable::LocalAgentUnreachableTracker;
use crate::user::{CurrentUser, InfoChange, SessionId, UserPlanManager};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use vpnorch_net::{ProbeTarget, ProbeTransport, Reachable};

const WAIT: Duration = Duration::from_secs(2);

/// An online PLUS server with one domain and a unique entry IP
pub(crate) fn test_server(id: &str, country: &str) -> Server {
    let hash = id
        .bytes()
        .fold(17u32, |h, b| h.wrapping_mul(31).wrapping_add(b as u32));
    let entry_ip = IpAddr::V4(Ipv4Addr::new(10, (hash >> 16) as u8, (hash >> 8) as u8, hash as u8));
    let host = id.to_lowercase().replace('#', "-");
    Server {
        server_id: id.to_string(),
        name: id.to_string(),
        entry_country: country.to_string(),
        exit_country: country.to_string(),
        city: None,
        state: None,
        tier: tier::PLUS,
        features: BTreeSet::new(),
        secure_core: false,
        gateway_name: None,
        is_online: true,
        load: 20.0,
        score: 1.0,
        domains: vec![ConnectingDomain {
            id: format!("{}-d1", id),
            entry_domain: format!("{}.example.net", host),
            entry_ip,
            exit_ip: None,
            entry_per_protocol: None,
            status: 1,
            public_key_x25519: Some(CertKeyPair::generate().x25519_public_base64()),
        }],
    }
}

pub(crate) fn vpn_user(max_tier: u32) -> VpnUser {
    let plan_name = match max_tier {
        tier::FREE => "free",
        tier::BASIC => "basic",
        _ => "plus",
    };
    VpnUser {
        plan_name: plan_name.to_string(),
        max_tier,
        max_connect: 10,
        is_delinquent: false,
    }
}

pub(crate) async fn next_state(states: &mut mpsc::UnboundedReceiver<VpnState>) -> VpnState {
    tokio::time::timeout(WAIT, states.recv())
        .await
        .expect("timed out waiting for a state")
        .expect("state channel closed")
}

pub(crate) async fn next_transition(transitions: &mut broadcast::Receiver<StatusTransition>) -> VpnState {
    tokio::time::timeout(WAIT, transitions.recv())
        .await
        .expect("timed out waiting for a transition")
        .expect("transition channel closed")
        .current
        .state
}

/// First status matching `predicate`, current one included
pub(crate) async fn wait_for_status(monitor: &VpnStateMonitor, predicate: impl Fn(&Status) -> bool) -> Status {
    let mut status = monitor.subscribe();
    let found = tokio::time::timeout(WAIT, async {
        loop {
            let current = status.borrow_and_update().clone();
            if predicate(&current) {
                return current;
            }
            status.changed().await.expect("monitor dropped");
        }
    })
    .await;
    found.unwrap_or_else(|_| panic!("timed out waiting for status, last: {:?}", monitor.status()))
}

/// Probe answering only the configured destinations
#[derive(Default)]
pub(crate) struct FakeProbe {
    reachable: Mutex<HashSet<(SocketAddr, ProbeTransport)>>,
    calls: AtomicUsize,
    last_groups: Mutex<Vec<(ProtocolSelection, Vec<ProbeTarget>)>>,
}

impl FakeProbe {
    pub fn set_reachable(&self, destinations: impl IntoIterator<Item = (SocketAddr, ProbeTransport)>) {
        *self.reachable.lock().unwrap() = destinations.into_iter().collect();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_groups(&self) -> Vec<(ProtocolSelection, Vec<ProbeTarget>)> {
        self.last_groups.lock().unwrap().clone()
    }
}

#[async_trait]
impl AvailabilityProbe for FakeProbe {
    async fn ping_in_parallel(
        &self,
        groups: Vec<(ProtocolSelection, Vec<ProbeTarget>)>,
        _wait_for_all: bool,
    ) -> HashMap<ProtocolSelection, Vec<Reachable>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_groups.lock().unwrap() = groups.clone();
        let reachable = self.reachable.lock().unwrap().clone();

        let mut answers = HashMap::new();
        for (protocol, targets) in groups {
            let answered: Vec<Reachable> = targets
                .into_iter()
                .filter(|t| reachable.contains(&(t.addr, t.transport)))
                .map(|target| Reachable { target, latency: Duration::from_millis(10) })
                .collect();
            if !answered.is_empty() {
                answers.insert(protocol, answered);
            }
        }
        answers
    }
}

/// Closed agent connections of a fake backend
#[derive(Default)]
pub(crate) struct AgentLog {
    closed: AtomicUsize,
}

impl AgentLog {
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

struct FakeAgent {
    log: Arc<AgentLog>,
}

impl AgentConnection for FakeAgent {
    fn set_features(&self, _features: &AgentFeatures) {}

    fn set_connectivity(&self, _connected: bool) {}

    fn close(&self) {
        self.log.closed.fetch_add(1, Ordering::SeqCst);
    }
}

struct BackendState {
    state: VpnState,
    scan_responses: HashSet<TransmissionProtocol>,
    reachable_servers: Option<(HashSet<String>, HashSet<TransmissionProtocol>)>,
    prepare_calls: Vec<(Vec<TransmissionProtocol>, bool)>,
    connect_states: Vec<VpnState>,
    connect_delay: Option<Duration>,
    disconnect_delay: Option<Duration>,
    prepare: Option<Arc<PrepareForConnection>>,
    call_log: Vec<String>,
    local_agent: bool,
    agent_listener: Option<AgentListener>,
    agent_credentials: Vec<AgentCredentials>,
}

/// Scripted tunnel backend
pub(crate) struct FakeBackend {
    protocol: VpnProtocol,
    ports: PortsConfig,
    states: broadcast::Sender<VpnState>,
    inner: Mutex<BackendState>,
    connecting: AtomicUsize,
    max_connecting: AtomicUsize,
    disconnects: AtomicUsize,
    agents_created: AtomicUsize,
    agent_log: Arc<AgentLog>,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeBackend {
    pub fn new(protocol: VpnProtocol) -> Self {
        let (states, _) = broadcast::channel(64);
        Self {
            protocol,
            ports: PortsConfig::default(),
            states,
            inner: Mutex::new(BackendState {
                state: VpnState::Disabled,
                scan_responses: HashSet::new(),
                reachable_servers: None,
                prepare_calls: Vec::new(),
                connect_states: vec![VpnState::Connected],
                connect_delay: None,
                disconnect_delay: None,
                prepare: None,
                call_log: Vec::new(),
                local_agent: false,
                agent_listener: None,
                agent_credentials: Vec::new(),
            }),
            connecting: AtomicUsize::new(0),
            max_connecting: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            agents_created: AtomicUsize::new(0),
            agent_log: Arc::new(AgentLog::default()),
        }
    }

    /// Transports answering a scan on any server
    pub fn set_scan_responses(&self, transports: impl IntoIterator<Item = TransmissionProtocol>) {
        self.inner.lock().unwrap().scan_responses = transports.into_iter().collect();
    }

    /// Only these servers answer a scan, on these transports
    pub fn set_reachable_servers(
        &self,
        servers: impl IntoIterator<Item = String>,
        transports: impl IntoIterator<Item = TransmissionProtocol>,
    ) {
        self.inner.lock().unwrap().reachable_servers =
            Some((servers.into_iter().collect(), transports.into_iter().collect()));
    }

    /// States emitted after `Connecting` on every connect
    pub fn set_connect_states(&self, states: Vec<VpnState>) {
        self.inner.lock().unwrap().connect_states = states;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.inner.lock().unwrap().connect_delay = Some(delay);
    }

    /// Slow disconnect, logging "disconnect done" once it finishes
    pub fn set_disconnect_delay(&self, delay: Duration) {
        self.inner.lock().unwrap().disconnect_delay = Some(delay);
    }

    /// Resolve entry points through `prepare` instead of the scripted scan
    pub fn set_prepare(&self, prepare: Arc<PrepareForConnection>) {
        self.inner.lock().unwrap().prepare = Some(prepare);
    }

    pub fn set_local_agent(&self, supported: bool) {
        self.inner.lock().unwrap().local_agent = supported;
    }

    pub fn emit(&self, state: VpnState) {
        self.inner.lock().unwrap().state = state;
        let _ = self.states.send(state);
    }

    pub fn prepare_calls(&self) -> Vec<(Vec<TransmissionProtocol>, bool)> {
        self.inner.lock().unwrap().prepare_calls.clone()
    }

    pub fn call_log(&self) -> Vec<String> {
        self.inner.lock().unwrap().call_log.clone()
    }

    pub fn max_concurrent_connects(&self) -> usize {
        self.max_connecting.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn agents_created(&self) -> usize {
        self.agents_created.load(Ordering::SeqCst)
    }

    /// Listener of the latest agent connection
    pub fn agent_listener(&self) -> Option<AgentListener> {
        self.inner.lock().unwrap().agent_listener.clone()
    }

    pub fn agent_credentials(&self) -> Vec<AgentCredentials> {
        self.inner.lock().unwrap().agent_credentials.clone()
    }

    pub fn agent_log(&self) -> Arc<AgentLog> {
        self.agent_log.clone()
    }

    fn answers_scan(&self, server: &Server, transmission: TransmissionProtocol) -> bool {
        let inner = self.inner.lock().unwrap();
        match &inner.reachable_servers {
            Some((servers, transports)) => servers.contains(&server.server_id) && transports.contains(&transmission),
            None => inner.scan_responses.contains(&transmission),
        }
    }

    fn info(&self, server: &Server, protocol: ProtocolSelection) -> Option<ProtocolInfo> {
        let domain = server.online_domains(&protocol).first().copied()?.clone();
        let port = if protocol.vpn == VpnProtocol::IKEv2 {
            IKEV2_PORT
        } else {
            *domain
                .ports_for(&protocol)
                .unwrap_or_else(|| self.ports.ports_for(&protocol))
                .first()?
        };
        Some(ProtocolInfo {
            protocol,
            entry_ip: domain.entry_ip_for(&protocol),
            domain,
            port,
        })
    }
}

#[async_trait]
impl VpnBackend for FakeBackend {
    fn protocol(&self) -> VpnProtocol {
        self.protocol
    }

    async fn prepare_for_connection(
        &self,
        _intent: &AnyConnectIntent,
        server: &Server,
        transmissions: &[TransmissionProtocol],
        scan: bool,
        number_of_ports: usize,
        wait_for_all: bool,
    ) -> Vec<ProtocolInfo> {
        let prepare = {
            let mut inner = self.inner.lock().unwrap();
            inner.prepare_calls.push((transmissions.to_vec(), scan));
            inner.prepare.clone()
        };
        if let Some(prepare) = prepare {
            return prepare
                .prepare(server, self.protocol, transmissions, scan, number_of_ports, wait_for_all)
                .await;
        }

        if self.protocol == VpnProtocol::IKEv2 {
            return self.info(server, ProtocolSelection::IKEV2).into_iter().collect();
        }
        transmissions
            .iter()
            .filter(|&&t| !scan || self.answers_scan(server, t))
            .filter_map(|&t| self.info(server, ProtocolSelection::new(self.protocol, Some(t))))
            .collect()
    }

    async fn connect(&self, params: &ConnectionParams) {
        let now = self.connecting.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_connecting.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.connecting);

        let (delay, states) = {
            let mut inner = self.inner.lock().unwrap();
            inner.call_log.push(format!("connect {}", params.server.server_id));
            (inner.connect_delay, inner.connect_states.clone())
        };
        self.emit(VpnState::Connecting);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        for state in states {
            self.emit(state);
        }
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        let delay = {
            let mut inner = self.inner.lock().unwrap();
            inner.call_log.push("disconnect".to_string());
            inner.disconnect_delay
        };
        self.emit(VpnState::Disconnecting);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
            self.inner.lock().unwrap().call_log.push("disconnect done".to_string());
        }
        self.emit(VpnState::Disabled);
    }

    fn subscribe_state(&self) -> broadcast::Receiver<VpnState> {
        self.states.subscribe()
    }

    fn state(&self) -> VpnState {
        self.inner.lock().unwrap().state
    }

    fn supports_local_agent(&self) -> bool {
        self.inner.lock().unwrap().local_agent
    }

    async fn create_agent_connection(
        &self,
        credentials: &AgentCredentials,
        _hostname: &str,
        listener: AgentListener,
        _features: AgentFeatures,
    ) -> Result<Box<dyn AgentConnection>, BackendError> {
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.local_agent {
                return Err(BackendError::AgentUnsupported(self.protocol));
            }
            inner.agent_listener = Some(listener.clone());
            inner.agent_credentials.push(credentials.clone());
        }
        self.agents_created.fetch_add(1, Ordering::SeqCst);
        listener.on_state(AgentState::Connected);
        Ok(Box::new(FakeAgent { log: self.agent_log.clone() }))
    }
}

/// API issuing `cert-N` certificates valid for a day
pub(crate) struct FakeApi {
    clock: Arc<ManualClock>,
    certificate_calls: AtomicUsize,
    certificate_delay: Mutex<Option<Duration>>,
    certificate_error: Mutex<Option<ApiError>>,
    connecting_domain: Mutex<Option<ApiResult<ConnectingDomainResponse>>>,
    sessions: Mutex<SessionListResponse>,
}

impl FakeApi {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            certificate_calls: AtomicUsize::new(0),
            certificate_delay: Mutex::new(None),
            certificate_error: Mutex::new(None),
            connecting_domain: Mutex::new(None),
            sessions: Mutex::new(SessionListResponse { code: 1000, sessions: Vec::new() }),
        }
    }

    pub fn certificate_calls(&self) -> usize {
        self.certificate_calls.load(Ordering::SeqCst)
    }

    pub fn set_certificate_delay(&self, delay: Duration) {
        *self.certificate_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_certificate_error(&self, error: Option<ApiError>) {
        *self.certificate_error.lock().unwrap() = error;
    }

    pub fn set_connecting_domain(&self, response: ApiResult<ConnectingDomainResponse>) {
        *self.connecting_domain.lock().unwrap() = Some(response);
    }

    pub fn set_sessions(&self, sessions: SessionListResponse) {
        *self.sessions.lock().unwrap() = sessions;
    }
}

#[async_trait]
impl VpnApi for FakeApi {
    async fn get_certificate(
        &self,
        _session_id: &str,
        _request: &CertificateRequest,
    ) -> ApiResult<CertificateResponse> {
        let n = self.certificate_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *self.certificate_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.certificate_error.lock().unwrap().clone() {
            return Err(error);
        }
        let now = self.clock.now_ms() / 1000;
        Ok(CertificateResponse {
            certificate: format!("cert-{}", n),
            expiration_time: now + 24 * 60 * 60,
            refresh_time: now + 12 * 60 * 60,
        })
    }

    async fn get_connecting_domain(&self, _domain_id: &str) -> ApiResult<ConnectingDomainResponse> {
        self.connecting_domain
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(Err(ApiError::Connection))
    }

    async fn get_session(&self) -> ApiResult<SessionListResponse> {
        Ok(self.sessions.lock().unwrap().clone())
    }
}

/// In-memory server list
#[derive(Default)]
pub(crate) struct FakeServerManager {
    servers: Mutex<Vec<Server>>,
    best: Mutex<Option<Server>>,
    guest_hole: Mutex<Vec<Server>>,
    domain_updates: AtomicUsize,
}

impl FakeServerManager {
    pub fn set_servers(&self, servers: Vec<Server>) {
        *self.servers.lock().unwrap() = servers;
    }

    /// Answer for intents that do not name a server
    pub fn set_best(&self, server: Option<Server>) {
        *self.best.lock().unwrap() = server;
    }

    pub fn domain_updates(&self) -> usize {
        self.domain_updates.load(Ordering::SeqCst)
    }

    pub fn guest_hole_servers(&self) -> Vec<Server> {
        self.guest_hole.lock().unwrap().clone()
    }

    fn find(&self, server_id: &str) -> Option<Server> {
        self.servers
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.server_id == server_id)
            .cloned()
    }
}

#[async_trait]
impl ServerManager for FakeServerManager {
    async fn get_best_server_for_intent(
        &self,
        intent: &AnyConnectIntent,
        _user: Option<&VpnUser>,
        _protocol: &ProtocolSelection,
    ) -> Option<Server> {
        let intent = match intent {
            AnyConnectIntent::GuestHole { server_id } => {
                let guest_hole = self.guest_hole.lock().unwrap();
                return guest_hole.iter().find(|s| &s.server_id == server_id).cloned();
            }
            AnyConnectIntent::Regular(intent) => intent,
        };
        if let IntentTarget::Server { server_id, .. } = &intent.target {
            return self.find(server_id);
        }
        if let Some(best) = self.best.lock().unwrap().clone() {
            return Some(best);
        }
        self.servers
            .lock()
            .unwrap()
            .iter()
            .find(|s| {
                s.is_online
                    && s.secure_core == intent.is_secure_core()
                    && intent.exit_country().is_none_or(|country| s.exit_country == country)
            })
            .cloned()
    }

    async fn get_server_by_id(&self, server_id: &str) -> Option<Server> {
        self.find(server_id)
    }

    async fn get_online_accessible_servers(
        &self,
        secure_core: bool,
        gateway_name: Option<&str>,
        user: Option<&VpnUser>,
        protocol: &ProtocolSelection,
    ) -> Vec<Server> {
        self.servers
            .lock()
            .unwrap()
            .iter()
            .filter(|s| {
                s.is_online
                    && s.secure_core == secure_core
                    && s.gateway_name.as_deref() == gateway_name
                    && user.is_none_or(|u| u.has_access(s))
                    && s.supports_protocol(protocol)
            })
            .cloned()
            .collect()
    }

    async fn update_server_domain_status(&self, domain: &ConnectingDomain) {
        self.domain_updates.fetch_add(1, Ordering::SeqCst);
        for server in self.servers.lock().unwrap().iter_mut() {
            for existing in server.domains.iter_mut().filter(|d| d.id == domain.id) {
                existing.status = domain.status;
            }
        }
    }

    async fn set_guest_hole_servers(&self, servers: Vec<Server>) {
        *self.guest_hole.lock().unwrap() = servers;
    }
}

#[derive(Default)]
pub(crate) struct FakeServerListUpdater {
    updates: AtomicUsize,
}

impl FakeServerListUpdater {
    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServerListUpdater for FakeServerListUpdater {
    async fn update_server_list(&self) {
        self.updates.fetch_add(1, Ordering::SeqCst);
    }
}

/// Logged-in PLUS user with session `session-1`
pub(crate) struct FakeUser {
    user: Mutex<Option<VpnUser>>,
    session_id: Mutex<Option<SessionId>>,
}

impl Default for FakeUser {
    fn default() -> Self {
        Self {
            user: Mutex::new(Some(vpn_user(tier::PLUS))),
            session_id: Mutex::new(Some("session-1".to_string())),
        }
    }
}

impl FakeUser {
    pub fn set_user(&self, user: Option<VpnUser>) {
        *self.user.lock().unwrap() = user;
    }

    pub fn set_session_id(&self, session_id: Option<&str>) {
        *self.session_id.lock().unwrap() = session_id.map(String::from);
    }
}

#[async_trait]
impl CurrentUser for FakeUser {
    async fn vpn_user(&self) -> Option<VpnUser> {
        self.user.lock().unwrap().clone()
    }

    async fn session_id(&self) -> Option<SessionId> {
        self.session_id.lock().unwrap().clone()
    }
}

/// Plan manager whose next refresh reports scripted changes
pub(crate) struct FakePlanManager {
    next_changes: Mutex<Vec<InfoChange>>,
    changes: broadcast::Sender<Vec<InfoChange>>,
}

impl Default for FakePlanManager {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(8);
        Self {
            next_changes: Mutex::new(Vec::new()),
            changes,
        }
    }
}

impl FakePlanManager {
    pub fn set_refresh_changes(&self, changes: Vec<InfoChange>) {
        *self.next_changes.lock().unwrap() = changes;
    }

    /// Report changes detected outside of an auth error
    pub fn publish(&self, changes: Vec<InfoChange>) {
        let _ = self.changes.send(changes);
    }
}

#[async_trait]
impl UserPlanManager for FakePlanManager {
    async fn refresh_vpn_info(&self) -> Vec<InfoChange> {
        let changes = std::mem::take(&mut *self.next_changes.lock().unwrap());
        if !changes.is_empty() {
            let _ = self.changes.send(changes.clone());
        }
        changes
    }

    fn subscribe_info_changes(&self) -> broadcast::Receiver<Vec<InfoChange>> {
        self.changes.subscribe()
    }
}

#[derive(Default)]
pub(crate) struct FakePermission {
    needed: AtomicBool,
}

impl FakePermission {
    pub fn set_needed(&self, needed: bool) {
        self.needed.store(needed, Ordering::SeqCst);
    }
}

impl VpnPermissionDelegate for FakePermission {
    fn needs_permission(&self) -> bool {
        self.needed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub(crate) struct RecordingTelemetry {
    starts: Mutex<Vec<ConnectTrigger>>,
    aborts: Mutex<Vec<(String, bool)>>,
    disconnects: Mutex<Vec<DisconnectTrigger>>,
}

impl RecordingTelemetry {
    pub fn starts(&self) -> Vec<ConnectTrigger> {
        self.starts.lock().unwrap().clone()
    }

    pub fn aborts(&self) -> Vec<(String, bool)> {
        self.aborts.lock().unwrap().clone()
    }

    pub fn disconnects(&self) -> Vec<DisconnectTrigger> {
        self.disconnects.lock().unwrap().clone()
    }
}

impl VpnConnectionTelemetry for RecordingTelemetry {
    fn on_connection_start(&self, trigger: &ConnectTrigger) {
        self.starts.lock().unwrap().push(trigger.clone());
    }

    fn on_connection_abort(&self, reason: &str, is_failure: bool) {
        self.aborts.lock().unwrap().push((reason.to_string(), is_failure));
    }

    fn on_disconnection_trigger(&self, trigger: &DisconnectTrigger, _previous: Option<&ConnectionParams>) {
        self.disconnects.lock().unwrap().push(trigger.clone());
    }

    fn event(&self, _group: &str, _name: &str, _value: i64, _dimensions: &BTreeMap<String, String>) {}
}

#[derive(Default)]
pub(crate) struct CountingWakeLock {
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl CountingWakeLock {
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl WakeLock for CountingWakeLock {
    fn acquire(&self, _tag: &'static str, _max_hold: Duration) {
        self.acquired.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self, _tag: &'static str) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// UI delegate granting permission and leaving restrictions to the core
pub(crate) struct FakeDelegate {
    grant: bool,
    handle_restrictions: bool,
    permission_requests: AtomicUsize,
    restrictions: Mutex<Vec<ServerRestrictedReason>>,
    protocol_not_supported: AtomicUsize,
}

impl Default for FakeDelegate {
    fn default() -> Self {
        Self {
            grant: true,
            handle_restrictions: false,
            permission_requests: AtomicUsize::new(0),
            restrictions: Mutex::new(Vec::new()),
            protocol_not_supported: AtomicUsize::new(0),
        }
    }
}

impl FakeDelegate {
    pub fn denying_permission() -> Self {
        Self { grant: false, ..Self::default() }
    }

    pub fn handling_restrictions() -> Self {
        Self { handle_restrictions: true, ..Self::default() }
    }

    pub fn permission_requests(&self) -> usize {
        self.permission_requests.load(Ordering::SeqCst)
    }

    pub fn restrictions(&self) -> Vec<ServerRestrictedReason> {
        self.restrictions.lock().unwrap().clone()
    }

    pub fn protocol_not_supported(&self) -> usize {
        self.protocol_not_supported.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VpnUiDelegate for FakeDelegate {
    async fn ask_for_permissions(&self, _intent: &AnyConnectIntent) -> bool {
        self.permission_requests.fetch_add(1, Ordering::SeqCst);
        self.grant
    }

    async fn on_server_restricted(&self, reason: ServerRestrictedReason) -> bool {
        self.restrictions.lock().unwrap().push(reason);
        self.handle_restrictions
    }

    fn on_protocol_not_supported(&self) {
        self.protocol_not_supported.fetch_add(1, Ordering::SeqCst);
    }
}

/// Every collaborator of the core, faked
pub(crate) struct TestHarness {
    pub config: CoreConfig,
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryKeyValueStore>,
    pub monitor: Arc<VpnStateMonitor>,
    pub settings: watch::Sender<LocalUserSettings>,
    pub flags: watch::Sender<FeatureFlags>,
    pub network: NetworkMonitor,
    pub wireguard: Arc<FakeBackend>,
    pub openvpn: Arc<FakeBackend>,
    pub ikev2: Arc<FakeBackend>,
    pub provider: Arc<SmartProtocolProvider>,
    pub probe: Arc<FakeProbe>,
    pub servers: Arc<FakeServerManager>,
    pub server_list: Arc<FakeServerListUpdater>,
    pub api: Arc<FakeApi>,
    pub user: Arc<FakeUser>,
    pub plan: Arc<FakePlanManager>,
    pub certificates: CertificateRepository,
    pub telemetry: Arc<RecordingTelemetry>,
    pub wake_lock: Arc<CountingWakeLock>,
    pub permission: Arc<FakePermission>,
}

impl TestHarness {
    pub fn new() -> Self {
        let mut config = CoreConfig::default();
        config.connection.disconnect_settle_ms = 200;
        config.guest_hole.close_timeout_ms = 50;
        config.guest_hole.settle_ms = 0;

        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(MemoryKeyValueStore::default());
        let monitor = Arc::new(VpnStateMonitor::new().with_store(store.clone()));
        let (settings, _) = watch::channel(LocalUserSettings::default());
        let (flags, _) = watch::channel(FeatureFlags::default());

        let wireguard = Arc::new(FakeBackend::new(VpnProtocol::WireGuard));
        let openvpn = Arc::new(FakeBackend::new(VpnProtocol::OpenVpn));
        let ikev2 = Arc::new(FakeBackend::new(VpnProtocol::IKEv2));
        let provider = Arc::new(SmartProtocolProvider::new(
            vec![wireguard.clone(), openvpn.clone(), ikev2.clone()],
            config.smart.clone(),
            flags.subscribe(),
        ));

        let api = Arc::new(FakeApi::new(clock.clone()));
        let certificates = CertificateRepository::new(
            CertificateStorage::new(Arc::new(MemoryKeyValueStore::default()), None),
            api.clone(),
            clock.clone(),
            CertificateConfig::default(),
        );

        Self {
            config,
            clock,
            store,
            monitor,
            settings,
            flags,
            network: NetworkMonitor::default(),
            wireguard,
            openvpn,
            ikev2,
            provider,
            probe: Arc::new(FakeProbe::default()),
            servers: Arc::new(FakeServerManager::default()),
            server_list: Arc::new(FakeServerListUpdater::default()),
            api,
            user: Arc::new(FakeUser::default()),
            plan: Arc::new(FakePlanManager::default()),
            certificates,
            telemetry: Arc::new(RecordingTelemetry::default()),
            wake_lock: Arc::new(CountingWakeLock::default()),
            permission: Arc::new(FakePermission::default()),
        }
    }

    /// Let every backend resolve entry points by probing `self.probe`
    pub fn prepare_with_probe(&self) {
        let prepare = Arc::new(PrepareForConnection::new(self.probe.clone(), self.config.ports.clone()));
        for backend in [&self.wireguard, &self.openvpn, &self.ikev2] {
            backend.set_prepare(prepare.clone());
        }
    }

    pub fn settings_for_connection(&self) -> SettingsForConnection {
        SettingsForConnection::new(
            self.settings.subscribe(),
            self.flags.subscribe(),
            self.config.guest_hole.protocol,
        )
    }

    pub fn error_handler(&self) -> Arc<VpnConnectionErrorHandler> {
        let deps = ErrorHandlerDeps {
            api: self.api.clone(),
            flags: self.flags.subscribe(),
            settings: self.settings_for_connection(),
            plan_manager: self.plan.clone(),
            server_manager: self.servers.clone(),
            server_list_updater: self.server_list.clone(),
            monitor: self.monitor.clone(),
            network: self.network.clone(),
            provider: self.provider.clone(),
            user: self.user.clone(),
            clock: self.clock.clone(),
        };
        Arc::new(VpnConnectionErrorHandler::new(deps, self.config.connection.clone()))
    }

    pub fn manager(&self) -> VpnConnectionManager {
        let deps = ManagerDeps {
            monitor: self.monitor.clone(),
            provider: self.provider.clone(),
            server_manager: self.servers.clone(),
            error_handler: self.error_handler(),
            settings: self.settings_for_connection(),
            user: self.user.clone(),
            certificates: self.certificates.clone(),
            permission: self.permission.clone(),
            telemetry: self.telemetry.clone(),
            wake_lock: self.wake_lock.clone(),
            network: self.network.clone(),
            clock: self.clock.clone(),
        };
        VpnConnectionManager::new(deps, &self.config)
    }

    pub(crate) fn agent_context(&self, session_id: Option<&str>) -> AgentContext {
        AgentContext {
            certificates: self.certificates.clone(),
            tracker: Arc::new(LocalAgentUnreachableTracker::new(
                self.clock.clone(),
                self.config.unreachable.clone(),
            )),
            settings: self.settings_for_connection(),
            network: self.network.clone(),
            session_id: session_id.map(String::from),
            disconnect_settle: self.config.connection.disconnect_settle(),
        }
    }

    /// WireGuard UDP on the first domain, default port
    pub fn wireguard_params(&self, intent: AnyConnectIntent, server: &Server) -> ConnectionParams {
        let protocol = ProtocolSelection::WIREGUARD_UDP;
        let domain = server.domains[0].clone();
        ConnectionParams::new(
            intent,
            server.clone(),
            ProtocolInfo {
                protocol,
                entry_ip: domain.entry_ip_for(&protocol),
                domain,
                port: 443,
            },
        )
    }
}
