//! VPN Connection Error Handler
//!
//! Decides what to do when a connection fails in a way that another
//! server, protocol or intent might fix. Every decision is a
//! [`VpnFallbackResult`]: a switch to apply or an error to show.
//!
//! Candidate servers are ranked by a bit-flag compatibility score with the
//! original intent, pinged in parallel and the first answering one wins.
//! If the original server still answers on the same protocol nothing is
//! switched; a connection stuck like that for long enough gets its server
//! excluded from the next search.
//!
//! Plan changes and on-demand maintenance checks are published on the
//! switch stream, where the connection manager picks them up.

use crate::api::{HTTP_UNPROCESSABLE_ENTITY, VpnApi};
use crate::backend::PrepareResult;
use crate::config::{ConnectionConfig, FeatureFlags};
use crate::intent::{AnyConnectIntent, ConnectIntent, IntentTarget};
use crate::monitor::VpnStateMonitor;
use crate::platform::{Clock, NetworkMonitor};
use crate::provider::{PingResult, VpnBackendProvider};
use crate::server::{ConnectionParams, PhysicalServer, ProtocolSelection, Server, ServerListUpdater, ServerManager, VpnUser, tier};
use crate::settings::SettingsForConnection;
use crate::state::{ErrorType, VpnState};
use crate::user::{CurrentUser, InfoChange, UserPlanManager};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Why a connection was moved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchServerReason {
    Downgrade { from_tier: String, to_tier: String },
    UserBecameDelinquent,
    ServerInMaintenance,
    ServerUnreachable,
    ServerUnavailable,
    UnknownAuthFailure,
}

/// A decided change of connection
#[derive(Debug, Clone, PartialEq)]
pub enum Switch {
    /// Run a full connect for another intent, preferring `to_server`
    SwitchConnectIntent {
        from_server: Option<Server>,
        to_server: Server,
        from_intent: ConnectIntent,
        to_intent: ConnectIntent,
        reason: Option<SwitchServerReason>,
    },
    /// Same intent, connect straight to an already prepared server
    SwitchServer {
        from_server: Option<Server>,
        intent: ConnectIntent,
        prepared: PrepareResult,
        reason: SwitchServerReason,
        /// The prepared protocol is the one the user selected
        compatible_protocol: bool,
        switched_secure_core: bool,
        notify_user: bool,
    },
}

impl Switch {
    pub fn reason(&self) -> Option<&SwitchServerReason> {
        match self {
            Switch::SwitchConnectIntent { reason, .. } => reason.as_ref(),
            Switch::SwitchServer { reason, .. } => Some(reason),
        }
    }

    pub fn notify_user(&self) -> bool {
        match self {
            Switch::SwitchConnectIntent { reason, .. } => reason.is_some(),
            Switch::SwitchServer { notify_user, .. } => *notify_user,
        }
    }

    pub fn from_server(&self) -> Option<&Server> {
        match self {
            Switch::SwitchConnectIntent { from_server, .. } | Switch::SwitchServer { from_server, .. } => {
                from_server.as_ref()
            }
        }
    }

    pub fn to_server(&self) -> &Server {
        match self {
            Switch::SwitchConnectIntent { to_server, .. } => to_server,
            Switch::SwitchServer { prepared, .. } => &prepared.params.server,
        }
    }
}

impl fmt::Display for Switch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Switch::SwitchConnectIntent { to_intent, reason, .. } => {
                write!(f, "SwitchConnectIntent: {} reason: {:?}", to_intent, reason)
            }
            Switch::SwitchServer { prepared, reason, compatible_protocol, .. } => write!(
                f,
                "SwitchServer {} reason: {:?} compatibleProtocol: {}",
                prepared.params, reason, compatible_protocol
            ),
        }
    }
}

/// Outcome of an error handler decision
#[derive(Debug, Clone, PartialEq)]
pub enum VpnFallbackResult {
    Switch(Switch),
    Error {
        original_params: ConnectionParams,
        kind: ErrorType,
        reason: Option<SwitchServerReason>,
    },
}

impl VpnFallbackResult {
    fn error(params: &ConnectionParams, kind: ErrorType, reason: Option<SwitchServerReason>) -> Self {
        VpnFallbackResult::Error {
            original_params: params.clone(),
            kind,
            reason,
        }
    }
}

/// Compatibility aspects, one score bit each
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompatibilityAspect {
    Features = 0,
    Tier,
    Gateway,
    City,
    State,
    Country,
    SecureCore,
}

impl CompatibilityAspect {
    const fn bit(self) -> u32 {
        1 << self as u32
    }
}

fn has(score: u32, aspect: CompatibilityAspect) -> bool {
    score & aspect.bit() != 0
}

/// Compatibility of `server` with the original intent
fn server_score(server: &Server, intent: &ConnectIntent, direct_server: Option<&Server>, user: Option<&VpnUser>) -> u32 {
    use CompatibilityAspect::*;
    let country = |c: &str| if server.exit_country == c { Country.bit() } else { 0 };
    let city = |c: Option<&str>| match (c, server.city.as_deref()) {
        (Some(wanted), Some(actual)) if !actual.is_empty() && wanted == actual => City.bit(),
        _ => 0,
    };
    let direct = |d: &Server| country(d.exit_country.as_str()) + city(d.city.as_deref());

    let mut score = match &intent.target {
        IntentTarget::Fastest => Country.bit(),
        IntentTarget::FastestInCountry { country: c } => country(c.as_str()),
        IntentTarget::FastestInCity { country: c, city: ci } => country(c.as_str()) + city(Some(ci.as_str())),
        IntentTarget::FastestInState { country: c, state } => {
            let state_score = match server.state.as_deref() {
                Some(actual) if !actual.is_empty() && actual == state => State.bit(),
                _ => 0,
            };
            country(c.as_str()) + state_score
        }
        IntentTarget::SecureCore { exit_country, .. } => country(exit_country.as_str()),
        IntentTarget::Gateway { name, .. } => {
            let gateway = if server.gateway_name.as_deref() == Some(name.as_str()) {
                Gateway.bit()
            } else {
                0
            };
            gateway + direct_server.map(direct).unwrap_or(0)
        }
        IntentTarget::Server { .. } => direct_server.map(direct).unwrap_or(0),
    };

    let server_plus = server.tier >= tier::PLUS;
    if user.is_some_and(|u| u.is_plus_or_above() == server_plus) {
        score += Tier.bit();
    }
    if intent.features.is_subset(&server.features) {
        score += Features.bit();
    }
    if intent.is_secure_core() == server.secure_core {
        score += SecureCore.bit();
    }
    score
}

fn is_compatible(score: u32, candidate: &PhysicalServer, original: Option<&PhysicalServer>) -> bool {
    use CompatibilityAspect::*;
    has(score, Gateway)
        || (has(score, Country)
            && has(score, Features)
            && has(score, SecureCore)
            && (has(score, Tier) || original.is_none_or(|o| candidate.server.tier >= o.server.tier)))
}

/// Tracks a connection whose server keeps answering while failing
pub struct StuckConnectionHandler {
    clock: Arc<dyn Clock>,
    stuck_duration_ms: i64,
    stuck: Mutex<Option<(ConnectionParams, i64)>>,
}

impl StuckConnectionHandler {
    pub fn new(clock: Arc<dyn Clock>, config: &ConnectionConfig) -> Self {
        Self {
            clock,
            stuck_duration_ms: config.stuck_duration().as_millis() as i64,
            stuck: Mutex::new(None),
        }
    }

    pub fn on_switch_ignored(&self, current: &ConnectionParams) {
        let Ok(mut stuck) = self.stuck.lock() else { return };
        if stuck.as_ref().is_none_or(|(params, _)| params != current) {
            *stuck = Some((current.clone(), self.clock.now_ms()));
        }
    }

    pub fn is_stuck_on(&self, connection: Option<&ConnectionParams>) -> bool {
        let Some(connection) = connection else { return false };
        let now = self.clock.now_ms();
        self.stuck
            .lock()
            .map(|stuck| {
                stuck
                    .as_ref()
                    .is_some_and(|(params, since)| params == connection && now - since >= self.stuck_duration_ms)
            })
            .unwrap_or(false)
    }

    pub fn reset(&self) {
        if let Ok(mut stuck) = self.stuck.lock() {
            *stuck = None;
        }
    }
}

/// Collaborators of the error handler
pub struct ErrorHandlerDeps {
    pub api: Arc<dyn VpnApi>,
    pub flags: watch::Receiver<FeatureFlags>,
    pub settings: SettingsForConnection,
    pub plan_manager: Arc<dyn UserPlanManager>,
    pub server_manager: Arc<dyn ServerManager>,
    pub server_list_updater: Arc<dyn ServerListUpdater>,
    pub monitor: Arc<VpnStateMonitor>,
    pub network: NetworkMonitor,
    pub provider: Arc<dyn VpnBackendProvider>,
    pub user: Arc<dyn CurrentUser>,
    pub clock: Arc<dyn Clock>,
}

/// Resets a flag when dropped
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn set(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct VpnConnectionErrorHandler {
    deps: ErrorHandlerDeps,
    config: ConnectionConfig,
    handling_auth_error: AtomicBool,
    stuck: StuckConnectionHandler,
    last_server_error_handled: Mutex<Option<i64>>,
    switches: broadcast::Sender<VpnFallbackResult>,
}

impl VpnConnectionErrorHandler {
    pub fn new(deps: ErrorHandlerDeps, config: ConnectionConfig) -> Self {
        let (switches, _) = broadcast::channel(16);
        let stuck = StuckConnectionHandler::new(deps.clock.clone(), &config);
        Self {
            deps,
            config,
            handling_auth_error: AtomicBool::new(false),
            stuck,
            last_server_error_handled: Mutex::new(None),
            switches,
        }
    }

    /// Switches decided outside of a connection attempt
    pub fn subscribe_switches(&self) -> broadcast::Receiver<VpnFallbackResult> {
        self.switches.subscribe()
    }

    /// Watch plan changes and connection states
    pub fn spawn_observers(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let mut changes = self.deps.plan_manager.subscribe_info_changes();
        let mut status = self.deps.monitor.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = changes.recv() => {
                        let changes = match received {
                            Ok(changes) => changes,
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => break,
                        };
                        let Some(handler) = weak.upgrade() else { break };
                        handler.on_info_changes(&changes).await;
                    }
                    changed = status.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = status.borrow_and_update().state;
                        let Some(handler) = weak.upgrade() else { break };
                        // No longer stuck once connected, disconnected or offline
                        if matches!(state, VpnState::Connected | VpnState::Disabled | VpnState::WaitingForNetwork) {
                            handler.stuck.reset();
                        }
                    }
                }
            }
        })
    }

    async fn on_info_changes(&self, changes: &[InfoChange]) {
        if self.handling_auth_error.load(Ordering::SeqCst) || !self.deps.monitor.is_establishing_or_connected() {
            return;
        }
        let Some(params) = self.deps.monitor.connection_params() else { return };
        // Guest hole connections never fall back
        let Some(intent) = params.intent.as_regular() else { return };

        let user = self.deps.user.vpn_user().await;
        if let Some(fallback) = self
            .fallback_for_info_changes(intent, &params.server, changes, user.as_ref())
            .await
        {
            info!("Plan change while connected: {}", fallback);
            let _ = self.switches.send(VpnFallbackResult::Switch(fallback));
        }
    }

    async fn fallback_for_info_changes(
        &self,
        intent: &ConnectIntent,
        server: &Server,
        changes: &[InfoChange],
        user: Option<&VpnUser>,
    ) -> Option<Switch> {
        let reason = changes.iter().find_map(|change| match change {
            InfoChange::PlanChange { old, new } if change.is_downgrade() => Some(SwitchServerReason::Downgrade {
                from_tier: old.plan_name.clone(),
                to_tier: new.plan_name.clone(),
            }),
            InfoChange::UserBecameDelinquent => Some(SwitchServerReason::UserBecameDelinquent),
            _ => None,
        })?;

        let fallback_intent = self.deps.server_manager.default_fallback_intent().await;
        let protocol = self.deps.settings.get_for(&fallback_intent.clone().into()).protocol;
        let fallback_server = self
            .deps
            .server_manager
            .get_best_server_for_intent(&fallback_intent.clone().into(), user, &protocol)
            .await
            .filter(|s| s.is_online)?;

        Some(Switch::SwitchConnectIntent {
            from_server: Some(server.clone()),
            to_server: fallback_server,
            from_intent: intent.clone(),
            to_intent: fallback_intent,
            reason: Some(reason),
        })
    }

    /// No server could be resolved for the intent
    pub async fn on_server_not_available(&self, intent: &AnyConnectIntent) -> Option<Switch> {
        self.fallback_to_compatible_server(intent, None, false, SwitchServerReason::ServerUnavailable)
            .await
    }

    pub async fn on_server_in_maintenance(
        &self,
        intent: &AnyConnectIntent,
        params: Option<&ConnectionParams>,
    ) -> Option<Switch> {
        self.fallback_to_compatible_server(intent, params, false, SwitchServerReason::ServerInMaintenance)
            .await
    }

    pub async fn on_unreachable_error(&self, params: &ConnectionParams) -> VpnFallbackResult {
        match self
            .fallback_to_compatible_server(&params.intent, Some(params), true, SwitchServerReason::ServerUnreachable)
            .await
        {
            Some(switch) => VpnFallbackResult::Switch(switch),
            None => VpnFallbackResult::error(params, ErrorType::Unreachable, Some(SwitchServerReason::ServerUnreachable)),
        }
    }

    /// Switch server at most once per cooldown
    pub async fn on_server_error(&self, params: &ConnectionParams) -> VpnFallbackResult {
        let now = self.deps.clock.now_ms();
        let cooldown = self.config.server_error_cooldown().as_millis() as i64;
        let last = self.last_server_error_handled.lock().ok().and_then(|last| *last);
        if last.is_some_and(|at| now - at < cooldown) {
            info!("Server error cooldown, not switching");
            return VpnFallbackResult::error(params, ErrorType::Unreachable, Some(SwitchServerReason::ServerUnreachable));
        }

        match self
            .fallback_to_compatible_server(&params.intent, Some(params), false, SwitchServerReason::ServerUnreachable)
            .await
        {
            Some(switch) => {
                if let Ok(mut last) = self.last_server_error_handled.lock() {
                    *last = Some(self.deps.clock.now_ms());
                }
                VpnFallbackResult::Switch(switch)
            }
            None => VpnFallbackResult::error(params, ErrorType::Unreachable, Some(SwitchServerReason::ServerUnreachable)),
        }
    }

    /// Authentication failed: plan change, session limit, maintenance or a
    /// transient credential problem
    pub async fn on_auth_error(&self, params: &ConnectionParams) -> VpnFallbackResult {
        let Some(intent) = params.intent.as_regular() else {
            return VpnFallbackResult::error(params, ErrorType::AuthFailed, Some(SwitchServerReason::UnknownAuthFailure));
        };
        let _guard = FlagGuard::set(&self.handling_auth_error);

        let changes = self.deps.plan_manager.refresh_vpn_info().await;
        let user = self.deps.user.vpn_user().await;
        if let Some(fallback) = self
            .fallback_for_info_changes(intent, &params.server, &changes, user.as_ref())
            .await
        {
            return VpnFallbackResult::Switch(fallback);
        }

        if changes.contains(&InfoChange::VpnCredentials) {
            // Credentials are fresh now, retry the same connection
            return VpnFallbackResult::Switch(Switch::SwitchConnectIntent {
                from_server: Some(params.server.clone()),
                to_server: params.server.clone(),
                from_intent: intent.clone(),
                to_intent: intent.clone(),
                reason: None,
            });
        }

        if let Some(user) = &user {
            let sessions = match self.deps.api.get_session().await {
                Ok(response) => response.sessions.len(),
                Err(e) => {
                    warn!("Session list unavailable: {}", e);
                    0
                }
            };
            if user.max_connect as usize <= sessions {
                return VpnFallbackResult::error(params, ErrorType::MaxSessions, None);
            }
        }

        if let Some(fallback) = self.maintenance_fallback(params).await {
            return fallback;
        }
        match self
            .fallback_to_compatible_server(&params.intent, Some(params), true, SwitchServerReason::UnknownAuthFailure)
            .await
        {
            Some(switch) => VpnFallbackResult::Switch(switch),
            None => VpnFallbackResult::error(params, ErrorType::AuthFailed, Some(SwitchServerReason::UnknownAuthFailure)),
        }
    }

    /// Check the current connection's domain and publish a switch if it went
    /// into maintenance
    pub async fn maintenance_check(&self) {
        let Some(params) = self.deps.monitor.connection_params() else { return };
        if let Some(fallback) = self.maintenance_fallback(&params).await {
            let _ = self.switches.send(fallback);
        }
    }

    async fn maintenance_fallback(&self, params: &ConnectionParams) -> Option<VpnFallbackResult> {
        if !self.deps.flags.borrow().maintenance_tracker_enabled {
            return None;
        }

        debug!("Checking if server is in maintenance");
        let in_maintenance = match self.deps.api.get_connecting_domain(&params.domain.id).await {
            Ok(response) if !response.connecting_domain.is_online() => {
                info!("Current server is in maintenance ({})", response.connecting_domain.entry_domain);
                self.deps
                    .server_manager
                    .update_server_domain_status(&response.connecting_domain)
                    .await;
                true
            }
            Ok(_) => false,
            Err(e) if e.http_code() == Some(HTTP_UNPROCESSABLE_ENTITY) => true,
            Err(e) => {
                warn!("Maintenance check failed: {}", e);
                false
            }
        };
        if !in_maintenance {
            return None;
        }

        self.deps.server_list_updater.update_server_list().await;
        match self.on_server_in_maintenance(&params.intent, Some(params)).await {
            Some(switch) => Some(VpnFallbackResult::Switch(switch)),
            None => params
                .intent
                .as_regular()
                .and_then(|intent| intent.profile_id)
                .map(|_| {
                    VpnFallbackResult::error(
                        params,
                        ErrorType::NoProfileFallbackAvailable,
                        Some(SwitchServerReason::ServerInMaintenance),
                    )
                }),
        }
    }

    async fn fallback_to_compatible_server(
        &self,
        any_intent: &AnyConnectIntent,
        original: Option<&ConnectionParams>,
        include_original_server: bool,
        reason: SwitchServerReason,
    ) -> Option<Switch> {
        let Some(intent) = any_intent.as_regular() else {
            debug!("Ignoring fallback for guest hole");
            return None;
        };
        info!("Looking for a fallback server, reason: {:?}", reason);
        if !self.deps.network.is_connected() {
            info!("No network, aborting fallback");
            return None;
        }

        if self.deps.server_list_updater.needs_update() {
            self.deps.server_list_updater.update_server_list().await;
        }

        let settings = self.deps.settings.get_for(any_intent);
        let user = self.deps.user.vpn_user().await;
        let original_physical = match original {
            Some(params) => self.existing(params.physical_server()).await,
            None => None,
        };
        let protocol = original.map(|p| p.protocol).unwrap_or(settings.protocol);

        let stuck = self.stuck.is_stuck_on(original);
        if include_original_server && stuck {
            info!("Stuck on {}, looking for an alternative", original.map(|p| p.server.name.as_str()).unwrap_or(""));
        }
        let candidates = self
            .candidate_servers(
                intent,
                original_physical.as_ref(),
                &protocol,
                &settings.protocol,
                user.as_ref(),
                include_original_server && !stuck,
            )
            .await;
        for candidate in &candidates {
            debug!(
                "Fallback candidate: {} city={:?}",
                candidate.domain.entry_domain, candidate.server.city
            );
        }

        let Some(ping) = self
            .deps
            .provider
            .ping_all(any_intent, protocol, &candidates, original_physical.as_ref())
            .await
        else {
            info!("No fallback server responded");
            return None;
        };

        // The original connection still answers, switching would not help
        if let (Some(original_physical), Some(params)) = (&original_physical, original) {
            if &ping.physical_server == original_physical
                && ping
                    .responses
                    .iter()
                    .any(|r| params.has_same_protocol_params(&protocol_info(&r.params)))
            {
                self.stuck.on_switch_ignored(params);
                info!("Current connection responds, not switching server");
                return None;
            }
        }

        let expected = expected_protocol_connection(&ping, &settings.protocol);
        let direct_server = match &intent.target {
            IntentTarget::Server { server_id, .. } | IntentTarget::Gateway { server_id: Some(server_id), .. } => {
                self.deps.server_manager.get_server_by_id(server_id).await
            }
            _ => None,
        };
        let score = server_score(&ping.physical_server.server, intent, direct_server.as_ref(), user.as_ref());
        let switched_secure_core = intent.is_secure_core() && !has(score, CompatibilityAspect::SecureCore);
        let compatible = is_compatible(score, &ping.physical_server, original_physical.as_ref())
            && expected.is_some()
            && !switched_secure_core;

        info!(
            "Fallback server selected: {} {}",
            ping.physical_server.server, ping.physical_server.domain.entry_domain
        );
        let compatible_protocol = expected.is_some();
        let prepared = expected.or_else(|| ping.responses.first().cloned())?;
        Some(Switch::SwitchServer {
            from_server: original.map(|p| p.server.clone()),
            intent: intent.clone(),
            prepared,
            reason,
            compatible_protocol,
            switched_secure_core,
            notify_user: !compatible,
        })
    }

    /// The physical server if it is still in the server list
    async fn existing(&self, physical: PhysicalServer) -> Option<PhysicalServer> {
        let server = self.deps.server_manager.get_server_by_id(&physical.server.server_id).await?;
        server.domains.contains(&physical.domain).then_some(physical)
    }

    async fn sort_by_score(&self, servers: Vec<Server>, intent: &ConnectIntent, user: Option<&VpnUser>) -> Vec<Server> {
        let direct_server = match &intent.target {
            IntentTarget::Server { server_id, .. } => self.deps.server_manager.get_server_by_id(server_id).await,
            _ => None,
        };
        let mut scored: Vec<(u32, Server)> = servers
            .into_iter()
            .map(|s| (server_score(&s, intent, direct_server.as_ref(), user), s))
            .collect();
        // Stable sort keeps the collaborator's order within a score
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.into_iter().map(|(_, s)| s).collect()
    }

    async fn candidate_servers(
        &self,
        intent: &ConnectIntent,
        original: Option<&PhysicalServer>,
        protocol: &ProtocolSelection,
        intent_protocol: &ProtocolSelection,
        user: Option<&VpnUser>,
        include_original: bool,
    ) -> Vec<PhysicalServer> {
        let limit = self.config.fallback_candidates;
        let mut candidates: Vec<PhysicalServer> = Vec::new();
        if let (Some(original), true) = (original, include_original) {
            candidates.push(original.clone());
        }

        let secure_core = intent.is_secure_core();
        let eligible = if intent.profile_id.is_some() {
            let max_tier = user.map(|u| u.max_tier).unwrap_or(tier::FREE);
            self.deps
                .server_manager
                .get_online_servers_for_intent(intent, intent_protocol, max_tier)
                .await
        } else {
            self.deps
                .server_manager
                .get_online_accessible_servers(secure_core, intent.gateway_name(), user, protocol)
                .await
        };

        let original_is_tor = original.is_some_and(|o| o.server.is_tor());
        let original_entry_ip = original.map(|o| o.domain.entry_ip_for(protocol));
        let scored: Vec<Server> = self
            .sort_by_score(eligible, intent, user)
            .await
            .into_iter()
            .filter(|candidate| {
                let other_ip = original.is_none()
                    || candidate
                        .online_domains(protocol)
                        .iter()
                        .any(|d| Some(d.entry_ip_for(protocol)) != original_entry_ip);
                other_ip && (original_is_tor || !candidate.is_tor())
            })
            .collect();

        let mut seen_domains: HashSet<String> = HashSet::new();
        for server in &scored {
            if candidates.len() >= limit {
                break;
            }
            let domains: Vec<_> = server
                .online_domains(protocol)
                .into_iter()
                .filter(|d| Some(d.entry_ip_for(protocol)) != original_entry_ip)
                .collect();
            let Some(domain) = domains.get(rand::random::<usize>() % domains.len().max(1)) else {
                continue;
            };
            if seen_domains.insert(domain.entry_domain.clone()) {
                candidates.push(PhysicalServer {
                    server: server.clone(),
                    domain: (*domain).clone(),
                });
            }
        }

        let mut extra: Vec<Server> = Vec::new();
        let exit_countries: HashSet<&str> = candidates.iter().map(|c| c.server.exit_country.as_str()).collect();
        if exit_countries.len() == 1 {
            let country = exit_countries.iter().next().copied().unwrap_or_default();
            let cities: HashSet<Option<&str>> = candidates.iter().map(|c| c.server.city.as_deref()).collect();
            if cities.len() == 1 {
                let city = cities.iter().next().copied().flatten();
                if let Some(other_city) = scored
                    .iter()
                    .find(|s| s.exit_country == country && s.city.as_deref() != city)
                {
                    extra.push(other_city.clone());
                }
            }
            if let Some(other_country) = scored.iter().find(|s| s.exit_country != country) {
                extra.push(other_country.clone());
            }
        }

        // Last resort for Secure Core: the best regular server
        if secure_core && intent.profile_id.is_none() {
            let regular = self
                .deps
                .server_manager
                .get_online_accessible_servers(false, None, user, protocol)
                .await;
            if let Some(best) = self.sort_by_score(regular, intent, user).await.into_iter().next() {
                extra.push(best);
            }
        }

        candidates.truncate(limit.saturating_sub(extra.len()));
        candidates.extend(extra.into_iter().filter_map(|server| {
            let domain = server.random_online_domain(protocol)?.clone();
            Some(PhysicalServer { server, domain })
        }));
        candidates
    }
}

fn protocol_info(params: &ConnectionParams) -> crate::server::ProtocolInfo {
    crate::server::ProtocolInfo {
        protocol: params.protocol,
        domain: params.domain.clone(),
        entry_ip: params.entry_ip,
        port: params.port,
    }
}

/// First response on the protocol the user selected
fn expected_protocol_connection(ping: &PingResult, expected: &ProtocolSelection) -> Option<PrepareResult> {
    if expected.is_smart() {
        return ping.responses.first().cloned();
    }
    ping.responses
        .iter()
        .find(|r| r.params.protocol == *expected)
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiError, ConnectingDomainResponse, Session, SessionListResponse};
    use crate::intent::ServerFeature;
    use crate::server::TransmissionProtocol;
    use crate::test_support::{TestHarness, test_server, vpn_user};
    use std::time::Duration;

    #[test]
    fn test_score_prefers_matching_country_and_features() {
        let intent = ConnectIntent::fastest_in_country("CH").with_features([ServerFeature::P2P]);
        let mut ch = test_server("CH#1", "CH");
        ch.features.insert(ServerFeature::P2P);
        let de = test_server("DE#1", "DE");
        let user = vpn_user(tier::PLUS);

        let ch_score = server_score(&ch, &intent, None, Some(&user));
        let de_score = server_score(&de, &intent, None, Some(&user));
        assert!(ch_score > de_score);
        assert!(has(ch_score, CompatibilityAspect::Country));
        assert!(has(ch_score, CompatibilityAspect::Features));
        assert!(!has(de_score, CompatibilityAspect::Features));
    }

    #[test]
    fn test_gateway_match_is_always_compatible() {
        let intent = ConnectIntent::new(IntentTarget::Gateway { name: "acme".into(), server_id: None });
        let mut server = test_server("GW#1", "US");
        server.gateway_name = Some("acme".into());
        let score = server_score(&server, &intent, None, None);
        let physical = PhysicalServer { server: server.clone(), domain: server.domains[0].clone() };
        assert!(is_compatible(score, &physical, None));
    }

    #[test]
    fn test_stuck_handler() {
        let harness = TestHarness::new();
        let server = test_server("CH#1", "CH");
        let params = harness.wireguard_params(ConnectIntent::fastest().into(), &server);
        let stuck = StuckConnectionHandler::new(harness.clock.clone(), &ConnectionConfig::default());

        stuck.on_switch_ignored(&params);
        assert!(!stuck.is_stuck_on(Some(&params)));
        harness.clock.advance(Duration::from_secs(30));
        stuck.on_switch_ignored(&params);
        harness.clock.advance(Duration::from_secs(30));
        assert!(stuck.is_stuck_on(Some(&params)));
        assert!(!stuck.is_stuck_on(Some(&params.renewed())));

        stuck.reset();
        assert!(!stuck.is_stuck_on(Some(&params)));
    }

    #[tokio::test]
    async fn test_unreachable_switches_to_answering_server() {
        let harness = TestHarness::new();
        let ch1 = test_server("CH#1", "CH");
        let ch2 = test_server("CH#2", "CH");
        harness.servers.set_servers(vec![ch1.clone(), ch2.clone()]);
        harness.wireguard.set_reachable_servers(["CH#2".to_string()], [TransmissionProtocol::Udp]);
        let params = harness.wireguard_params(ConnectIntent::fastest_in_country("CH").into(), &ch1);

        let result = harness.error_handler().on_unreachable_error(&params).await;

        let VpnFallbackResult::Switch(Switch::SwitchServer { prepared, reason, compatible_protocol, notify_user, .. }) =
            &result
        else {
            panic!("expected a server switch, got {:?}", result);
        };
        assert_eq!(prepared.params.server.server_id, "CH#2");
        assert_eq!(*reason, SwitchServerReason::ServerUnreachable);
        assert!(*compatible_protocol);
        assert!(!*notify_user);
    }

    #[tokio::test]
    async fn test_unreachable_keeps_answering_original() {
        let harness = TestHarness::new();
        let ch1 = test_server("CH#1", "CH");
        harness.servers.set_servers(vec![ch1.clone(), test_server("CH#2", "CH")]);
        harness.wireguard.set_scan_responses([TransmissionProtocol::Udp]);
        let params = harness.wireguard_params(ConnectIntent::fastest_in_country("CH").into(), &ch1);

        let result = harness.error_handler().on_unreachable_error(&params).await;

        assert!(matches!(
            result,
            VpnFallbackResult::Error { kind: ErrorType::Unreachable, .. }
        ));
    }

    #[tokio::test]
    async fn test_no_network_means_no_fallback() {
        let harness = TestHarness::new();
        harness.network.update(crate::platform::NetworkStatus::Disconnected);
        harness.servers.set_servers(vec![test_server("CH#1", "CH")]);
        harness.wireguard.set_scan_responses([TransmissionProtocol::Udp]);

        let intent: AnyConnectIntent = ConnectIntent::fastest().into();
        assert!(harness.error_handler().on_server_not_available(&intent).await.is_none());
    }

    #[tokio::test]
    async fn test_server_error_cooldown() {
        let harness = TestHarness::new();
        let ch1 = test_server("CH#1", "CH");
        harness.servers.set_servers(vec![ch1.clone(), test_server("CH#2", "CH")]);
        harness.wireguard.set_reachable_servers(["CH#2".to_string()], [TransmissionProtocol::Udp]);
        let params = harness.wireguard_params(ConnectIntent::fastest().into(), &ch1);
        let handler = harness.error_handler();

        assert!(matches!(handler.on_server_error(&params).await, VpnFallbackResult::Switch(_)));
        assert!(matches!(
            handler.on_server_error(&params).await,
            VpnFallbackResult::Error { kind: ErrorType::Unreachable, .. }
        ));

        harness.clock.advance(Duration::from_secs(121));
        assert!(matches!(handler.on_server_error(&params).await, VpnFallbackResult::Switch(_)));
    }

    #[tokio::test]
    async fn test_auth_error_downgrade_switches_intent() {
        let harness = TestHarness::new();
        let plus_server = test_server("CH#1", "CH");
        let free_server = test_server("FREE#1", "NL");
        harness.servers.set_servers(vec![plus_server.clone(), free_server.clone()]);
        harness.servers.set_best(Some(free_server.clone()));
        harness.plan.set_refresh_changes(vec![InfoChange::PlanChange {
            old: vpn_user(tier::PLUS),
            new: vpn_user(tier::FREE),
        }]);
        let params = harness.wireguard_params(ConnectIntent::fastest_in_country("CH").into(), &plus_server);

        let result = harness.error_handler().on_auth_error(&params).await;

        let VpnFallbackResult::Switch(Switch::SwitchConnectIntent { to_server, to_intent, reason, .. }) = &result else {
            panic!("expected an intent switch, got {:?}", result);
        };
        assert_eq!(to_server.server_id, "FREE#1");
        assert_eq!(*to_intent, ConnectIntent::fastest());
        assert!(matches!(reason, Some(SwitchServerReason::Downgrade { .. })));
    }

    #[tokio::test]
    async fn test_auth_error_max_sessions() {
        let harness = TestHarness::new();
        let server = test_server("CH#1", "CH");
        harness.servers.set_servers(vec![server.clone()]);
        harness.user.set_user(Some(VpnUser { max_connect: 2, ..vpn_user(tier::PLUS) }));
        harness.api.set_sessions(SessionListResponse {
            code: 1000,
            sessions: vec![
                Session { session_id: "a".into(), exit_ip: "1.1.1.1".into() },
                Session { session_id: "b".into(), exit_ip: "1.1.1.2".into() },
            ],
        });
        let params = harness.wireguard_params(ConnectIntent::fastest().into(), &server);

        let result = harness.error_handler().on_auth_error(&params).await;
        assert!(matches!(result, VpnFallbackResult::Error { kind: ErrorType::MaxSessions, .. }));
    }

    #[tokio::test]
    async fn test_auth_error_maintenance_switches_server() {
        let harness = TestHarness::new();
        let ch1 = test_server("CH#1", "CH");
        harness.servers.set_servers(vec![ch1.clone(), test_server("CH#2", "CH")]);
        harness.wireguard.set_reachable_servers(["CH#2".to_string()], [TransmissionProtocol::Udp]);
        let mut offline = ch1.domains[0].clone();
        offline.status = 0;
        harness.api.set_connecting_domain(Ok(ConnectingDomainResponse { connecting_domain: offline }));
        let params = harness.wireguard_params(ConnectIntent::fastest().into(), &ch1);

        let result = harness.error_handler().on_auth_error(&params).await;

        let VpnFallbackResult::Switch(Switch::SwitchServer { reason, .. }) = &result else {
            panic!("expected a server switch, got {:?}", result);
        };
        assert_eq!(*reason, SwitchServerReason::ServerInMaintenance);
        assert_eq!(harness.servers.domain_updates(), 1);
        assert_eq!(harness.server_list.updates(), 1);
    }

    #[tokio::test]
    async fn test_maintenance_422_publishes_switch() {
        let harness = TestHarness::new();
        let ch1 = test_server("CH#1", "CH");
        harness.servers.set_servers(vec![ch1.clone(), test_server("CH#2", "CH")]);
        harness.wireguard.set_reachable_servers(["CH#2".to_string()], [TransmissionProtocol::Udp]);
        harness.api.set_connecting_domain(Err(ApiError::Http {
            code: HTTP_UNPROCESSABLE_ENTITY,
            message: "gone".into(),
            retry_after: None,
        }));
        let params = harness.wireguard_params(ConnectIntent::fastest().into(), &ch1);
        harness.monitor.update_status(crate::monitor::Status {
            state: VpnState::Connected,
            connection_params: Some(params.clone()),
            connection_intent: Some(params.intent.clone()),
        });

        let handler = harness.error_handler();
        let mut switches = handler.subscribe_switches();
        handler.maintenance_check().await;

        assert!(matches!(switches.try_recv(), Ok(VpnFallbackResult::Switch(_))));
    }

    #[tokio::test]
    async fn test_guest_hole_never_falls_back() {
        let harness = TestHarness::new();
        harness.servers.set_servers(vec![test_server("CH#1", "CH")]);
        harness.wireguard.set_scan_responses([TransmissionProtocol::Udp]);
        let intent = AnyConnectIntent::GuestHole { server_id: "CH#1".into() };

        assert!(harness.error_handler().on_server_not_available(&intent).await.is_none());
    }
}
