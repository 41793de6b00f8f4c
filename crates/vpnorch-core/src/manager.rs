//! VPN Connection Manager
//!
//! The connection state machine. Owns the active backend, serializes every
//! connect, disconnect and fallback through one control sequence and is
//! the only writer of the [`VpnStateMonitor`].
//!
//! # Usage
//!
//! ```rust,ignore
//! let manager = VpnConnectionManager::new(deps, &config);
//! let _observers = manager.spawn_observers();
//!
//! manager
//!     .connect(Arc::new(BackgroundUiDelegate), ConnectIntent::fastest().into(), ConnectTrigger::User)
//!     .await;
//! if manager.monitor().is_connected() {
//!     println!("Connected");
//! }
//!
//! manager.disconnect(DisconnectTrigger::UserAction).await;
//! ```
//!
//! # Control sequence
//!
//! Public operations run as one spawned attempt at a time. A new attempt
//! aborts the previous one and any running fallback, then waits on the
//! control gate. Backend disconnects run in their own task that an abort
//! cannot interrupt, and every attempt waits for a pending one, so an old
//! backend is always disconnected before a new one connects. Backend states reach the manager through a pump task tagged
//! with the generation of the connection it belongs to; states of a
//! replaced connection are dropped.

use crate::agent::{AgentContext, LocalAgentSupervisor};
use crate::backend::{PrepareResult, VpnBackend};
use crate::certificate::CertificateRepository;
use crate::config::{ConnectionConfig, CoreConfig};
use crate::delegate::{BackgroundUiDelegate, ServerRestrictedReason, VpnPermissionDelegate, VpnUiDelegate};
use crate::error_handler::{Switch, SwitchServerReason, VpnConnectionErrorHandler, VpnFallbackResult};
use crate::intent::AnyConnectIntent;
use crate::monitor::{Status, VpnStateMonitor};
use crate::platform::{Clock, NetworkMonitor, WakeLock, WakeLockGuard};
use crate::provider::VpnBackendProvider;
use crate::server::{ConnectionParams, ProtocolSelection, Server, ServerManager};
use crate::settings::SettingsForConnection;
use crate::state::{ErrorType, VpnState};
use crate::telemetry::{ConnectTrigger, DisconnectTrigger, VpnConnectionTelemetry};
use crate::unreachable::LocalAgentUnreachableTracker;
use crate::user::CurrentUser;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

const CONNECT_WAKE_LOCK: &str = "vpnorch:connect";
const FALLBACK_WAKE_LOCK: &str = "vpnorch:fallback";

/// Collaborators of the connection manager
pub struct ManagerDeps {
    pub monitor: Arc<VpnStateMonitor>,
    pub provider: Arc<dyn VpnBackendProvider>,
    pub server_manager: Arc<dyn ServerManager>,
    pub error_handler: Arc<VpnConnectionErrorHandler>,
    pub settings: SettingsForConnection,
    pub user: Arc<dyn CurrentUser>,
    pub certificates: CertificateRepository,
    pub permission: Arc<dyn VpnPermissionDelegate>,
    pub telemetry: Arc<dyn VpnConnectionTelemetry>,
    pub wake_lock: Arc<dyn WakeLock>,
    pub network: NetworkMonitor,
    pub clock: Arc<dyn Clock>,
}

/// The running connection
struct Active {
    backend: Arc<dyn VpnBackend>,
    params: ConnectionParams,
    _supervisor: LocalAgentSupervisor,
    pump: JoinHandle<()>,
}

impl Drop for Active {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[derive(Default)]
struct Control {
    /// Bumped whenever the active connection changes
    generation: u64,
    active: Option<Active>,
    attempt: Option<AbortHandle>,
    fallback: Option<AbortHandle>,
    fallback_active: bool,
    last_intent: Option<AnyConnectIntent>,
    /// Disconnect of a replaced backend, possibly still running
    teardown: Option<Shared<BoxFuture<'static, ()>>>,
}

struct Inner {
    deps: ManagerDeps,
    config: ConnectionConfig,
    tracker: Arc<LocalAgentUnreachableTracker>,
    /// Held for the whole of a connect, disconnect or fallback application
    gate: tokio::sync::Mutex<()>,
    control: Mutex<Control>,
}

/// Connection manager handle
#[derive(Clone)]
pub struct VpnConnectionManager {
    inner: Arc<Inner>,
}

impl VpnConnectionManager {
    pub fn new(deps: ManagerDeps, config: &CoreConfig) -> Self {
        let tracker = Arc::new(LocalAgentUnreachableTracker::new(
            deps.clock.clone(),
            config.unreachable.clone(),
        ));
        Self {
            inner: Arc::new(Inner {
                deps,
                config: config.connection.clone(),
                tracker,
                gate: tokio::sync::Mutex::new(()),
                control: Mutex::new(Control::default()),
            }),
        }
    }

    pub fn monitor(&self) -> &Arc<VpnStateMonitor> {
        &self.inner.deps.monitor
    }

    /// Intent of the latest connect
    pub fn last_intent(&self) -> Option<AnyConnectIntent> {
        self.inner.control().last_intent.clone()
    }

    /// Connect to `intent`, replacing whatever runs now.
    ///
    /// Returns once the attempt has handed the tunnel to a backend, or has
    /// failed. Progress after that is visible on the monitor.
    pub async fn connect(&self, delegate: Arc<dyn VpnUiDelegate>, intent: AnyConnectIntent, trigger: ConnectTrigger) {
        info!("Connect requested: {} ({:?})", intent, trigger);
        self.run_attempt(move |inner| {
            inner.connect_locked(delegate, intent, None, trigger, DisconnectTrigger::NewConnection)
        })
        .await;
    }

    pub async fn disconnect(&self, trigger: DisconnectTrigger) {
        info!("Disconnect requested ({:?})", trigger);
        if trigger == DisconnectTrigger::UserAction {
            self.inner.deps.monitor.on_disconnected_by_user();
        }
        self.run_attempt(move |inner| {
            async move { inner.disconnect_locked(trigger, VpnState::Disabled).await }.boxed()
        })
        .await;
    }

    /// Resolve the last intent again and reconnect
    pub async fn reconnect(&self, reason: &str, delegate: Arc<dyn VpnUiDelegate>) {
        let Some(intent) = self.last_intent() else {
            debug!("Nothing to reconnect");
            return;
        };
        let reason = reason.to_string();
        self.run_attempt(move |inner| {
            inner.connect_locked(delegate, intent, None, ConnectTrigger::Reconnect, DisconnectTrigger::Reconnect(reason))
        })
        .await;
    }

    /// Reconnect to the same server and entry point without resolving again
    pub async fn reconnect_with_current_params(&self, delegate: Arc<dyn VpnUiDelegate>) {
        let current = self
            .inner
            .control()
            .active
            .as_ref()
            .map(|active| (active.backend.clone(), active.params.renewed()));
        let Some((backend, params)) = current else {
            self.reconnect("no active connection", delegate).await;
            return;
        };
        self.run_attempt(move |inner| {
            async move {
                inner.deps.telemetry.on_connection_start(&ConnectTrigger::Reconnect);
                let trigger = DisconnectTrigger::Reconnect("current params".to_string());
                inner.prepared_connect(PrepareResult { backend, params }, trigger).await;
            }
            .boxed()
        })
        .await;
    }

    /// Bring the connection back after a process restart.
    ///
    /// Returns whether a connect was started.
    pub async fn on_restore_process(&self, intent: AnyConnectIntent, reason: &str) -> bool {
        let persisted = self.inner.deps.monitor.persisted_state_name();
        match persisted.as_deref() {
            None | Some("DISABLED") | Some("DISCONNECTING") => return false,
            Some(_) => {}
        }
        if intent.is_guest_hole() {
            return false;
        }
        let busy = self
            .inner
            .control()
            .attempt
            .as_ref()
            .is_some_and(|attempt| !attempt.is_finished());
        if busy || self.inner.deps.monitor.is_establishing_or_connected() {
            debug!("Connection already in progress, not restoring");
            return false;
        }

        info!("Restoring connection after process restart: {}", reason);
        self.connect(Arc::new(BackgroundUiDelegate), intent, ConnectTrigger::Auto(reason.to_string()))
            .await;
        true
    }

    /// Disconnect if the current connection is a guest hole
    pub async fn disconnect_guest_hole(&self) -> bool {
        if !self.last_intent().is_some_and(|intent| intent.is_guest_hole()) {
            return false;
        }
        self.disconnect(DisconnectTrigger::GuestHole).await;
        true
    }

    /// Apply switches the error handler decides outside of a connect
    pub fn spawn_observers(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let mut switches = self.inner.deps.error_handler.subscribe_switches();
        tokio::spawn(async move {
            loop {
                let result = match switches.recv().await {
                    Ok(result) => result,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Missed {} fallback decisions", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(inner) = weak.upgrade() else { break };
                if !inner.deps.monitor.is_establishing_or_connected() {
                    debug!("Not connected, ignoring fallback");
                    continue;
                }
                let _wake = WakeLockGuard::acquire(
                    inner.deps.wake_lock.clone(),
                    FALLBACK_WAKE_LOCK,
                    inner.config.wake_lock_max(),
                );
                let _gate = inner.gate.lock().await;
                inner.apply_fallback(result).await;
            }
        })
    }

    async fn run_attempt<F>(&self, job: F)
    where
        F: FnOnce(Arc<Inner>) -> BoxFuture<'static, ()> + Send + 'static,
    {
        let inner = self.inner.clone();
        let handle = {
            let mut control = self.inner.control();
            if let Some(previous) = control.attempt.take() {
                previous.abort();
            }
            if let Some(fallback) = control.fallback.take() {
                fallback.abort();
            }
            let handle = tokio::spawn(async move {
                let wake = WakeLockGuard::acquire(
                    inner.deps.wake_lock.clone(),
                    CONNECT_WAKE_LOCK,
                    inner.config.wake_lock_max(),
                );
                let gate = inner.gate.lock().await;
                inner.wait_for_teardown().await;
                job(inner.clone()).await;
                drop(gate);
                inner.hold_until_settled(wake);
            });
            control.attempt = Some(handle.abort_handle());
            handle
        };

        if let Err(e) = handle.await {
            if e.is_cancelled() {
                debug!("Connection attempt superseded");
            } else {
                error!("Connection attempt failed: {}", e);
            }
        }
    }
}

impl Inner {
    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_current(&self, generation: u64) -> bool {
        let control = self.control();
        control.generation == generation && control.active.is_some()
    }

    fn publish(&self, state: VpnState, params: &ConnectionParams) {
        self.deps.monitor.update_status(Status {
            state,
            connection_params: Some(params.clone()),
            connection_intent: Some(params.intent.clone()),
        });
    }

    /// Disconnect `backend` in a task of its own, after any earlier one.
    ///
    /// The returned future completes with the disconnect; dropping it does
    /// not cancel the disconnect, which the next attempt still waits for.
    fn start_teardown(&self, backend: Arc<dyn VpnBackend>) -> Shared<BoxFuture<'static, ()>> {
        let earlier = self.control().teardown.take();
        let task = tokio::spawn(async move {
            if let Some(earlier) = earlier {
                earlier.await;
            }
            backend.disconnect().await;
        });
        let teardown = async move {
            if let Err(e) = task.await {
                error!("Backend disconnect failed: {}", e);
            }
        }
        .boxed()
        .shared();
        self.control().teardown = Some(teardown.clone());
        teardown
    }

    async fn wait_for_teardown(&self) {
        let pending = self.control().teardown.clone();
        let Some(pending) = pending else { return };
        if pending.peek().is_none() {
            debug!("Waiting for the previous backend to disconnect");
        }
        pending.await;
        let mut control = self.control();
        if control.teardown.as_ref().is_some_and(|t| t.peek().is_some()) {
            control.teardown = None;
        }
    }

    /// Keep the wake lock until the attempt reaches a stable state
    fn hold_until_settled(&self, wake: WakeLockGuard) {
        let monitor = &self.deps.monitor;
        if monitor.is_connected() || !monitor.is_establishing_or_connected() {
            return;
        }
        let mut status = monitor.subscribe();
        let max_hold = self.config.wake_lock_max();
        tokio::spawn(async move {
            let _wake = wake;
            let settled = async {
                while status.changed().await.is_ok() {
                    let state = status.borrow_and_update().state;
                    if state.is_connected() || !state.is_establishing_connection() {
                        break;
                    }
                }
            };
            if tokio::time::timeout(max_hold, settled).await.is_err() {
                debug!("Connection did not settle while holding the wake lock");
            }
        });
    }

    fn connect_locked(
        self: &Arc<Self>,
        delegate: Arc<dyn VpnUiDelegate>,
        intent: AnyConnectIntent,
        preferred: Option<Server>,
        trigger: ConnectTrigger,
        disconnect_trigger: DisconnectTrigger,
    ) -> BoxFuture<'static, ()> {
        let inner = self.clone();
        async move {
            inner.deps.telemetry.on_connection_start(&trigger);

            if inner.deps.permission.needs_permission() && !delegate.ask_for_permissions(&intent).await {
                info!("VPN permission denied");
                inner.abort_attempt("permission denied", false, disconnect_trigger).await;
                return;
            }

            inner.control().last_intent = Some(intent.clone());
            let settings = inner.deps.settings.get_for(&intent);
            let user = inner.deps.user.vpn_user().await;
            let server = match preferred {
                Some(server) => Some(server),
                None => {
                    inner
                        .deps
                        .server_manager
                        .get_best_server_for_intent(&intent, user.as_ref(), &settings.protocol)
                        .await
                }
            };

            let Some(server) = server else {
                info!("No server available for {}", intent);
                let fallback = inner.deps.error_handler.on_server_not_available(&intent).await;
                if let Some(switch) = fallback {
                    inner.deps.monitor.notify(VpnFallbackResult::Switch(switch.clone()));
                    if inner.apply_switch(switch, disconnect_trigger.clone()).await {
                        return;
                    }
                }
                inner.abort_attempt("no server available", true, disconnect_trigger).await;
                return;
            };

            let restriction = if !server.is_online {
                Some(ServerRestrictedReason::Maintenance)
            } else if !delegate.should_skip_access_restrictions()
                && user.as_ref().is_some_and(|user| !user.has_access(&server))
            {
                Some(if server.secure_core {
                    ServerRestrictedReason::SecureCoreUpgrade
                } else {
                    ServerRestrictedReason::Upgrade
                })
            } else {
                None
            };
            if let Some(reason) = restriction {
                info!("{} is restricted: {:?}", server, reason);
                if !delegate.on_server_restricted(reason).await {
                    let handler = &inner.deps.error_handler;
                    let fallback = match reason {
                        ServerRestrictedReason::Maintenance => handler.on_server_in_maintenance(&intent, None).await,
                        _ => handler.on_server_not_available(&intent).await,
                    };
                    if let Some(switch) = fallback {
                        inner.deps.monitor.notify(VpnFallbackResult::Switch(switch.clone()));
                        if inner.apply_switch(switch, disconnect_trigger.clone()).await {
                            return;
                        }
                    }
                }
                inner.abort_attempt("server restricted", false, disconnect_trigger).await;
                return;
            }

            inner
                .smart_connect(delegate, intent, server, settings.protocol, disconnect_trigger)
                .await;
        }
        .boxed()
    }

    /// Negotiate a protocol for `server` and connect
    async fn smart_connect(
        self: &Arc<Self>,
        delegate: Arc<dyn VpnUiDelegate>,
        intent: AnyConnectIntent,
        server: Server,
        protocol: ProtocolSelection,
        disconnect_trigger: DisconnectTrigger,
    ) {
        self.deps.monitor.update_status(Status {
            state: VpnState::ScanningPorts,
            connection_params: None,
            connection_intent: Some(intent.clone()),
        });

        let has_network = self.deps.network.is_connected();
        let protocol = if !has_network && protocol.is_smart() {
            let fallback = self.deps.provider.fallback_protocol(&server);
            info!("No network, using {} without scanning", fallback);
            fallback
        } else {
            protocol
        };

        let provider = &self.deps.provider;
        let mut prepared = provider.prepare_connection(protocol, &intent, &server, has_network).await;
        if prepared.is_none() && !protocol.is_smart() && has_network {
            info!("{} did not answer on {}, trying without scanning", server, protocol);
            prepared = provider.prepare_connection(protocol, &intent, &server, false).await;
        }

        match prepared {
            Some(prepared) => self.prepared_connect(prepared, disconnect_trigger).await,
            None => {
                warn!("No usable protocol for {}", server);
                delegate.on_protocol_not_supported();
                self.abort_attempt("protocol not supported", true, disconnect_trigger).await;
            }
        }
    }

    /// Replace the active connection with `prepared`
    async fn prepared_connect(self: &Arc<Self>, prepared: PrepareResult, disconnect_trigger: DisconnectTrigger) {
        self.wait_for_teardown().await;
        let previous = {
            let mut control = self.control();
            control.generation += 1;
            control.fallback_active = false;
            control.active.take()
        };
        if let Some(previous) = previous {
            self.deps
                .telemetry
                .on_disconnection_trigger(&disconnect_trigger, Some(&previous.params));
            let backend = previous.backend.clone();
            drop(previous);
            debug!("Disconnecting previous backend");
            self.start_teardown(backend).await;
        }

        let PrepareResult { backend, params } = prepared;
        let session_id = if params.intent.is_guest_hole() {
            None
        } else {
            self.deps.user.session_id().await
        };
        let ctx = AgentContext {
            certificates: self.deps.certificates.clone(),
            tracker: self.tracker.clone(),
            settings: self.deps.settings.clone(),
            network: self.deps.network.clone(),
            session_id,
            disconnect_settle: self.config.disconnect_settle(),
        };
        self.tracker.reset(false);
        let (supervisor, states) = LocalAgentSupervisor::start(ctx, backend.clone(), params.clone());

        {
            let mut control = self.control();
            control.generation += 1;
            let generation = control.generation;
            let pump = tokio::spawn(pump(Arc::downgrade(self), generation, params.clone(), states));
            control.active = Some(Active {
                backend: backend.clone(),
                params: params.clone(),
                _supervisor: supervisor,
                pump,
            });
        }

        info!("Connecting to {} via {}", params.server, params.protocol);
        self.publish(VpnState::Connecting, &params);
        backend.connect(&params).await;
    }

    /// Tear down the active connection and publish `final_state`
    async fn disconnect_locked(&self, trigger: DisconnectTrigger, final_state: VpnState) {
        let active = {
            let mut control = self.control();
            control.generation += 1;
            control.fallback_active = false;
            control.active.take()
        };

        let mut params = None;
        if let Some(active) = active {
            self.deps.telemetry.on_disconnection_trigger(&trigger, Some(&active.params));
            self.publish(VpnState::Disconnecting, &active.params);
            let backend = active.backend.clone();
            params = Some(active.params.clone());
            drop(active);
            self.start_teardown(backend).await;
        }

        let status = match final_state {
            VpnState::Error { .. } => Status {
                state: final_state,
                connection_intent: params.as_ref().map(|p| p.intent.clone()),
                connection_params: params,
            },
            state => Status {
                state,
                ..Status::disabled()
            },
        };
        self.deps.monitor.update_status(status);
    }

    async fn abort_attempt(&self, reason: &str, is_failure: bool, trigger: DisconnectTrigger) {
        self.deps.telemetry.on_connection_abort(reason, is_failure);
        self.disconnect_locked(trigger, VpnState::Disabled).await;
    }

    /// Apply a switch; returns false when it was not applicable
    async fn apply_switch(self: &Arc<Self>, switch: Switch, disconnect_trigger: DisconnectTrigger) -> bool {
        info!("Applying fallback: {}", switch);
        let trigger = ConnectTrigger::Fallback(match switch.reason() {
            Some(reason) => format!("{:?}", reason),
            None => "retry".to_string(),
        });
        match switch {
            Switch::SwitchConnectIntent { to_server, to_intent, .. } => {
                self.connect_locked(
                    Arc::new(BackgroundUiDelegate),
                    to_intent.into(),
                    Some(to_server),
                    trigger,
                    disconnect_trigger,
                )
                .await;
                true
            }
            Switch::SwitchServer { prepared, reason, compatible_protocol, .. } => {
                if reason == SwitchServerReason::UserBecameDelinquent || !compatible_protocol {
                    info!("Not switching to {} ({:?})", prepared.params, reason);
                    self.deps.telemetry.on_connection_abort("incompatible fallback", false);
                    return false;
                }
                self.deps.telemetry.on_connection_start(&trigger);
                self.prepared_connect(prepared, disconnect_trigger).await;
                true
            }
        }
    }

    /// Publish and apply a fallback decision. Callers hold the gate.
    async fn apply_fallback(self: &Arc<Self>, result: VpnFallbackResult) {
        self.deps.monitor.notify(result.clone());
        match result {
            VpnFallbackResult::Switch(switch) => {
                self.apply_switch(switch, DisconnectTrigger::Fallback).await;
            }
            VpnFallbackResult::Error { original_params, kind, .. } => match kind {
                ErrorType::MaxSessions | ErrorType::NoProfileFallbackAvailable => {
                    self.disconnect_locked(DisconnectTrigger::Error(kind.to_string()), VpnState::final_error(kind))
                        .await;
                }
                _ => {
                    let params = self
                        .control()
                        .active
                        .as_ref()
                        .map(|active| active.params.clone())
                        .unwrap_or(original_params);
                    self.publish(VpnState::error(kind), &params);
                }
            },
        }
    }

    fn on_backend_state(self: &Arc<Self>, generation: u64, params: &ConnectionParams, state: VpnState) {
        match state {
            VpnState::Error { kind, is_final: false } if kind.is_recoverable() => {
                self.start_fallback(generation, params.clone(), kind);
            }
            VpnState::Error { kind, is_final: true } => {
                warn!("Final error on {}: {}", params.server, kind);
                self.publish(state, params);
                self.spawn_teardown(generation);
            }
            state => self.publish(state, params),
        }
    }

    fn start_fallback(self: &Arc<Self>, generation: u64, params: ConnectionParams, kind: ErrorType) {
        let mut control = self.control();
        if control.fallback_active {
            debug!("Fallback already running, ignoring {}", kind);
            return;
        }
        control.fallback_active = true;
        info!("Recoverable error {} on {}, checking availability", kind, params.server);
        self.publish(VpnState::CheckingAvailability, &params);

        let inner = self.clone();
        let task = tokio::spawn(async move { inner.run_fallback(generation, params, kind).await });
        control.fallback = Some(task.abort_handle());
    }

    async fn run_fallback(self: Arc<Self>, generation: u64, params: ConnectionParams, kind: ErrorType) {
        let _wake = WakeLockGuard::acquire(self.deps.wake_lock.clone(), FALLBACK_WAKE_LOCK, self.config.wake_lock_max());
        let handler = &self.deps.error_handler;
        let result = match kind {
            ErrorType::UnreachableInternal => handler.on_unreachable_error(&params).await,
            ErrorType::ServerError => handler.on_server_error(&params).await,
            _ => handler.on_auth_error(&params).await,
        };

        let _gate = self.gate.lock().await;
        if !self.is_current(generation) {
            info!("Connection changed, discarding fallback for {}", params.server);
            return;
        }
        self.apply_fallback(result).await;
        self.control().fallback_active = false;
    }

    /// Drop a connection that ended in a final error
    fn spawn_teardown(self: &Arc<Self>, generation: u64) {
        let inner = self.clone();
        tokio::spawn(async move {
            let _gate = inner.gate.lock().await;
            let active = {
                let mut control = inner.control();
                if control.generation != generation {
                    return;
                }
                control.generation += 1;
                control.active.take()
            };
            if let Some(active) = active {
                let backend = active.backend.clone();
                drop(active);
                if backend.state() != VpnState::Disabled {
                    inner.start_teardown(backend).await;
                }
            }
        });
    }
}

/// Forward supervised states of one connection to the manager
async fn pump(
    inner: Weak<Inner>,
    generation: u64,
    params: ConnectionParams,
    mut states: mpsc::UnboundedReceiver<VpnState>,
) {
    let mut started = false;
    while let Some(state) = states.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        if !inner.is_current(generation) {
            break;
        }
        // The backend is idle until its connect begins
        if !started {
            if state == VpnState::Disabled {
                continue;
            }
            started = true;
        }
        inner.on_backend_state(generation, &params, state);
    }
}
