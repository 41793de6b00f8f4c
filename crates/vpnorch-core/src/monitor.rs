//! VPN State Monitor
//!
//! Single source of truth for the connection status seen by the rest of
//! the application. Only the connection manager writes to it.

use crate::error_handler::VpnFallbackResult;
use crate::intent::AnyConnectIntent;
use crate::server::ConnectionParams;
use crate::state::VpnState;
use crate::storage::KeyValueStore;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

/// Key the last state name is persisted under
pub const STATE_NAME_KEY: &str = "VpnStateMonitor.VPN_STATE_NAME";

/// Observable connection status
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub state: VpnState,
    pub connection_params: Option<ConnectionParams>,
    pub connection_intent: Option<AnyConnectIntent>,
}

impl Status {
    pub fn disabled() -> Self {
        Self {
            state: VpnState::Disabled,
            connection_params: None,
            connection_intent: None,
        }
    }
}

/// A state change with the status it replaced
#[derive(Debug, Clone, PartialEq)]
pub struct StatusTransition {
    pub previous: Status,
    pub current: Status,
}

pub struct VpnStateMonitor {
    status: watch::Sender<Status>,
    transitions: broadcast::Sender<StatusTransition>,
    notifications: broadcast::Sender<VpnFallbackResult>,
    disconnected_by_user: broadcast::Sender<()>,
    store: Option<Arc<dyn KeyValueStore>>,
}

impl VpnStateMonitor {
    pub fn new() -> Self {
        let (status, _) = watch::channel(Status::disabled());
        let (transitions, _) = broadcast::channel(64);
        let (notifications, _) = broadcast::channel(16);
        let (disconnected_by_user, _) = broadcast::channel(4);
        Self {
            status,
            transitions,
            notifications,
            disconnected_by_user,
            store: None,
        }
    }

    /// Persist the state name on every change
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> VpnState {
        self.status.borrow().state
    }

    pub fn connection_params(&self) -> Option<ConnectionParams> {
        self.status.borrow().connection_params.clone()
    }

    pub fn connection_intent(&self) -> Option<AnyConnectIntent> {
        self.status.borrow().connection_intent.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<StatusTransition> {
        self.transitions.subscribe()
    }

    /// Fallbacks and errors the user should be told about
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<VpnFallbackResult> {
        self.notifications.subscribe()
    }

    pub fn subscribe_disconnected_by_user(&self) -> broadcast::Receiver<()> {
        self.disconnected_by_user.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn is_disabled(&self) -> bool {
        self.state() == VpnState::Disabled
    }

    pub fn is_establishing_or_connected(&self) -> bool {
        let state = self.state();
        state.is_connected() || state.is_establishing_connection()
    }

    /// State name saved by a previous process, if any
    pub fn persisted_state_name(&self) -> Option<String> {
        self.store.as_ref()?.get(STATE_NAME_KEY)
    }

    /// Publish a new status; identical statuses are dropped
    pub(crate) fn update_status(&self, status: Status) {
        let previous = self.status.borrow().clone();
        if previous == status {
            return;
        }
        debug!("VPN state: {} -> {}", previous.state, status.state);

        if previous.state.name() != status.state.name() {
            if let Some(store) = &self.store {
                if let Err(e) = store.put(STATE_NAME_KEY, status.state.name()) {
                    warn!("Failed to persist VPN state: {}", e);
                }
            }
        }

        self.status.send_replace(status.clone());
        let _ = self.transitions.send(StatusTransition {
            previous,
            current: status,
        });
    }

    pub(crate) fn notify(&self, notification: VpnFallbackResult) {
        let _ = self.notifications.send(notification);
    }

    pub(crate) fn on_disconnected_by_user(&self) {
        let _ = self.disconnected_by_user.send(());
    }
}

impl Default for VpnStateMonitor {
    fn default() -> Self {
        Self::new()
    }
}
