//! Guest Hole
//!
//! A temporary tunnel that lets API calls through when the API is blocked
//! and no real connection is up. Users of the tunnel hold a
//! [`GuestHoleLease`]; the tunnel is closed once the last lease is gone
//! and the close timeout passes without a new one.
//!
//! # Usage
//!
//! ```rust,ignore
//! let guest_hole = GuestHole::new(manager, server_manager, store, servers, config.guest_hole.clone());
//!
//! let response = guest_hole
//!     .run_with_guest_hole_fallback(|scope| async move {
//!         match api.get_session().await {
//!             Err(ApiError::Connection) if scope.on_proxies_failed().await => api.get_session().await,
//!             other => other,
//!         }
//!     })
//!     .await;
//! ```

use crate::config::GuestHoleConfig;
use crate::delegate::GuestHoleUiDelegate;
use crate::intent::AnyConnectIntent;
use crate::manager::VpnConnectionManager;
use crate::server::{Server, ServerManager};
use crate::storage::KeyValueStore;
use crate::telemetry::ConnectTrigger;
use rand::seq::SliceRandom;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Key the id of the last working guest hole server is kept under
pub const LAST_SERVER_KEY: &str = "GuestHole.LAST_SERVER";

#[derive(Default)]
struct LockState {
    count: usize,
    close_task: Option<JoinHandle<()>>,
}

struct Inner {
    manager: VpnConnectionManager,
    server_manager: Arc<dyn ServerManager>,
    store: Arc<dyn KeyValueStore>,
    servers: Vec<Server>,
    config: GuestHoleConfig,
    /// Serializes tunnel setup between concurrent callers
    establish: tokio::sync::Mutex<()>,
    lock: Mutex<LockState>,
}

/// Guest hole handle
#[derive(Clone)]
pub struct GuestHole {
    inner: Arc<Inner>,
}

impl GuestHole {
    pub fn new(
        manager: VpnConnectionManager,
        server_manager: Arc<dyn ServerManager>,
        store: Arc<dyn KeyValueStore>,
        servers: Vec<Server>,
        config: GuestHoleConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                manager,
                server_manager,
                store,
                servers,
                config,
                establish: tokio::sync::Mutex::new(()),
                lock: Mutex::new(LockState::default()),
            }),
        }
    }

    /// Outstanding leases
    pub fn lease_count(&self) -> usize {
        self.inner.lock().count
    }

    /// Keep the tunnel open until the lease is dropped.
    ///
    /// Cancels a pending close.
    pub fn acquire_need_guest_hole(&self) -> GuestHoleLease {
        let mut lock = self.inner.lock();
        lock.count += 1;
        if let Some(task) = lock.close_task.take() {
            task.abort();
            debug!("Guest hole close cancelled");
        }
        GuestHoleLease {
            inner: Some(self.inner.clone()),
        }
    }

    /// Run `block` with the API unblocked.
    ///
    /// A real connection is left alone. Returns `None` when no guest hole
    /// server could be reached, in which case `block` is not run.
    pub async fn on_alternatives_unblock<F, Fut, T>(&self, block: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if self.has_real_connection() {
            debug!("Real connection in place, no guest hole needed");
            return Some(block().await);
        }
        let _lease = self.acquire_need_guest_hole();
        if !self.ensure_tunnel().await {
            return None;
        }
        Some(block().await)
    }

    /// Run `block`, engaging the guest hole if it reports the API blocked.
    ///
    /// The lease taken by [`GuestHoleScope::on_proxies_failed`] is released
    /// when `block` finishes, fails or is dropped.
    pub async fn run_with_guest_hole_fallback<F, Fut, T>(&self, block: F) -> T
    where
        F: FnOnce(GuestHoleScope) -> Fut,
        Fut: Future<Output = T>,
    {
        let lease = Arc::new(Mutex::new(None));
        let _release = ScopeRelease(lease.clone());
        block(GuestHoleScope {
            guest_hole: self.clone(),
            lease,
        })
        .await
    }

    fn has_real_connection(&self) -> bool {
        let monitor = self.inner.manager.monitor();
        let intent = monitor.connection_intent();
        monitor.is_establishing_or_connected() && !intent.is_some_and(|intent| intent.is_guest_hole())
    }

    /// Connect a guest hole server unless one is already up
    async fn ensure_tunnel(&self) -> bool {
        let _establish = self.inner.establish.lock().await;
        let monitor = self.inner.manager.monitor();
        if monitor.is_connected() {
            return true;
        }

        let candidates = self.candidates();
        if candidates.is_empty() {
            warn!("No guest hole servers");
            return false;
        }
        self.inner.server_manager.set_guest_hole_servers(candidates.clone()).await;

        let attempt = async {
            for server in &candidates {
                if self.connect_to(server).await {
                    return Some(server);
                }
            }
            None
        };
        match tokio::time::timeout(self.inner.config.attempt_timeout(), attempt).await {
            Ok(Some(server)) => {
                info!("Guest hole established through {}", server);
                if let Err(e) = self.inner.store.put(LAST_SERVER_KEY, &server.server_id) {
                    warn!("Failed to remember guest hole server: {}", e);
                }
                tokio::time::sleep(self.inner.config.settle()).await;
                true
            }
            Ok(None) => {
                info!("No guest hole server reachable");
                false
            }
            Err(_) => {
                info!("Guest hole attempt timed out");
                false
            }
        }
    }

    async fn connect_to(&self, server: &Server) -> bool {
        debug!("Trying guest hole server {}", server);
        let intent = AnyConnectIntent::GuestHole {
            server_id: server.server_id.clone(),
        };
        let connected = async {
            self.inner
                .manager
                .connect(Arc::new(GuestHoleUiDelegate), intent, ConnectTrigger::GuestHole)
                .await;
            let mut status = self.inner.manager.monitor().subscribe();
            status
                .wait_for(|s| s.state.is_connected() || !s.state.is_establishing_connection())
                .await
                .is_ok_and(|s| s.state.is_connected())
        };
        tokio::time::timeout(self.inner.config.server_timeout(), connected)
            .await
            .unwrap_or(false)
    }

    /// The last working server first, then a random pick of the rest
    fn candidates(&self) -> Vec<Server> {
        let last = self.inner.store.get(LAST_SERVER_KEY);
        let mut rest: Vec<Server> = self
            .inner
            .servers
            .iter()
            .filter(|s| last.as_deref() != Some(s.server_id.as_str()))
            .cloned()
            .collect();
        rest.shuffle(&mut rand::thread_rng());

        let mut candidates: Vec<Server> = self
            .inner
            .servers
            .iter()
            .filter(|s| last.as_deref() == Some(s.server_id.as_str()))
            .cloned()
            .collect();
        candidates.extend(rest);
        candidates.truncate(self.inner.config.server_count);
        candidates
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, LockState> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release_need_guest_hole(self: &Arc<Self>) {
        let mut lock = self.lock();
        lock.count = lock.count.saturating_sub(1);
        if lock.count > 0 {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Guest hole released outside a runtime, not closing");
            return;
        };
        let weak = Arc::downgrade(self);
        let close_timeout = self.config.close_timeout();
        lock.close_task = Some(runtime.spawn(async move {
            tokio::time::sleep(close_timeout).await;
            let Some(inner) = weak.upgrade() else { return };
            // A lease taken once the close is committed waits here in
            // ensure_tunnel and reconnects after the disconnect
            let _establish = inner.establish.lock().await;
            {
                let mut lock = inner.lock();
                if lock.count > 0 {
                    return;
                }
                lock.close_task = None;
            }
            if inner.manager.disconnect_guest_hole().await {
                info!("Guest hole closed");
            }
        }));
    }
}

/// Keeps the guest hole open while alive
#[must_use = "the guest hole is released when the lease is dropped"]
pub struct GuestHoleLease {
    inner: Option<Arc<Inner>>,
}

impl GuestHoleLease {
    pub fn release_need_guest_hole(mut self) {
        if let Some(inner) = self.inner.take() {
            inner.release_need_guest_hole();
        }
    }
}

impl Drop for GuestHoleLease {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.release_need_guest_hole();
        }
    }
}

/// Handed to the block of [`GuestHole::run_with_guest_hole_fallback`]
#[derive(Clone)]
pub struct GuestHoleScope {
    guest_hole: GuestHole,
    lease: Arc<Mutex<Option<GuestHoleLease>>>,
}

impl GuestHoleScope {
    /// The regular API path is blocked.
    ///
    /// Engages the guest hole for the rest of the scope and returns whether
    /// the API is now reachable. Repeated calls reuse the first lease.
    pub async fn on_proxies_failed(&self) -> bool {
        if self.guest_hole.has_real_connection() {
            return true;
        }
        {
            let mut lease = self.lease.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if lease.is_none() {
                *lease = Some(self.guest_hole.acquire_need_guest_hole());
            }
        }
        self.guest_hole.ensure_tunnel().await
    }
}

struct ScopeRelease(Arc<Mutex<Option<GuestHoleLease>>>);

impl Drop for ScopeRelease {
    fn drop(&mut self) {
        let lease = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
        drop(lease);
    }
}
