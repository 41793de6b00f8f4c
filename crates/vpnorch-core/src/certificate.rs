//! Certificate Repository
//!
//! Per-session client certificates for local agent authentication.
//!
//! A session owns one key pair and at most one issued certificate. The
//! certificate is fetched on demand, refreshed at `refresh_at` by a timer,
//! when the app comes to the foreground past that time, and after plan
//! changes. Concurrent fetches for the same session share one API call.
//!
//! # Usage
//!
//! ```rust,ignore
//! let repository = CertificateRepository::new(storage, api, clock, config.certificate);
//! match repository.get_certificate(&session_id, false).await {
//!     CertificateResult::Success { certificate_pem, private_key_pem } => { /* connect agent */ }
//!     CertificateResult::Error(e) => warn!("No certificate: {:?}", e),
//! }
//! ```

use crate::api::{ApiError, CertificateRequest, VpnApi};
use crate::config::CertificateConfig;
use crate::keys::{CertKeyPair, KeyError};
use crate::platform::Clock;
use crate::storage::CertificateStorage;
use crate::user::{CurrentUser, InfoChange, SessionId};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

/// Stored key pair and certificate of a session
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct CertInfo {
    pub private_key_pem: String,
    pub public_key_pem: String,
    pub x25519_base64: String,
    /// Epoch ms
    pub expires_at: i64,
    /// Epoch ms
    pub refresh_at: i64,
    pub certificate_pem: Option<String>,
    /// Failed refreshes since the last success
    pub refresh_count: u32,
}

impl CertInfo {
    fn from_keys(keys: &CertKeyPair) -> Result<Self, KeyError> {
        Ok(Self {
            private_key_pem: keys.private_key_pem()?,
            public_key_pem: keys.public_key_pem()?,
            x25519_base64: keys.x25519_base64(),
            expires_at: 0,
            refresh_at: 0,
            certificate_pem: None,
            refresh_count: 0,
        })
    }

    pub fn is_valid(&self, now_ms: i64) -> bool {
        self.certificate_pem.is_some() && self.expires_at > now_ms
    }

    fn result(&self) -> Option<CertificateResult> {
        self.certificate_pem
            .as_ref()
            .map(|certificate_pem| CertificateResult::Success {
                certificate_pem: certificate_pem.clone(),
                private_key_pem: self.private_key_pem.clone(),
            })
    }
}

impl fmt::Debug for CertInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertInfo")
            .field("expires_at", &self.expires_at)
            .field("refresh_at", &self.refresh_at)
            .field("has_certificate", &self.certificate_pem.is_some())
            .field("refresh_count", &self.refresh_count)
            .finish()
    }
}

/// Outcome of a certificate request
#[derive(Clone, PartialEq)]
pub enum CertificateResult {
    Success {
        certificate_pem: String,
        private_key_pem: String,
    },
    Error(Option<ApiError>),
}

impl CertificateResult {
    pub fn is_success(&self) -> bool {
        matches!(self, CertificateResult::Success { .. })
    }

    pub fn certificate_pem(&self) -> Option<&str> {
        match self {
            CertificateResult::Success { certificate_pem, .. } => Some(certificate_pem),
            CertificateResult::Error(_) => None,
        }
    }
}

impl fmt::Debug for CertificateResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertificateResult::Success { .. } => write!(f, "Success([redacted])"),
            CertificateResult::Error(e) => write!(f, "Error({:?})", e),
        }
    }
}

/// A certificate was issued for a session
#[derive(Debug, Clone, PartialEq)]
pub struct CertificateUpdate {
    pub session_id: SessionId,
    pub certificate_pem: String,
}

/// Delay until the next proactive refresh.
///
/// After a success the refresh happens at `refresh_at`. After a failure
/// a server-provided retry-after wins; otherwise the retry lands halfway
/// to expiry (at least `min_refresh_delay`) until the retry budget is spent.
pub fn next_refresh_delay(
    config: &CertificateConfig,
    info: &CertInfo,
    now_ms: i64,
    failure: Option<&ApiError>,
) -> Duration {
    let Some(error) = failure else {
        return Duration::from_millis((info.refresh_at - now_ms).max(0) as u64);
    };

    if let Some(retry_after) = error.retry_after() {
        return retry_after;
    }
    if info.refresh_count < config.max_refresh_retries {
        let halfway = (now_ms + info.expires_at) / 2 - now_ms;
        Duration::from_millis(halfway.max(0) as u64).max(config.min_refresh_delay())
    } else {
        config.fallback_refresh_delay()
    }
}

type SharedFetch = Shared<BoxFuture<'static, CertificateResult>>;

struct InFlight {
    id: u64,
    abort: AbortHandle,
    result: SharedFetch,
}

/// Per-session refresh timers
#[derive(Default)]
pub struct CertRefreshScheduler {
    timers: Mutex<HashMap<SessionId, JoinHandle<()>>>,
}

impl CertRefreshScheduler {
    /// Run `task` after `delay`, replacing the session's pending timer
    pub fn schedule<F>(&self, session_id: &str, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!("Certificate refresh for session scheduled in {:?}", delay);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        if let Ok(mut timers) = self.timers.lock() {
            if let Some(old) = timers.insert(session_id.to_string(), timer) {
                old.abort();
            }
        }
    }

    pub fn cancel(&self, session_id: &str) {
        if let Ok(mut timers) = self.timers.lock() {
            if let Some(timer) = timers.remove(session_id) {
                timer.abort();
            }
        }
    }

    pub fn is_scheduled(&self, session_id: &str) -> bool {
        self.timers
            .lock()
            .map(|timers| timers.get(session_id).is_some_and(|t| !t.is_finished()))
            .unwrap_or(false)
    }
}

impl Drop for CertRefreshScheduler {
    fn drop(&mut self) {
        if let Ok(timers) = self.timers.get_mut() {
            for timer in timers.values() {
                timer.abort();
            }
        }
    }
}

struct Inner {
    storage: CertificateStorage,
    api: Arc<dyn VpnApi>,
    clock: Arc<dyn Clock>,
    config: CertificateConfig,
    /// Serializes read-modify-write of stored entries
    storage_lock: tokio::sync::Mutex<()>,
    in_flight: Mutex<HashMap<SessionId, InFlight>>,
    next_fetch_id: AtomicU64,
    updates: broadcast::Sender<CertificateUpdate>,
    scheduler: CertRefreshScheduler,
}

/// Certificate repository handle
#[derive(Clone)]
pub struct CertificateRepository {
    inner: Arc<Inner>,
}

impl CertificateRepository {
    pub fn new(
        storage: CertificateStorage,
        api: Arc<dyn VpnApi>,
        clock: Arc<dyn Clock>,
        config: CertificateConfig,
    ) -> Self {
        let (updates, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                storage,
                api,
                clock,
                config,
                storage_lock: tokio::sync::Mutex::new(()),
                in_flight: Mutex::new(HashMap::new()),
                next_fetch_id: AtomicU64::new(0),
                updates,
                scheduler: CertRefreshScheduler::default(),
            }),
        }
    }

    /// Newly issued certificates
    pub fn subscribe_updates(&self) -> broadcast::Receiver<CertificateUpdate> {
        self.inner.updates.subscribe()
    }

    /// Stored certificate if still valid, otherwise a fetched one
    pub async fn get_certificate(&self, session_id: &str, force_refresh: bool) -> CertificateResult {
        if !force_refresh {
            match self.inner.cert_info(session_id).await {
                Ok(info) if info.is_valid(self.inner.clock.now_ms()) => {
                    if let Some(result) = info.result() {
                        return result;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Certificate keys unavailable: {}", e);
                    return CertificateResult::Error(None);
                }
            }
        }
        self.fetch_or_join(session_id, false, !force_refresh).await
    }

    /// Stored certificate without any network access
    pub async fn get_certificate_without_refresh(&self, session_id: &str) -> Option<CertificateResult> {
        let _lock = self.inner.storage_lock.lock().await;
        self.inner.storage.get(session_id)?.result()
    }

    /// Fetch a new certificate for the current key.
    ///
    /// Joins a fetch already running for the session unless
    /// `cancel_ongoing` is set, in which case that fetch is abandoned.
    pub async fn update_certificate(&self, session_id: &str, cancel_ongoing: bool) -> CertificateResult {
        self.fetch_or_join(session_id, cancel_ongoing, false).await
    }

    /// With `reuse_valid` a certificate stored by a fetch that completed
    /// since the caller last looked is returned instead of fetching again.
    async fn fetch_or_join(&self, session_id: &str, cancel_ongoing: bool, reuse_valid: bool) -> CertificateResult {
        let (id, fetch) = {
            let Ok(mut in_flight) = self.inner.in_flight.lock() else {
                return CertificateResult::Error(None);
            };
            if reuse_valid && !in_flight.contains_key(session_id) {
                if let Some(result) = self.inner.valid_stored(session_id) {
                    return result;
                }
            }
            if cancel_ongoing {
                if let Some(old) = in_flight.remove(session_id) {
                    old.abort.abort();
                }
            }
            match in_flight.get(session_id) {
                Some(ongoing) => (ongoing.id, ongoing.result.clone()),
                None => {
                    let id = self.inner.next_fetch_id.fetch_add(1, Ordering::Relaxed);
                    let inner = self.inner.clone();
                    let session = session_id.to_string();
                    let task = tokio::spawn(async move { inner.fetch(&session).await });
                    let abort = task.abort_handle();
                    let result = async move { task.await.unwrap_or(CertificateResult::Error(None)) }
                        .boxed()
                        .shared();
                    in_flight.insert(
                        session_id.to_string(),
                        InFlight { id, abort, result: result.clone() },
                    );
                    (id, result)
                }
            }
        };

        let result = fetch.await;
        if let Ok(mut in_flight) = self.inner.in_flight.lock() {
            if in_flight.get(session_id).is_some_and(|f| f.id == id) {
                in_flight.remove(session_id);
            }
        }
        result
    }

    /// Replace the session's key pair; the old certificate is dropped too
    pub async fn generate_new_key(&self, session_id: &str) {
        info!("Generating new certificate key");
        self.inner.cancel_fetch(session_id);
        self.inner.scheduler.cancel(session_id);

        let _lock = self.inner.storage_lock.lock().await;
        match CertInfo::from_keys(&CertKeyPair::generate()) {
            Ok(info) => {
                if let Err(e) = self.inner.storage.put(session_id, &info) {
                    warn!("Failed to store new certificate key: {}", e);
                }
            }
            Err(e) => warn!("Failed to encode new certificate key: {}", e),
        }
    }

    /// Forget everything stored for the session
    pub async fn clear(&self, session_id: &str) {
        self.inner.cancel_fetch(session_id);
        self.inner.scheduler.cancel(session_id);
        let _lock = self.inner.storage_lock.lock().await;
        if let Err(e) = self.inner.storage.remove(session_id) {
            warn!("Failed to clear certificate: {}", e);
        }
    }

    /// Drop the certificate but keep the key pair
    pub async fn clear_cert(&self, session_id: &str) {
        let _lock = self.inner.storage_lock.lock().await;
        if let Some(mut info) = self.inner.storage.get(session_id) {
            info.certificate_pem = None;
            info.expires_at = 0;
            info.refresh_at = 0;
            info.refresh_count = 0;
            if let Err(e) = self.inner.storage.put(session_id, &info) {
                warn!("Failed to clear certificate: {}", e);
            }
        }
    }

    /// App came to the foreground
    pub async fn on_app_in_use(&self, session_id: &str) {
        let due = {
            let _lock = self.inner.storage_lock.lock().await;
            match self.inner.storage.get(session_id) {
                Some(info) => info.certificate_pem.is_none() || info.refresh_at <= self.inner.clock.now_ms(),
                None => true,
            }
        };
        if due {
            debug!("Certificate refresh due on app use");
            self.update_certificate(session_id, false).await;
        }
    }

    /// Plan changed: the old certificate no longer matches the account
    pub async fn on_plan_change(&self, session_id: &str) {
        info!("Plan changed, refreshing certificate");
        self.clear_cert(session_id).await;
        self.update_certificate(session_id, true).await;
    }

    pub fn is_refresh_scheduled(&self, session_id: &str) -> bool {
        self.inner.scheduler.is_scheduled(session_id)
    }

    /// Drive refreshes from plan changes and app foreground transitions
    pub fn spawn_refresh_triggers(
        &self,
        user: Arc<dyn CurrentUser>,
        mut plan_changes: broadcast::Receiver<Vec<InfoChange>>,
        mut app_in_use: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                let plan_changed = tokio::select! {
                    changes = plan_changes.recv() => match changes {
                        Ok(changes) => changes.iter().any(|c| {
                            matches!(c, InfoChange::PlanChange { .. } | InfoChange::UserBecameDelinquent)
                        }),
                        Err(broadcast::error::RecvError::Lagged(_)) => true,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    changed = app_in_use.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if !*app_in_use.borrow_and_update() {
                            continue;
                        }
                        false
                    }
                };

                let Some(inner) = weak.upgrade() else { break };
                let Some(session_id) = user.session_id().await else { continue };
                let repository = CertificateRepository { inner };
                if plan_changed {
                    repository.on_plan_change(&session_id).await;
                } else {
                    repository.on_app_in_use(&session_id).await;
                }
            }
        })
    }
}

impl Inner {
    /// Stored entry, created with fresh keys when missing
    async fn cert_info(&self, session_id: &str) -> Result<CertInfo, KeyError> {
        let _lock = self.storage_lock.lock().await;
        if let Some(info) = self.storage.get(session_id) {
            return Ok(info);
        }
        let info = CertInfo::from_keys(&CertKeyPair::generate())?;
        if let Err(e) = self.storage.put(session_id, &info) {
            warn!("Failed to store certificate key: {}", e);
        }
        Ok(info)
    }

    fn valid_stored(&self, session_id: &str) -> Option<CertificateResult> {
        let info = self.storage.get(session_id)?;
        if !info.is_valid(self.clock.now_ms()) {
            return None;
        }
        info.result()
    }

    fn cancel_fetch(&self, session_id: &str) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            if let Some(ongoing) = in_flight.remove(session_id) {
                ongoing.abort.abort();
            }
        }
    }

    async fn fetch(self: Arc<Self>, session_id: &str) -> CertificateResult {
        let info = match self.cert_info(session_id).await {
            Ok(info) => info,
            Err(e) => {
                warn!("Certificate keys unavailable: {}", e);
                return CertificateResult::Error(None);
            }
        };

        debug!("Requesting certificate");
        let request = CertificateRequest::new(info.public_key_pem.clone());
        let response = self.api.get_certificate(session_id, &request).await;
        let now = self.clock.now_ms();

        let _lock = self.storage_lock.lock().await;
        match response {
            Ok(response) => {
                let updated = CertInfo {
                    certificate_pem: Some(response.certificate.clone()),
                    expires_at: response.expiration_time * 1000,
                    refresh_at: response.refresh_time * 1000,
                    refresh_count: 0,
                    ..info
                };
                if let Err(e) = self.storage.put(session_id, &updated) {
                    warn!("Failed to store certificate: {}", e);
                }
                self.schedule_refresh(session_id, next_refresh_delay(&self.config, &updated, now, None));
                let _ = self.updates.send(CertificateUpdate {
                    session_id: session_id.to_string(),
                    certificate_pem: response.certificate.clone(),
                });
                info!("Certificate updated");
                CertificateResult::Success {
                    certificate_pem: response.certificate,
                    private_key_pem: updated.private_key_pem,
                }
            }
            Err(e) => {
                warn!("Certificate request failed: {}", e);
                let delay = next_refresh_delay(&self.config, &info, now, Some(&e));
                let updated = CertInfo {
                    refresh_count: info.refresh_count + 1,
                    ..info
                };
                if let Err(e) = self.storage.put(session_id, &updated) {
                    warn!("Failed to store certificate retry state: {}", e);
                }
                self.schedule_refresh(session_id, delay);
                CertificateResult::Error(Some(e))
            }
        }
    }

    fn schedule_refresh(self: &Arc<Self>, session_id: &str, delay: Duration) {
        let weak: Weak<Inner> = Arc::downgrade(self);
        let session = session_id.to_string();
        self.scheduler.schedule(session_id, delay, async move {
            if let Some(inner) = weak.upgrade() {
                CertificateRepository { inner }.update_certificate(&session, false).await;
            }
        });
    }
}
