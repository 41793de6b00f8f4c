//! Platform seams: clocks, wake locks and network status

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tracing::debug;

/// Wall-clock time source
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch
    fn now_ms(&self) -> i64;
}

/// System time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Manually driven clock
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self { now: AtomicI64::new(now_ms) }
    }

    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Keep-CPU-awake primitive
pub trait WakeLock: Send + Sync {
    fn acquire(&self, tag: &'static str, max_hold: Duration);
    fn release(&self, tag: &'static str);
}

/// No-op wake lock for platforms without one
#[derive(Debug, Default)]
pub struct NoWakeLock;

impl WakeLock for NoWakeLock {
    fn acquire(&self, _tag: &'static str, _max_hold: Duration) {}
    fn release(&self, _tag: &'static str) {}
}

/// Holds a wake lock until dropped
pub struct WakeLockGuard {
    lock: Arc<dyn WakeLock>,
    tag: &'static str,
}

impl WakeLockGuard {
    pub fn acquire(lock: Arc<dyn WakeLock>, tag: &'static str, max_hold: Duration) -> Self {
        debug!("Wake lock {} acquired", tag);
        lock.acquire(tag, max_hold);
        Self { lock, tag }
    }
}

impl Drop for WakeLockGuard {
    fn drop(&mut self) {
        debug!("Wake lock {} released", self.tag);
        self.lock.release(self.tag);
    }
}

/// Network availability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Disconnected,
    Unmetered,
    Metered,
}

impl NetworkStatus {
    pub fn is_connected(&self) -> bool {
        !matches!(self, NetworkStatus::Disconnected)
    }
}

/// Observable network status
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    tx: Arc<watch::Sender<NetworkStatus>>,
}

impl NetworkMonitor {
    pub fn new(initial: NetworkStatus) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn status(&self) -> NetworkStatus {
        *self.tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    /// Report a new status; observers are woken only on change
    pub fn update(&self, status: NetworkStatus) {
        self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.tx.subscribe()
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(NetworkStatus::Unmetered)
    }
}
