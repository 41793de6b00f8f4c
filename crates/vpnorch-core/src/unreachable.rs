//! Local agent unreachable tracking
//!
//! Decides whether an unreachable control channel is reported as a plain
//! error or escalated to a server/protocol fallback. Fallbacks back off
//! exponentially with jitter so devices do not all switch at once.

use crate::config::UnreachableConfig;
use crate::platform::Clock;
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// What to do about an unreachable report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreachableAction {
    /// First report after a fresh connect: retry without showing anything
    SilentReconnect,
    /// Report the error and keep trying
    Error,
    /// Switch server or protocol
    Fallback,
}

#[derive(Debug)]
struct TrackerState {
    /// Fallbacks since the last network change
    fallback_count: u32,
    last_fallback_at: Option<i64>,
    interval: Duration,
    silent_reconnect_armed: bool,
    silent_reconnect: bool,
}

pub struct LocalAgentUnreachableTracker {
    clock: Arc<dyn Clock>,
    config: UnreachableConfig,
    state: Mutex<TrackerState>,
}

impl LocalAgentUnreachableTracker {
    pub fn new(clock: Arc<dyn Clock>, config: UnreachableConfig) -> Self {
        let interval = config.base();
        Self {
            clock,
            config,
            state: Mutex::new(TrackerState {
                fallback_count: 0,
                last_fallback_at: None,
                interval,
                silent_reconnect_armed: false,
                silent_reconnect: false,
            }),
        }
    }

    /// Minimum wait before another fallback after `fallback_count` fallbacks
    pub fn min_interval(&self, fallback_count: u32) -> Duration {
        let factor = (self.config.multiplier as u64).saturating_pow(fallback_count);
        let base = self.config.base_secs.saturating_mul(factor);
        Duration::from_secs(base.min(self.config.max_secs).max(self.config.base_secs))
    }

    fn jitter(&self) -> Duration {
        let bound = self.config.base().as_millis() as f64 * self.config.jitter_fraction;
        if bound < 1.0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=bound as u64))
    }

    pub fn on_unreachable(&self) -> UnreachableAction {
        let Ok(mut state) = self.state.lock() else {
            return UnreachableAction::Error;
        };

        if state.silent_reconnect_armed {
            state.silent_reconnect_armed = false;
            state.silent_reconnect = true;
            debug!("Unreachable right after connect, reconnecting silently");
            return UnreachableAction::SilentReconnect;
        }
        state.silent_reconnect = false;

        let now = self.clock.now_ms();
        let elapsed = state
            .last_fallback_at
            .map(|at| Duration::from_millis((now - at).max(0) as u64));
        match elapsed {
            Some(elapsed) if elapsed < state.interval => UnreachableAction::Error,
            _ => UnreachableAction::Fallback,
        }
    }

    /// A fallback was started; the next one waits longer
    pub fn on_fallback_triggered(&self) {
        let Ok(mut state) = self.state.lock() else { return };
        state.fallback_count += 1;
        state.last_fallback_at = Some(self.clock.now_ms());
        state.interval = self.min_interval(state.fallback_count) + self.jitter();
        debug!(
            "Fallback #{} triggered, next one in at least {:?}",
            state.fallback_count, state.interval
        );
    }

    /// Unreachability after a network change says nothing about the server
    pub fn on_network_changed(&self) {
        let Ok(mut state) = self.state.lock() else { return };
        state.fallback_count = 0;
        state.interval = self.config.base();
    }

    /// Called on every fresh connection outcome.
    ///
    /// Only arms or disarms the silent reconnect; the fallback exponent
    /// survives so a flapping server keeps backing off.
    pub fn reset(&self, connected: bool) {
        let Ok(mut state) = self.state.lock() else { return };
        state.silent_reconnect_armed = connected;
        if !connected {
            state.silent_reconnect = false;
        }
    }

    /// Whether a silent reconnect is running
    pub fn is_silent_reconnect(&self) -> bool {
        self.state.lock().map(|s| s.silent_reconnect).unwrap_or(false)
    }

    /// Current minimum time between fallbacks
    pub fn current_interval(&self) -> Duration {
        self.state.lock().map(|s| s.interval).unwrap_or(self.config.base())
    }
}
