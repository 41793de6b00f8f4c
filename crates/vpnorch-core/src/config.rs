//! Core Configuration
//!
//! Tunables of the connection core, loadable from TOML or JSON.
//!
//! # Usage
//!
//! ```rust,ignore
//! let config = CoreConfig::load(Path::new("vpnorch.toml"))?;
//! let ports = config.ports.ports_for(&ProtocolSelection::WIREGUARD_UDP);
//! ```

use crate::server::{ProtocolSelection, TransmissionProtocol, VpnProtocol};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub connection: ConnectionConfig,
    pub unreachable: UnreachableConfig,
    pub certificate: CertificateConfig,
    pub guest_hole: GuestHoleConfig,
    pub ports: PortsConfig,
    pub smart: SmartConfig,
}

impl CoreConfig {
    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from JSON file
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_json(&content)
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load a file, picking the format from its extension, and validate it
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        let config = match ext.as_str() {
            "toml" => Self::from_toml_file(path)?,
            "json" => Self::from_json_file(path)?,
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let u = &self.unreachable;
        if u.base_secs == 0 || u.max_secs < u.base_secs {
            return Err(ConfigError::Invalid("unreachable: need 0 < base <= max".into()));
        }
        if u.multiplier < 1 {
            return Err(ConfigError::Invalid("unreachable: multiplier must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&u.jitter_fraction) {
            return Err(ConfigError::Invalid("unreachable: jitter_fraction must be in [0, 1]".into()));
        }

        if self.smart.protocols.is_empty() {
            return Err(ConfigError::Invalid("smart: protocol list is empty".into()));
        }
        for protocol in &self.smart.protocols {
            if protocol.is_smart() || protocol.transmission.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "smart: {} is not a concrete scannable protocol",
                    protocol
                )));
            }
            if self.ports.ports_for(protocol).is_empty() {
                return Err(ConfigError::Invalid(format!("ports: no ports for {}", protocol)));
            }
        }

        if self.guest_hole.server_count == 0 {
            return Err(ConfigError::Invalid("guest_hole: server_count must be > 0".into()));
        }
        if self.guest_hole.protocol.is_smart() {
            return Err(ConfigError::Invalid("guest_hole: protocol must be explicit".into()));
        }
        Ok(())
    }
}

/// Connection manager and error handler tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Upper bound a connection wake lock is held
    pub wake_lock_max_secs: u64,
    /// Minimum time between two server switches caused by server errors
    pub server_error_cooldown_secs: u64,
    /// How long the original server may keep answering before it is skipped
    pub stuck_duration_secs: u64,
    /// Fallback candidates pinged per decision
    pub fallback_candidates: usize,
    /// Wait for a backend to settle after an agent-initiated disconnect
    pub disconnect_settle_ms: u64,
}

impl ConnectionConfig {
    pub fn wake_lock_max(&self) -> Duration {
        Duration::from_secs(self.wake_lock_max_secs)
    }

    pub fn server_error_cooldown(&self) -> Duration {
        Duration::from_secs(self.server_error_cooldown_secs)
    }

    pub fn stuck_duration(&self) -> Duration {
        Duration::from_secs(self.stuck_duration_secs)
    }

    pub fn disconnect_settle(&self) -> Duration {
        Duration::from_millis(self.disconnect_settle_ms)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            wake_lock_max_secs: 120,
            server_error_cooldown_secs: 120,
            stuck_duration_secs: 60,
            fallback_candidates: 5,
            disconnect_settle_ms: 1000,
        }
    }
}

/// Backoff policy of the local agent unreachable tracker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnreachableConfig {
    pub base_secs: u64,
    pub multiplier: u32,
    /// Jitter upper bound as a fraction of the base interval
    pub jitter_fraction: f64,
    pub max_secs: u64,
}

impl UnreachableConfig {
    pub fn base(&self) -> Duration {
        Duration::from_secs(self.base_secs)
    }

    pub fn max(&self) -> Duration {
        Duration::from_secs(self.max_secs)
    }
}

impl Default for UnreachableConfig {
    fn default() -> Self {
        Self {
            base_secs: 30,
            multiplier: 2,
            jitter_fraction: 0.2,
            max_secs: 30 * 60,
        }
    }
}

/// Certificate refresh policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificateConfig {
    pub min_refresh_delay_secs: u64,
    pub max_refresh_retries: u32,
    pub fallback_refresh_delay_secs: u64,
}

impl CertificateConfig {
    pub fn min_refresh_delay(&self) -> Duration {
        Duration::from_secs(self.min_refresh_delay_secs)
    }

    pub fn fallback_refresh_delay(&self) -> Duration {
        Duration::from_secs(self.fallback_refresh_delay_secs)
    }
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            min_refresh_delay_secs: 30,
            max_refresh_retries: 4,
            fallback_refresh_delay_secs: 12 * 60 * 60,
        }
    }
}

/// Guest hole tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestHoleConfig {
    /// Servers tried per attempt
    pub server_count: usize,
    pub server_timeout_secs: u64,
    pub attempt_timeout_secs: u64,
    /// Debounce before an unused tunnel is closed
    pub close_timeout_ms: u64,
    /// Pause after connecting before the wrapped call runs
    pub settle_ms: u64,
    pub protocol: ProtocolSelection,
}

impl GuestHoleConfig {
    pub fn server_timeout(&self) -> Duration {
        Duration::from_secs(self.server_timeout_secs)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

impl Default for GuestHoleConfig {
    fn default() -> Self {
        Self {
            server_count: 5,
            server_timeout_secs: 10,
            attempt_timeout_secs: 50,
            close_timeout_ms: 10_000,
            settle_ms: 500,
            protocol: ProtocolSelection::OPENVPN_TCP,
        }
    }
}

/// Default ports per protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    pub wireguard_udp: Vec<u16>,
    pub wireguard_tcp: Vec<u16>,
    pub wireguard_tls: Vec<u16>,
    pub openvpn_udp: Vec<u16>,
    pub openvpn_tcp: Vec<u16>,
}

impl PortsConfig {
    /// Ports for a concrete protocol, default port first
    pub fn ports_for(&self, protocol: &ProtocolSelection) -> &[u16] {
        use TransmissionProtocol::*;
        match (protocol.vpn, protocol.transmission) {
            (VpnProtocol::WireGuard, Some(Udp)) => &self.wireguard_udp,
            (VpnProtocol::WireGuard, Some(Tcp)) => &self.wireguard_tcp,
            (VpnProtocol::WireGuard, Some(Tls)) => &self.wireguard_tls,
            (VpnProtocol::OpenVpn, Some(Udp)) => &self.openvpn_udp,
            (VpnProtocol::OpenVpn, Some(Tcp) | Some(Tls)) => &self.openvpn_tcp,
            _ => &[],
        }
    }
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            wireguard_udp: vec![443, 88, 1224, 51820, 500, 4500],
            wireguard_tcp: vec![443],
            wireguard_tls: vec![443],
            openvpn_udp: vec![80, 51820, 4569, 1194, 5060],
            openvpn_tcp: vec![443, 7770, 8443],
        }
    }
}

/// Smart protocol negotiation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmartConfig {
    /// Priority order of scanned protocols
    pub protocols: Vec<ProtocolSelection>,
    /// Ports probed per transport during a connect
    pub ports_per_transport: usize,
    /// Ports probed per transport when pinging fallback candidates
    pub ping_all_ports: usize,
    pub probe_timeout_ms: u64,
}

impl SmartConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Default for SmartConfig {
    fn default() -> Self {
        Self {
            protocols: vec![
                ProtocolSelection::WIREGUARD_UDP,
                ProtocolSelection::WIREGUARD_TCP,
                ProtocolSelection::WIREGUARD_TLS,
                ProtocolSelection::OPENVPN_UDP,
                ProtocolSelection::OPENVPN_TCP,
            ],
            ports_per_transport: 3,
            ping_all_ports: 1,
            probe_timeout_ms: 5000,
        }
    }
}

/// Remote feature switches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    pub wireguard_tls_enabled: bool,
    pub maintenance_tracker_enabled: bool,
    pub ipv6_enabled: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            wireguard_tls_enabled: true,
            maintenance_tracker_enabled: true,
            ipv6_enabled: false,
        }
    }
}
