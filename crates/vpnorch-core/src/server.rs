//! Servers, protocols and connection parameters

use crate::intent::{AnyConnectIntent, ConnectIntent, ServerFeature, ServerId};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use uuid::Uuid;

/// Tunnel protocol family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VpnProtocol {
    WireGuard,
    OpenVpn,
    IKEv2,
    /// Negotiated at connect time
    Smart,
}

/// Transport under a tunnel protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransmissionProtocol {
    Udp,
    Tcp,
    Tls,
}

/// A protocol with an optional transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolSelection {
    pub vpn: VpnProtocol,
    pub transmission: Option<TransmissionProtocol>,
}

impl ProtocolSelection {
    pub const SMART: Self = Self::new(VpnProtocol::Smart, None);
    pub const WIREGUARD_UDP: Self = Self::new(VpnProtocol::WireGuard, Some(TransmissionProtocol::Udp));
    pub const WIREGUARD_TCP: Self = Self::new(VpnProtocol::WireGuard, Some(TransmissionProtocol::Tcp));
    pub const WIREGUARD_TLS: Self = Self::new(VpnProtocol::WireGuard, Some(TransmissionProtocol::Tls));
    pub const OPENVPN_UDP: Self = Self::new(VpnProtocol::OpenVpn, Some(TransmissionProtocol::Udp));
    pub const OPENVPN_TCP: Self = Self::new(VpnProtocol::OpenVpn, Some(TransmissionProtocol::Tcp));
    pub const IKEV2: Self = Self::new(VpnProtocol::IKEv2, None);

    pub const fn new(vpn: VpnProtocol, transmission: Option<TransmissionProtocol>) -> Self {
        Self { vpn, transmission }
    }

    pub fn is_smart(&self) -> bool {
        self.vpn == VpnProtocol::Smart
    }

    /// Key used by the API for per-protocol entry overrides
    pub fn api_key(&self) -> Option<&'static str> {
        use TransmissionProtocol::*;
        match (self.vpn, self.transmission) {
            (VpnProtocol::WireGuard, Some(Udp)) => Some("WireGuardUDP"),
            (VpnProtocol::WireGuard, Some(Tcp)) => Some("WireGuardTCP"),
            (VpnProtocol::WireGuard, Some(Tls)) => Some("WireGuardTLS"),
            (VpnProtocol::OpenVpn, Some(Udp)) => Some("OpenVPNUDP"),
            (VpnProtocol::OpenVpn, Some(Tcp)) => Some("OpenVPNTCP"),
            (VpnProtocol::IKEv2, _) => Some("IKEv2"),
            _ => None,
        }
    }
}

impl Default for ProtocolSelection {
    fn default() -> Self {
        Self::SMART
    }
}

impl fmt::Display for ProtocolSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.transmission {
            Some(t) => write!(f, "{:?}/{:?}", self.vpn, t),
            None => write!(f, "{:?}", self.vpn),
        }
    }
}

/// Entry override for one protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProtocolEntry {
    #[serde(rename = "IPv4")]
    pub ipv4: Option<IpAddr>,
    pub ports: Option<Vec<u16>>,
}

/// An entry point of a logical server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConnectingDomain {
    #[serde(rename = "ID")]
    pub id: String,
    pub entry_domain: String,
    #[serde(rename = "EntryIP")]
    pub entry_ip: IpAddr,
    #[serde(rename = "ExitIP", default)]
    pub exit_ip: Option<IpAddr>,
    /// Absent means every protocol is served on `entry_ip`
    #[serde(rename = "EntryPerProtocol", default)]
    pub entry_per_protocol: Option<BTreeMap<String, ProtocolEntry>>,
    /// 1 = online
    pub status: u8,
    #[serde(rename = "X25519PublicKey", default)]
    pub public_key_x25519: Option<String>,
}

impl ConnectingDomain {
    pub fn is_online(&self) -> bool {
        self.status == 1
    }

    pub fn supports_protocol(&self, protocol: &ProtocolSelection) -> bool {
        if protocol.is_smart() {
            return true;
        }
        match (&self.entry_per_protocol, protocol.api_key()) {
            (None, _) => true,
            (Some(map), Some(key)) => map.contains_key(key),
            (Some(_), None) => false,
        }
    }

    /// Dedicated entry IP for `protocol`, or the default one
    pub fn entry_ip_for(&self, protocol: &ProtocolSelection) -> IpAddr {
        protocol
            .api_key()
            .and_then(|key| self.entry_per_protocol.as_ref()?.get(key))
            .and_then(|entry| entry.ipv4)
            .unwrap_or(self.entry_ip)
    }

    /// Ports advertised for `protocol`, if the domain overrides them
    pub fn ports_for(&self, protocol: &ProtocolSelection) -> Option<&[u16]> {
        protocol
            .api_key()
            .and_then(|key| self.entry_per_protocol.as_ref()?.get(key))
            .and_then(|entry| entry.ports.as_deref())
    }
}

/// A logical server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub server_id: ServerId,
    pub name: String,
    pub entry_country: String,
    pub exit_country: String,
    pub city: Option<String>,
    pub state: Option<String>,
    pub tier: u32,
    #[serde(default)]
    pub features: BTreeSet<ServerFeature>,
    #[serde(default)]
    pub secure_core: bool,
    #[serde(default)]
    pub gateway_name: Option<String>,
    pub is_online: bool,
    /// Load in percent
    pub load: f32,
    pub score: f64,
    pub domains: Vec<ConnectingDomain>,
}

impl Server {
    pub fn is_tor(&self) -> bool {
        self.features.contains(&ServerFeature::Tor)
    }

    pub fn supports_protocol(&self, protocol: &ProtocolSelection) -> bool {
        self.domains.iter().any(|d| d.supports_protocol(protocol))
    }

    pub fn online_domains(&self, protocol: &ProtocolSelection) -> Vec<&ConnectingDomain> {
        self.domains
            .iter()
            .filter(|d| d.is_online() && d.supports_protocol(protocol))
            .collect()
    }

    /// Random online domain for `protocol`
    pub fn random_online_domain(&self, protocol: &ProtocolSelection) -> Option<&ConnectingDomain> {
        self.online_domains(protocol)
            .choose(&mut rand::thread_rng())
            .copied()
    }

    /// Copy of this server restricted to one entry point
    pub fn with_domain(&self, domain: &ConnectingDomain) -> Server {
        Server {
            domains: vec![domain.clone()],
            ..self.clone()
        }
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A server pinned to one of its entry points
#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalServer {
    pub server: Server,
    pub domain: ConnectingDomain,
}

/// Plan tiers
pub mod tier {
    pub const FREE: u32 = 0;
    pub const BASIC: u32 = 1;
    pub const PLUS: u32 = 2;
}

/// VPN account information of the current user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpnUser {
    pub plan_name: String,
    pub max_tier: u32,
    pub max_connect: u32,
    pub is_delinquent: bool,
}

impl VpnUser {
    pub fn is_free(&self) -> bool {
        self.max_tier == tier::FREE
    }

    pub fn is_plus_or_above(&self) -> bool {
        self.max_tier >= tier::PLUS
    }

    pub fn has_access(&self, server: &Server) -> bool {
        !self.is_delinquent && self.max_tier >= server.tier
    }
}

/// Resolved entry point for one protocol
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolInfo {
    pub protocol: ProtocolSelection,
    pub domain: ConnectingDomain,
    pub entry_ip: IpAddr,
    pub port: u16,
}

/// A concrete connection. Every attempt gets a fresh `uuid`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionParams {
    pub uuid: Uuid,
    pub intent: AnyConnectIntent,
    pub server: Server,
    pub domain: ConnectingDomain,
    pub protocol: ProtocolSelection,
    pub entry_ip: IpAddr,
    pub port: u16,
}

impl ConnectionParams {
    pub fn new(intent: AnyConnectIntent, server: Server, info: ProtocolInfo) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            intent,
            server,
            domain: info.domain,
            protocol: info.protocol,
            entry_ip: info.entry_ip,
            port: info.port,
        }
    }

    /// Same target, new identity
    pub fn renewed(&self) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            ..self.clone()
        }
    }

    pub fn has_same_protocol_params(&self, other: &ProtocolInfo) -> bool {
        self.protocol == other.protocol && self.entry_ip == other.entry_ip && self.port == other.port
    }

    pub fn physical_server(&self) -> PhysicalServer {
        PhysicalServer {
            server: self.server.clone(),
            domain: self.domain.clone(),
        }
    }
}

impl fmt::Display for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}:{} {})",
            self.server, self.entry_ip, self.port, self.protocol
        )
    }
}

/// Server selection collaborator
#[async_trait]
pub trait ServerManager: Send + Sync {
    /// Best server for an intent, honoring the user's plan and protocol
    async fn get_best_server_for_intent(
        &self,
        intent: &AnyConnectIntent,
        user: Option<&VpnUser>,
        protocol: &ProtocolSelection,
    ) -> Option<Server>;

    async fn get_server_by_id(&self, server_id: &str) -> Option<Server>;

    /// Online servers the user can reach, optionally within a gateway
    async fn get_online_accessible_servers(
        &self,
        secure_core: bool,
        gateway_name: Option<&str>,
        user: Option<&VpnUser>,
        protocol: &ProtocolSelection,
    ) -> Vec<Server>;

    /// Online servers matching a saved profile's intent up to `max_tier`
    async fn get_online_servers_for_intent(
        &self,
        intent: &ConnectIntent,
        protocol: &ProtocolSelection,
        max_tier: u32,
    ) -> Vec<Server> {
        self.get_online_accessible_servers(intent.is_secure_core(), intent.gateway_name(), None, protocol)
            .await
            .into_iter()
            .filter(|s| s.tier <= max_tier)
            .filter(|s| intent.exit_country().is_none_or(|country| s.exit_country == country))
            .collect()
    }

    /// Default connection used when a plan change invalidates the current one
    async fn default_fallback_intent(&self) -> ConnectIntent {
        ConnectIntent::fastest()
    }

    /// Record a domain status fetched from the API
    async fn update_server_domain_status(&self, domain: &ConnectingDomain);

    /// Servers reachable through the guest hole intent
    async fn set_guest_hole_servers(&self, servers: Vec<Server>);
}

/// Server list refresh collaborator
#[async_trait]
pub trait ServerListUpdater: Send + Sync {
    /// Whether the cached list is too old to pick fallbacks from
    fn needs_update(&self) -> bool {
        false
    }

    async fn update_server_list(&self);
}
