//! Effective settings for a connection

use crate::config::FeatureFlags;
use crate::intent::{AnyConnectIntent, NetShieldProtocol};
use crate::server::{ProtocolSelection, TransmissionProtocol, VpnProtocol};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tokio::sync::watch;

/// Global user settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalUserSettings {
    pub protocol: ProtocolSelection,
    pub netshield: NetShieldProtocol,
    pub randomized_nat: bool,
    pub lan_connections: bool,
    pub custom_dns: Vec<IpAddr>,
}

impl Default for LocalUserSettings {
    fn default() -> Self {
        Self {
            protocol: ProtocolSelection::SMART,
            netshield: NetShieldProtocol::EnabledMalware,
            randomized_nat: true,
            lan_connections: false,
            custom_dns: Vec::new(),
        }
    }
}

/// Merges intent overrides over the live global settings
#[derive(Debug, Clone)]
pub struct SettingsForConnection {
    settings: watch::Receiver<LocalUserSettings>,
    flags: watch::Receiver<FeatureFlags>,
    guest_hole_protocol: ProtocolSelection,
}

impl SettingsForConnection {
    pub fn new(
        settings: watch::Receiver<LocalUserSettings>,
        flags: watch::Receiver<FeatureFlags>,
        guest_hole_protocol: ProtocolSelection,
    ) -> Self {
        Self {
            settings,
            flags,
            guest_hole_protocol,
        }
    }

    pub fn global(&self) -> LocalUserSettings {
        self.settings.borrow().clone()
    }

    /// Global settings changes
    pub fn subscribe(&self) -> watch::Receiver<LocalUserSettings> {
        self.settings.clone()
    }

    /// Settings a connection for `intent` runs with
    pub fn get_for(&self, intent: &AnyConnectIntent) -> LocalUserSettings {
        let mut effective = self.global();

        if intent.is_guest_hole() {
            effective.protocol = self.guest_hole_protocol;
            return effective;
        }

        if let Some(overrides) = intent.overrides() {
            if let Some(protocol) = overrides.protocol {
                effective.protocol = protocol;
            }
            if let Some(netshield) = overrides.netshield {
                effective.netshield = netshield;
            }
            if let Some(nat) = overrides.randomized_nat {
                effective.randomized_nat = nat;
            }
            if let Some(lan) = overrides.lan_connections {
                effective.lan_connections = lan;
            }
            if let Some(dns) = &overrides.custom_dns {
                effective.custom_dns = dns.clone();
            }
        }

        // Stream transports are gated remotely
        let tls_enabled = self.flags.borrow().wireguard_tls_enabled;
        if !tls_enabled
            && effective.protocol.vpn == VpnProtocol::WireGuard
            && matches!(
                effective.protocol.transmission,
                Some(TransmissionProtocol::Tcp | TransmissionProtocol::Tls)
            )
        {
            effective.protocol = ProtocolSelection::SMART;
        }
        effective
    }
}
