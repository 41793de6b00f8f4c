//! Connect intents
//!
//! What the user asked to connect to, independent of the server and
//! protocol the connection eventually resolves to.

use crate::server::ProtocolSelection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

/// Logical server identifier
pub type ServerId = String;

/// Features a server may offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ServerFeature {
    P2P,
    Tor,
    Streaming,
}

/// NetShield blocking level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NetShieldProtocol {
    #[default]
    Disabled,
    EnabledMalware,
    EnabledExtended,
}

/// Per-connection settings that take precedence over global ones
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsOverrides {
    pub protocol: Option<ProtocolSelection>,
    pub netshield: Option<NetShieldProtocol>,
    pub randomized_nat: Option<bool>,
    pub lan_connections: Option<bool>,
    pub custom_dns: Option<Vec<IpAddr>>,
}

/// Where the user wants to go
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentTarget {
    Fastest,
    FastestInCountry { country: String },
    FastestInCity { country: String, city: String },
    FastestInState { country: String, state: String },
    SecureCore { entry_country: Option<String>, exit_country: String },
    Gateway { name: String, server_id: Option<ServerId> },
    Server { server_id: ServerId, exit_country: String },
}

/// A user connect request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectIntent {
    pub target: IntentTarget,
    #[serde(default)]
    pub features: BTreeSet<ServerFeature>,
    #[serde(default)]
    pub overrides: Option<SettingsOverrides>,
    /// Set when the intent comes from a saved profile
    #[serde(default)]
    pub profile_id: Option<i64>,
}

impl ConnectIntent {
    pub fn new(target: IntentTarget) -> Self {
        Self {
            target,
            features: BTreeSet::new(),
            overrides: None,
            profile_id: None,
        }
    }

    /// Fastest server, no features
    pub fn fastest() -> Self {
        Self::new(IntentTarget::Fastest)
    }

    pub fn fastest_in_country(country: impl Into<String>) -> Self {
        Self::new(IntentTarget::FastestInCountry { country: country.into() })
    }

    pub fn secure_core(entry_country: Option<String>, exit_country: impl Into<String>) -> Self {
        Self::new(IntentTarget::SecureCore {
            entry_country,
            exit_country: exit_country.into(),
        })
    }

    pub fn server(server_id: impl Into<ServerId>, exit_country: impl Into<String>) -> Self {
        Self::new(IntentTarget::Server {
            server_id: server_id.into(),
            exit_country: exit_country.into(),
        })
    }

    pub fn with_features(mut self, features: impl IntoIterator<Item = ServerFeature>) -> Self {
        self.features = features.into_iter().collect();
        self
    }

    pub fn with_overrides(mut self, overrides: SettingsOverrides) -> Self {
        self.overrides = Some(overrides);
        self
    }

    pub fn is_secure_core(&self) -> bool {
        matches!(self.target, IntentTarget::SecureCore { .. })
    }

    pub fn gateway_name(&self) -> Option<&str> {
        match &self.target {
            IntentTarget::Gateway { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Exit country the intent asks for, if any
    pub fn exit_country(&self) -> Option<&str> {
        match &self.target {
            IntentTarget::FastestInCountry { country }
            | IntentTarget::FastestInCity { country, .. }
            | IntentTarget::FastestInState { country, .. } => Some(country),
            IntentTarget::SecureCore { exit_country, .. }
            | IntentTarget::Server { exit_country, .. } => Some(exit_country),
            IntentTarget::Fastest | IntentTarget::Gateway { .. } => None,
        }
    }
}

impl fmt::Display for ConnectIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            IntentTarget::Fastest => write!(f, "Fastest"),
            IntentTarget::FastestInCountry { country } => write!(f, "Fastest in {}", country),
            IntentTarget::FastestInCity { country, city } => write!(f, "{} ({})", city, country),
            IntentTarget::FastestInState { country, state } => write!(f, "{} ({})", state, country),
            IntentTarget::SecureCore { exit_country, .. } => write!(f, "Secure Core {}", exit_country),
            IntentTarget::Gateway { name, .. } => write!(f, "Gateway {}", name),
            IntentTarget::Server { server_id, .. } => write!(f, "Server {}", server_id),
        }
    }
}

/// A user intent or a guest hole connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnyConnectIntent {
    Regular(ConnectIntent),
    GuestHole { server_id: ServerId },
}

impl AnyConnectIntent {
    pub fn is_guest_hole(&self) -> bool {
        matches!(self, AnyConnectIntent::GuestHole { .. })
    }

    pub fn as_regular(&self) -> Option<&ConnectIntent> {
        match self {
            AnyConnectIntent::Regular(intent) => Some(intent),
            AnyConnectIntent::GuestHole { .. } => None,
        }
    }

    pub fn features(&self) -> BTreeSet<ServerFeature> {
        self.as_regular().map(|i| i.features.clone()).unwrap_or_default()
    }

    pub fn overrides(&self) -> Option<&SettingsOverrides> {
        self.as_regular().and_then(|i| i.overrides.as_ref())
    }
}

impl From<ConnectIntent> for AnyConnectIntent {
    fn from(intent: ConnectIntent) -> Self {
        AnyConnectIntent::Regular(intent)
    }
}

impl fmt::Display for AnyConnectIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnyConnectIntent::Regular(intent) => intent.fmt(f),
            AnyConnectIntent::GuestHole { server_id } => write!(f, "Guest hole {}", server_id),
        }
    }
}
