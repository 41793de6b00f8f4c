//! UI callbacks used during a connect

use crate::intent::AnyConnectIntent;
use async_trait::async_trait;

/// Why a server cannot be used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRestrictedReason {
    Maintenance,
    Upgrade,
    SecureCoreUpgrade,
}

/// Callbacks into whatever started a connect.
///
/// Defaults are the conservative answers: permissions are not granted,
/// restrictions are not handled and access restrictions apply.
#[async_trait]
pub trait VpnUiDelegate: Send + Sync {
    async fn ask_for_permissions(&self, _intent: &AnyConnectIntent) -> bool {
        false
    }

    /// Returns true when the UI handled the restriction itself
    async fn on_server_restricted(&self, _reason: ServerRestrictedReason) -> bool {
        false
    }

    fn on_protocol_not_supported(&self) {}

    fn should_skip_access_restrictions(&self) -> bool {
        false
    }
}

/// Whether the platform still needs to grant VPN permission
pub trait VpnPermissionDelegate: Send + Sync {
    fn needs_permission(&self) -> bool;
}

/// Permission is always in place
#[derive(Debug, Default)]
pub struct PermissionGranted;

impl VpnPermissionDelegate for PermissionGranted {
    fn needs_permission(&self) -> bool {
        false
    }
}

/// Delegate for connects with no UI attached
#[derive(Debug, Default)]
pub struct BackgroundUiDelegate;

#[async_trait]
impl VpnUiDelegate for BackgroundUiDelegate {}

/// Delegate for guest hole connects: restrictions never apply
#[derive(Debug, Default)]
pub struct GuestHoleUiDelegate;

#[async_trait]
impl VpnUiDelegate for GuestHoleUiDelegate {
    fn should_skip_access_restrictions(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::ConnectIntent;
    use crate::server::{TransmissionProtocol, tier};
    use crate::state::VpnState;
    use crate::telemetry::ConnectTrigger;
    use crate::test_support::{TestHarness, test_server, vpn_user, wait_for_status};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_default_answers_are_conservative() {
        let intent: AnyConnectIntent = ConnectIntent::fastest().into();
        let delegate = BackgroundUiDelegate;

        assert!(!delegate.ask_for_permissions(&intent).await);
        assert!(!delegate.on_server_restricted(ServerRestrictedReason::Upgrade).await);
        assert!(!delegate.should_skip_access_restrictions());
        assert!(GuestHoleUiDelegate.should_skip_access_restrictions());
        assert!(!PermissionGranted.needs_permission());
    }

    #[tokio::test]
    async fn test_guest_hole_delegate_bypasses_plan_restrictions() {
        let harness = TestHarness::new();
        let ch1 = test_server("CH#1", "CH");
        harness.servers.set_servers(vec![ch1]);
        harness.wireguard.set_scan_responses([TransmissionProtocol::Udp]);
        harness.user.set_user(Some(vpn_user(tier::FREE)));
        let manager = harness.manager();

        manager
            .connect(
                Arc::new(GuestHoleUiDelegate),
                ConnectIntent::server("CH#1", "CH").into(),
                ConnectTrigger::User,
            )
            .await;

        let status = wait_for_status(&harness.monitor, |s| s.state == VpnState::Connected).await;
        assert_eq!(status.connection_params.unwrap().server.server_id, "CH#1");
        assert!(harness.telemetry.aborts().is_empty());
    }
}
