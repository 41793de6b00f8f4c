//! Connection telemetry sink

use crate::server::ConnectionParams;
use std::collections::BTreeMap;
use tracing::debug;

/// Why a connection attempt started
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectTrigger {
    User,
    QuickConnect,
    Auto(String),
    Reconnect,
    Fallback(String),
    GuestHole,
}

/// Why a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectTrigger {
    UserAction,
    NewConnection,
    Reconnect(String),
    ServiceDestroyed,
    Fallback,
    GuestHole,
    Error(String),
    Test,
}

/// Fire-and-forget telemetry. Implementations must not block.
pub trait VpnConnectionTelemetry: Send + Sync {
    fn on_connection_start(&self, trigger: &ConnectTrigger);

    fn on_connection_abort(&self, reason: &str, is_failure: bool);

    fn on_disconnection_trigger(&self, trigger: &DisconnectTrigger, previous: Option<&ConnectionParams>);

    fn event(&self, group: &str, name: &str, value: i64, dimensions: &BTreeMap<String, String>);
}

/// Telemetry that only logs
#[derive(Debug, Default)]
pub struct LogTelemetry;

impl VpnConnectionTelemetry for LogTelemetry {
    fn on_connection_start(&self, trigger: &ConnectTrigger) {
        debug!("telemetry: connection start ({:?})", trigger);
    }

    fn on_connection_abort(&self, reason: &str, is_failure: bool) {
        debug!("telemetry: connection abort ({}, failure: {})", reason, is_failure);
    }

    fn on_disconnection_trigger(&self, trigger: &DisconnectTrigger, previous: Option<&ConnectionParams>) {
        match previous {
            Some(params) => debug!("telemetry: disconnect {:?} from {}", trigger, params),
            None => debug!("telemetry: disconnect {:?}", trigger),
        }
    }

    fn event(&self, group: &str, name: &str, value: i64, dimensions: &BTreeMap<String, String>) {
        debug!("telemetry: {}.{} = {} {:?}", group, name, value, dimensions);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::ConnectIntent;
    use crate::state::VpnState;
    use crate::test_support::{FakeDelegate, TestHarness, test_server};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_unusable_server_reports_failed_abort() {
        let harness = TestHarness::new();
        let mut ch1 = test_server("CH#1", "CH");
        ch1.domains[0].status = 0;
        harness.servers.set_servers(vec![ch1]);
        let manager = harness.manager();
        let delegate = Arc::new(FakeDelegate::default());

        manager
            .connect(delegate.clone(), ConnectIntent::server("CH#1", "CH").into(), ConnectTrigger::User)
            .await;

        assert_eq!(harness.telemetry.starts(), vec![ConnectTrigger::User]);
        assert_eq!(harness.telemetry.aborts(), vec![("protocol not supported".to_string(), true)]);
        // Nothing was active, so nothing was replaced
        assert!(harness.telemetry.disconnects().is_empty());
        assert_eq!(delegate.protocol_not_supported(), 1);
        assert_eq!(harness.monitor.state(), VpnState::Disabled);
    }

    #[test]
    fn test_log_telemetry_accepts_missing_params() {
        let telemetry = LogTelemetry;
        telemetry.on_connection_abort("permission denied", false);
        telemetry.on_disconnection_trigger(&DisconnectTrigger::UserAction, None);
        telemetry.event("vpn", "connect", 1, &BTreeMap::new());
    }
}
