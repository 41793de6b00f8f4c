//! Smart Protocol backend provider
//!
//! Picks the backend and entry point a connection uses. An explicit
//! protocol goes straight to its backend. The Smart protocol scans every
//! enabled candidate the server advertises in parallel and takes the
//! first answering one in priority order; when nothing answers it falls
//! back to an unscanned default, since a failed probe does not mean the
//! server is down.

use crate::backend::{PrepareResult, VpnBackend};
use crate::config::{FeatureFlags, SmartConfig};
use crate::intent::AnyConnectIntent;
use crate::server::{ConnectionParams, PhysicalServer, ProtocolSelection, Server, TransmissionProtocol, VpnProtocol};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// A fallback candidate that answered
#[derive(Debug, Clone, PartialEq)]
pub struct PingResult {
    pub physical_server: PhysicalServer,
    pub responses: Vec<PrepareResult>,
}

/// Backend selection
#[async_trait]
pub trait VpnBackendProvider: Send + Sync {
    /// Backend and parameters for `server`, or `None` when no protocol works
    async fn prepare_connection(
        &self,
        protocol: ProtocolSelection,
        intent: &AnyConnectIntent,
        server: &Server,
        always_scan: bool,
    ) -> Option<PrepareResult>;

    /// First server of `preference_list` that answers on `protocol`.
    ///
    /// `full_scan_server` is probed on every port so that its responses
    /// can be compared with the current connection.
    async fn ping_all(
        &self,
        intent: &AnyConnectIntent,
        protocol: ProtocolSelection,
        preference_list: &[PhysicalServer],
        full_scan_server: Option<&PhysicalServer>,
    ) -> Option<PingResult>;

    /// Protocol used without scanning when Smart cannot negotiate
    fn fallback_protocol(&self, server: &Server) -> ProtocolSelection;
}

/// Provider over one backend per protocol family
pub struct SmartProtocolProvider {
    backends: HashMap<VpnProtocol, Arc<dyn VpnBackend>>,
    config: SmartConfig,
    flags: watch::Receiver<FeatureFlags>,
}

impl SmartProtocolProvider {
    pub fn new(
        backends: Vec<Arc<dyn VpnBackend>>,
        config: SmartConfig,
        flags: watch::Receiver<FeatureFlags>,
    ) -> Self {
        let backends = backends.into_iter().map(|b| (b.protocol(), b)).collect();
        Self { backends, config, flags }
    }

    fn tls_enabled(&self) -> bool {
        self.flags.borrow().wireguard_tls_enabled
    }

    fn is_enabled(&self, protocol: &ProtocolSelection) -> bool {
        let stream_transport = matches!(
            protocol.transmission,
            Some(TransmissionProtocol::Tcp | TransmissionProtocol::Tls)
        );
        !(protocol.vpn == VpnProtocol::WireGuard && stream_transport && !self.tls_enabled())
    }

    /// Smart candidates `server` supports, grouped per backend in priority order
    fn smart_candidates(&self, server: &Server) -> Vec<(Arc<dyn VpnBackend>, Vec<TransmissionProtocol>)> {
        let mut grouped: Vec<(Arc<dyn VpnBackend>, Vec<TransmissionProtocol>)> = Vec::new();
        for protocol in &self.config.protocols {
            if !self.is_enabled(protocol) || !server.supports_protocol(protocol) {
                continue;
            }
            let (Some(backend), Some(transmission)) = (self.backends.get(&protocol.vpn), protocol.transmission)
            else {
                continue;
            };
            match grouped.iter_mut().find(|(b, _)| b.protocol() == protocol.vpn) {
                Some((_, transmissions)) => transmissions.push(transmission),
                None => grouped.push((backend.clone(), vec![transmission])),
            }
        }
        grouped
    }

    /// Position of a protocol in the Smart priority list
    fn priority(&self, protocol: &ProtocolSelection) -> usize {
        self.config
            .protocols
            .iter()
            .position(|p| p == protocol)
            .unwrap_or(usize::MAX)
    }

    async fn scan_smart(
        &self,
        intent: &AnyConnectIntent,
        server: &Server,
        number_of_ports: usize,
        wait_for_all: bool,
    ) -> Vec<PrepareResult> {
        let candidates = self.smart_candidates(server);
        let scans = candidates.iter().map(|(backend, transmissions)| async move {
            backend
                .prepare_for_connection(intent, server, transmissions, true, number_of_ports, wait_for_all)
                .await
                .into_iter()
                .map(|info| PrepareResult {
                    backend: backend.clone(),
                    params: ConnectionParams::new(intent.clone(), server.clone(), info),
                })
                .collect::<Vec<_>>()
        });

        let mut responses: Vec<PrepareResult> = join_all(scans).await.into_iter().flatten().collect();
        // Stable: keeps the per-transport latency order
        responses.sort_by_key(|r| self.priority(&r.params.protocol));
        responses
    }

    async fn prepare_explicit(
        &self,
        protocol: ProtocolSelection,
        intent: &AnyConnectIntent,
        server: &Server,
        scan: bool,
        number_of_ports: usize,
        wait_for_all: bool,
    ) -> Vec<PrepareResult> {
        let Some(backend) = self.backends.get(&protocol.vpn) else {
            debug!("No backend for {}", protocol);
            return Vec::new();
        };
        let transmissions: Vec<TransmissionProtocol> = protocol.transmission.into_iter().collect();
        backend
            .prepare_for_connection(intent, server, &transmissions, scan, number_of_ports, wait_for_all)
            .await
            .into_iter()
            .map(|info| PrepareResult {
                backend: backend.clone(),
                params: ConnectionParams::new(intent.clone(), server.clone(), info),
            })
            .collect()
    }
}

#[async_trait]
impl VpnBackendProvider for SmartProtocolProvider {
    async fn prepare_connection(
        &self,
        protocol: ProtocolSelection,
        intent: &AnyConnectIntent,
        server: &Server,
        always_scan: bool,
    ) -> Option<PrepareResult> {
        let ports = self.config.ports_per_transport;
        if !protocol.is_smart() {
            return self
                .prepare_explicit(protocol, intent, server, always_scan, ports, false)
                .await
                .into_iter()
                .next();
        }

        if let Some(best) = self.scan_smart(intent, server, ports, false).await.into_iter().next() {
            info!("Smart protocol picked {} for {}", best.params.protocol, server);
            return Some(best);
        }

        // Nothing answered: connect without scanning
        let fallback = if self.backends.contains_key(&VpnProtocol::IKEv2)
            && server.supports_protocol(&ProtocolSelection::IKEV2)
        {
            ProtocolSelection::IKEV2
        } else {
            self.fallback_protocol(server)
        };
        info!("No response from {}, using {} without scanning", server, fallback);
        self.prepare_explicit(fallback, intent, server, false, 1, false)
            .await
            .into_iter()
            .next()
    }

    async fn ping_all(
        &self,
        intent: &AnyConnectIntent,
        protocol: ProtocolSelection,
        preference_list: &[PhysicalServer],
        full_scan_server: Option<&PhysicalServer>,
    ) -> Option<PingResult> {
        let pings = preference_list.iter().map(|physical| async move {
            let full_scan = full_scan_server.is_some_and(|full| full == physical);
            let (ports, wait_for_all) = if full_scan {
                (usize::MAX, true)
            } else {
                (self.config.ping_all_ports, false)
            };
            let server = physical.server.with_domain(&physical.domain);
            let responses = if protocol.is_smart() {
                self.scan_smart(intent, &server, ports, wait_for_all).await
            } else {
                self.prepare_explicit(protocol, intent, &server, true, ports, wait_for_all)
                    .await
            };
            PingResult {
                physical_server: physical.clone(),
                responses,
            }
        });

        join_all(pings)
            .await
            .into_iter()
            .find(|result| !result.responses.is_empty())
    }

    fn fallback_protocol(&self, server: &Server) -> ProtocolSelection {
        let mut order = vec![ProtocolSelection::WIREGUARD_UDP, ProtocolSelection::OPENVPN_UDP];
        if self.tls_enabled() {
            order.push(ProtocolSelection::WIREGUARD_TCP);
            order.push(ProtocolSelection::WIREGUARD_TLS);
        }
        order
            .into_iter()
            .find(|p| server.supports_protocol(p))
            .unwrap_or(ProtocolSelection::WIREGUARD_UDP)
    }
}
