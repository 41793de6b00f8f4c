//! Prepare For Connection
//!
//! Resolves the entry points a backend can connect to: one online domain
//! per transport, the entry IP serving that transport and the ports to
//! use. With scanning enabled the ports are probed first and only the ones
//! that answer are kept, fastest first.
//!
//! # Usage
//!
//! ```rust,ignore
//! let prepare = PrepareForConnection::new(Arc::new(ServerAvailabilityCheck::default()), config.ports);
//! let infos = prepare
//!     .prepare(&server, VpnProtocol::WireGuard, &[TransmissionProtocol::Udp], true, 3, false)
//!     .await;
//! ```

use crate::config::PortsConfig;
use crate::keys::decode_x25519_public;
use crate::server::{ConnectingDomain, ProtocolInfo, ProtocolSelection, Server, TransmissionProtocol, VpnProtocol};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, warn};
use vpnorch_net::packet::{openvpn_hard_reset, wireguard_initiation};
use vpnorch_net::{ProbeTarget, Reachable, ServerAvailabilityCheck};

/// IKEv2 is only served on its standard port
pub const IKEV2_PORT: u16 = 500;

/// Parallel probing seam
#[async_trait]
pub trait AvailabilityProbe: Send + Sync {
    async fn ping_in_parallel(
        &self,
        groups: Vec<(ProtocolSelection, Vec<ProbeTarget>)>,
        wait_for_all: bool,
    ) -> HashMap<ProtocolSelection, Vec<Reachable>>;
}

#[async_trait]
impl AvailabilityProbe for ServerAvailabilityCheck {
    async fn ping_in_parallel(
        &self,
        groups: Vec<(ProtocolSelection, Vec<ProbeTarget>)>,
        wait_for_all: bool,
    ) -> HashMap<ProtocolSelection, Vec<Reachable>> {
        ServerAvailabilityCheck::ping_in_parallel(self, groups, wait_for_all).await
    }
}

struct Candidate {
    protocol: ProtocolSelection,
    domain: ConnectingDomain,
    entry_ip: IpAddr,
    ports: Vec<u16>,
}

/// Entry point resolution shared by all backends
pub struct PrepareForConnection {
    probe: Arc<dyn AvailabilityProbe>,
    ports: PortsConfig,
}

impl PrepareForConnection {
    pub fn new(probe: Arc<dyn AvailabilityProbe>, ports: PortsConfig) -> Self {
        Self { probe, ports }
    }

    /// Entry points for `vpn` over each of `transmissions`, in transport order.
    ///
    /// Without `scan` every transport resolves to its default port. With
    /// `scan` at most `number_of_ports` ports per transport are probed (the
    /// default one plus a random sample) and transports nobody answers on
    /// are dropped.
    pub async fn prepare(
        &self,
        server: &Server,
        vpn: VpnProtocol,
        transmissions: &[TransmissionProtocol],
        scan: bool,
        number_of_ports: usize,
        wait_for_all: bool,
    ) -> Vec<ProtocolInfo> {
        if vpn == VpnProtocol::IKEv2 {
            return self.prepare_ikev2(server);
        }

        let candidates: Vec<Candidate> = transmissions
            .iter()
            .filter_map(|&transmission| self.candidate(server, ProtocolSelection::new(vpn, Some(transmission))))
            .collect();

        if !scan {
            return candidates
                .into_iter()
                .filter_map(|c| {
                    let port = *c.ports.first()?;
                    Some(ProtocolInfo {
                        protocol: c.protocol,
                        domain: c.domain,
                        entry_ip: c.entry_ip,
                        port,
                    })
                })
                .collect();
        }

        let groups: Vec<(ProtocolSelection, Vec<ProbeTarget>)> = candidates
            .iter()
            .map(|c| {
                let targets: Vec<ProbeTarget> = scan_ports(&c.ports, number_of_ports)
                    .into_iter()
                    .filter_map(|port| probe_target(c.protocol, &c.domain, SocketAddr::new(c.entry_ip, port)))
                    .collect();
                (c.protocol, targets)
            })
            .filter(|(_, targets)| !targets.is_empty())
            .collect();
        if groups.is_empty() {
            return Vec::new();
        }

        let mut answers = self.probe.ping_in_parallel(groups, wait_for_all).await;
        let mut result = Vec::new();
        for candidate in candidates {
            let Some(mut reachable) = answers.remove(&candidate.protocol) else {
                debug!("No answer from {} over {}", server, candidate.protocol);
                continue;
            };
            reachable.sort_by_key(|r| r.latency);
            for answer in reachable {
                result.push(ProtocolInfo {
                    protocol: candidate.protocol,
                    domain: candidate.domain.clone(),
                    entry_ip: candidate.entry_ip,
                    port: answer.target.addr.port(),
                });
            }
        }
        result
    }

    fn prepare_ikev2(&self, server: &Server) -> Vec<ProtocolInfo> {
        let protocol = ProtocolSelection::IKEV2;
        server
            .random_online_domain(&protocol)
            .map(|domain| ProtocolInfo {
                protocol,
                domain: domain.clone(),
                entry_ip: domain.entry_ip_for(&protocol),
                port: IKEV2_PORT,
            })
            .into_iter()
            .collect()
    }

    fn candidate(&self, server: &Server, protocol: ProtocolSelection) -> Option<Candidate> {
        let Some(domain) = server.random_online_domain(&protocol) else {
            debug!("{} has no online domain for {}", server, protocol);
            return None;
        };
        let ports = match domain.ports_for(&protocol) {
            Some(ports) if !ports.is_empty() => ports.to_vec(),
            _ => self.ports.ports_for(&protocol).to_vec(),
        };
        if ports.is_empty() {
            warn!("No ports configured for {}", protocol);
            return None;
        }
        Some(Candidate {
            protocol,
            domain: domain.clone(),
            entry_ip: domain.entry_ip_for(&protocol),
            ports,
        })
    }
}

/// Default port first, then a random sample of the others
fn scan_ports(ports: &[u16], limit: usize) -> Vec<u16> {
    let Some((&default, rest)) = ports.split_first() else {
        return Vec::new();
    };
    let mut others = rest.to_vec();
    others.shuffle(&mut rand::thread_rng());

    let mut selected = vec![default];
    selected.extend(others.into_iter().take(limit.saturating_sub(1)));
    selected
}

fn probe_target(protocol: ProtocolSelection, domain: &ConnectingDomain, addr: SocketAddr) -> Option<ProbeTarget> {
    match (protocol.vpn, protocol.transmission) {
        (VpnProtocol::WireGuard, Some(TransmissionProtocol::Udp)) => {
            let key = domain.public_key_x25519.as_deref()?;
            match decode_x25519_public(key) {
                Ok(key) => Some(ProbeTarget::udp(addr, wireguard_initiation(&key))),
                Err(e) => {
                    warn!("Bad server key on domain {}: {}", domain.id, e);
                    None
                }
            }
        }
        (VpnProtocol::OpenVpn, Some(TransmissionProtocol::Udp)) => {
            Some(ProbeTarget::udp(addr, openvpn_hard_reset()))
        }
        (_, Some(TransmissionProtocol::Tcp | TransmissionProtocol::Tls)) => Some(ProbeTarget::tcp(addr)),
        _ => None,
    }
}
