//! vpnorch-probe: entry point reachability check
//!
//! Probes a VPN host on every port the configuration lists for each
//! protocol, the same way connection preparation does, and reports which
//! entry points answer.

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use vpnorch_core::{CoreConfig, ProtocolSelection, TransmissionProtocol, VpnProtocol, decode_x25519_public};
use vpnorch_net::packet::{openvpn_hard_reset, wireguard_initiation};
use vpnorch_net::{ProbeTarget, ProbeTransport, ServerAvailabilityCheck, ServerPing};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "vpnorch-probe", version, about = "Check which VPN entry points of a host answer")]
struct Args {
    /// Host name or IP of the entry server
    host: String,

    /// Core configuration (TOML or JSON); defaults are used without one
    #[arg(short, long, env = "VPNORCH_CONFIG")]
    config: Option<PathBuf>,

    /// Server X25519 public key (base64), needed for WireGuard UDP
    #[arg(long)]
    wireguard_key: Option<String>,

    /// Per-probe timeout in milliseconds; the configured one by default
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Collect every answering port instead of the first per protocol
    #[arg(long)]
    wait_for_all: bool,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct EntryReport {
    protocol: String,
    transport: ProbeTransport,
    addr: SocketAddr,
    latency_ms: u128,
}

#[tokio::main]
async fn main() -> Result<()> {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => {
            CoreConfig::load(path).with_context(|| format!("failed to load config from {}", path.display()))?
        }
        None => CoreConfig::default(),
    };
    let server_key = args
        .wireguard_key
        .as_deref()
        .map(decode_x25519_public)
        .transpose()
        .context("invalid WireGuard key")?;

    let ip = resolve(&args.host).await?;
    info!("Probing {} ({})", args.host, ip);

    let mut groups = Vec::new();
    for protocol in &config.smart.protocols {
        let ports = config.ports.ports_for(protocol);
        let targets: Vec<ProbeTarget> = match (protocol.vpn, protocol.transmission) {
            (VpnProtocol::WireGuard, Some(TransmissionProtocol::Udp)) => {
                let Some(key) = &server_key else {
                    warn!("No WireGuard key given, skipping {}", protocol);
                    continue;
                };
                let payload = wireguard_initiation(key);
                ports
                    .iter()
                    .map(|&port| ProbeTarget::udp(SocketAddr::new(ip, port), payload.clone()))
                    .collect()
            }
            (VpnProtocol::OpenVpn, Some(TransmissionProtocol::Udp)) => {
                let payload = openvpn_hard_reset();
                ports
                    .iter()
                    .map(|&port| ProbeTarget::udp(SocketAddr::new(ip, port), payload.clone()))
                    .collect()
            }
            _ => ports.iter().map(|&port| ProbeTarget::tcp(SocketAddr::new(ip, port))).collect(),
        };
        groups.push((*protocol, targets));
    }
    if groups.is_empty() {
        bail!("nothing to probe");
    }

    let timeout = args
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.smart.probe_timeout());
    let check = ServerAvailabilityCheck::new(ServerPing::new(timeout));
    let probed: Vec<ProtocolSelection> = groups.iter().map(|(protocol, _)| *protocol).collect();
    let results = check.ping_in_parallel(groups, args.wait_for_all).await;

    let mut report = Vec::new();
    for protocol in &probed {
        for reachable in results.get(protocol).into_iter().flatten() {
            report.push(EntryReport {
                protocol: protocol.to_string(),
                transport: reachable.target.transport,
                addr: reachable.target.addr,
                latency_ms: reachable.latency.as_millis(),
            });
        }
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for protocol in &probed {
            if !results.contains_key(protocol) {
                println!("{:<16} unreachable", protocol.to_string());
            }
        }
        for entry in &report {
            println!("{:<16} {:<22} {:>5} ms", entry.protocol, entry.addr, entry.latency_ms);
        }
    }

    info!("{} of {} protocols reachable", results.len(), probed.len());
    Ok(())
}

async fn resolve(host: &str) -> Result<IpAddr> {
    if let Ok(ip) = host.parse() {
        return Ok(ip);
    }
    tokio::net::lookup_host((host, 0))
        .await
        .with_context(|| format!("failed to resolve {}", host))?
        .next()
        .map(|addr| addr.ip())
        .with_context(|| format!("no address for {}", host))
}
