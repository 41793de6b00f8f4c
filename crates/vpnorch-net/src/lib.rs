//! vpnorch network probing
//!
//! Reachability checks for VPN entry points, used to pick a working
//! protocol, transport and port before a tunnel is started.
//!
//! Architecture:
//! 1. `ServerPing` probes one destination (TCP connect or UDP request/answer)
//! 2. `ServerAvailabilityCheck` fans probes out under a shared deadline
//! 3. `packet` builds the first datagram each protocol's server answers to

mod availability;
pub mod packet;
mod ping;

pub use availability::ServerAvailabilityCheck;
pub use ping::{ProbeError, ProbeTarget, ProbeTransport, Reachable, ServerPing};
