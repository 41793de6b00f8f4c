//! Server Availability Check
//!
//! Runs many probes at once under one shared deadline. Probes are grouped
//! by a caller-chosen key (for example a transport protocol); the result
//! says which destinations of each group answered.
//!
//! # Usage
//!
//! ```rust,ignore
//! let check = ServerAvailabilityCheck::new(ServerPing::new(Duration::from_secs(5)));
//! let groups = vec![
//!     ("udp", vec![ProbeTarget::udp(addr_a, payload)]),
//!     ("tcp", vec![ProbeTarget::tcp(addr_b), ProbeTarget::tcp(addr_c)]),
//! ];
//! // First responder per group
//! let fastest = check.ping_in_parallel(groups, false).await;
//! ```

use crate::ping::{ProbeTarget, Reachable, ServerPing};
use std::collections::HashMap;
use std::hash::Hash;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::debug;

/// Parallel reachability probing
#[derive(Debug, Clone, Default)]
pub struct ServerAvailabilityCheck {
    ping: ServerPing,
}

impl ServerAvailabilityCheck {
    /// Create a new availability check
    pub fn new(ping: ServerPing) -> Self {
        Self { ping }
    }

    /// Probe all destinations of all groups concurrently.
    ///
    /// With `wait_for_all` every responding destination is collected until
    /// the shared timeout; otherwise only the first responder per group is
    /// kept and the call returns as soon as every group has one. Groups with
    /// no responder are absent from the result.
    ///
    /// Dropping the returned future cancels all outstanding probes.
    pub async fn ping_in_parallel<K>(
        &self,
        groups: Vec<(K, Vec<ProbeTarget>)>,
        wait_for_all: bool,
    ) -> HashMap<K, Vec<Reachable>>
    where
        K: Eq + Hash + Clone + Send + 'static,
    {
        let mut results: HashMap<K, Vec<Reachable>> = HashMap::new();
        let group_count = groups.len();
        if group_count == 0 {
            return results;
        }

        let deadline = Instant::now() + self.ping.timeout();
        let mut probes = JoinSet::new();
        for (key, targets) in groups {
            for target in targets {
                let ping = self.ping.clone();
                let key = key.clone();
                probes.spawn(async move {
                    let outcome = ping.ping(&target).await;
                    (key, target, outcome)
                });
            }
        }

        loop {
            let next = tokio::time::timeout_at(deadline, probes.join_next()).await;
            let (key, target, outcome) = match next {
                Ok(Some(Ok(done))) => done,
                // A probe task panicked or was cancelled; keep collecting the rest.
                Ok(Some(Err(_))) => continue,
                Ok(None) => break,
                Err(_) => {
                    debug!("Availability check deadline reached");
                    break;
                }
            };

            let Ok(latency) = outcome else { continue };
            let entry = results.entry(key).or_default();
            if wait_for_all || entry.is_empty() {
                entry.push(Reachable { target, latency });
            }

            if !wait_for_all && results.len() == group_count {
                break;
            }
        }

        // Remaining probes are aborted when the set is dropped.
        for reachable in results.values_mut() {
            reachable.sort_by_key(|r| r.latency);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::{TcpListener, UdpSocket};

    async fn listening_port() -> (TcpListener, std::net::SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    async fn silent_udp() -> (UdpSocket, std::net::SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    #[tokio::test]
    async fn test_empty_groups() {
        let check = ServerAvailabilityCheck::default();
        let result = check.ping_in_parallel::<u8>(Vec::new(), true).await;
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_all_collects_every_responder() {
        let (_l1, a1) = listening_port().await;
        let (_l2, a2) = listening_port().await;
        let (_silent, dead) = silent_udp().await;

        let check = ServerAvailabilityCheck::new(ServerPing::new(Duration::from_millis(300)));
        let groups = vec![
            ("tcp", vec![ProbeTarget::tcp(a1), ProbeTarget::tcp(a2)]),
            ("udp", vec![ProbeTarget::udp(dead, vec![1u8])]),
        ];
        let result = check.ping_in_parallel(groups, true).await;

        assert_eq!(result.get("tcp").map(Vec::len), Some(2));
        assert!(!result.contains_key("udp"));
    }

    #[tokio::test]
    async fn test_first_responder_per_group() {
        let (_l1, a1) = listening_port().await;
        let (_l2, a2) = listening_port().await;
        let (_l3, a3) = listening_port().await;

        let check = ServerAvailabilityCheck::new(ServerPing::new(Duration::from_secs(2)));
        let groups = vec![
            (1u8, vec![ProbeTarget::tcp(a1), ProbeTarget::tcp(a2)]),
            (2u8, vec![ProbeTarget::tcp(a3)]),
        ];
        let result = check.ping_in_parallel(groups, false).await;

        assert_eq!(result.get(&1).map(Vec::len), Some(1));
        assert_eq!(result.get(&2).map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn test_returns_before_timeout_when_all_groups_answered() {
        let (_l1, a1) = listening_port().await;
        let (_silent, dead) = silent_udp().await;

        let check = ServerAvailabilityCheck::new(ServerPing::new(Duration::from_secs(10)));
        let groups = vec![(0u8, vec![ProbeTarget::tcp(a1), ProbeTarget::udp(dead, vec![1u8])])];

        let started = std::time::Instant::now();
        let result = check.ping_in_parallel(groups, false).await;

        assert_eq!(result.len(), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
