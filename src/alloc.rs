//! Topology allocation
//!
//! Turns a CIDR block and a set of `host/count` requests into a session
//! document: per-instance addresses walk up from the bottom of the block,
//! bridge addresses walk down from the top, and the per-host bridges are
//! chained with vxlan tunnels in sorted host order. Allocation is
//! all-or-nothing and deterministic; running it twice over the same inputs
//! produces byte-identical documents.

use crate::session::{Bridge, HostPlan, Instance, Peer, Session};
use ipnetwork::Ipv4Network;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use thiserror::Error;
use tracing::debug;

/// Bridge device name used on every host.
pub const BRIDGE_DEVICE: &str = "vc_br0";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid host/count request '{0}' (expected e.g. 'hostname/3')")]
    InvalidHostCount(String),

    #[error("Network block too small: need {needed} usable addresses, block has {available}")]
    InsufficientCapacity { needed: u64, available: u64 },

    #[error("Network block exhausted during allocation")]
    BlockExhausted,

    #[error("Address arithmetic failed: {0}")]
    Address(#[from] ipnetwork::IpNetworkError),
}

/// One `host/count` request from the operator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostRequest {
    pub host: String,
    pub count: u32,
}

impl HostRequest {
    /// Parse the `host/count` syntax, e.g. `node-a/3`.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let (host, count) = text
            .split_once('/')
            .ok_or_else(|| ConfigError::InvalidHostCount(text.to_string()))?;
        if host.is_empty() {
            return Err(ConfigError::InvalidHostCount(text.to_string()));
        }
        let count: u32 = count
            .parse()
            .map_err(|_| ConfigError::InvalidHostCount(text.to_string()))?;
        Ok(Self {
            host: host.to_string(),
            count,
        })
    }
}

/// Merge duplicate hosts by summing counts; hosts that end up at zero do
/// not participate and reserve no addresses.
fn merge_requests(requests: &[HostRequest]) -> BTreeMap<String, u32> {
    let mut merged: BTreeMap<String, u32> = BTreeMap::new();
    for request in requests {
        *merged.entry(request.host.clone()).or_insert(0) += request.count;
    }
    merged.retain(|_, count| *count > 0);
    merged
}

fn usable_addresses(network: Ipv4Network) -> u64 {
    let span = 1u64 << (32 - network.prefix());
    // Network and broadcast addresses are unusable except in /31 and /32
    if network.prefix() >= 31 {
        span
    } else {
        span - 2
    }
}

/// Allocate a session for the given block and requests.
pub fn allocate(network: Ipv4Network, requests: &[HostRequest]) -> Result<Session, ConfigError> {
    let merged = merge_requests(requests);
    let total_instances: u64 = merged.values().map(|c| *c as u64).sum();
    let needed = total_instances + merged.len() as u64;
    let available = usable_addresses(network);
    if needed > available {
        return Err(ConfigError::InsufficientCapacity { needed, available });
    }

    let prefix = network.prefix();
    let broadcast = u32::from(network.broadcast());
    // Skip the network address; instance addresses start at the first
    // usable host address.
    let mut addresses = network.iter().skip(1);

    let mut session = Session::default();
    for (ordinal, (host, count)) in merged.iter().enumerate() {
        let mut instances = Vec::with_capacity(*count as usize);
        for index in 0..*count {
            let address = addresses.next().ok_or(ConfigError::BlockExhausted)?;
            instances.push(Instance {
                namespace: format!("vc_ns{index}"),
                device: format!("vc_tap{index}"),
                iface: Ipv4Network::new(address, prefix)?,
                running: true,
            });
        }
        // Bridges take addresses from the opposite end of the block, so
        // they cannot collide with instances under the capacity check.
        let bridge_address = Ipv4Addr::from(broadcast - (ordinal as u32 + 1));
        session.hosts.insert(
            host.clone(),
            HostPlan {
                instances,
                bridge: Bridge {
                    device: BRIDGE_DEVICE.to_string(),
                    iface: Ipv4Network::new(bridge_address, prefix)?,
                    peers: Vec::new(),
                },
            },
        );
    }

    chain_peers(&mut session);
    debug!(
        "Allocated {} instances across {} hosts in {}",
        total_instances,
        session.hosts.len(),
        network
    );
    Ok(session)
}

/// Connect the per-host bridges in a chain over the sorted host order:
/// each host tunnels to its immediate predecessor and successor.
fn chain_peers(session: &mut Session) {
    let hosts: Vec<String> = session.hosts.keys().cloned().collect();
    if hosts.len() < 2 {
        return;
    }
    for (i, host) in hosts.iter().enumerate() {
        let mut neighbors = Vec::new();
        if i > 0 {
            neighbors.push(hosts[i - 1].clone());
        }
        if i < hosts.len() - 1 {
            neighbors.push(hosts[i + 1].clone());
        }
        if let Some(plan) = session.hosts.get_mut(host) {
            plan.bridge.peers = neighbors
                .into_iter()
                .enumerate()
                .map(|(k, neighbor)| Peer {
                    device: format!("vc_vxlan{k}"),
                    host: neighbor,
                    resolved: None,
                })
                .collect();
        }
    }
}
