//! Session document model
//!
//! The session document is the single persisted artifact of a virtual
//! cluster: one `HostPlan` per participating host, each holding the
//! instances (namespaces) allocated on that host and the bridge that
//! connects them. Address assignment is immutable once allocated; the only
//! field rewritten across reconciliation passes is each instance's
//! `running` flag.

use crate::resolve::{ResolveError, Resolver};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to read session document {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to write session document {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },

    #[error("Malformed session document {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("Failed to serialize session: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

/// One emulated cluster member: an isolated network namespace with its own
/// address on the virtual network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Instance {
    /// Namespace identifier, unique within its host (e.g. `vc_ns0`)
    pub namespace: String,
    /// Interface device moved into the namespace (e.g. `vc_tap0`)
    pub device: String,
    /// Address/prefix assigned to the device
    pub iface: Ipv4Network,
    /// Desired state; toggled by apply/reset, never deleted
    pub running: bool,
}

/// Tunnel endpoint toward a neighboring host's bridge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Peer {
    /// Tunnel device name on this host (e.g. `vc_vxlan0`)
    pub device: String,
    /// Hostname of the peer; resolved lazily at read time
    pub host: String,
    /// Filled by `Session::resolve_peers`, never persisted
    #[serde(skip)]
    pub resolved: Option<Ipv4Addr>,
}

/// Per-host virtual switch connecting the host's instances and its tunnels.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Bridge {
    pub device: String,
    pub iface: Ipv4Network,
    #[serde(default)]
    pub peers: Vec<Peer>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostPlan {
    pub instances: Vec<Instance>,
    pub bridge: Bridge,
}

/// Host identifier → plan. A `BTreeMap` keeps host iteration in the sorted
/// order that allocation and reconciliation both rely on.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Session {
    pub hosts: BTreeMap<String, HostPlan>,
}

impl Session {
    /// Load a session document from a JSON file, rejecting unknown fields.
    pub fn load(path: &Path) -> Result<Self, SessionError> {
        let text = std::fs::read_to_string(path).map_err(|source| SessionError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let session: Session =
            serde_json::from_str(&text).map_err(|source| SessionError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        debug!(
            "Loaded session with {} hosts from {}",
            session.hosts.len(),
            path.display()
        );
        Ok(session)
    }

    /// Persist the session document. Only the `running` flags ever change
    /// between saves; everything else round-trips untouched.
    pub fn save(&self, path: &Path) -> Result<(), SessionError> {
        let text = self.to_json()?;
        std::fs::write(path, text).map_err(|source| SessionError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn to_json(&self) -> Result<String, SessionError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Resolve every peer hostname to an address. Peers that resolve to a
    /// loopback address are substituted with this machine's outbound
    /// address, so a single-host setup can tunnel to itself over a
    /// routable address.
    pub fn resolve_peers(&mut self, resolver: &dyn Resolver) -> Result<(), SessionError> {
        for plan in self.hosts.values_mut() {
            for peer in &mut plan.bridge.peers {
                let mut ip = resolver.resolve(&peer.host)?;
                if ip.is_loopback() {
                    ip = resolver.local_outbound()?;
                    debug!(
                        "Peer {} resolves to loopback, substituting {}",
                        peer.host, ip
                    );
                }
                peer.resolved = Some(ip);
            }
        }
        Ok(())
    }

    /// Set the desired state of every instance in the session.
    pub fn set_all_running(&mut self, running: bool) {
        for plan in self.hosts.values_mut() {
            for instance in &mut plan.instances {
                instance.running = running;
            }
        }
    }

    /// Total instance count across all hosts.
    pub fn instance_count(&self) -> usize {
        self.hosts.values().map(|p| p.instances.len()).sum()
    }
}
