//! Live TCP connection graph discovery
//!
//! Builds a point-in-time snapshot of who talks to whom among a set of
//! monitored service ports: `(listening-port, peer-port)` → the ephemeral
//! source ports of every observed flow in that direction. The snapshot is
//! advisory; flows opening or closing between the two socket queries may be
//! missed or stale, which is fine because shaping rules are idempotent to
//! re-apply.

use crate::exec::{ExecError, Executor};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("pid {pid} listens on both port {first} and port {second}; one process must own exactly one monitored port")]
    OwnershipConflict { pid: u32, first: u16, second: u16 },

    #[error("Malformed socket inspection output: {0}")]
    Parse(String),

    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// `(listening-port, peer-port)` → ephemeral ports in observation order.
pub type ConnectionGraph = BTreeMap<(u16, u16), Vec<u16>>;

/// A listening socket and the pid that owns it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListenerRecord {
    pub pid: u32,
    pub port: u16,
}

/// An established connection owned by a pid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnRecord {
    pub pid: u32,
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

/// Socket inspection seam; implementations report listening sockets and
/// established connections restricted to a port set.
#[async_trait]
pub trait SocketInspector: Send + Sync {
    async fn listeners(&self, ports: &BTreeSet<u16>) -> Result<Vec<ListenerRecord>, GraphError>;
    async fn established(&self, ports: &BTreeSet<u16>) -> Result<Vec<ConnRecord>, GraphError>;
}

/// Build the connection graph for the monitored port set.
pub async fn build_graph(
    inspector: &dyn SocketInspector,
    ports: &BTreeSet<u16>,
) -> Result<ConnectionGraph, GraphError> {
    let mut pid_to_port: HashMap<u32, u16> = HashMap::new();
    for listener in inspector.listeners(ports).await? {
        if !ports.contains(&listener.port) {
            continue;
        }
        match pid_to_port.insert(listener.pid, listener.port) {
            Some(previous) if previous != listener.port => {
                return Err(GraphError::OwnershipConflict {
                    pid: listener.pid,
                    first: previous,
                    second: listener.port,
                });
            }
            _ => {}
        }
    }
    debug!("Found {} listener pids", pid_to_port.len());

    let mut graph = ConnectionGraph::new();
    for conn in inspector.established(ports).await? {
        // Not a process of interest
        let Some(listen_port) = pid_to_port.get(&conn.pid) else {
            continue;
        };
        let peer_port = conn.remote.port();
        if !ports.contains(&peer_port) {
            continue;
        }
        graph
            .entry((*listen_port, peer_port))
            .or_default()
            .push(conn.local.port());
    }
    debug!("Connection graph has {} port pairs", graph.len());
    Ok(graph)
}

/// Inspector backed by `lsof` run through an executor. The queries are
/// read-only and run even in dry-run mode.
pub struct LsofInspector<'a> {
    exec: &'a dyn Executor,
}

impl<'a> LsofInspector<'a> {
    pub fn new(exec: &'a dyn Executor) -> Self {
        Self { exec }
    }

    fn csv(ports: &BTreeSet<u16>) -> String {
        ports
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[async_trait]
impl SocketInspector for LsofInspector<'_> {
    async fn listeners(&self, ports: &BTreeSet<u16>) -> Result<Vec<ListenerRecord>, GraphError> {
        let cmd = format!("lsof -Pni4TCP:{} -sTCP:LISTEN -Fpn", Self::csv(ports));
        let output = self.exec.query(&cmd).await?;
        parse_lsof_listeners(&output)
    }

    async fn established(&self, ports: &BTreeSet<u16>) -> Result<Vec<ConnRecord>, GraphError> {
        let cmd = format!("lsof -Pni4TCP:{} -sTCP:ESTABLISHED -Fpn", Self::csv(ports));
        let output = self.exec.query(&cmd).await?;
        parse_lsof_established(&output)
    }
}

/// Parse `lsof -Fpn` listener output: `p<pid>` lines set the current pid,
/// `n<addr>:<port>` lines name a bound socket.
pub fn parse_lsof_listeners(output: &str) -> Result<Vec<ListenerRecord>, GraphError> {
    let mut records = Vec::new();
    let mut pid: Option<u32> = None;
    for line in output.lines().filter(|l| !l.is_empty()) {
        if let Some(rest) = line.strip_prefix('p') {
            pid = Some(
                rest.parse()
                    .map_err(|_| GraphError::Parse(format!("bad pid line: {line}")))?,
            );
        } else if let Some(name) = line.strip_prefix('n') {
            let Some(pid) = pid else {
                return Err(GraphError::Parse(format!("name line before pid: {line}")));
            };
            let port = port_of(name)
                .ok_or_else(|| GraphError::Parse(format!("bad listener endpoint: {name}")))?;
            records.push(ListenerRecord { pid, port });
        }
    }
    Ok(records)
}

/// Parse `lsof -Fpn` established output; name lines look like
/// `n10.0.0.1:54321->10.0.0.2:9090`.
pub fn parse_lsof_established(output: &str) -> Result<Vec<ConnRecord>, GraphError> {
    let mut records = Vec::new();
    let mut pid: Option<u32> = None;
    for line in output.lines().filter(|l| !l.is_empty()) {
        if let Some(rest) = line.strip_prefix('p') {
            pid = Some(
                rest.parse()
                    .map_err(|_| GraphError::Parse(format!("bad pid line: {line}")))?,
            );
        } else if let Some(name) = line.strip_prefix('n') {
            let Some(pid) = pid else {
                return Err(GraphError::Parse(format!("name line before pid: {line}")));
            };
            let Some((local, remote)) = name.split_once("->") else {
                // Listening sockets can show up in the same process listing
                continue;
            };
            let local: SocketAddr = local
                .parse()
                .map_err(|_| GraphError::Parse(format!("bad local endpoint: {local}")))?;
            let remote: SocketAddr = remote
                .parse()
                .map_err(|_| GraphError::Parse(format!("bad remote endpoint: {remote}")))?;
            records.push(ConnRecord { pid, local, remote });
        }
    }
    Ok(records)
}

fn port_of(endpoint: &str) -> Option<u16> {
    endpoint.rsplit(':').next()?.parse().ok()
}
