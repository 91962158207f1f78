//! Virtual cluster provisioning and per-flow WAN emulation
//!
//! This crate builds isolated virtual network topologies (namespaces, bridges,
//! vxlan tunnels) across a set of test hosts and derives per-flow traffic
//! shaping rules for processes already running in them:
//! - Deterministic topology allocation from a CIDR block
//! - Desired-state reconciliation of the processes inside each namespace
//! - Live TCP connection graph discovery and flow selection for tc filters
//! - Typed provisioning plans rendered to scripts for local or ssh execution

pub mod alloc;
pub mod exec;
pub mod flows;
pub mod graph;
pub mod hosts;
pub mod plan;
pub mod reconcile;
pub mod resolve;
pub mod session;

// Re-export commonly used types
pub use alloc::{allocate, HostRequest};
pub use exec::{ExecOptions, Executor};
pub use flows::{select_flows, PortGroups};
pub use graph::{build_graph, ConnectionGraph, SocketInspector};
pub use hosts::{select_host_flows, HostGroups};
pub use reconcile::{Action, LaunchSpec, Liveness, ReconcileReport};
pub use session::{Bridge, HostPlan, Instance, Peer, Session};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Configuration error: {0}")]
    Config(#[from] alloc::ConfigError),

    #[error("Connection graph error: {0}")]
    Graph(#[from] graph::GraphError),

    #[error("Flow selection error: {0}")]
    Flows(#[from] flows::FlowError),

    #[error("Host group error: {0}")]
    Hosts(#[from] hosts::HostGroupError),

    #[error("Session document error: {0}")]
    Session(#[from] session::SessionError),

    #[error("Host resolution error: {0}")]
    Resolve(#[from] resolve::ResolveError),

    #[error("Provisioning plan error: {0}")]
    Plan(#[from] plan::PlanError),

    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] reconcile::ReconcileError),

    #[error("Remote execution error: {0}")]
    Exec(#[from] exec::ExecError),
}
