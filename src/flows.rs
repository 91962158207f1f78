//! Flow selection
//!
//! Given named port groups and a connection graph, derives the concrete
//! `(source-port, destination-port)` pairs that the shaping filters must
//! classify. Matching on per-flow port pairs, rather than shaping a whole
//! interface, leaves control traffic and unrelated flows untouched.

use crate::graph::ConnectionGraph;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Invalid port '{0}' in port group")]
    InvalidPort(String),

    #[error("Port {0} appears more than once across the port groups")]
    DuplicatePort(u16),
}

/// Ordered, pairwise-disjoint port groups.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortGroups {
    groups: Vec<Vec<u16>>,
}

impl PortGroups {
    /// Parse comma-separated group arguments, e.g. `["8080,8081", "9090"]`.
    /// A port repeated anywhere across the request is a configuration error.
    pub fn parse(args: &[String]) -> Result<Self, FlowError> {
        let mut groups = Vec::with_capacity(args.len());
        for arg in args {
            let mut group = Vec::new();
            for part in arg.split(',') {
                let port: u16 = part
                    .trim()
                    .parse()
                    .map_err(|_| FlowError::InvalidPort(part.to_string()))?;
                group.push(port);
            }
            groups.push(group);
        }
        let groups = Self { groups };
        groups.check_disjoint()?;
        Ok(groups)
    }

    pub fn from_groups(groups: Vec<Vec<u16>>) -> Result<Self, FlowError> {
        let groups = Self { groups };
        groups.check_disjoint()?;
        Ok(groups)
    }

    fn check_disjoint(&self) -> Result<(), FlowError> {
        let mut seen = std::collections::BTreeSet::new();
        for port in self.all_ports() {
            if !seen.insert(port) {
                return Err(FlowError::DuplicatePort(port));
            }
        }
        Ok(())
    }

    /// All ports across every group, in group order.
    pub fn all_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.groups.iter().flatten().copied()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Derive the flat, order-preserving list of `(source, destination)` port
/// pairs to classify into the shaped traffic class. Every emitted pair is
/// accompanied by its reverse, so both directions of an exchange match.
/// Fewer than two groups select nothing; only the default class applies.
pub fn select_flows(groups: &PortGroups, graph: &ConnectionGraph) -> Vec<(u16, u16)> {
    let mut pairs = Vec::new();
    for i in 0..groups.groups.len() {
        for j in i + 1..groups.groups.len() {
            for &p1 in &groups.groups[i] {
                for &p2 in &groups.groups[j] {
                    if let Some(ephemerals) = graph.get(&(p1, p2)) {
                        for &e in ephemerals {
                            pairs.push((e, p2));
                            pairs.push((p2, e));
                        }
                    }
                    if let Some(ephemerals) = graph.get(&(p2, p1)) {
                        for &e in ephemerals {
                            pairs.push((e, p1));
                            pairs.push((p1, e));
                        }
                    }
                }
            }
        }
    }
    pairs
}
