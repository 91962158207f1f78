//! Host groups and per-host flow selection
//!
//! Host groups name whole machines, optionally restricted to an instance
//! ordinal range (`node-a[0:5]`). They drive whole-host shaping: traffic
//! between machines in different groups is degraded, traffic within one
//! group is left alone. The ordinal ranges scope commands that operate per
//! namespace, such as running a command in a subset of instances.

use crate::resolve::{ResolveError, Resolver};
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use thiserror::Error;

/// Largest instance ordinal an open-ended range covers.
const RANGE_DEFAULT_STOP: u32 = 250;

#[derive(Error, Debug)]
pub enum HostGroupError {
    #[error("Invalid host group entry '{0}' (expected e.g. 'node-a', 'node-a[3]', or 'node-a[0:5]')")]
    InvalidEntry(String),

    #[error("Host {0} appears more than once across the host groups")]
    DuplicateHost(String),
}

/// One host with a half-open instance ordinal range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostRange {
    pub host: String,
    pub start: u32,
    pub stop: u32,
}

impl HostRange {
    /// Parse one entry: `name`, `name[3]`, `name[1:4]`, `name[:4]`,
    /// `name[1:]`. A bare name covers every ordinal.
    fn parse(text: &str) -> Result<Self, HostGroupError> {
        let invalid = || HostGroupError::InvalidEntry(text.to_string());
        let (host, range) = match text.split_once('[') {
            None => (text, None),
            Some((host, rest)) => {
                let inner = rest.strip_suffix(']').ok_or_else(invalid)?;
                (host, Some(inner))
            }
        };
        if host.is_empty() {
            return Err(invalid());
        }
        let (start, stop) = match range {
            None => (0, RANGE_DEFAULT_STOP),
            Some(inner) => match inner.split_once(':') {
                None => {
                    let index: u32 = inner.parse().map_err(|_| invalid())?;
                    (index, index + 1)
                }
                Some((start, stop)) => {
                    let start = if start.is_empty() {
                        0
                    } else {
                        start.parse().map_err(|_| invalid())?
                    };
                    let stop = if stop.is_empty() {
                        RANGE_DEFAULT_STOP
                    } else {
                        stop.parse().map_err(|_| invalid())?
                    };
                    (start, stop)
                }
            },
        };
        if stop < start {
            return Err(invalid());
        }
        Ok(Self {
            host: host.to_string(),
            start,
            stop,
        })
    }
}

/// Ordered host groups; the same host may not be named twice anywhere
/// across a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostGroups {
    groups: Vec<Vec<HostRange>>,
}

impl HostGroups {
    /// Parse comma-separated group arguments, e.g.
    /// `["web-a,web-b", "db[0:2]"]`.
    pub fn parse(args: &[String]) -> Result<Self, HostGroupError> {
        let mut groups = Vec::with_capacity(args.len());
        let mut seen = BTreeSet::new();
        for arg in args {
            let mut group = Vec::new();
            for part in arg.split(',') {
                let range = HostRange::parse(part.trim())?;
                if !seen.insert(range.host.clone()) {
                    return Err(HostGroupError::DuplicateHost(range.host));
                }
                group.push(range);
            }
            groups.push(group);
        }
        Ok(Self { groups })
    }

    /// Every host named across the groups, in group order.
    pub fn hosts(&self) -> impl Iterator<Item = &str> + '_ {
        self.groups.iter().flatten().map(|r| r.host.as_str())
    }

    /// Whether the given host's instance ordinal falls inside any range.
    pub fn contains(&self, host: &str, index: u32) -> bool {
        self.groups
            .iter()
            .flatten()
            .any(|r| r.host == host && r.start <= index && index < r.stop)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// For every unordered pair of distinct groups, resolve each cross-group
/// host pair and record the other side's address: host → the peer addresses
/// its shaping filters must match on. A single group selects nothing, and
/// pairs within one group never appear.
pub fn select_host_flows(
    groups: &HostGroups,
    resolver: &dyn Resolver,
) -> Result<BTreeMap<String, Vec<Ipv4Addr>>, ResolveError> {
    let mut flows: BTreeMap<String, Vec<Ipv4Addr>> = BTreeMap::new();
    for i in 0..groups.groups.len() {
        for j in i + 1..groups.groups.len() {
            for h1 in &groups.groups[i] {
                for h2 in &groups.groups[j] {
                    let ip1 = resolver.resolve(&h1.host)?;
                    let ip2 = resolver.resolve(&h2.host)?;
                    flows.entry(h1.host.clone()).or_default().push(ip2);
                    flows.entry(h2.host.clone()).or_default().push(ip1);
                }
            }
        }
    }
    Ok(flows)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Resolver with one fixed answer per hostname.
    struct MapResolver(BTreeMap<String, Ipv4Addr>);

    impl MapResolver {
        fn new(entries: &[(&str, &str)]) -> Self {
            Self(
                entries
                    .iter()
                    .map(|(host, ip)| (host.to_string(), ip.parse().unwrap()))
                    .collect(),
            )
        }
    }

    impl Resolver for MapResolver {
        fn resolve(&self, host: &str) -> Result<Ipv4Addr, ResolveError> {
            self.0
                .get(host)
                .copied()
                .ok_or_else(|| ResolveError::Unresolvable(host.to_string()))
        }

        fn local_outbound(&self) -> Result<Ipv4Addr, ResolveError> {
            Ok("192.0.2.1".parse().unwrap())
        }
    }

    fn groups(specs: &[&str]) -> HostGroups {
        let args: Vec<String> = specs.iter().map(|s| s.to_string()).collect();
        HostGroups::parse(&args).unwrap()
    }

    #[test]
    fn parses_bare_names_and_ranges() {
        let g = groups(&["a,b[3]", "c[1:4],d[:2],e[5:]"]);
        assert_eq!(g.len(), 2);
        assert_eq!(
            g.hosts().collect::<Vec<_>>(),
            vec!["a", "b", "c", "d", "e"]
        );
        assert!(g.contains("a", 0));
        assert!(g.contains("a", 249));
        assert!(g.contains("b", 3));
        assert!(!g.contains("b", 2));
        assert!(g.contains("c", 1) && g.contains("c", 3) && !g.contains("c", 4));
        assert!(g.contains("d", 0) && !g.contains("d", 2));
        assert!(!g.contains("e", 4) && g.contains("e", 5));
        assert!(!g.contains("unknown", 0));
    }

    #[test]
    fn rejects_malformed_entries() {
        for bad in ["", "[1]", "a[", "a[1", "a[x]", "a[4:1]", "a[1]b"] {
            let args = vec![bad.to_string()];
            assert!(
                matches!(
                    HostGroups::parse(&args),
                    Err(HostGroupError::InvalidEntry(_))
                ),
                "should reject {bad:?}"
            );
        }
    }

    #[test]
    fn repeated_hosts_are_rejected() {
        let args = vec!["a,b".to_string(), "a[0:2]".to_string()];
        assert!(matches!(
            HostGroups::parse(&args),
            Err(HostGroupError::DuplicateHost(host)) if host == "a"
        ));
        let args = vec!["a,a".to_string()];
        assert!(matches!(
            HostGroups::parse(&args),
            Err(HostGroupError::DuplicateHost(_))
        ));
    }

    #[test]
    fn cross_group_hosts_see_each_other() {
        let resolver = MapResolver::new(&[
            ("a", "10.1.0.1"),
            ("b", "10.1.0.2"),
            ("c", "10.1.0.3"),
        ]);
        let flows = select_host_flows(&groups(&["a,b", "c"]), &resolver).unwrap();
        assert_eq!(flows["a"], vec!["10.1.0.3".parse::<Ipv4Addr>().unwrap()]);
        assert_eq!(flows["b"], vec!["10.1.0.3".parse::<Ipv4Addr>().unwrap()]);
        assert_eq!(
            flows["c"],
            vec![
                "10.1.0.1".parse::<Ipv4Addr>().unwrap(),
                "10.1.0.2".parse::<Ipv4Addr>().unwrap(),
            ]
        );
    }

    #[test]
    fn pairs_within_one_group_are_not_shaped() {
        let resolver = MapResolver::new(&[("a", "10.1.0.1"), ("b", "10.1.0.2")]);
        let flows = select_host_flows(&groups(&["a,b"]), &resolver).unwrap();
        assert!(flows.is_empty());
    }

    #[test]
    fn unresolvable_host_aborts_selection() {
        let resolver = MapResolver::new(&[("a", "10.1.0.1")]);
        let err = select_host_flows(&groups(&["a", "ghost"]), &resolver);
        assert!(matches!(err, Err(ResolveError::Unresolvable(_))));
    }
}
