//! Provisioning plans and script rendering
//!
//! Topology logic never emits shell text directly: it produces an ordered
//! list of typed operations which a renderer turns into `ovs-vsctl`/`ip`
//! commands for the execution transport. The plan itself is unit-testable
//! without touching a network device.
//!
//! The tc renderers at the bottom are the boundary where flow selection
//! becomes effectful: a drr class tree with one netem leaf for the shaped
//! class and a catch-all default class.

use crate::session::HostPlan;
use ipnetwork::Ipv4Network;
use std::fmt::Write;
use std::net::Ipv4Addr;
use thiserror::Error;

/// MTU leaving headroom for the vxlan encapsulation overhead.
pub const TUNNEL_MTU: u32 = 1446;

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("Peer '{0}' has no resolved address; resolve the session before planning")]
    UnresolvedPeer(String),
}

/// One provisioning step. Rendering order matters: namespaces exist before
/// devices move into them, addresses before links come up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlanOp {
    AddBridge {
        device: String,
    },
    AddNamespace {
        name: String,
    },
    LoopbackUp {
        namespace: String,
    },
    AddTap {
        bridge: String,
        device: String,
    },
    MoveToNamespace {
        device: String,
        namespace: String,
    },
    SetLinkUp {
        namespace: Option<String>,
        device: String,
    },
    SetAddress {
        namespace: Option<String>,
        device: String,
        address: Ipv4Network,
    },
    SetMtu {
        namespace: Option<String>,
        device: String,
        mtu: u32,
    },
    AddTunnel {
        bridge: String,
        device: String,
        remote: Ipv4Addr,
    },
    EnableStp {
        bridge: String,
    },
    DelNamespace {
        name: String,
    },
    DelBridge {
        device: String,
    },
}

/// Build the provisioning plan for one host: bridge, per-instance
/// namespace wiring, tunnels to every resolved peer, then bring the
/// bridge itself up.
pub fn provision_plan(plan: &HostPlan) -> Result<Vec<PlanOp>, PlanError> {
    let bridge = &plan.bridge;
    let mut ops = vec![
        PlanOp::AddBridge {
            device: bridge.device.clone(),
        },
        PlanOp::SetMtu {
            namespace: None,
            device: bridge.device.clone(),
            mtu: TUNNEL_MTU,
        },
    ];
    for instance in &plan.instances {
        ops.push(PlanOp::AddNamespace {
            name: instance.namespace.clone(),
        });
        ops.push(PlanOp::LoopbackUp {
            namespace: instance.namespace.clone(),
        });
        ops.push(PlanOp::AddTap {
            bridge: bridge.device.clone(),
            device: instance.device.clone(),
        });
        ops.push(PlanOp::MoveToNamespace {
            device: instance.device.clone(),
            namespace: instance.namespace.clone(),
        });
        ops.push(PlanOp::SetLinkUp {
            namespace: Some(instance.namespace.clone()),
            device: instance.device.clone(),
        });
        ops.push(PlanOp::SetAddress {
            namespace: Some(instance.namespace.clone()),
            device: instance.device.clone(),
            address: instance.iface,
        });
        ops.push(PlanOp::SetMtu {
            namespace: Some(instance.namespace.clone()),
            device: instance.device.clone(),
            mtu: TUNNEL_MTU,
        });
    }
    for peer in &bridge.peers {
        let remote = peer
            .resolved
            .ok_or_else(|| PlanError::UnresolvedPeer(peer.host.clone()))?;
        ops.push(PlanOp::AddTunnel {
            bridge: bridge.device.clone(),
            device: peer.device.clone(),
            remote,
        });
    }
    ops.push(PlanOp::SetAddress {
        namespace: None,
        device: bridge.device.clone(),
        address: bridge.iface,
    });
    ops.push(PlanOp::EnableStp {
        bridge: bridge.device.clone(),
    });
    ops.push(PlanOp::SetLinkUp {
        namespace: None,
        device: bridge.device.clone(),
    });
    Ok(ops)
}

/// Tear down everything `provision_plan` created on one host.
pub fn teardown_plan(plan: &HostPlan) -> Vec<PlanOp> {
    let mut ops = vec![PlanOp::DelBridge {
        device: plan.bridge.device.clone(),
    }];
    for instance in &plan.instances {
        ops.push(PlanOp::DelNamespace {
            name: instance.namespace.clone(),
        });
    }
    ops
}

fn ns_prefix(namespace: &Option<String>) -> String {
    match namespace {
        Some(ns) => format!("ip netns exec {ns} "),
        None => String::new(),
    }
}

/// Render a plan to a shell script for the execution transport.
pub fn render_script(ops: &[PlanOp]) -> String {
    let mut script = String::new();
    for op in ops {
        match op {
            PlanOp::AddBridge { device } => {
                let _ = writeln!(script, "ovs-vsctl add-br {device}");
            }
            PlanOp::AddNamespace { name } => {
                let _ = writeln!(script, "ip netns add {name}");
            }
            PlanOp::LoopbackUp { namespace } => {
                let _ = writeln!(script, "ip netns exec {namespace} ip link set dev lo up");
            }
            PlanOp::AddTap { bridge, device } => {
                let _ = writeln!(
                    script,
                    "ovs-vsctl add-port {bridge} {device} -- set Interface {device} type=internal"
                );
            }
            PlanOp::MoveToNamespace { device, namespace } => {
                let _ = writeln!(script, "ip link set {device} netns {namespace}");
            }
            PlanOp::SetLinkUp { namespace, device } => {
                let _ = writeln!(
                    script,
                    "{}ip link set dev {device} up",
                    ns_prefix(namespace)
                );
            }
            PlanOp::SetAddress {
                namespace,
                device,
                address,
            } => {
                let _ = writeln!(
                    script,
                    "{}ip addr add {address} dev {device}",
                    ns_prefix(namespace)
                );
            }
            PlanOp::SetMtu {
                namespace,
                device,
                mtu,
            } => {
                let _ = writeln!(
                    script,
                    "{}ip link set dev {device} mtu {mtu}",
                    ns_prefix(namespace)
                );
            }
            PlanOp::AddTunnel {
                bridge,
                device,
                remote,
            } => {
                let _ = writeln!(
                    script,
                    "ovs-vsctl add-port {bridge} {device} -- set interface {device} type=vxlan options:remote_ip={remote}"
                );
            }
            PlanOp::EnableStp { bridge } => {
                let _ = writeln!(script, "ovs-vsctl set bridge {bridge} stp_enable=true");
            }
            PlanOp::DelNamespace { name } => {
                let _ = writeln!(script, "ip netns delete {name}");
            }
            PlanOp::DelBridge { device } => {
                let _ = writeln!(script, "ovs-vsctl del-br {device}");
            }
        }
    }
    script
}

/// Package installation for hosts that have never been prepared.
pub fn install_script() -> String {
    "apt-get update\napt-get -y install openvswitch-switch\n".to_string()
}

/// Render the per-flow shaping script: a drr tree with class 1:10 (netem
/// with the given condition) for matched port pairs and class 1:20 (plain
/// netem) as the default for everything else. The condition descriptor is
/// passed through verbatim.
pub fn shape_script(device: &str, pairs: &[(u16, u16)], condition: &str) -> String {
    let mut script = String::new();
    let _ = writeln!(script, "tc qdisc add dev {device} root handle 1: drr");
    let _ = writeln!(script, "tc class add dev {device} parent 1: classid 1:1 drr");
    let _ = writeln!(
        script,
        "tc class add dev {device} parent 1:1 classid 1:10 drr"
    );
    let _ = writeln!(
        script,
        "tc class add dev {device} parent 1:1 classid 1:20 drr"
    );
    let _ = writeln!(
        script,
        "tc qdisc add dev {device} parent 1:10 handle 10: netem {condition}"
    );
    let _ = writeln!(
        script,
        "tc qdisc add dev {device} parent 1:20 handle 20: netem"
    );
    for (sport, dport) in pairs {
        let _ = writeln!(
            script,
            "tc filter add dev {device} parent 1:0 protocol ip prio 1 u32 match ip sport {sport} 0xffff match ip dport {dport} 0xffff flowid 1:10"
        );
    }
    let _ = writeln!(
        script,
        "tc filter add dev {device} parent 1:0 protocol ip prio 1 u32 match ip dst 0.0.0.0/0 flowid 1:20"
    );
    script
}

/// Render the whole-host shaping script: an htb tree whose netem leaf
/// degrades traffic toward the given peer addresses; everything else keeps
/// the interface's default path.
pub fn shape_hosts_script(device: &str, peers: &[Ipv4Addr], condition: &str) -> String {
    let mut script = String::new();
    let _ = writeln!(script, "tc qdisc add dev {device} root handle 1: htb");
    let _ = writeln!(
        script,
        "tc class add dev {device} parent 1: classid 1:1 htb rate 1000Mbps"
    );
    let _ = writeln!(
        script,
        "tc class add dev {device} parent 1:1 classid 1:11 htb rate 1000Mbps"
    );
    let _ = writeln!(
        script,
        "tc qdisc add dev {device} parent 1:11 handle 10: netem {condition}"
    );
    for peer in peers {
        let _ = writeln!(
            script,
            "tc filter add dev {device} protocol ip prio 1 u32 match ip dst {peer} flowid 1:11"
        );
    }
    script
}

/// Remove the shaping tree installed by `shape_script` or
/// `shape_hosts_script`.
pub fn unshape_script(device: &str) -> String {
    format!("tc qdisc del dev {device} root\n")
}
