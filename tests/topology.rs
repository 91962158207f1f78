//! Topology pipeline integration tests
//!
//! Allocation through persistence through provisioning-plan rendering,
//! end to end, without touching a network device.

use vcluster::alloc::{allocate, ConfigError, HostRequest};
use vcluster::plan::{provision_plan, render_script, teardown_plan};
use vcluster::resolve::FixedResolver;
use vcluster::Session;

fn requests(specs: &[&str]) -> Vec<HostRequest> {
    specs.iter().map(|s| HostRequest::parse(s).unwrap()).collect()
}

#[test]
fn allocate_persist_reload_is_lossless() {
    let session = allocate(
        "10.10.0.0/16".parse().unwrap(),
        &requests(&["node-b/3", "node-a/5", "node-c/2"]),
    )
    .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.json");
    session.save(&path).unwrap();
    let reloaded = Session::load(&path).unwrap();
    assert_eq!(session, reloaded);
    assert_eq!(reloaded.instance_count(), 10);
}

#[test]
fn two_allocations_are_byte_identical() {
    let reqs = requests(&["w1/10", "w2/10", "w0/5"]);
    let block = "172.16.0.0/20".parse().unwrap();
    let first = allocate(block, &reqs).unwrap().to_json().unwrap();
    let second = allocate(block, &reqs).unwrap().to_json().unwrap();
    assert_eq!(first, second);
}

#[test]
fn capacity_failure_allocates_nothing() {
    // 14 usable addresses in a /28; 12 instances + 3 bridges = 15
    let err = allocate(
        "10.0.0.0/28".parse().unwrap(),
        &requests(&["a/4", "b/4", "c/4"]),
    );
    assert!(matches!(err, Err(ConfigError::InsufficientCapacity { .. })));
}

#[test]
fn resolved_session_renders_full_provisioning_scripts() {
    let mut session = allocate(
        "10.0.0.0/24".parse().unwrap(),
        &requests(&["alpha/2", "beta/1"]),
    )
    .unwrap();

    let resolver = FixedResolver {
        address: "192.0.2.10".parse().unwrap(),
        outbound: "192.0.2.99".parse().unwrap(),
    };
    session.resolve_peers(&resolver).unwrap();

    for (host, plan) in &session.hosts {
        let script = render_script(&provision_plan(plan).unwrap());
        assert!(script.contains("ovs-vsctl add-br vc_br0"), "{host}");
        // Every instance gets a namespace and its address
        for instance in &plan.instances {
            assert!(script.contains(&format!("ip netns add {}", instance.namespace)));
            assert!(script.contains(&format!(
                "ip addr add {} dev {}",
                instance.iface, instance.device
            )));
        }
        // One vxlan tunnel per peer, at the resolved address
        for peer in &plan.bridge.peers {
            assert!(script.contains(&format!(
                "{} type=vxlan options:remote_ip=192.0.2.10",
                peer.device
            )));
        }
    }
}

#[test]
fn teardown_covers_everything_provisioning_created() {
    let session = allocate("10.0.0.0/24".parse().unwrap(), &requests(&["solo/3"])).unwrap();
    let plan = &session.hosts["solo"];
    let script = render_script(&teardown_plan(plan));
    assert!(script.contains("ovs-vsctl del-br vc_br0"));
    for instance in &plan.instances {
        assert!(script.contains(&format!("ip netns delete {}", instance.namespace)));
    }
}

#[test]
fn unresolved_session_cannot_be_provisioned() {
    let session = allocate(
        "10.0.0.0/24".parse().unwrap(),
        &requests(&["alpha/1", "beta/1"]),
    )
    .unwrap();
    // Peers exist but were never resolved
    assert!(provision_plan(&session.hosts["alpha"]).is_err());
}
