//! Reconciliation integration tests
//!
//! These drive full apply/stop/reset passes against an in-memory cluster
//! fake: the executor mutates a shared running-set the way the real
//! scripts would, so convergence and idempotence are observable without
//! namespaces or privileges.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use vcluster::exec::{ExecError, Executor, ExecutorFactory};
use vcluster::reconcile::{self, Action, LaunchSpec, Liveness};
use vcluster::resolve::ResolveError;
use vcluster::{allocate, HostGroups, HostRequest, Session};

#[derive(Default)]
struct ClusterState {
    /// (host, namespace) pairs with a live process
    running: BTreeSet<(String, String)>,
    /// Every side-effecting script, in execution order
    scripts: Vec<(String, String)>,
    copies: Vec<(String, String)>,
    fail_hosts: BTreeSet<String>,
}

/// Shared fake cluster: liveness probe, executor factory, and the
/// "hardware" all in one.
#[derive(Clone, Default)]
struct FakeCluster(Arc<Mutex<ClusterState>>);

impl FakeCluster {
    fn is_live(&self, host: &str, namespace: &str) -> bool {
        self.0
            .lock()
            .unwrap()
            .running
            .contains(&(host.to_string(), namespace.to_string()))
    }

    fn set_live(&self, host: &str, namespace: &str) {
        self.0
            .lock()
            .unwrap()
            .running
            .insert((host.to_string(), namespace.to_string()));
    }

    fn fail_host(&self, host: &str) {
        self.0.lock().unwrap().fail_hosts.insert(host.to_string());
    }

    fn scripts_for(&self, host: &str) -> Vec<String> {
        self.0
            .lock()
            .unwrap()
            .scripts
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, s)| s.clone())
            .collect()
    }
}

struct FakeExecutor {
    host: String,
    state: Arc<Mutex<ClusterState>>,
}

fn namespace_after<'a>(script: &'a str, prefix: &str) -> Option<&'a str> {
    let idx = script.find(prefix)? + prefix.len();
    script[idx..].split_whitespace().next()
}

#[async_trait]
impl Executor for FakeExecutor {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, script: &str) -> Result<String, ExecError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_hosts.contains(&self.host) {
            return Err(ExecError::Failed {
                host: self.host.clone(),
                code: Some(1),
                stderr: "injected failure".to_string(),
            });
        }
        state.scripts.push((self.host.clone(), script.to_string()));
        // Mimic what the real scripts do to process state
        if script.contains("nohup") {
            if let Some(ns) = namespace_after(script, "ip netns exec ") {
                state.running.insert((self.host.clone(), ns.to_string()));
            }
        } else if script.contains("kill -9") {
            if let Some(ns) = namespace_after(script, "ip netns pids ") {
                state.running.remove(&(self.host.clone(), ns.to_string()));
            }
        }
        Ok(String::new())
    }

    async fn query(&self, _script: &str) -> Result<String, ExecError> {
        Ok(String::new())
    }

    async fn copy(&self, _local: &Path, remote: &str) -> Result<(), ExecError> {
        self.state
            .lock()
            .unwrap()
            .copies
            .push((self.host.clone(), remote.to_string()));
        Ok(())
    }
}

#[async_trait]
impl Liveness for FakeCluster {
    async fn is_running(&self, exec: &dyn Executor, namespace: &str) -> Result<bool, ExecError> {
        Ok(self.is_live(exec.host(), namespace))
    }
}

impl ExecutorFactory for FakeCluster {
    fn executor(&self, host: &str) -> Result<Box<dyn Executor>, ResolveError> {
        Ok(Box::new(FakeExecutor {
            host: host.to_string(),
            state: self.0.clone(),
        }))
    }
}

fn test_session() -> Session {
    let requests = vec![
        HostRequest::parse("a/2").unwrap(),
        HostRequest::parse("b/1").unwrap(),
    ];
    allocate("10.0.0.0/24".parse().unwrap(), &requests).unwrap()
}

fn launch_spec() -> (tempfile::NamedTempFile, LaunchSpec) {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"#!/bin/sh\nexit 0\n").unwrap();
    let spec = LaunchSpec::new(file.path().to_path_buf());
    (file, spec)
}

#[tokio::test]
async fn apply_converges_in_one_pass() {
    let session = test_session();
    let cluster = FakeCluster::default();
    let (_file, spec) = launch_spec();

    let report = reconcile::apply(&session, &cluster, &cluster, &spec)
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.actions.len(), 3);
    for (host, plan) in &session.hosts {
        for instance in &plan.instances {
            assert_eq!(
                cluster.is_live(host, &instance.namespace),
                instance.running,
                "{host}/{} should match desired state",
                instance.namespace
            );
        }
    }
}

#[tokio::test]
async fn second_pass_is_a_no_op() {
    let session = test_session();
    let cluster = FakeCluster::default();
    let (_file, spec) = launch_spec();

    let first = reconcile::apply(&session, &cluster, &cluster, &spec)
        .await
        .unwrap();
    assert_eq!(first.actions.len(), 3);

    let second = reconcile::apply(&session, &cluster, &cluster, &spec)
        .await
        .unwrap();
    assert!(second.is_success());
    assert!(second.actions.is_empty(), "converged session must be a no-op");
}

#[tokio::test]
async fn registry_is_published_before_any_start() {
    let session = test_session();
    let cluster = FakeCluster::default();
    let (_file, spec) = launch_spec();

    reconcile::apply(&session, &cluster, &cluster, &spec)
        .await
        .unwrap();

    for host in ["a", "b"] {
        let scripts = cluster.scripts_for(host);
        let publish = scripts.iter().position(|s| s.contains("hosts.json") && s.contains("echo"));
        let start = scripts.iter().position(|s| s.contains("nohup"));
        let (publish, start) = (publish.unwrap(), start.unwrap());
        assert!(publish < start, "registry must land on {host} before starts");
    }

    // The binary itself was copied to a content-addressed path on each host
    let copies = cluster.0.lock().unwrap().copies.clone();
    assert_eq!(copies.len(), 2);
    assert!(copies.iter().all(|(_, remote)| remote.starts_with("/tmp/")));
}

#[tokio::test]
async fn registry_includes_siblings_started_in_same_pass() {
    let session = test_session();
    let cluster = FakeCluster::default();
    let (_file, spec) = launch_spec();

    reconcile::apply(&session, &cluster, &cluster, &spec)
        .await
        .unwrap();

    // Nothing was running before the pass, yet every host's registry file
    // names all three endpoints of the desired state.
    for host in ["a", "b"] {
        let scripts = cluster.scripts_for(host);
        let publish = scripts
            .iter()
            .find(|s| s.contains("hosts.json") && s.contains("echo"))
            .unwrap();
        for endpoint in ["10.0.0.1:3000", "10.0.0.2:3000", "10.0.0.3:3000"] {
            assert!(publish.contains(endpoint), "{host} registry missing {endpoint}");
        }
    }
}

#[tokio::test]
async fn mixed_desired_state_starts_and_stops() {
    let mut session = test_session();
    let cluster = FakeCluster::default();
    let (_file, spec) = launch_spec();

    // a/vc_ns0 should stop, a/vc_ns1 should start, b/vc_ns0 is converged
    session.hosts.get_mut("a").unwrap().instances[0].running = false;
    cluster.set_live("a", "vc_ns0");
    cluster.set_live("b", "vc_ns0");

    let report = reconcile::apply(&session, &cluster, &cluster, &spec)
        .await
        .unwrap();

    assert_eq!(report.actions.len(), 2);
    assert!(report.actions.contains(&Action::Stop {
        host: "a".to_string(),
        namespace: "vc_ns0".to_string(),
    }));
    assert!(matches!(
        report
            .actions
            .iter()
            .find(|a| matches!(a, Action::Start { .. })),
        Some(Action::Start { host, namespace, .. }) if host == "a" && namespace == "vc_ns1"
    ));
    assert!(!cluster.is_live("a", "vc_ns0"));
    assert!(cluster.is_live("a", "vc_ns1"));
}

#[tokio::test]
async fn failed_host_does_not_halt_the_pass() {
    let session = test_session();
    let cluster = FakeCluster::default();
    let (_file, spec) = launch_spec();
    cluster.fail_host("a");

    let report = reconcile::apply(&session, &cluster, &cluster, &spec)
        .await
        .unwrap();

    assert!(!report.is_success());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].host, "a");
    // b still converged
    assert!(cluster.is_live("b", "vc_ns0"));

    // Re-invocation after clearing the fault finishes the job
    cluster.0.lock().unwrap().fail_hosts.clear();
    let retry = reconcile::apply(&session, &cluster, &cluster, &spec)
        .await
        .unwrap();
    assert!(retry.is_success());
    assert!(cluster.is_live("a", "vc_ns0"));
    assert!(cluster.is_live("a", "vc_ns1"));
}

#[tokio::test]
async fn stop_flips_desired_state_and_kills_everything() {
    let mut session = test_session();
    let cluster = FakeCluster::default();
    for (host, plan) in &session.hosts {
        for instance in &plan.instances {
            cluster.set_live(host, &instance.namespace);
        }
    }

    let report = reconcile::stop(&mut session, &cluster, &cluster).await;
    assert!(report.is_success());
    assert_eq!(report.actions.len(), 3);
    assert!(session.hosts.values().all(|p| p.instances.iter().all(|i| !i.running)));
    assert!(cluster.0.lock().unwrap().running.is_empty());

    let again = reconcile::stop(&mut session, &cluster, &cluster).await;
    assert!(again.actions.is_empty());
}

#[tokio::test]
async fn run_reaches_every_instance_namespace() {
    let session = test_session();
    let cluster = FakeCluster::default();

    let failures = reconcile::run_in_instances(&session, &cluster, "hostname", None).await;
    assert!(failures.is_empty());
    assert_eq!(
        cluster.scripts_for("a"),
        vec![
            "ip netns exec vc_ns0 hostname",
            "ip netns exec vc_ns1 hostname"
        ]
    );
    assert_eq!(
        cluster.scripts_for("b"),
        vec!["ip netns exec vc_ns0 hostname"]
    );
}

#[tokio::test]
async fn run_group_selector_limits_instances() {
    let session = test_session();
    let cluster = FakeCluster::default();

    let groups = HostGroups::parse(&["a[1]".to_string()]).unwrap();
    let failures =
        reconcile::run_in_instances(&session, &cluster, "ip addr", Some(&groups)).await;
    assert!(failures.is_empty());
    assert_eq!(cluster.scripts_for("a"), vec!["ip netns exec vc_ns1 ip addr"]);
    assert!(cluster.scripts_for("b").is_empty());
}

#[tokio::test]
async fn run_collects_per_host_failures() {
    let session = test_session();
    let cluster = FakeCluster::default();
    cluster.fail_host("a");

    let failures = reconcile::run_in_instances(&session, &cluster, "true", None).await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].host, "a");
    // b still ran the command
    assert_eq!(cluster.scripts_for("b"), vec!["ip netns exec vc_ns0 true"]);
}

#[tokio::test]
async fn reset_tears_down_the_topology() {
    let mut session = test_session();
    let cluster = FakeCluster::default();
    cluster.set_live("a", "vc_ns0");

    let report = reconcile::reset(&mut session, &cluster, &cluster).await;
    assert!(report.is_success());

    for host in ["a", "b"] {
        let scripts = cluster.scripts_for(host);
        assert!(
            scripts.iter().any(|s| s.contains("ovs-vsctl del-br vc_br0")),
            "teardown must delete the bridge on {host}"
        );
        assert!(scripts.iter().any(|s| s.contains("ip netns delete")));
    }
}
