//! Session reconciliation
//!
//! Compares each instance's desired `running` flag against the observed
//! liveness of its namespace and issues start/stop actions to converge.
//! The endpoint registry handed to newly started processes is computed
//! once per pass from the desired state, so instances started in the same
//! pass already see each other.
//!
//! A failed host is recorded and skipped; the remaining hosts still get
//! their pass. Nothing is rolled back: re-invoking reconciliation is the
//! recovery path, and a pass over an already-converged session issues no
//! actions.

use crate::exec::{ExecError, Executor, ExecutorFactory};
use crate::hosts::HostGroups;
use crate::plan::{render_script, teardown_plan};
use crate::session::Session;
use crate::ClusterError;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Fixed service port every instance binds to.
pub const DEFAULT_SERVICE_PORT: u16 = 3000;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Failed to read binary {path}: {source}")]
    Binary {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to encode endpoint registry: {0}")]
    Registry(#[from] serde_json::Error),
}

/// Whether a process is currently active inside an instance's namespace.
#[async_trait]
pub trait Liveness: Send + Sync {
    async fn is_running(&self, exec: &dyn Executor, namespace: &str) -> Result<bool, ExecError>;
}

/// Probe based on `ip netns pids`: a namespace with any pid in it counts
/// as running.
pub struct PidLiveness;

#[async_trait]
impl Liveness for PidLiveness {
    async fn is_running(&self, exec: &dyn Executor, namespace: &str) -> Result<bool, ExecError> {
        let output = exec
            .query(&format!("ip netns pids {namespace} 2>/dev/null || true"))
            .await?;
        Ok(!output.trim().is_empty())
    }
}

/// The process to launch for instances that need starting.
#[derive(Clone, Debug)]
pub struct LaunchSpec {
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub service_port: u16,
}

impl LaunchSpec {
    pub fn new(binary: PathBuf) -> Self {
        Self {
            binary,
            args: Vec::new(),
            service_port: DEFAULT_SERVICE_PORT,
        }
    }

    /// Content-addressed remote path: the same binary always lands at the
    /// same place, so copies are skippable and stale processes are
    /// distinguishable by path.
    pub fn remote_path(&self) -> Result<String, ReconcileError> {
        let bytes = std::fs::read(&self.binary).map_err(|source| ReconcileError::Binary {
            path: self.binary.display().to_string(),
            source,
        })?;
        let digest = Sha256::digest(&bytes);
        Ok(format!("/tmp/{digest:x}"))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Start {
        host: String,
        namespace: String,
        address: Ipv4Addr,
    },
    Stop {
        host: String,
        namespace: String,
    },
}

#[derive(Debug)]
pub struct HostFailure {
    pub host: String,
    pub error: ClusterError,
}

/// What one reconciliation pass did. Failures are per host; any failure
/// marks the overall pass failed while the other hosts' work stands.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub actions: Vec<Action>,
    pub failures: Vec<HostFailure>,
}

impl ReconcileReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// The membership list newly started instances read: `address:port` for
/// every instance that will be running once this pass converges.
pub fn endpoint_registry(session: &Session, port: u16) -> Vec<String> {
    let mut endpoints = Vec::new();
    for plan in session.hosts.values() {
        for instance in &plan.instances {
            if instance.running {
                endpoints.push(format!("{}:{}", instance.iface.ip(), port));
            }
        }
    }
    endpoints
}

struct LaunchCtx {
    binary: PathBuf,
    remote_path: String,
    registry_json: String,
    args: String,
    port: u16,
}

/// One reconciliation pass toward the session's desired state.
pub async fn apply(
    session: &Session,
    liveness: &dyn Liveness,
    factory: &dyn ExecutorFactory,
    launch: &LaunchSpec,
) -> Result<ReconcileReport, ReconcileError> {
    let registry = endpoint_registry(session, launch.service_port);
    let ctx = LaunchCtx {
        binary: launch.binary.clone(),
        remote_path: launch.remote_path()?,
        registry_json: serde_json::to_string(&registry)?,
        args: launch.args.join(" "),
        port: launch.service_port,
    };
    debug!("Registry has {} endpoints", registry.len());
    Ok(run_pass(session, liveness, factory, Some(&ctx)).await)
}

/// Stop every instance: flip desired state to stopped and run one pass.
pub async fn stop(
    session: &mut Session,
    liveness: &dyn Liveness,
    factory: &dyn ExecutorFactory,
) -> ReconcileReport {
    session.set_all_running(false);
    run_pass(session, liveness, factory, None).await
}

/// Stop everything, then tear down bridges, namespaces, and tunnels.
pub async fn reset(
    session: &mut Session,
    liveness: &dyn Liveness,
    factory: &dyn ExecutorFactory,
) -> ReconcileReport {
    let mut report = stop(session, liveness, factory).await;
    for (host, plan) in &session.hosts {
        let script = render_script(&teardown_plan(plan));
        let result = async {
            let exec = factory.executor(host)?;
            exec.run(&script).await?;
            Ok::<(), ClusterError>(())
        }
        .await;
        if let Err(error) = result {
            warn!("Teardown failed on {host}: {error}");
            report.failures.push(HostFailure {
                host: host.clone(),
                error,
            });
        } else {
            info!("Tore down virtual topology on {host}");
        }
    }
    report
}

/// Run a command inside every instance namespace, host by host in sorted
/// order. An optional host-group selector restricts the run to matching
/// instance ordinals; failures are collected per host, as in reconciliation.
pub async fn run_in_instances(
    session: &Session,
    factory: &dyn ExecutorFactory,
    command: &str,
    selector: Option<&HostGroups>,
) -> Vec<HostFailure> {
    let mut failures = Vec::new();
    for (host, plan) in &session.hosts {
        let result = async {
            let exec = factory.executor(host)?;
            for (index, instance) in plan.instances.iter().enumerate() {
                if let Some(groups) = selector {
                    if !groups.contains(host, index as u32) {
                        continue;
                    }
                }
                exec.run(&format!("ip netns exec {} {command}", instance.namespace))
                    .await?;
            }
            Ok::<(), ClusterError>(())
        }
        .await;
        if let Err(error) = result {
            warn!("Command run failed on {host}: {error}");
            failures.push(HostFailure {
                host: host.clone(),
                error,
            });
        }
    }
    failures
}

async fn run_pass(
    session: &Session,
    liveness: &dyn Liveness,
    factory: &dyn ExecutorFactory,
    ctx: Option<&LaunchCtx>,
) -> ReconcileReport {
    let mut report = ReconcileReport::default();
    for (host, plan) in &session.hosts {
        match reconcile_host(host, plan, liveness, factory, ctx).await {
            Ok(actions) => report.actions.extend(actions),
            Err(error) => {
                warn!("Reconciliation failed on {host}: {error}");
                report.failures.push(HostFailure {
                    host: host.clone(),
                    error,
                });
            }
        }
    }
    info!(
        "Reconciliation pass: {} actions, {} host failures",
        report.actions.len(),
        report.failures.len()
    );
    report
}

async fn reconcile_host(
    host: &str,
    plan: &crate::session::HostPlan,
    liveness: &dyn Liveness,
    factory: &dyn ExecutorFactory,
    ctx: Option<&LaunchCtx>,
) -> Result<Vec<Action>, ClusterError> {
    let exec = factory.executor(host)?;
    let mut to_stop = Vec::new();
    let mut to_start = Vec::new();
    for instance in &plan.instances {
        let observed = liveness.is_running(exec.as_ref(), &instance.namespace).await?;
        match (instance.running, observed) {
            (false, true) => to_stop.push(instance),
            (true, false) => to_start.push(instance),
            // Already converged
            _ => {}
        }
    }

    let mut actions = Vec::new();
    for instance in to_stop {
        exec.run(&stop_script(&instance.namespace)).await?;
        actions.push(Action::Stop {
            host: host.to_string(),
            namespace: instance.namespace.clone(),
        });
    }

    if !to_start.is_empty() {
        // Starts without a launch context cannot happen: stop/reset flip
        // every desired flag to stopped before running their pass.
        if let Some(ctx) = ctx {
            publish(exec.as_ref(), ctx).await?;
            for instance in to_start {
                exec.run(&start_script(ctx, instance)).await?;
                actions.push(Action::Start {
                    host: host.to_string(),
                    namespace: instance.namespace.clone(),
                    address: instance.iface.ip(),
                });
            }
        }
    }
    Ok(actions)
}

/// Push the binary and the registry file to a host, before any of its
/// instances are started.
async fn publish(exec: &dyn Executor, ctx: &LaunchCtx) -> Result<(), ExecError> {
    exec.copy(&ctx.binary, &ctx.remote_path).await?;
    exec.run(&format!(
        "echo '{}' > {}.hosts.json\nchmod +x {}\n",
        ctx.registry_json, ctx.remote_path, ctx.remote_path
    ))
    .await?;
    Ok(())
}

fn stop_script(namespace: &str) -> String {
    format!(
        "pids=$(ip netns pids {namespace} 2>/dev/null)\n\
         [ -n \"$pids\" ] && kill -9 $pids || true\n"
    )
}

fn start_script(ctx: &LaunchCtx, instance: &crate::session::Instance) -> String {
    let ip = instance.iface.ip();
    let args = if ctx.args.is_empty() {
        String::new()
    } else {
        format!("{} ", ctx.args)
    };
    format!(
        "ip netns exec {ns} nohup {bin} {args}-hosts {bin}.hosts.json --listen {ip}:{port} \
         > /tmp/{ip}.out 2> /tmp/{ip}.err < /dev/null &\n",
        ns = instance.namespace,
        bin = ctx.remote_path,
        args = args,
        ip = ip,
        port = ctx.port,
    )
}
