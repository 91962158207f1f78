//! Virtual cluster CLI
//!
//! Thin command-line surface over the vcluster library: allocate a session
//! document, provision/tear down the virtual topology it describes,
//! reconcile the processes inside it, and shape traffic between named
//! service ports on the local machine.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ipnetwork::Ipv4Network;
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::Level;
use vcluster::exec::{executor_for, ExecOptions, TransportFactory};
use vcluster::graph::LsofInspector;
use vcluster::plan::{
    install_script, provision_plan, render_script, shape_hosts_script, shape_script,
    unshape_script,
};
use vcluster::reconcile::{self, LaunchSpec, PidLiveness, DEFAULT_SERVICE_PORT};
use vcluster::resolve::DnsResolver;
use vcluster::{
    allocate, build_graph, select_flows, select_host_flows, HostGroups, HostRequest,
    PortGroups, Session,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Print every script sent to a host and its output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Do not run scripts with side effects (queries still run)
    #[arg(short, long, global = true)]
    dry_run: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Allocate a new session document for a network block
    New {
        /// CIDR block to allocate from (e.g. 10.0.0.0/24)
        network: Ipv4Network,

        /// Host/count requests (e.g. node-a/3 node-b/2)
        #[arg(required = true)]
        requests: Vec<String>,

        /// Write the session document here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Provision bridges, namespaces, and tunnels on every host
    Prepare {
        /// Session document path
        session: PathBuf,

        /// Skip installing openvswitch on the hosts
        #[arg(long)]
        skip_install: bool,
    },

    /// Reconcile running processes toward the session's desired state
    Apply {
        /// Session document path
        session: PathBuf,

        /// Binary to launch in instances that need starting
        binary: PathBuf,

        /// Service port every instance binds to
        #[arg(long, default_value_t = DEFAULT_SERVICE_PORT)]
        port: u16,

        /// Extra arguments passed to the launched binary
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Stop every instance (desired state becomes stopped)
    Stop {
        /// Session document path
        session: PathBuf,
    },

    /// Stop everything and tear down the virtual topology
    Reset {
        /// Session document path
        session: PathBuf,
    },

    /// Shape traffic between port groups on the local machine
    Shape {
        /// Netem condition descriptor (e.g. "delay 100ms loss 1%")
        condition: String,

        /// Port groups, comma-separated within a group (at least two)
        #[arg(required = true, num_args = 2..)]
        groups: Vec<String>,
    },

    /// Shape traffic between host groups on each host's interface
    ShapeHosts {
        /// Netem condition descriptor (e.g. "delay 100ms loss 1%")
        condition: String,

        /// Host groups, comma-separated within a group (range syntax
        /// host[start:stop] allowed)
        #[arg(required = true)]
        groups: Vec<String>,

        /// Remove host shaping from every named host instead
        #[arg(long)]
        heal: bool,

        /// Interface to shape on each host
        #[arg(long, default_value = "eth0")]
        device: String,
    },

    /// Remove local traffic shaping
    Unshape,

    /// Run a command inside every instance namespace
    Run {
        /// Session document path
        session: PathBuf,

        /// Restrict to instances in this host group (e.g. 'node-a[0:2]')
        #[arg(short, long)]
        group: Option<String>,

        /// Command to run
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Print the live connection graph for a set of ports
    Graph {
        /// Ports of interest
        #[arg(required = true)]
        ports: Vec<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    let opts = ExecOptions {
        verbose: cli.verbose,
        dry_run: cli.dry_run,
    };

    match cli.command {
        Commands::New {
            network,
            requests,
            output,
        } => cmd_new(network, &requests, output),
        Commands::Prepare {
            session,
            skip_install,
        } => cmd_prepare(&session, skip_install, opts).await,
        Commands::Apply {
            session,
            binary,
            port,
            args,
        } => cmd_apply(&session, binary, port, args, opts).await,
        Commands::Stop { session } => cmd_stop(&session, opts).await,
        Commands::Reset { session } => cmd_reset(&session, opts).await,
        Commands::Shape { condition, groups } => cmd_shape(&condition, &groups, opts).await,
        Commands::ShapeHosts {
            condition,
            groups,
            heal,
            device,
        } => cmd_shape_hosts(&condition, &groups, heal, &device, opts).await,
        Commands::Unshape => cmd_unshape(opts).await,
        Commands::Run {
            session,
            group,
            command,
        } => cmd_run(&session, group, &command, opts).await,
        Commands::Graph { ports } => cmd_graph(&ports, opts).await,
    }
}

fn cmd_new(network: Ipv4Network, requests: &[String], output: Option<PathBuf>) -> Result<()> {
    let requests = requests
        .iter()
        .map(|r| HostRequest::parse(r))
        .collect::<Result<Vec<_>, _>>()?;
    let session = allocate(network, &requests)?;
    let text = session.to_json()?;
    match output {
        Some(path) => {
            std::fs::write(&path, &text)
                .with_context(|| format!("writing session to {}", path.display()))?;
            println!("Session written to {}", path.display());
        }
        None => println!("{text}"),
    }
    Ok(())
}

async fn cmd_prepare(path: &PathBuf, skip_install: bool, opts: ExecOptions) -> Result<()> {
    let mut session = Session::load(path)?;
    session.resolve_peers(&DnsResolver)?;

    let mut failures = Vec::new();
    for (host, plan) in &session.hosts {
        let result = async {
            let exec = executor_for(host, opts, &DnsResolver)?;
            if !skip_install {
                exec.run(&install_script()).await?;
            }
            let script = render_script(&provision_plan(plan)?);
            exec.run(&script).await?;
            Ok::<(), vcluster::ClusterError>(())
        }
        .await;
        match result {
            Ok(()) => println!("Prepared {host}"),
            Err(e) => failures.push(format!("{host}: {e}")),
        }
    }
    if !failures.is_empty() {
        bail!("prepare failed on {} host(s):\n{}", failures.len(), failures.join("\n"));
    }
    Ok(())
}

async fn cmd_apply(
    path: &PathBuf,
    binary: PathBuf,
    port: u16,
    args: Vec<String>,
    opts: ExecOptions,
) -> Result<()> {
    let session = Session::load(path)?;
    let factory = TransportFactory {
        opts,
        resolver: Box::new(DnsResolver),
    };
    let launch = LaunchSpec {
        binary,
        args,
        service_port: port,
    };
    let report = reconcile::apply(&session, &PidLiveness, &factory, &launch).await?;
    print_report(&report)
}

async fn cmd_stop(path: &PathBuf, opts: ExecOptions) -> Result<()> {
    let mut session = Session::load(path)?;
    let factory = TransportFactory {
        opts,
        resolver: Box::new(DnsResolver),
    };
    let report = reconcile::stop(&mut session, &PidLiveness, &factory).await;
    if !opts.dry_run {
        session.save(path)?;
    }
    print_report(&report)
}

async fn cmd_reset(path: &PathBuf, opts: ExecOptions) -> Result<()> {
    let mut session = Session::load(path)?;
    let factory = TransportFactory {
        opts,
        resolver: Box::new(DnsResolver),
    };
    let report = reconcile::reset(&mut session, &PidLiveness, &factory).await;
    if !opts.dry_run {
        session.save(path)?;
    }
    print_report(&report)
}

fn print_report(report: &reconcile::ReconcileReport) -> Result<()> {
    for action in &report.actions {
        match action {
            reconcile::Action::Start {
                host,
                namespace,
                address,
            } => println!("started {namespace} ({address}) on {host}"),
            reconcile::Action::Stop { host, namespace } => {
                println!("stopped {namespace} on {host}")
            }
        }
    }
    if !report.is_success() {
        let hosts: Vec<String> = report
            .failures
            .iter()
            .map(|f| format!("{}: {}", f.host, f.error))
            .collect();
        bail!(
            "reconciliation failed on {} host(s):\n{}",
            report.failures.len(),
            hosts.join("\n")
        );
    }
    Ok(())
}

async fn cmd_shape(condition: &str, groups: &[String], opts: ExecOptions) -> Result<()> {
    let groups = PortGroups::parse(groups)?;
    let ports: BTreeSet<u16> = groups.all_ports().collect();
    let exec = executor_for("localhost", opts, &DnsResolver)?;
    let inspector = LsofInspector::new(exec.as_ref());
    let graph = build_graph(&inspector, &ports).await?;
    let pairs = select_flows(&groups, &graph);
    if pairs.is_empty() {
        println!("No flows between the given port groups right now");
    }
    exec.run(&shape_script("lo", &pairs, condition)).await?;
    println!("Shaping {} flow pair(s)", pairs.len());
    Ok(())
}

async fn cmd_shape_hosts(
    condition: &str,
    groups: &[String],
    heal: bool,
    device: &str,
    opts: ExecOptions,
) -> Result<()> {
    let groups = HostGroups::parse(groups)?;
    let mut failures = Vec::new();
    if heal {
        for host in groups.hosts() {
            let result = async {
                let exec = executor_for(host, opts, &DnsResolver)?;
                exec.run(&unshape_script(device)).await?;
                Ok::<(), vcluster::ClusterError>(())
            }
            .await;
            match result {
                Ok(()) => println!("Healed {host}"),
                Err(e) => failures.push(format!("{host}: {e}")),
            }
        }
    } else {
        let flows = select_host_flows(&groups, &DnsResolver)?;
        if flows.is_empty() {
            println!("No cross-group host pairs to shape");
        }
        for (host, peers) in &flows {
            let result = async {
                let exec = executor_for(host, opts, &DnsResolver)?;
                exec.run(&shape_hosts_script(device, peers, condition)).await?;
                Ok::<(), vcluster::ClusterError>(())
            }
            .await;
            match result {
                Ok(()) => println!("Shaping {} peer(s) from {host}", peers.len()),
                Err(e) => failures.push(format!("{host}: {e}")),
            }
        }
    }
    if !failures.is_empty() {
        bail!(
            "host shaping failed on {} host(s):\n{}",
            failures.len(),
            failures.join("\n")
        );
    }
    Ok(())
}

async fn cmd_run(
    path: &PathBuf,
    group: Option<String>,
    command: &[String],
    opts: ExecOptions,
) -> Result<()> {
    let session = Session::load(path)?;
    let selector = group.map(|g| HostGroups::parse(&[g])).transpose()?;
    let factory = TransportFactory {
        opts,
        resolver: Box::new(DnsResolver),
    };
    let failures =
        reconcile::run_in_instances(&session, &factory, &command.join(" "), selector.as_ref())
            .await;
    if !failures.is_empty() {
        let hosts: Vec<String> = failures
            .iter()
            .map(|f| format!("{}: {}", f.host, f.error))
            .collect();
        bail!(
            "command failed on {} host(s):\n{}",
            failures.len(),
            hosts.join("\n")
        );
    }
    Ok(())
}

async fn cmd_unshape(opts: ExecOptions) -> Result<()> {
    let exec = executor_for("localhost", opts, &DnsResolver)?;
    exec.run(&unshape_script("lo")).await?;
    Ok(())
}

async fn cmd_graph(ports: &[u16], opts: ExecOptions) -> Result<()> {
    let port_set: BTreeSet<u16> = ports.iter().copied().collect();
    let exec = executor_for("localhost", opts, &DnsResolver)?;
    let inspector = LsofInspector::new(exec.as_ref());
    let graph = build_graph(&inspector, &port_set).await?;
    if graph.is_empty() {
        println!("No flows between the given ports");
    }
    for ((listen, peer), ephemerals) in &graph {
        println!("{listen} -> {peer}: {ephemerals:?}");
    }
    Ok(())
}
