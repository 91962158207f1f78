//! Script execution transport
//!
//! Everything effectful in this crate goes through the `Executor` trait:
//! run a script (side effects), query (read-only), or copy a file. The
//! local implementation shells out through `bash`, the remote one through
//! `ssh`/`scp`. Dry-run mode suppresses side-effecting scripts but still
//! performs queries; verbose mode surfaces every command and its output.
//!
//! A single failed command fails the surrounding operation; there is no
//! retry policy here, callers re-invoke idempotently instead.

use crate::resolve::{ResolveError, Resolver};
use async_trait::async_trait;
use std::future::Future;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Upper bound on any single remote call, so an unreachable host fails the
/// operation instead of blocking it forever.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Failed to spawn command on {host}: {source}")]
    Spawn {
        host: String,
        source: std::io::Error,
    },

    #[error("Command on {host} exited with code {code:?}: {stderr}")]
    Failed {
        host: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Command on {host} timed out after {seconds}s")]
    Timeout { host: String, seconds: u64 },

    #[error("Failed to copy {local} to {host}:{remote}: {reason}")]
    Copy {
        host: String,
        local: String,
        remote: String,
        reason: String,
    },
}

/// Execution behavior flags, threaded explicitly through every operation.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExecOptions {
    /// Surface every script and its output
    pub verbose: bool,
    /// Suppress side-effecting scripts; queries still run
    pub dry_run: bool,
}

#[async_trait]
pub trait Executor: Send + Sync {
    fn host(&self) -> &str;

    /// Run a side-effecting script. Suppressed in dry-run mode.
    async fn run(&self, script: &str) -> Result<String, ExecError>;

    /// Run a read-only script. Executes even in dry-run mode.
    async fn query(&self, script: &str) -> Result<String, ExecError>;

    /// Copy a local file to the target host. Suppressed in dry-run mode.
    async fn copy(&self, local: &Path, remote: &str) -> Result<(), ExecError>;
}

/// Hands out a transport for each host a pass touches.
pub trait ExecutorFactory: Send + Sync {
    fn executor(&self, host: &str) -> Result<Box<dyn Executor>, ResolveError>;
}

/// Factory dispatching on resolution: loopback hosts run locally, anything
/// else goes over ssh.
pub struct TransportFactory {
    pub opts: ExecOptions,
    pub resolver: Box<dyn Resolver>,
}

impl ExecutorFactory for TransportFactory {
    fn executor(&self, host: &str) -> Result<Box<dyn Executor>, ResolveError> {
        executor_for(host, self.opts, self.resolver.as_ref())
    }
}

/// Pick the right transport for a host: loopback targets run locally,
/// anything else goes over ssh.
pub fn executor_for(
    host: &str,
    opts: ExecOptions,
    resolver: &dyn Resolver,
) -> Result<Box<dyn Executor>, ResolveError> {
    let ip = resolver.resolve(host)?;
    if ip.is_loopback() {
        Ok(Box::new(LocalExecutor::new(host, opts)))
    } else {
        Ok(Box::new(SshExecutor::new(host, opts)))
    }
}

fn log_script(host: &str, script: &str, query: bool, verbose: bool) {
    if !verbose {
        return;
    }
    info!("{}$ {}", host, if query { "(query)" } else { "" });
    for line in script.lines().filter(|l| !l.trim().is_empty()) {
        info!("\t{line}");
    }
}

async fn with_timeout<F, T>(host: &str, fut: F) -> Result<T, ExecError>
where
    F: Future<Output = Result<T, ExecError>>,
{
    tokio::time::timeout(COMMAND_TIMEOUT, fut)
        .await
        .map_err(|_| ExecError::Timeout {
            host: host.to_string(),
            seconds: COMMAND_TIMEOUT.as_secs(),
        })?
}

fn check_output(
    host: &str,
    output: std::process::Output,
    verbose: bool,
) -> Result<String, ExecError> {
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    if !stderr.is_empty() {
        warn!("{host}: {}", stderr.trim_end());
    }
    if !output.status.success() {
        return Err(ExecError::Failed {
            host: host.to_string(),
            code: output.status.code(),
            stderr,
        });
    }
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if verbose && !stdout.is_empty() {
        for line in stdout.lines() {
            info!("{host}> {line}");
        }
    }
    Ok(stdout)
}

/// Executor for the machine we are running on.
pub struct LocalExecutor {
    host: String,
    opts: ExecOptions,
}

impl LocalExecutor {
    pub fn new(host: &str, opts: ExecOptions) -> Self {
        Self {
            host: host.to_string(),
            opts,
        }
    }

    async fn exec(&self, script: &str, side_effects: bool) -> Result<String, ExecError> {
        log_script(&self.host, script, !side_effects, self.opts.verbose);
        if self.opts.dry_run && side_effects {
            debug!("dry-run: skipping script on {}", self.host);
            return Ok(String::new());
        }
        let output = with_timeout(&self.host, async {
            Command::new("bash")
                .arg("-c")
                .arg(script)
                .output()
                .await
                .map_err(|source| ExecError::Spawn {
                    host: self.host.clone(),
                    source,
                })
        })
        .await?;
        check_output(&self.host, output, self.opts.verbose)
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, script: &str) -> Result<String, ExecError> {
        self.exec(script, true).await
    }

    async fn query(&self, script: &str) -> Result<String, ExecError> {
        self.exec(script, false).await
    }

    async fn copy(&self, local: &Path, remote: &str) -> Result<(), ExecError> {
        if self.opts.verbose {
            info!("{}$ copy {} -> {}", self.host, local.display(), remote);
        }
        if self.opts.dry_run {
            return Ok(());
        }
        tokio::fs::copy(local, remote)
            .await
            .map_err(|e| ExecError::Copy {
                host: self.host.clone(),
                local: local.display().to_string(),
                remote: remote.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

/// Executor for remote hosts, over ssh with the script on stdin.
pub struct SshExecutor {
    host: String,
    opts: ExecOptions,
}

impl SshExecutor {
    pub fn new(host: &str, opts: ExecOptions) -> Self {
        Self {
            host: host.to_string(),
            opts,
        }
    }

    async fn exec(&self, script: &str, side_effects: bool) -> Result<String, ExecError> {
        log_script(&self.host, script, !side_effects, self.opts.verbose);
        if self.opts.dry_run && side_effects {
            debug!("dry-run: skipping script on {}", self.host);
            return Ok(String::new());
        }
        let output = with_timeout(&self.host, async {
            let mut child = Command::new("ssh")
                .arg("-o")
                .arg("BatchMode=yes")
                .arg(&self.host)
                .arg("bash")
                .arg("-s")
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|source| ExecError::Spawn {
                    host: self.host.clone(),
                    source,
                })?;
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(script.as_bytes())
                    .await
                    .map_err(|source| ExecError::Spawn {
                        host: self.host.clone(),
                        source,
                    })?;
            }
            child
                .wait_with_output()
                .await
                .map_err(|source| ExecError::Spawn {
                    host: self.host.clone(),
                    source,
                })
        })
        .await?;
        check_output(&self.host, output, self.opts.verbose)
    }
}

#[async_trait]
impl Executor for SshExecutor {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, script: &str) -> Result<String, ExecError> {
        self.exec(script, true).await
    }

    async fn query(&self, script: &str) -> Result<String, ExecError> {
        self.exec(script, false).await
    }

    async fn copy(&self, local: &Path, remote: &str) -> Result<(), ExecError> {
        if self.opts.verbose {
            info!("{}$ copy {} -> {}", self.host, local.display(), remote);
        }
        if self.opts.dry_run {
            return Ok(());
        }
        // Binaries are content-addressed by their hash, so an existing
        // remote file is already the right one.
        let exists = self
            .exec(&format!("test -e {remote} && echo yes || true"), false)
            .await?;
        if exists.trim() == "yes" {
            debug!("{}: {} already present, skipping copy", self.host, remote);
            return Ok(());
        }
        let status = Command::new("scp")
            .arg("-q")
            .arg(local)
            .arg(format!("{}:{}", self.host, remote))
            .status()
            .await
            .map_err(|e| ExecError::Copy {
                host: self.host.clone(),
                local: local.display().to_string(),
                remote: remote.to_string(),
                reason: e.to_string(),
            })?;
        if !status.success() {
            return Err(ExecError::Copy {
                host: self.host.clone(),
                local: local.display().to_string(),
                remote: remote.to_string(),
                reason: format!("scp exited with {status}"),
            });
        }
        Ok(())
    }
}
