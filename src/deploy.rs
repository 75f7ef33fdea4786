// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deploying a site to remote nodes
//!
//! The controller copies the site's inventory to each node and runs
//! `roost apply` there. Only the paths the site lists are copied, so a
//! controller key kept in the site directory never leaves the controller.
//!
//! Nodes are handled concurrently, up to `deploy.parallelism` at a time; a
//! failure on one node never stops the others.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::config::DeployConfig;
use crate::error::{Result, RoostError};
use crate::inventory::HostStore;

/// A node to deploy to
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeployTarget {
    /// Node name
    pub node: String,
    /// SSH destination, `user@address`
    pub destination: String,
}

/// What to do on each node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployAction {
    /// Copy the site only
    Copy,
    /// Copy the site and apply it
    Apply {
        /// Apply only these roles; all roles when empty
        roles: Vec<String>,
        /// Apply even if the node sets `testing_do_not_apply`
        force: bool,
    },
}

/// Moves files to and runs commands on remote nodes
#[async_trait]
pub trait Transport: Send + Sync {
    /// Replace the directory `remote` on the node with copies of `sources`
    async fn copy(&self, target: &DeployTarget, sources: &[PathBuf], remote: &str) -> Result<()>;

    /// Run a command on the node, returning its output
    async fn exec(&self, target: &DeployTarget, command: &[String]) -> Result<String>;
}

/// Transport over the `ssh` and `scp` binaries
#[derive(Debug, Clone, Default)]
pub struct SshTransport {
    options: Vec<String>,
}

/// Outcome for one node
#[derive(Debug)]
pub struct NodeOutcome {
    /// Node name
    pub node: String,
    /// Remote output, or the error message
    pub result: std::result::Result<String, String>,
    /// Time spent on this node
    pub duration_ms: u64,
}

/// Outcomes for every node, sorted by node name
#[derive(Debug, Default)]
pub struct DeployReport {
    /// Per-node outcomes
    pub outcomes: Vec<NodeOutcome>,
}

/// Runs a [`DeployAction`] across nodes
pub struct Deployer<T: Transport> {
    transport: T,
    config: DeployConfig,
    sources: Vec<PathBuf>,
}

impl SshTransport {
    /// Create a transport passing extra options to ssh and scp
    pub fn new(options: Vec<String>) -> Self {
        Self { options }
    }

    async fn run(&self, target: &DeployTarget, program: &str, args: Vec<String>) -> Result<String> {
        debug!(node = %target.node, program = %program, args = ?args, "Running remote transport");

        let output = Command::new(program)
            .args(&self.options)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => RoostError::CommandNotFound {
                    command: program.to_string(),
                },
                _ => RoostError::IoError(e),
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(RoostError::Transport {
                target: target.node.clone(),
                message: format!(
                    "{} exited with status {}: {}",
                    program,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            })
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn copy(&self, target: &DeployTarget, sources: &[PathBuf], remote: &str) -> Result<()> {
        let prepare = format!("rm -rf '{0}' && mkdir -p '{0}'", remote);
        self.exec(target, &[prepare]).await?;

        let mut args = vec!["-r".to_string()];
        args.extend(sources.iter().map(|source| source.display().to_string()));
        args.push(format!("{}:{}/", target.destination, remote));
        self.run(target, "scp", args).await.map(|_| ())
    }

    async fn exec(&self, target: &DeployTarget, command: &[String]) -> Result<String> {
        let mut args = vec![target.destination.clone(), "--".to_string()];
        args.extend(command.iter().cloned());
        self.run(target, "ssh", args).await
    }
}

impl<T: Transport> Deployer<T> {
    /// Create a deployer copying `sources` to every node
    pub fn new(transport: T, config: DeployConfig, sources: Vec<PathBuf>) -> Self {
        Self {
            transport,
            config,
            sources,
        }
    }

    /// The command run on each node for an action, if any
    pub fn remote_command(&self, target: &DeployTarget, action: &DeployAction) -> Option<Vec<String>> {
        let DeployAction::Apply { roles, force } = action else {
            return None;
        };
        let mut command = vec![
            self.config.remote_command.clone(),
            "--site".to_string(),
            self.config.remote_path.clone(),
            "apply".to_string(),
            target.node.clone(),
        ];
        if !roles.is_empty() {
            command.push("--roles".to_string());
            command.push(roles.join(","));
        }
        if *force {
            command.push("--force-apply".to_string());
        }
        Some(command)
    }

    /// Run an action on every target
    ///
    /// Every target is attempted. Check [`DeployReport::is_success`] for the
    /// overall result.
    pub async fn deploy(&self, targets: &[DeployTarget], action: &DeployAction) -> DeployReport {
        info!(
            nodes = targets.len(),
            parallelism = self.config.parallelism,
            "Starting deployment"
        );

        let mut outcomes: Vec<NodeOutcome> = stream::iter(targets)
            .map(|target| async move {
                let start = Instant::now();
                let result = self.deploy_one(target, action).await;
                let duration_ms = start.elapsed().as_millis() as u64;
                match &result {
                    Ok(_) => info!(node = %target.node, duration_ms, "Deployed"),
                    Err(e) => error!(node = %target.node, error = %e, "Deployment failed"),
                }
                NodeOutcome {
                    node: target.node.clone(),
                    result: result.map_err(|e| e.to_string()),
                    duration_ms,
                }
            })
            .buffer_unordered(self.config.parallelism.max(1))
            .collect()
            .await;

        outcomes.sort_by(|a, b| a.node.cmp(&b.node));
        let report = DeployReport { outcomes };
        info!(
            succeeded = report.succeeded().count(),
            failed = report.failed().count(),
            "Deployment completed"
        );
        report
    }

    async fn deploy_one(&self, target: &DeployTarget, action: &DeployAction) -> Result<String> {
        let limit = Duration::from_secs(self.config.timeout_secs);

        self.with_timeout(
            target,
            limit,
            self.transport
                .copy(target, &self.sources, &self.config.remote_path),
        )
        .await?;

        match self.remote_command(target, action) {
            Some(command) => {
                self.with_timeout(target, limit, self.transport.exec(target, &command))
                    .await
            }
            None => Ok(String::new()),
        }
    }

    async fn with_timeout<F, V>(&self, target: &DeployTarget, limit: Duration, operation: F) -> Result<V>
    where
        F: std::future::Future<Output = Result<V>>,
    {
        match timeout(limit, operation).await {
            Ok(result) => result,
            Err(_) => Err(RoostError::Transport {
                target: target.node.clone(),
                message: format!("Timed out after {} seconds", limit.as_secs()),
            }),
        }
    }
}

impl DeployReport {
    /// Whether every node succeeded
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    /// Outcomes of nodes that succeeded
    pub fn succeeded(&self) -> impl Iterator<Item = &NodeOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_ok())
    }

    /// Outcomes of nodes that failed
    pub fn failed(&self) -> impl Iterator<Item = &NodeOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }
}

/// Targets for the named nodes and the members of the named groups
///
/// Each node appears once, in name order.
pub fn resolve_targets(
    hosts: &HostStore,
    nodes: &[String],
    groups: &[String],
) -> Result<Vec<DeployTarget>> {
    let mut names: BTreeSet<String> = nodes.iter().cloned().collect();
    for group in groups {
        names.extend(hosts.group_members(group)?.iter().cloned());
    }
    if names.is_empty() {
        return Err(RoostError::InvalidConfig {
            message: "No nodes to deploy to; name at least one node or group".to_string(),
        });
    }

    names
        .into_iter()
        .map(|name| {
            let node = hosts.node(&name)?;
            Ok(DeployTarget {
                destination: node.ssh_destination(),
                node: name,
            })
        })
        .collect()
}
