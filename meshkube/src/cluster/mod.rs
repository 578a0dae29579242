//! Kubernetes bootstrap over the mesh.
//!
//! Leader-then-followers:
//!
//! ```text
//! leader init ──→ API ready ──→ token (once) ──→ kubeconfig
//!                                   │
//!             ┌─────────────────────┼─────────────────────┐
//!             ▼                     ▼                     ▼
//!         master join           worker join    ...    worker join
//!             │                     │                     │
//!         node Ready?           node Ready?           node Ready?
//! ```
//!
//! Leader failure is fatal. Follower failures are isolated: each join is
//! validated on its own from the leader, and the outcome reports which
//! followers never became Ready.

mod distribution;
mod kubeconfig;
mod scripts;

pub use distribution::Distribution;
pub use kubeconfig::{rewrite_server, server_of};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use meshkube_shared::constants::protocol;
use meshkube_shared::errors::{ClusterError, MeshkubeError, MeshkubeResult, RemoteError};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::node::{Node, NodeIndex};
use crate::options::{KubernetesOptions, SshOptions};
use crate::remote::{RemoteTarget, SharedExecutor, TargetResolver, records, tail};

/// Join token read from the leader. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct ClusterToken(String);

impl ClusterToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ClusterToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ClusterToken(<redacted>)")
    }
}

/// Node condition as seen by the leader's API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCondition {
    pub ready: bool,
    pub unschedulable: bool,
}

impl NodeCondition {
    pub fn schedulable_ready(&self) -> bool {
        self.ready && !self.unschedulable
    }
}

/// Parse `NODE|<name>|<ready>|<unschedulable>` for `name`.
pub fn parse_node_condition(output: &str, name: &str) -> Option<NodeCondition> {
    records(output, protocol::NODE)
        .into_iter()
        .find(|r| r.field(0) == name)
        .map(|r| NodeCondition {
            ready: r.field(1) == "True",
            unschedulable: r.field(2) == "true",
        })
}

/// Majority of `masters`.
pub fn quorum(masters: usize) -> usize {
    masters / 2 + 1
}

/// Result of a bootstrap whose leader came up.
#[derive(Debug, Clone)]
pub struct BootstrapOutcome {
    pub leader: NodeIndex,
    /// Kubeconfig with the API server pointed at the leader's mesh address.
    pub kubeconfig: String,
    /// Followers that joined and report Ready, in creation order.
    pub joined: Vec<NodeIndex>,
    pub failed: Vec<(NodeIndex, String)>,
    pub masters_total: usize,
    pub masters_joined: usize,
    pub warnings: Vec<String>,
}

impl BootstrapOutcome {
    pub fn quorum_met(&self) -> bool {
        self.masters_joined >= quorum(self.masters_total)
    }

    pub fn is_degraded(&self) -> bool {
        !self.warnings.is_empty()
    }
}

pub struct ClusterBootstrapper {
    executor: SharedExecutor,
    options: KubernetesOptions,
    mesh_interface: String,
    install_timeout: Duration,
    validate_timeout: Duration,
}

impl ClusterBootstrapper {
    pub fn new(
        executor: SharedExecutor,
        options: KubernetesOptions,
        mesh_interface: impl Into<String>,
        ssh: &SshOptions,
    ) -> Self {
        Self {
            executor,
            options,
            mesh_interface: mesh_interface.into(),
            install_timeout: ssh.install_timeout(),
            validate_timeout: ssh.validate_timeout(),
        }
    }

    /// Bootstrap a cluster over `nodes`. The first master is the leader.
    ///
    /// # Errors
    ///
    /// [`ClusterError::NoMaster`], or any leader failure (`LeaderInit`,
    /// `ApiNotReady`, `Token`). Follower failures land in the outcome.
    pub async fn bootstrap(
        &self,
        nodes: &[Node],
        resolver: &TargetResolver,
        cancel: &CancellationToken,
    ) -> MeshkubeResult<BootstrapOutcome> {
        let leader = nodes
            .iter()
            .find(|n| n.is_master())
            .ok_or(ClusterError::NoMaster)?;
        let leader_target = resolver.target(leader);
        let masters_total = nodes.iter().filter(|n| n.is_master()).count();

        tracing::info!(
            leader = %leader.name,
            mesh_ip = %leader.mesh_ip,
            distribution = %self.options.distribution,
            "Initializing control plane"
        );
        self.executor
            .run(
                &leader_target,
                &scripts::leader_init(leader, &self.options, &self.mesh_interface),
                self.install_timeout,
            )
            .await
            .map_err(|e| ClusterError::LeaderInit {
                node: leader.name.clone(),
                source: Box::new(e.into()),
            })?;

        self.wait_for_api(leader, &leader_target, cancel).await?;

        let token = Arc::new(self.fetch_token(leader, &leader_target).await?);
        let kubeconfig = self.fetch_kubeconfig(leader, &leader_target).await?;
        tracing::info!(leader = %leader.name, "Leader ready, joining followers");

        let followers: Vec<&Node> = nodes.iter().filter(|n| n.index != leader.index).collect();
        let results: Vec<(NodeIndex, MeshkubeResult<()>)> = stream::iter(followers)
            .map(|node| {
                let token = Arc::clone(&token);
                let leader_target = &leader_target;
                let target = resolver.target(node);
                async move {
                    let result = tokio::select! {
                        _ = cancel.cancelled() => Err(MeshkubeError::Cancelled(format!("join of {}", node.name))),
                        r = self.join(node, leader, leader_target, &target, &token) => r,
                    };
                    (node.index, result)
                }
            })
            .buffer_unordered(self.options.max_parallel.max(1))
            .collect()
            .await;

        if cancel.is_cancelled() {
            return Err(MeshkubeError::Cancelled("cluster bootstrap".into()));
        }

        let mut joined = Vec::new();
        let mut failed = Vec::new();
        let mut warnings = Vec::new();
        let mut masters_joined = 1;
        let mut workers_failed = 0;
        for (index, result) in results {
            let Some(node) = nodes.iter().find(|n| n.index == index) else {
                continue;
            };
            match result {
                Ok(()) => {
                    if node.is_master() {
                        masters_joined += 1;
                    }
                    joined.push(index);
                }
                Err(e) => {
                    tracing::warn!(node = %node.name, error = %e, "Follower join failed");
                    if !node.is_master() {
                        workers_failed += 1;
                    }
                    warnings.push(format!("{}: {e}", node.name));
                    failed.push((index, e.to_string()));
                }
            }
        }
        joined.sort();
        failed.sort();

        let outcome_quorum = quorum(masters_total);
        if masters_joined < outcome_quorum {
            warnings.push(format!(
                "control plane below quorum: {masters_joined}/{masters_total} masters joined, {outcome_quorum} needed"
            ));
        }
        tracing::info!(
            joined = joined.len(),
            failed = failed.len(),
            masters_joined,
            masters_total,
            workers_failed,
            "Cluster bootstrap finished"
        );

        Ok(BootstrapOutcome {
            leader: leader.index,
            kubeconfig,
            joined,
            failed,
            masters_total,
            masters_joined,
            warnings,
        })
    }

    async fn wait_for_api(
        &self,
        leader: &Node,
        target: &RemoteTarget,
        cancel: &CancellationToken,
    ) -> MeshkubeResult<()> {
        let wait = self.options.leader_api_wait();
        let deadline = Instant::now() + wait;
        let script = scripts::api_ready(&self.options);
        loop {
            let last_output = match self.executor.run(target, &script, self.validate_timeout).await {
                Ok(_) => {
                    tracing::debug!(leader = %leader.name, "API answering");
                    return Ok(());
                }
                Err(e) if e.is_dial_failure() => {
                    return Err(ClusterError::LeaderInit {
                        node: leader.name.clone(),
                        source: Box::new(e.into()),
                    }
                    .into());
                }
                Err(e) => e.output().map(str::to_string).unwrap_or_else(|| e.to_string()),
            };
            if Instant::now() >= deadline {
                return Err(ClusterError::ApiNotReady {
                    node: leader.name.clone(),
                    waited: wait,
                    last_output,
                }
                .into());
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(MeshkubeError::Cancelled("leader API wait".into()));
                }
                _ = tokio::time::sleep(self.options.poll_interval()) => {}
            }
        }
    }

    async fn fetch_token(&self, leader: &Node, target: &RemoteTarget) -> MeshkubeResult<ClusterToken> {
        let token_error = |source: MeshkubeError| ClusterError::Token {
            node: leader.name.clone(),
            source: Box::new(source),
        };
        let timeout = Duration::from_secs(self.options.token_wait_secs) + self.validate_timeout;
        let output = self
            .executor
            .run(target, &scripts::fetch_token(&self.options), timeout)
            .await
            .map_err(|e| token_error(e.into()))?;

        let token = records(&output.stdout, protocol::TOKEN)
            .first()
            .map(|r| r.rest(0).trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                token_error(
                    RemoteError::Protocol {
                        node: leader.name.clone(),
                        step: "cluster.token".into(),
                        detail: "no TOKEN line in output".into(),
                    }
                    .into(),
                )
            })?;
        Ok(ClusterToken::new(token))
    }

    async fn fetch_kubeconfig(&self, leader: &Node, target: &RemoteTarget) -> MeshkubeResult<String> {
        let output = self
            .executor
            .run(target, &scripts::fetch_kubeconfig(&self.options), self.validate_timeout)
            .await
            .map_err(|e| ClusterError::LeaderInit {
                node: leader.name.clone(),
                source: Box::new(e.into()),
            })?;
        Ok(rewrite_server(&output.stdout, &leader.mesh_ip.to_string()))
    }

    /// Join one follower and wait for the leader to see it Ready.
    async fn join(
        &self,
        node: &Node,
        leader: &Node,
        leader_target: &RemoteTarget,
        target: &RemoteTarget,
        token: &ClusterToken,
    ) -> MeshkubeResult<()> {
        let script = scripts::join(node, leader, token.expose(), &self.options, &self.mesh_interface);
        let timeout = self.install_timeout
            + Duration::from_secs(self.options.follower_mesh_wait_secs + self.options.leader_port_wait_secs);
        tracing::debug!(node = %node.name, role = if node.is_master() { "master" } else { "worker" }, "Joining");

        self.executor
            .run(target, &script, timeout)
            .await
            .map_err(|e| ClusterError::Join {
                node: node.name.clone(),
                reason: match e.output() {
                    Some(out) => format!("{e}\n{}", tail(out, 10)),
                    None => e.to_string(),
                },
            })?;

        let wait = self.options.node_ready_wait();
        let deadline = Instant::now() + wait;
        let status = scripts::node_status(&node.name, &self.options);
        let mut last = None;
        loop {
            match self.executor.run(leader_target, &status, self.validate_timeout).await {
                Ok(output) => {
                    last = parse_node_condition(&output.stdout, &node.name);
                    if last.is_some_and(|c| c.schedulable_ready()) {
                        tracing::info!(node = %node.name, "Node Ready");
                        return Ok(());
                    }
                }
                Err(e) => tracing::debug!(node = %node.name, error = %e, "Node status poll failed"),
            }
            if Instant::now() >= deadline {
                let reason = match last {
                    Some(c) if c.ready => "node is cordoned".to_string(),
                    Some(_) => format!("node not Ready after {wait:?}"),
                    None => format!("node never registered within {wait:?}"),
                };
                return Err(ClusterError::Join {
                    node: node.name.clone(),
                    reason,
                }
                .into());
            }
            tokio::time::sleep(self.options.poll_interval()).await;
        }
    }
}
