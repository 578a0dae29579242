//! Mesh construction.
//!
//! ```text
//! keygen on every node ──(barrier: all keys or abort)──→ KeyRing
//!                                                          │
//!            render + deploy per node (failures isolated) ←┘
//! ```
//!
//! Peer configs are only rendered once the ring is complete, so no node is
//! ever handed a partial peer list.

use std::collections::BTreeMap;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use meshkube_shared::constants::protocol;
use meshkube_shared::errors::{MeshError, MeshkubeError, MeshkubeResult, RemoteError};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::config::{self, MeshMember, MeshPlan};
use super::keys::{self, KeyRing, PublicKey};
use crate::node::{Node, NodeIndex};
use crate::options::{MeshOptions, SshOptions};
use crate::remote::{RemoteTarget, SharedExecutor, TargetResolver, records};

/// Mesh block of the run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshSummary {
    pub nodes: usize,
    pub tunnels: usize,
    pub peers_per_node: usize,
    pub deployed: Vec<String>,
    /// Node name → deploy failure.
    pub failed: BTreeMap<String, String>,
}

/// Output of a build: the plan every later stage works from.
#[derive(Debug, Clone)]
pub struct MeshBuild {
    pub plan: MeshPlan,
    pub summary: MeshSummary,
    /// Nodes whose config is live.
    pub deployed: Vec<NodeIndex>,
    pub failed: Vec<(NodeIndex, String)>,
}

pub struct MeshBuilder {
    executor: SharedExecutor,
    options: MeshOptions,
    install_timeout: Duration,
    validate_timeout: Duration,
}

impl MeshBuilder {
    pub fn new(executor: SharedExecutor, options: MeshOptions, ssh: &SshOptions) -> Self {
        Self {
            executor,
            options,
            install_timeout: ssh.install_timeout(),
            validate_timeout: ssh.validate_timeout(),
        }
    }

    /// Build a full mesh over `nodes`.
    ///
    /// # Errors
    ///
    /// - [`MeshError::InsufficientNodes`] for fewer than 2 nodes
    /// - [`MeshError::KeyCollection`] / [`MeshError::InvalidKey`] if the
    ///   key barrier fails; no config is deployed in that case
    /// - [`MeshkubeError::Cancelled`] if `cancel` fires
    pub async fn build(
        &self,
        nodes: &[Node],
        resolver: &TargetResolver,
        cancel: &CancellationToken,
    ) -> MeshkubeResult<MeshBuild> {
        if nodes.len() < 2 {
            return Err(MeshError::InsufficientNodes { count: nodes.len() }.into());
        }

        let ring = self.collect_keys(nodes, resolver, cancel).await?;
        let members: Vec<MeshMember> = nodes
            .iter()
            .map(|n| MeshMember::from_node(n, self.options.listen_port))
            .collect();
        let plan = MeshPlan::new(members, ring)?;
        tracing::info!(
            nodes = nodes.len(),
            tunnels = plan.tunnel_count(),
            "Public keys collected, deploying mesh"
        );

        let results: Vec<(NodeIndex, String, MeshkubeResult<()>)> = stream::iter(nodes)
            .map(|node| {
                let plan = &plan;
                let target = resolver.target(node);
                async move {
                    let member = MeshMember::from_node(node, self.options.listen_port);
                    let result = tokio::select! {
                        _ = cancel.cancelled() => Err(MeshkubeError::Cancelled("mesh deploy".into())),
                        r = self.deploy(plan, &member, &target) => r,
                    };
                    (node.index, node.name.clone(), result)
                }
            })
            .buffer_unordered(self.options.max_parallel.max(1))
            .collect()
            .await;

        if cancel.is_cancelled() {
            return Err(MeshkubeError::Cancelled("mesh deploy".into()));
        }

        let mut deployed = Vec::new();
        let mut failed = Vec::new();
        let mut summary = MeshSummary {
            nodes: nodes.len(),
            tunnels: plan.tunnel_count(),
            peers_per_node: nodes.len() - 1,
            deployed: Vec::new(),
            failed: BTreeMap::new(),
        };
        for (index, name, result) in results {
            match result {
                Ok(()) => {
                    deployed.push(index);
                    summary.deployed.push(name);
                }
                Err(e) => {
                    tracing::warn!(node = %name, error = %e, "Mesh deploy failed");
                    summary.failed.insert(name, e.to_string());
                    failed.push((index, e.to_string()));
                }
            }
        }
        deployed.sort();
        failed.sort();
        summary
            .deployed
            .sort_by_key(|name| nodes.iter().position(|n| &n.name == name));

        Ok(MeshBuild {
            plan,
            summary,
            deployed,
            failed,
        })
    }

    /// Key barrier. The first failure cancels keygen still in flight.
    async fn collect_keys(
        &self,
        nodes: &[Node],
        resolver: &TargetResolver,
        cancel: &CancellationToken,
    ) -> MeshkubeResult<KeyRing> {
        let barrier = cancel.child_token();
        let script = keys::keygen_script();

        let results: Vec<(Node, Option<MeshkubeResult<PublicKey>>)> = stream::iter(nodes)
            .map(|node| {
                let barrier = &barrier;
                let script = &script;
                let target = resolver.target(node);
                async move {
                    let outcome = tokio::select! {
                        _ = barrier.cancelled() => None,
                        r = self.executor.run(&target, script, self.validate_timeout) => Some(r),
                    };
                    let key = outcome.map(|r| -> MeshkubeResult<PublicKey> {
                        let output = r?;
                        let key = keys::parse_keygen_output(&node.name, &output.stdout)?;
                        Ok(key)
                    });
                    if matches!(key, Some(Err(_))) {
                        barrier.cancel();
                    }
                    (node.clone(), key)
                }
            })
            .buffer_unordered(self.options.max_parallel.max(1))
            .collect()
            .await;

        if cancel.is_cancelled() {
            return Err(MeshkubeError::Cancelled("mesh key collection".into()));
        }

        let mut collected = Vec::new();
        let mut failed = Vec::new();
        let mut first_error: Option<MeshkubeError> = None;
        for (node, key) in results {
            match key {
                Some(Ok(key)) => collected.push((node.index, key)),
                Some(Err(e)) => {
                    tracing::error!(node = %node.name, error = %e, "Key generation failed");
                    failed.push(node.name);
                    first_error.get_or_insert(e);
                }
                None => tracing::debug!(node = %node.name, "Key generation cancelled"),
            }
        }

        if let Some(error) = first_error {
            if let (1, MeshkubeError::Mesh(MeshError::InvalidKey { .. })) = (failed.len(), &error) {
                return Err(error);
            }
            return Err(MeshError::KeyCollection {
                nodes: failed,
                reason: error.to_string(),
            }
            .into());
        }

        Ok(KeyRing::from_keys(collected))
    }

    async fn deploy(
        &self,
        plan: &MeshPlan,
        member: &MeshMember,
        target: &RemoteTarget,
    ) -> MeshkubeResult<()> {
        let peers = plan.peers_for(member.index, &self.options);
        let rendered = config::render(member, &peers, &self.options);
        let script = config::deploy_script(&rendered, &self.options)?;

        let output = self
            .executor
            .run(target, &script, self.install_timeout)
            .await?;

        let reported = records(&output.stdout, protocol::PEERS)
            .first()
            .and_then(|r| r.field(0).trim().parse::<usize>().ok());
        match reported {
            Some(count) if count == peers.len() => {
                tracing::debug!(node = %member.name, peers = count, "Mesh config deployed");
                Ok(())
            }
            other => Err(RemoteError::Protocol {
                node: member.name.clone(),
                step: script.step().to_string(),
                detail: format!(
                    "interface reports {} peers, expected {}",
                    other.map_or_else(|| "no".to_string(), |c| c.to_string()),
                    peers.len()
                ),
            }
            .into()),
        }
    }
}
