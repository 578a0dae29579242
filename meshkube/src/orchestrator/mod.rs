//! Orchestrator.
//!
//! Sequences every component through an explicit phase graph:
//!
//! ```text
//! [bastion] ──→ nodes.create ──→ nodes.provision ──→ [nodes.firewall] ──→ mesh.build
//!                                                                              │
//!                                                                              ▼
//!                [dns, addons.gitops, addons.ingress] ←── cluster.bootstrap ←── mesh.validate
//! ```
//!
//! Bracketed phases exist only when configured. Phases never share live
//! state: each one reads node snapshots from the registry and the values
//! earlier phases published (target resolver, mesh summary, leader), and
//! only phase completion writes node status.

pub mod phase;
mod report;

pub use phase::{
    FailurePolicy, Phase, PhaseGraph, PhaseOutput, PhaseRecord, PhaseRunner, PhaseState, Schedule,
    execute,
};
pub use report::{RunOutcome, RunReport};

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use meshkube_shared::constants::phases;
use meshkube_shared::errors::{ClusterError, MeshkubeError, MeshkubeResult};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::addons::{self, DnsRegistrar, GitOpsInstaller, IngressInstaller};
use crate::bastion::BastionGate;
use crate::cluster::ClusterBootstrapper;
use crate::firewall::{FirewallPolicy, FirewallReport, NodeFirewall};
use crate::infra::Infrastructure;
use crate::mesh::{ConnectivityMatrix, MeshBuilder, MeshSummary, MeshValidator};
use crate::node::{Node, NodeIndex, NodeRegistry, NodeStatus};
use crate::options::ClusterOptions;
use crate::provision::{NodeProvisioner, ProvisionReport};
use crate::remote::{SharedExecutor, TargetResolver};

/// Values published by completed phases for later ones.
#[derive(Default)]
struct Published {
    resolver: TargetResolver,
    mesh: Option<MeshSummary>,
    connectivity: Option<ConnectivityMatrix>,
    leader: Option<NodeIndex>,
    kubeconfig: Option<String>,
}

/// Runs one cluster build end to end.
pub struct Orchestrator {
    options: ClusterOptions,
    executor: SharedExecutor,
    infra: Arc<dyn Infrastructure>,
    dns: Option<Arc<dyn DnsRegistrar>>,
    bastion: Option<BastionGate>,
    registry: NodeRegistry,
    published: Mutex<Published>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        options: ClusterOptions,
        executor: SharedExecutor,
        infra: Arc<dyn Infrastructure>,
    ) -> Self {
        let bastion = options.bastion.enabled.then(|| {
            BastionGate::new(
                executor.clone(),
                options.bastion.clone(),
                options.ssh.clone(),
            )
        });
        let published = Published {
            resolver: TargetResolver::new(&options.ssh, None),
            ..Default::default()
        };
        Self {
            options,
            executor,
            infra,
            dns: None,
            bastion,
            registry: NodeRegistry::new(),
            published: Mutex::new(published),
            cancel: CancellationToken::new(),
        }
    }

    /// DNS provider used by the `dns` phase.
    pub fn with_dns(mut self, registrar: Arc<dyn DnsRegistrar>) -> Self {
        self.dns = Some(registrar);
        self
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Cancelling this token halts the run as if a fatal phase had failed.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The phase graph this configuration runs.
    pub fn graph(&self) -> MeshkubeResult<PhaseGraph> {
        use FailurePolicy::{Fatal, WarnOnly};

        let mut graph = Vec::new();
        let mut create = Phase::new(phases::NODES_CREATE, Fatal);
        if self.options.bastion.enabled {
            graph.push(Phase::new(phases::BASTION, Fatal));
            create = create.after(&[phases::BASTION]);
        }
        graph.extend([
            create,
            Phase::new(phases::NODES_PROVISION, Fatal).after(&[phases::NODES_CREATE]),
        ]);
        let mut mesh = Phase::new(phases::MESH_BUILD, Fatal).after(&[phases::NODES_PROVISION]);
        if self.options.firewall.enabled {
            graph.push(Phase::new(phases::NODES_FIREWALL, Fatal).after(&[phases::NODES_PROVISION]));
            mesh = mesh.after(&[phases::NODES_FIREWALL]);
        }
        graph.extend([
            mesh,
            Phase::new(phases::MESH_VALIDATE, Fatal).after(&[phases::MESH_BUILD]),
            Phase::new(phases::CLUSTER_BOOTSTRAP, Fatal).after(&[phases::MESH_VALIDATE]),
        ]);
        if self.options.dns.is_enabled() {
            graph.push(Phase::new(phases::DNS, WarnOnly).after(&[phases::CLUSTER_BOOTSTRAP]));
        }
        if self.options.addons.gitops.is_some() {
            graph.push(
                Phase::new(phases::ADDONS_GITOPS, WarnOnly).after(&[phases::CLUSTER_BOOTSTRAP]),
            );
        }
        if self.options.addons.ingress.is_some() {
            graph.push(
                Phase::new(phases::ADDONS_INGRESS, WarnOnly).after(&[phases::CLUSTER_BOOTSTRAP]),
            );
        }
        PhaseGraph::new(graph)
    }

    /// Run every phase and report. Never returns early with an error: fatal
    /// failures are part of the report.
    pub async fn run(&self) -> RunReport {
        let run_id = Ulid::new();
        let started_at = Utc::now();

        let graph = match self.options.validate(0).and_then(|()| self.graph()) {
            Ok(graph) => graph,
            Err(e) => {
                tracing::error!(%run_id, error = %e, "Options rejected");
                let error = MeshkubeError::phase(phases::CONFIG, e);
                return self.report(run_id, started_at, Vec::new(), RunOutcome::from_error(&error));
            }
        };
        tracing::info!(%run_id, phases = graph.phases().len(), "Starting run");
        tracing::debug!("Phase graph:\n{}", graph.render());

        let schedule = execute(&graph, self, &self.cancel).await;
        let outcome = match &schedule.fatal {
            Some(error) => RunOutcome::from_error(error),
            None => {
                let mut warnings = schedule.warnings();
                for (name, status) in self.registry.statuses() {
                    let mentioned = warnings.iter().any(|w| w.contains(name.as_str()));
                    if !status.is_ready() && !mentioned {
                        warnings.push(format!("{name}: ended {status}"));
                    }
                }
                if warnings.is_empty() {
                    RunOutcome::Ready
                } else {
                    RunOutcome::Degraded { warnings }
                }
            }
        };

        let report = self.report(run_id, started_at, schedule.records, outcome);
        match &report.outcome {
            RunOutcome::Ready => tracing::info!(%run_id, "Cluster ready"),
            RunOutcome::Degraded { warnings } => {
                tracing::warn!(%run_id, warnings = warnings.len(), "Cluster ready with warnings")
            }
            RunOutcome::Failed { phase, nodes, .. } => {
                tracing::error!(%run_id, phase = %phase, ?nodes, "Run failed")
            }
        }
        report
    }

    fn report(
        &self,
        run_id: Ulid,
        started_at: DateTime<Utc>,
        phases: Vec<PhaseRecord>,
        outcome: RunOutcome,
    ) -> RunReport {
        let published = self.published.lock();
        RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            outcome,
            phases,
            nodes: self.registry.statuses(),
            bastion: self.bastion.as_ref().map(BastionGate::status),
            mesh: published.mesh.clone(),
            connectivity: published.connectivity.clone(),
            kubeconfig: published.kubeconfig.clone(),
        }
    }

    fn resolver(&self) -> TargetResolver {
        self.published.lock().resolver.clone()
    }

    fn leader(&self) -> MeshkubeResult<Node> {
        self.published
            .lock()
            .leader
            .and_then(|index| self.registry.get(index))
            .ok_or_else(|| MeshkubeError::InvalidState("no cluster leader has been elected".into()))
    }

    /// Concurrent per-node work. One node at a time through the bastion's
    /// session limit.
    fn node_parallelism(&self) -> usize {
        if self.options.bastion.enabled {
            1
        } else {
            self.options.provisioning.max_parallel.max(1)
        }
    }

    /// Fail every node whose work failed and turn the failures into
    /// warnings. The phase fails only when no master is left.
    fn settle<T>(
        &self,
        results: Vec<(Node, MeshkubeResult<T>)>,
        mut succeeded: impl FnMut(&Node, T) -> MeshkubeResult<()>,
    ) -> MeshkubeResult<PhaseOutput> {
        let mut warnings = Vec::new();
        let mut master_failure = None;
        for (node, result) in results {
            match result {
                Ok(value) => succeeded(&node, value)?,
                Err(e) => {
                    self.registry.fail(node.index, e.to_string());
                    warnings.push(format!("{}: {e}", node.name));
                    if node.is_master() && master_failure.is_none() {
                        master_failure = Some(e);
                    }
                }
            }
        }

        if !self.registry.live().iter().any(Node::is_master) {
            return Err(master_failure.unwrap_or_else(|| ClusterError::NoMaster.into()));
        }
        Ok(PhaseOutput::with_warnings(warnings))
    }

    fn node_name(&self, index: NodeIndex) -> String {
        self.registry
            .get(index)
            .map(|n| n.name)
            .unwrap_or_else(|| index.to_string())
    }

    // ========================================================================
    // Phases
    // ========================================================================

    async fn bastion_phase(&self) -> MeshkubeResult<PhaseOutput> {
        let gate = self
            .bastion
            .as_ref()
            .ok_or_else(|| MeshkubeError::InvalidState("bastion phase without a bastion".into()))?;
        let status = gate.run(self.infra.as_ref()).await?;
        let hop = status.proxy_hop().ok_or_else(|| {
            MeshkubeError::InvalidState(format!("bastion '{}' validated without an address", status.name))
        })?;
        tracing::info!(bastion = %status.name, hop = %hop.host, "Routing node traffic through bastion");
        self.published.lock().resolver = TargetResolver::new(&self.options.ssh, Some(hop));
        Ok(PhaseOutput::default())
    }

    async fn create_nodes(&self) -> MeshkubeResult<PhaseOutput> {
        if let Some(gate) = &self.bastion {
            if !gate.status().is_validated() {
                return Err(MeshkubeError::InvalidState(
                    "node creation requested before the bastion validated".into(),
                ));
            }
        }

        let specs = self.infra.create_nodes().await?;
        if specs.is_empty() {
            return Err(MeshkubeError::Infrastructure("no nodes were created".into()));
        }
        self.options.validate(specs.len())?;
        self.registry
            .register(specs, &self.options.mesh, self.options.kubernetes.masters)?;

        let nodes = self.registry.snapshot();
        tracing::info!(
            nodes = nodes.len(),
            masters = nodes.iter().filter(|n| n.is_master()).count(),
            "Nodes registered"
        );
        Ok(PhaseOutput::default())
    }

    /// Node failures are isolated; the phase fails only when no master is
    /// left.
    async fn provision_nodes(&self, cancel: &CancellationToken) -> MeshkubeResult<PhaseOutput> {
        let provisioner = NodeProvisioner::new(
            self.executor.clone(),
            self.options.provisioning.clone(),
            &self.options.ssh,
        );
        let resolver = self.resolver();
        let results: Vec<(Node, MeshkubeResult<ProvisionReport>)> =
            stream::iter(self.registry.live())
                .map(|node| {
                    let provisioner = &provisioner;
                    let target = resolver.target(&node);
                    async move {
                        let result = tokio::select! {
                            _ = cancel.cancelled() => Err(MeshkubeError::Cancelled(format!("provisioning of {}", node.name))),
                            r = provisioner.provision(&target) => r,
                        };
                        (node, result)
                    }
                })
                .buffer_unordered(self.node_parallelism())
                .collect()
                .await;

        if cancel.is_cancelled() {
            return Err(MeshkubeError::Cancelled("node provisioning".into()));
        }

        self.settle(results, |node, report| {
            self.registry.advance(node.index, NodeStatus::Provisioned)?;
            tracing::debug!(
                node = %node.name,
                already_provisioned = report.already_provisioned,
                attempts = report.attempts,
                "Node provisioned"
            );
            Ok(())
        })
    }

    /// Same isolation as provisioning. Behind a bastion, SSH is only
    /// accepted from the bastion.
    async fn firewall_nodes(&self, cancel: &CancellationToken) -> MeshkubeResult<PhaseOutput> {
        let resolver = self.resolver();
        let bastion = resolver.proxy().map(|hop| hop.host.as_str());
        let firewall = NodeFirewall::new(
            self.executor.clone(),
            FirewallPolicy::new(&self.options, bastion),
            self.options.ssh.install_timeout(),
        );

        let results: Vec<(Node, MeshkubeResult<FirewallReport>)> =
            stream::iter(self.registry.live())
                .map(|node| {
                    let firewall = &firewall;
                    let target = resolver.target(&node);
                    async move {
                        let result = tokio::select! {
                            _ = cancel.cancelled() => Err(MeshkubeError::Cancelled(format!("firewall on {}", node.name))),
                            r = firewall.apply(&node, &target) => r,
                        };
                        (node, result)
                    }
                })
                .buffer_unordered(self.node_parallelism())
                .collect()
                .await;

        if cancel.is_cancelled() {
            return Err(MeshkubeError::Cancelled("host firewall".into()));
        }

        let mut rules = 0;
        let output = self.settle(results, |_, report| {
            rules += report.rules;
            Ok(())
        })?;
        tracing::info!(rules, "Host firewalls applied");
        Ok(output)
    }

    async fn build_mesh(&self, cancel: &CancellationToken) -> MeshkubeResult<PhaseOutput> {
        let builder = MeshBuilder::new(
            self.executor.clone(),
            self.options.mesh.clone(),
            &self.options.ssh,
        );
        let nodes = self.registry.live();
        let build = builder.build(&nodes, &self.resolver(), cancel).await?;

        for index in &build.deployed {
            self.registry.advance(*index, NodeStatus::MeshJoined)?;
        }
        let mut warnings = Vec::new();
        for (index, reason) in &build.failed {
            self.registry.fail(*index, reason.clone());
            warnings.push(format!("mesh deploy on {}: {reason}", self.node_name(*index)));
        }
        tracing::info!(
            tunnels = build.summary.tunnels,
            deployed = build.deployed.len(),
            failed = build.failed.len(),
            "Mesh built"
        );
        self.published.lock().mesh = Some(build.summary);
        Ok(PhaseOutput::with_warnings(warnings))
    }

    async fn validate_mesh(&self, cancel: &CancellationToken) -> MeshkubeResult<PhaseOutput> {
        let peers = self
            .published
            .lock()
            .mesh
            .as_ref()
            .map(|m| m.peers_per_node)
            .ok_or_else(|| MeshkubeError::InvalidState("mesh validation before mesh build".into()))?;
        let validator = MeshValidator::new(
            self.executor.clone(),
            self.options.mesh.clone(),
            &self.options.ssh,
        );
        let nodes = self.registry.live();
        let validation = validator
            .validate(&nodes, peers, &self.resolver(), cancel)
            .await?;
        self.published.lock().connectivity = Some(validation.matrix);
        Ok(PhaseOutput::default())
    }

    async fn bootstrap_cluster(&self, cancel: &CancellationToken) -> MeshkubeResult<PhaseOutput> {
        let bootstrapper = ClusterBootstrapper::new(
            self.executor.clone(),
            self.options.kubernetes.clone(),
            self.options.mesh.interface.clone(),
            &self.options.ssh,
        );
        let nodes = self.registry.live();
        let outcome = match bootstrapper.bootstrap(&nodes, &self.resolver(), cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Some(leader) = nodes.iter().find(|n| n.is_master()) {
                    if !e.is_cancelled() {
                        self.registry.fail(leader.index, e.to_string());
                    }
                }
                return Err(e);
            }
        };

        for index in std::iter::once(outcome.leader).chain(outcome.joined.iter().copied()) {
            self.registry.advance(index, NodeStatus::ClusterJoined)?;
            self.registry.advance(index, NodeStatus::Ready)?;
        }
        for (index, reason) in &outcome.failed {
            self.registry.fail(*index, reason.clone());
        }
        if !outcome.quorum_met() {
            tracing::warn!(
                masters_joined = outcome.masters_joined,
                masters_total = outcome.masters_total,
                "Control plane below quorum"
            );
        }

        let mut published = self.published.lock();
        published.leader = Some(outcome.leader);
        published.kubeconfig = Some(outcome.kubeconfig);
        Ok(PhaseOutput::with_warnings(outcome.warnings))
    }

    async fn register_dns(&self) -> MeshkubeResult<PhaseOutput> {
        let registrar = self.dns.as_ref().ok_or_else(|| {
            MeshkubeError::Config(format!(
                "dns.domain is '{}' but no DNS registrar was supplied",
                self.options.dns.domain
            ))
        })?;
        let leader = self.leader()?;
        let ready: Vec<Node> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|n| n.status().is_ready())
            .collect();
        let records = addons::plan_records(&self.options.dns, &leader, &ready);
        let warnings = addons::register(registrar.as_ref(), &records).await;
        Ok(PhaseOutput::with_warnings(warnings))
    }

    async fn install_gitops(&self) -> MeshkubeResult<PhaseOutput> {
        let options = self.options.addons.gitops.clone().ok_or_else(|| {
            MeshkubeError::InvalidState("gitops phase without gitops options".into())
        })?;
        let leader = self.leader()?;
        GitOpsInstaller::new(
            self.executor.clone(),
            options,
            self.options.kubernetes.distribution,
            &self.options.ssh,
        )
        .install(&self.resolver().target(&leader))
        .await?;
        Ok(PhaseOutput::default())
    }

    async fn install_ingress(&self) -> MeshkubeResult<PhaseOutput> {
        let options = self.options.addons.ingress.clone().ok_or_else(|| {
            MeshkubeError::InvalidState("ingress phase without ingress options".into())
        })?;
        let acme_email = options.acme_email(&self.options.dns);
        let leader = self.leader()?;
        IngressInstaller::new(
            self.executor.clone(),
            options,
            self.options.kubernetes.distribution,
            acme_email,
            &self.options.ssh,
        )
        .install(&self.resolver().target(&leader))
        .await?;
        Ok(PhaseOutput::default())
    }
}

#[async_trait(?Send)]
impl PhaseRunner for Orchestrator {
    async fn run_phase(&self, name: &str, cancel: &CancellationToken) -> MeshkubeResult<PhaseOutput> {
        match name {
            phases::BASTION => self.bastion_phase().await,
            phases::NODES_CREATE => self.create_nodes().await,
            phases::NODES_PROVISION => self.provision_nodes(cancel).await,
            phases::NODES_FIREWALL => self.firewall_nodes(cancel).await,
            phases::MESH_BUILD => self.build_mesh(cancel).await,
            phases::MESH_VALIDATE => self.validate_mesh(cancel).await,
            phases::CLUSTER_BOOTSTRAP => self.bootstrap_cluster(cancel).await,
            phases::DNS => self.register_dns().await,
            phases::ADDONS_GITOPS => self.install_gitops().await,
            phases::ADDONS_INGRESS => self.install_ingress().await,
            other => Err(MeshkubeError::Internal(format!("no runner for phase '{other}'"))),
        }
    }
}
