//! Bastion gate.
//!
//! Creates, hardens and validates the single jump host:
//!
//! ```text
//! Create ──→ Harden ──→ Validate
//! ```
//!
//! Nothing may create cluster nodes until `Validate` has succeeded: once
//! password logins are off and inbound SSH is restricted, a half-hardened
//! bastion would lock out every later phase without saying so.
//! [`BastionStatus::proxy_hop`] only hands out a hop for a validated host.

mod scripts;

use std::collections::BTreeMap;
use std::future::Future;
use std::net::IpAddr;

use meshkube_shared::constants::{protocol, provision};
use meshkube_shared::errors::{BastionError, MeshkubeError, MeshkubeResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::infra::Infrastructure;
use crate::options::{BastionOptions, SshOptions};
use crate::orchestrator::PhaseState;
use crate::provision::scripts::cloud_init_wait;
use crate::remote::{ProxyHop, RemoteTarget, SharedExecutor, records};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BastionStage {
    Create,
    Harden,
    Validate,
}

impl BastionStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            BastionStage::Create => "create",
            BastionStage::Harden => "harden",
            BastionStage::Validate => "validate",
        }
    }
}

/// Bastion status block of the run report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BastionStatus {
    pub name: String,
    pub public_ip: Option<IpAddr>,
    /// SSH port after hardening.
    pub ssh_port: u16,
    pub user: String,
    pub stages: BTreeMap<BastionStage, PhaseState>,
    /// Service name → `systemctl is-active` state seen during validation.
    pub services: BTreeMap<String, String>,
}

impl BastionStatus {
    fn new(name: &str, ssh_port: u16) -> Self {
        Self {
            name: name.to_string(),
            public_ip: None,
            ssh_port,
            user: String::new(),
            stages: [BastionStage::Create, BastionStage::Harden, BastionStage::Validate]
                .into_iter()
                .map(|s| (s, PhaseState::Pending))
                .collect(),
            services: BTreeMap::new(),
        }
    }

    pub fn stage(&self, stage: BastionStage) -> PhaseState {
        self.stages.get(&stage).copied().unwrap_or(PhaseState::Pending)
    }

    pub fn is_validated(&self) -> bool {
        self.stage(BastionStage::Validate) == PhaseState::Succeeded
    }

    /// Jump hop for cluster nodes. `None` until validation succeeded.
    pub fn proxy_hop(&self) -> Option<ProxyHop> {
        if !self.is_validated() {
            return None;
        }
        self.public_ip.map(|ip| ProxyHop {
            host: ip.to_string(),
            port: self.ssh_port,
            user: self.user.clone(),
        })
    }
}

/// Drives the bastion through its three stages.
pub struct BastionGate {
    executor: SharedExecutor,
    options: BastionOptions,
    ssh: SshOptions,
    status: Mutex<BastionStatus>,
}

impl BastionGate {
    pub fn new(executor: SharedExecutor, options: BastionOptions, ssh: SshOptions) -> Self {
        let status = BastionStatus::new(&options.name, options.ssh_port);
        Self {
            executor,
            options,
            ssh,
            status: Mutex::new(status),
        }
    }

    /// Current status, including partially completed stages.
    pub fn status(&self) -> BastionStatus {
        self.status.lock().clone()
    }

    /// Run Create → Harden → Validate, stopping at the first failure.
    pub async fn run(&self, infra: &dyn Infrastructure) -> MeshkubeResult<BastionStatus> {
        let initial = self
            .stage(BastionStage::Create, self.create(infra))
            .await?;
        self.stage(BastionStage::Harden, self.harden(&initial))
            .await?;

        let hardened = initial.with_port(self.options.ssh_port);
        self.stage(BastionStage::Validate, self.validate(&hardened))
            .await?;

        let status = self.status();
        tracing::info!(
            bastion = %status.name,
            target = %hardened,
            "Bastion validated"
        );
        Ok(status)
    }

    async fn stage<T>(
        &self,
        stage: BastionStage,
        work: impl Future<Output = MeshkubeResult<T>>,
    ) -> MeshkubeResult<T> {
        self.status.lock().stages.insert(stage, PhaseState::Running);
        tracing::info!(bastion = %self.options.name, stage = stage.as_str(), "Bastion stage started");

        let result = work.await;
        let state = if result.is_ok() {
            PhaseState::Succeeded
        } else {
            PhaseState::Failed
        };
        self.status.lock().stages.insert(stage, state);

        if let Err(e) = &result {
            tracing::error!(
                bastion = %self.options.name,
                stage = stage.as_str(),
                error = %e,
                "Bastion stage failed"
            );
        }
        result
    }

    /// Obtain the host and wait until it accepts SSH with cloud-init settled.
    async fn create(&self, infra: &dyn Infrastructure) -> MeshkubeResult<RemoteTarget> {
        let spec = infra
            .create_bastion(&self.options)
            .await
            .map_err(|e| BastionError::Create {
                host: self.options.name.clone(),
                reason: e.to_string(),
            })?;

        let user = self
            .ssh
            .user
            .clone()
            .unwrap_or_else(|| spec.provider.default_ssh_user().to_string());
        {
            let mut status = self.status.lock();
            status.public_ip = Some(spec.public_ip);
            status.user = user.clone();
        }

        let target = RemoteTarget::new(&self.options.name, spec.public_ip.to_string(), user)
            .with_port(self.ssh.port);
        self.executor
            .run(
                &target,
                &cloud_init_wait(provision::CLOUD_INIT_WAIT_SECS),
                self.ssh.install_timeout(),
            )
            .await?;
        Ok(target)
    }

    async fn harden(&self, target: &RemoteTarget) -> MeshkubeResult<()> {
        self.executor
            .run(target, &scripts::harden(&self.options), self.ssh.install_timeout())
            .await
            .map_err(|e| BastionError::Harden {
                host: self.options.name.clone(),
                source: Box::new(e.into()),
            })?;
        Ok(())
    }

    /// Independent round trip on the hardened port.
    async fn validate(&self, target: &RemoteTarget) -> MeshkubeResult<()> {
        let output = self
            .executor
            .run(target, &scripts::validate(&self.options), self.ssh.validate_timeout())
            .await
            .map_err(|e| {
                let e = MeshkubeError::from(e);
                BastionError::Validate {
                    host: self.options.name.clone(),
                    failed: vec![format!("ssh round trip: {e}")],
                    output: e.diagnostic().unwrap_or_default(),
                }
            })?;

        let services: BTreeMap<String, String> = records(&output.stdout, protocol::SERVICE)
            .iter()
            .map(|r| (r.field(0).to_string(), r.field(1).to_string()))
            .collect();
        self.status.lock().services = services.clone();

        let mut required = vec!["sshd", "ufw", "fail2ban"];
        if self.options.audit_log {
            required.push("auditd");
        }
        let failed: Vec<String> = required
            .into_iter()
            .filter_map(|name| match services.get(name).map(String::as_str) {
                Some("active") => None,
                Some(state) => Some(format!("{name}: {state}")),
                None => Some(format!("{name}: not reported")),
            })
            .collect();

        if !failed.is_empty() {
            return Err(BastionError::Validate {
                host: self.options.name.clone(),
                failed,
                output: output.stdout,
            }
            .into());
        }
        Ok(())
    }
}
