//! Node preparation.
//!
//! Brings one machine from "exists" to "has a container runtime, WireGuard
//! tooling and Kubernetes kernel settings":
//!
//! ```text
//! cloud-init wait ──→ validate ──(all ok)──→ done (already provisioned)
//!                        │
//!                        └──(missing)──→ [lock wait → install → verify] × retries
//!                                                        │
//!                                                        └──→ validate (authoritative)
//! ```
//!
//! Installer exit codes are never trusted: each attempt ends with an
//! independent verification, and the final validation pass decides.

pub(crate) mod scripts;

use std::time::Duration;

use meshkube_shared::constants::{protocol, provision};
use meshkube_shared::errors::{MeshkubeError, MeshkubeResult, ProvisionError, RemoteError};
use serde::{Deserialize, Serialize};

use crate::options::{ProvisioningOptions, SshOptions};
use crate::remote::{RemoteTarget, SharedExecutor, records, tail};

/// Checks the final validation pass must see, with required output text.
const VALIDATION_CHECKS: &[(&str, Option<&str>)] = &[
    ("docker", Some("Docker version")),
    ("docker-daemon", None),
    ("wireguard", Some("wireguard-tools")),
    ("ip_forward", None),
    ("overlay", None),
    ("br_netfilter", None),
    ("disk", None),
];

/// Checks run right after each install attempt.
const VERIFY_CHECKS: &[(&str, Option<&str>)] = &[
    ("docker", Some("Docker version")),
    ("docker-daemon", None),
    ("wireguard", Some("wireguard-tools")),
];

/// Result of one prerequisite check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrereqCheck {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

/// Parsed output of a verification script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub checks: Vec<PrereqCheck>,
}

impl ValidationReport {
    /// Evaluate `CHECK` lines against `expected`. Checks absent from the
    /// output are recorded as failed.
    pub fn parse(output: &str, expected: &[(&str, Option<&str>)]) -> Self {
        let recs = records(output, protocol::CHECK);
        let checks = expected
            .iter()
            .map(|(name, must_contain)| {
                match recs.iter().find(|r| r.field(0) == *name) {
                    Some(rec) => {
                        let detail = rec.rest(2);
                        let content_ok = must_contain.is_none_or(|needle| detail.contains(needle));
                        PrereqCheck {
                            name: name.to_string(),
                            ok: rec.field(1) == "ok" && content_ok,
                            detail,
                        }
                    }
                    None => PrereqCheck {
                        name: name.to_string(),
                        ok: false,
                        detail: "no result reported".into(),
                    },
                }
            })
            .collect();
        Self { checks }
    }

    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.ok)
    }

    /// `name: detail` for every failing check.
    pub fn failures(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|c| !c.ok)
            .map(|c| format!("{}: {}", c.name, c.detail))
            .collect()
    }
}

/// Outcome of a successful provisioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionReport {
    pub node: String,
    /// Validation passed before any install was attempted.
    pub already_provisioned: bool,
    /// Install attempts made (0 when already provisioned).
    pub attempts: u32,
    /// Stale package manager locks were forcibly cleared.
    pub lock_forced: bool,
    pub checks: Vec<PrereqCheck>,
}

/// Installs OS prerequisites on nodes.
#[derive(Clone)]
pub struct NodeProvisioner {
    executor: SharedExecutor,
    options: ProvisioningOptions,
    install_timeout: Duration,
    validate_timeout: Duration,
}

impl NodeProvisioner {
    pub fn new(executor: SharedExecutor, options: ProvisioningOptions, ssh: &SshOptions) -> Self {
        Self {
            executor,
            options,
            install_timeout: ssh.install_timeout(),
            validate_timeout: ssh.validate_timeout(),
        }
    }

    /// Provision one node.
    ///
    /// # Errors
    ///
    /// - [`RemoteError::DialTimeout`] if the node never accepts SSH
    /// - [`ProvisionError::LockTimeout`] if the last attempt still found the
    ///   package manager locked
    /// - [`ProvisionError::InstallFailed`] once the install retry budget is spent
    /// - [`ProvisionError::ValidationFailed`] if the final pass finds gaps
    pub async fn provision(&self, target: &RemoteTarget) -> MeshkubeResult<ProvisionReport> {
        let node = target.node.as_str();
        tracing::info!(node, target = %target, "Provisioning node");

        self.executor
            .run(
                target,
                &scripts::cloud_init_wait(self.options.cloud_init_wait_secs),
                Duration::from_secs(self.options.cloud_init_wait_secs) + self.validate_timeout,
            )
            .await?;

        let before = self.validate(target).await?;
        if before.passed() {
            tracing::info!(node, "Prerequisites already present, skipping install");
            return Ok(ProvisionReport {
                node: node.to_string(),
                already_provisioned: true,
                attempts: 0,
                lock_forced: false,
                checks: before.checks,
            });
        }
        tracing::debug!(node, missing = ?before.failures(), "Prerequisites missing");

        let mut attempts = 0;
        let install = self
            .options
            .install_retry
            .retry_if(
                &format!("install on {node}"),
                is_install_retryable,
                |attempt| {
                    attempts = attempt;
                    self.install_attempt(target, attempt)
                },
            )
            .await;

        let lock_forced = match install {
            Ok(forced) => forced,
            Err(MeshkubeError::Remote(source)) if source.is_dial_failure() => {
                return Err(ProvisionError::Remote {
                    node: node.to_string(),
                    source,
                }
                .into());
            }
            Err(MeshkubeError::Provision(lock @ ProvisionError::LockTimeout { .. })) => {
                tracing::error!(node, attempts, "Package manager lock never released");
                return Err(lock.into());
            }
            Err(e) => {
                return Err(ProvisionError::InstallFailed {
                    node: node.to_string(),
                    attempts,
                    diagnostic: e.diagnostic().unwrap_or_default(),
                    last: e.to_string(),
                }
                .into());
            }
        };

        let after = self.validate(target).await?;
        if !after.passed() {
            let failed = after.failures();
            tracing::error!(node, ?failed, "Post-install validation failed");
            return Err(ProvisionError::ValidationFailed {
                node: node.to_string(),
                failed,
                output: render_checks(&after),
            }
            .into());
        }

        tracing::info!(node, attempts, lock_forced, "Node provisioned");
        Ok(ProvisionReport {
            node: node.to_string(),
            already_provisioned: false,
            attempts,
            lock_forced,
            checks: after.checks,
        })
    }

    /// Run the authoritative validation pass.
    pub async fn validate(&self, target: &RemoteTarget) -> MeshkubeResult<ValidationReport> {
        let output = self
            .executor
            .run(
                target,
                &scripts::validate(self.options.disk_usage_ceiling_percent),
                self.validate_timeout,
            )
            .await?;
        Ok(ValidationReport::parse(&output.stdout, VALIDATION_CHECKS))
    }

    /// Lock wait, install and verification. Returns whether locks were forced.
    async fn install_attempt(&self, target: &RemoteTarget, attempt: u32) -> MeshkubeResult<bool> {
        let node = target.node.as_str();
        tracing::debug!(node, attempt, "Install attempt");

        let lock_wait = Duration::from_secs(self.options.lock_wait_secs);
        let lock = self
            .executor
            .run(
                target,
                &scripts::lock_wait(self.options.lock_wait_secs, self.options.lock_poll_secs),
                lock_wait + self.validate_timeout,
            )
            .await
            .map_err(|e| match e {
                RemoteError::ScriptFailed { exit_code, .. }
                    if exit_code == provision::LOCK_HELD_EXIT_CODE =>
                {
                    ProvisionError::LockTimeout {
                        node: node.to_string(),
                        waited: lock_wait,
                    }
                    .into()
                }
                other => MeshkubeError::from(other),
            })?;
        let lock_forced = lock.stdout.contains(protocol::LOCK_FORCED);
        if lock_forced {
            tracing::warn!(node, "Cleared stale package manager locks");
        }

        self.executor
            .run(target, &scripts::install(), self.install_timeout)
            .await?;

        let output = self
            .executor
            .run(target, &scripts::verify(), self.validate_timeout)
            .await?;
        let verify = ValidationReport::parse(&output.stdout, VERIFY_CHECKS);
        if !verify.passed() {
            // installer reported success but left gaps
            return Err(ProvisionError::ValidationFailed {
                node: node.to_string(),
                failed: verify.failures(),
                output: tail(&output.stdout, 20),
            }
            .into());
        }

        Ok(lock_forced)
    }
}

/// Transient errors, plus install and verification failures: installers
/// fail spuriously often enough that a fresh attempt is worth it.
fn is_install_retryable(e: &MeshkubeError) -> bool {
    e.is_transient()
        || matches!(
            e,
            MeshkubeError::Remote(RemoteError::ScriptFailed { .. } | RemoteError::Timeout { .. })
                | MeshkubeError::Provision(ProvisionError::ValidationFailed { .. })
        )
}

fn render_checks(report: &ValidationReport) -> String {
    report
        .checks
        .iter()
        .map(|c| format!("{:<14} {:<4} {}", c.name, if c.ok { "ok" } else { "FAIL" }, c.detail))
        .collect::<Vec<_>>()
        .join("\n")
}
