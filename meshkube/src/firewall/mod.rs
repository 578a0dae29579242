//! Host firewall.
//!
//! Each node gets a ufw rule set for its role after provisioning: inbound
//! traffic is denied except for SSH, WireGuard and the Kubernetes ports the
//! role needs. Cluster-internal ports only accept the internal range.

mod rules;
mod scripts;

use std::time::Duration;

use meshkube_shared::constants::{firewall, protocol};
use meshkube_shared::errors::{MeshkubeResult, ProvisionError};
use serde::{Deserialize, Serialize};

use crate::node::Node;
use crate::remote::{RemoteTarget, SharedExecutor, records};

pub use rules::{FirewallPolicy, FirewallRule, Protocol};

/// What the node reported after the rules were applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallReport {
    pub node: String,
    pub state: String,
    pub rules: usize,
}

pub struct NodeFirewall {
    executor: SharedExecutor,
    policy: FirewallPolicy,
    timeout: Duration,
}

impl NodeFirewall {
    pub fn new(executor: SharedExecutor, policy: FirewallPolicy, timeout: Duration) -> Self {
        Self {
            executor,
            policy,
            timeout,
        }
    }

    pub fn policy(&self) -> &FirewallPolicy {
        &self.policy
    }

    /// Apply the node's rule set and check ufw came up with all of it.
    ///
    /// # Errors
    ///
    /// `ProvisionError::Remote` when the script cannot run, and
    /// `ProvisionError::Firewall` when ufw is inactive or rules are missing.
    pub async fn apply(&self, node: &Node, target: &RemoteTarget) -> MeshkubeResult<FirewallReport> {
        let rules = self.policy.rules_for(node);
        tracing::debug!(node = %node.name, rules = rules.len(), "Applying host firewall");

        let output = self
            .executor
            .run(target, &scripts::apply(&rules), self.timeout)
            .await
            .map_err(|e| ProvisionError::Remote {
                node: node.name.clone(),
                source: e,
            })?;

        let status = records(&output.stdout, protocol::FIREWALL)
            .last()
            .map(|r| (r.field(0).to_string(), r.field(1).parse::<usize>().unwrap_or(0)));
        let Some((state, present)) = status else {
            return Err(ProvisionError::Firewall {
                node: node.name.clone(),
                reason: "no status reported".into(),
                output: output.stdout,
            }
            .into());
        };

        let reason = if state != "active" {
            Some(format!("ufw is {state}"))
        } else if present < rules.len() {
            Some(format!(
                "{present} of {} '{}' rules in place",
                rules.len(),
                firewall::COMMENT_PREFIX
            ))
        } else {
            None
        };
        if let Some(reason) = reason {
            tracing::warn!(node = %node.name, %reason, "Host firewall incomplete");
            return Err(ProvisionError::Firewall {
                node: node.name.clone(),
                reason,
                output: output.stdout,
            }
            .into());
        }

        tracing::info!(node = %node.name, rules = present, "Host firewall active");
        Ok(FirewallReport {
            node: node.name.clone(),
            state,
            rules: present,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeRegistry, NodeSpec, Provider};
    use crate::options::{ClusterOptions, MeshOptions};
    use crate::remote::{ExecOutput, RemoteExecutor, RemoteScript};
    use async_trait::async_trait;
    use meshkube_shared::errors::{MeshkubeError, RemoteError};
    use std::sync::Arc;

    /// Answers with a fixed ufw state and the given rule shortfall.
    struct FakeUfw {
        state: &'static str,
        missing: usize,
    }

    #[async_trait]
    impl RemoteExecutor for FakeUfw {
        async fn run(
            &self,
            _target: &RemoteTarget,
            script: &RemoteScript,
            _timeout: Duration,
        ) -> Result<ExecOutput, RemoteError> {
            assert_eq!(script.step(), "firewall.apply");
            let added = script
                .text()
                .lines()
                .filter(|l| l.starts_with("ufw allow") && l.contains("meshkube:"))
                .count();
            Ok(ExecOutput::stdout(format!(
                "Firewall is active and enabled on system startup\nFIREWALL|{}|{}\n",
                self.state,
                added - self.missing
            )))
        }
    }

    fn worker() -> Node {
        let registry = NodeRegistry::new();
        registry
            .register(
                vec![
                    NodeSpec::new("m1", Provider::Linode, "203.0.113.1".parse().unwrap()),
                    NodeSpec::new("w1", Provider::Linode, "203.0.113.2".parse().unwrap()),
                ],
                &MeshOptions::default(),
                1,
            )
            .unwrap();
        registry.snapshot().remove(1)
    }

    fn firewall(state: &'static str, missing: usize) -> NodeFirewall {
        NodeFirewall::new(
            Arc::new(FakeUfw { state, missing }),
            FirewallPolicy::new(&ClusterOptions::default(), None),
            Duration::from_secs(30),
        )
    }

    fn target(node: &Node) -> RemoteTarget {
        RemoteTarget::new(&node.name, node.public_ip.to_string(), "root")
    }

    #[tokio::test]
    async fn active_firewall_with_every_rule_passes() {
        let node = worker();
        let firewall = firewall("active", 0);
        let report = firewall.apply(&node, &target(&node)).await.unwrap();

        assert_eq!(report.state, "active");
        assert_eq!(report.rules, firewall.policy().rules_for(&node).len());
    }

    #[tokio::test]
    async fn inactive_or_partial_firewall_fails() {
        let node = worker();

        let err = firewall("inactive", 0).apply(&node, &target(&node)).await.unwrap_err();
        assert!(matches!(
            err,
            MeshkubeError::Provision(ProvisionError::Firewall { ref reason, .. }) if reason == "ufw is inactive"
        ));
        assert!(err.diagnostic().is_some_and(|d| d.contains("FIREWALL|inactive")));

        let err = firewall("active", 2).apply(&node, &target(&node)).await.unwrap_err();
        assert_eq!(err.implicated_nodes(), vec!["w1".to_string()]);
        assert!(err.to_string().contains("rules in place"), "{err}");
    }
}
