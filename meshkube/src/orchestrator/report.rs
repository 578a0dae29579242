//! Run report.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use meshkube_shared::errors::{MeshkubeError, MeshkubeResult};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use super::phase::{PhaseRecord, PhaseState};
use crate::bastion::BastionStatus;
use crate::mesh::{ConnectivityMatrix, MeshSummary};
use crate::node::NodeStatus;

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every phase succeeded and every node is Ready.
    Ready,

    /// The cluster is up, but something needs attention.
    Degraded { warnings: Vec<String> },

    /// A fatal phase halted the run.
    Failed {
        phase: String,
        nodes: Vec<String>,
        diagnostic: String,
        message: String,
    },
}

impl RunOutcome {
    /// Outcome for a fatal error, unwrapping the phase it was raised in.
    pub fn from_error(error: &MeshkubeError) -> Self {
        let (phase, message) = match error {
            MeshkubeError::Phase { phase, source, .. } => (phase.clone(), source.to_string()),
            other => (String::new(), other.to_string()),
        };
        RunOutcome::Failed {
            phase,
            nodes: error.implicated_nodes(),
            diagnostic: error.diagnostic().unwrap_or_default(),
            message,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, RunOutcome::Ready)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, RunOutcome::Failed { .. })
    }
}

/// Everything a caller needs after a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Ulid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub phases: Vec<PhaseRecord>,
    pub nodes: BTreeMap<String, NodeStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bastion: Option<BastionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh: Option<MeshSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connectivity: Option<ConnectivityMatrix>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<String>,
}

impl RunReport {
    pub fn phase_state(&self, name: &str) -> Option<PhaseState> {
        self.phases.iter().find(|p| p.name == name).map(|p| p.state)
    }

    pub fn node_status(&self, name: &str) -> Option<NodeStatus> {
        self.nodes.get(name).copied()
    }

    pub fn warnings(&self) -> &[String] {
        match &self.outcome {
            RunOutcome::Degraded { warnings } => warnings,
            _ => &[],
        }
    }

    pub fn to_json(&self) -> MeshkubeResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| MeshkubeError::Internal(format!("failed to serialize run report: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshkube_shared::errors::RemoteError;

    fn report(outcome: RunOutcome) -> RunReport {
        let now = Utc::now();
        RunReport {
            run_id: Ulid::new(),
            started_at: now,
            finished_at: now,
            outcome,
            phases: Vec::new(),
            nodes: BTreeMap::from([("m1".to_string(), NodeStatus::Ready)]),
            bastion: None,
            mesh: None,
            connectivity: None,
            kubeconfig: None,
        }
    }

    #[test]
    fn failed_outcome_carries_phase_nodes_and_diagnostic() {
        let error = MeshkubeError::phase(
            "nodes.provision",
            RemoteError::DialTimeout {
                node: "w3".into(),
                host: "203.0.113.9".into(),
                attempts: 30,
                last: "Connection timed out".into(),
            }
            .into(),
        );
        match RunOutcome::from_error(&error) {
            RunOutcome::Failed {
                phase,
                nodes,
                diagnostic,
                message,
            } => {
                assert_eq!(phase, "nodes.provision");
                assert_eq!(nodes, vec!["w3".to_string()]);
                assert_eq!(diagnostic, "Connection timed out");
                assert!(message.starts_with("remote: w3 (203.0.113.9)"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn json_is_tagged_and_omits_empty_blocks() {
        let json = report(RunOutcome::Degraded {
            warnings: vec!["w3: join failed".into()],
        })
        .to_json()
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["outcome"]["status"], "degraded");
        assert_eq!(value["outcome"]["warnings"][0], "w3: join failed");
        assert_eq!(value["nodes"]["m1"], "ready");
        assert!(value.get("bastion").is_none());
        assert!(value.get("kubeconfig").is_none());
    }

    #[test]
    fn warnings_only_for_degraded_runs() {
        assert!(report(RunOutcome::Ready).warnings().is_empty());
        let degraded = report(RunOutcome::Degraded {
            warnings: vec!["a".into()],
        });
        assert_eq!(degraded.warnings(), ["a".to_string()]);
        assert!(!degraded.outcome.is_ready());
    }
}
