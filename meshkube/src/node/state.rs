//! Node lifecycle status and state machine.

use chrono::{DateTime, Utc};
use meshkube_shared::errors::{MeshkubeError, MeshkubeResult};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a cluster node.
///
/// ```text
/// Created → Provisioned → MeshJoined → ClusterJoined → Ready
///    └──────────┴─────────────┴─────────────┴───────────┴──→ Failed
/// ```
///
/// `Failed` is terminal for the run; a failed node keeps its index and
/// mesh address and is never recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Machine exists and answers (or will answer) SSH.
    Created,

    /// OS prerequisites installed and independently validated.
    Provisioned,

    /// WireGuard interface configured with the full peer set.
    MeshJoined,

    /// Kubernetes service installed and joined.
    ClusterJoined,

    /// Node reported Ready and schedulable by the API server.
    Ready,

    Failed,
}

impl NodeStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, NodeStatus::Failed)
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, NodeStatus::Ready)
    }

    /// Check if transition to target state is valid.
    pub fn can_transition_to(&self, target: NodeStatus) -> bool {
        use NodeStatus::*;
        matches!(
            (self, target),
            (Created, Provisioned)
                | (Provisioned, MeshJoined)
                | (MeshJoined, ClusterJoined)
                | (ClusterJoined, Ready)
                // Any live node can fail
                | (Created | Provisioned | MeshJoined | ClusterJoined | Ready, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Created => "created",
            NodeStatus::Provisioned => "provisioned",
            NodeStatus::MeshJoined => "mesh_joined",
            NodeStatus::ClusterJoined => "cluster_joined",
            NodeStatus::Ready => "ready",
            NodeStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for NodeStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(NodeStatus::Created),
            "provisioned" => Ok(NodeStatus::Provisioned),
            "mesh_joined" => Ok(NodeStatus::MeshJoined),
            "cluster_joined" => Ok(NodeStatus::ClusterJoined),
            "ready" => Ok(NodeStatus::Ready),
            "failed" => Ok(NodeStatus::Failed),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Dynamic node state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub status: NodeStatus,
    /// Why the node failed, when it did.
    pub failure: Option<String>,
    pub last_updated: DateTime<Utc>,
}

impl NodeState {
    pub fn new() -> Self {
        Self {
            status: NodeStatus::Created,
            failure: None,
            last_updated: Utc::now(),
        }
    }

    /// Attempt state transition with validation.
    pub fn transition_to(&mut self, new_status: NodeStatus) -> MeshkubeResult<()> {
        if !self.status.can_transition_to(new_status) {
            return Err(MeshkubeError::InvalidState(format!(
                "Cannot transition from {} to {}",
                self.status, new_status
            )));
        }
        self.status = new_status;
        self.last_updated = Utc::now();
        Ok(())
    }

    /// Mark failed with a reason. Already-failed nodes keep their first reason.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.status.is_failed() {
            return;
        }
        self.status = NodeStatus::Failed;
        self.failure = Some(reason.into());
        self.last_updated = Utc::now();
    }
}

impl Default for NodeState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_chain() {
        let mut state = NodeState::new();
        for next in [
            NodeStatus::Provisioned,
            NodeStatus::MeshJoined,
            NodeStatus::ClusterJoined,
            NodeStatus::Ready,
        ] {
            state.transition_to(next).unwrap();
        }
        assert!(state.status.is_ready());
    }

    #[test]
    fn test_skipping_stages_is_rejected() {
        let mut state = NodeState::new();
        let err = state.transition_to(NodeStatus::MeshJoined).unwrap_err();
        assert!(err.to_string().contains("Cannot transition from created to mesh_joined"));
        assert_eq!(state.status, NodeStatus::Created);
    }

    #[test]
    fn test_failed_is_terminal() {
        let mut state = NodeState::new();
        state.fail("ssh dial failed");
        state.fail("second reason");
        assert_eq!(state.failure.as_deref(), Some("ssh dial failed"));
        for target in [
            NodeStatus::Created,
            NodeStatus::Provisioned,
            NodeStatus::Ready,
            NodeStatus::Failed,
        ] {
            assert!(!NodeStatus::Failed.can_transition_to(target));
        }
    }

    #[test]
    fn test_status_round_trip_through_str() {
        for status in [
            NodeStatus::Created,
            NodeStatus::Provisioned,
            NodeStatus::MeshJoined,
            NodeStatus::ClusterJoined,
            NodeStatus::Ready,
            NodeStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<NodeStatus>(), Ok(status));
        }
        assert!("running".parse::<NodeStatus>().is_err());
    }
}
