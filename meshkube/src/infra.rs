//! Infrastructure collaborator.
//!
//! Cloud resource creation stays outside this crate. The orchestrator asks
//! an [`Infrastructure`] for machines at the point in the phase graph where
//! they may exist, which is what makes "no node before a validated bastion"
//! enforceable.

use async_trait::async_trait;
use meshkube_shared::errors::{MeshkubeError, MeshkubeResult};

use crate::node::NodeSpec;
use crate::options::BastionOptions;

#[async_trait]
pub trait Infrastructure: Send + Sync {
    /// Create (or look up) the jump host.
    async fn create_bastion(&self, options: &BastionOptions) -> MeshkubeResult<NodeSpec>;

    /// Create (or look up) cluster machines, in a stable creation order.
    async fn create_nodes(&self) -> MeshkubeResult<Vec<NodeSpec>>;
}

/// Machines that already exist.
#[derive(Debug, Clone, Default)]
pub struct StaticInfrastructure {
    bastion: Option<NodeSpec>,
    nodes: Vec<NodeSpec>,
}

impl StaticInfrastructure {
    pub fn new(nodes: Vec<NodeSpec>) -> Self {
        Self {
            bastion: None,
            nodes,
        }
    }

    pub fn with_bastion(mut self, bastion: NodeSpec) -> Self {
        self.bastion = Some(bastion);
        self
    }
}

#[async_trait]
impl Infrastructure for StaticInfrastructure {
    async fn create_bastion(&self, options: &BastionOptions) -> MeshkubeResult<NodeSpec> {
        self.bastion.clone().ok_or_else(|| {
            MeshkubeError::Infrastructure(format!(
                "bastion '{}' is enabled but no bastion host was supplied",
                options.name
            ))
        })
    }

    async fn create_nodes(&self) -> MeshkubeResult<Vec<NodeSpec>> {
        Ok(self.nodes.clone())
    }
}
