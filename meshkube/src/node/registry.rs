//! Node arena owned by the orchestrator.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use meshkube_shared::errors::{MeshkubeError, MeshkubeResult};
use parking_lot::RwLock;

use super::{Node, NodeIndex, NodeSpec, NodeState, NodeStatus, positional_roles};
use crate::options::MeshOptions;

/// Registry of every node in the run.
///
/// Cloneable handle; readers take snapshots, and only the orchestrator's
/// phase-completion path writes (`advance`, `fail`).
#[derive(Clone, Debug, Default)]
pub struct NodeRegistry {
    inner: Arc<RwLock<Vec<Node>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register machines in creation order.
    ///
    /// Mesh addresses are derived from the index. Roles come from the specs;
    /// when no spec carries any, the first `masters` nodes become masters.
    /// Roles are fixed from here on.
    pub fn register(
        &self,
        specs: Vec<NodeSpec>,
        mesh: &MeshOptions,
        masters: usize,
    ) -> MeshkubeResult<()> {
        let mut nodes = self.inner.write();
        if !nodes.is_empty() {
            return Err(MeshkubeError::InvalidState(
                "nodes are already registered for this run".into(),
            ));
        }

        let mut seen = HashSet::new();
        for spec in &specs {
            if !seen.insert(spec.name.as_str()) {
                return Err(MeshkubeError::Config(format!(
                    "duplicate node name '{}'",
                    spec.name
                )));
            }
        }

        let with_roles = specs.iter().filter(|s| !s.roles.is_empty()).count();
        let fallback = if with_roles == 0 {
            if masters > specs.len() {
                return Err(MeshkubeError::Config(format!(
                    "{} masters requested but only {} nodes exist",
                    masters,
                    specs.len()
                )));
            }
            tracing::info!(masters, nodes = specs.len(), "Assigning roles by creation order");
            Some(positional_roles(specs.len(), masters))
        } else if with_roles != specs.len() {
            return Err(MeshkubeError::Config(
                "roles must be given for every node or for none".into(),
            ));
        } else {
            None
        };

        let mut registered = Vec::with_capacity(specs.len());
        for (i, spec) in specs.into_iter().enumerate() {
            let roles = match &fallback {
                Some(roles) => vec![roles[i]],
                None => spec.roles,
            };
            let node = Node {
                index: NodeIndex(i),
                mesh_ip: mesh.address_for(i)?,
                name: spec.name,
                provider: spec.provider,
                region: spec.region,
                size: spec.size,
                public_ip: spec.public_ip,
                private_ip: spec.private_ip,
                roles,
                state: NodeState::new(),
            };
            tracing::debug!(
                node = %node.name,
                index = i,
                mesh_ip = %node.mesh_ip,
                roles = ?node.roles,
                "Registering node"
            );
            registered.push(node);
        }

        *nodes = registered;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Every node, failed ones included.
    pub fn snapshot(&self) -> Vec<Node> {
        self.inner.read().clone()
    }

    /// Nodes that have not failed.
    pub fn live(&self) -> Vec<Node> {
        self.inner.read().iter().filter(|n| n.is_live()).cloned().collect()
    }

    pub fn get(&self, index: NodeIndex) -> Option<Node> {
        self.inner.read().get(index.0).cloned()
    }

    pub(crate) fn advance(&self, index: NodeIndex, status: NodeStatus) -> MeshkubeResult<()> {
        let mut nodes = self.inner.write();
        let node = nodes
            .get_mut(index.0)
            .ok_or_else(|| MeshkubeError::Internal(format!("node {index} not registered")))?;
        let old = node.state.status;
        node.state.transition_to(status).map_err(|e| {
            MeshkubeError::InvalidState(format!("node {}: {}", node.name, e))
        })?;
        tracing::debug!(node = %node.name, old_status = %old, new_status = %status, "Node advanced");
        Ok(())
    }

    pub(crate) fn fail(&self, index: NodeIndex, reason: impl Into<String>) {
        let mut nodes = self.inner.write();
        if let Some(node) = nodes.get_mut(index.0) {
            let reason = reason.into();
            tracing::warn!(node = %node.name, status = %node.state.status, %reason, "Node failed");
            node.state.fail(reason);
        }
    }

    /// Name → status for every node.
    pub fn statuses(&self) -> BTreeMap<String, NodeStatus> {
        self.inner
            .read()
            .iter()
            .map(|n| (n.name.clone(), n.state.status))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Provider, Role};
    use std::net::{IpAddr, Ipv4Addr};

    fn spec(name: &str, last: u8) -> NodeSpec {
        NodeSpec::new(
            name,
            Provider::DigitalOcean,
            IpAddr::V4(Ipv4Addr::new(203, 0, 113, last)),
        )
    }

    #[test]
    fn positional_roles_when_none_given() {
        let registry = NodeRegistry::new();
        registry
            .register(
                vec![spec("a", 1), spec("b", 2), spec("c", 3), spec("d", 4)],
                &MeshOptions::default(),
                3,
            )
            .unwrap();
        let nodes = registry.snapshot();
        assert!(nodes[..3].iter().all(Node::is_master));
        assert!(nodes[3].is_worker());
        assert_eq!(nodes[3].mesh_ip, Ipv4Addr::new(10, 8, 0, 13));
    }

    #[test]
    fn explicit_roles_are_kept() {
        let registry = NodeRegistry::new();
        registry
            .register(
                vec![
                    spec("w", 1).with_roles([Role::Worker]),
                    spec("m", 2).with_roles([Role::Master]),
                ],
                &MeshOptions::default(),
                1,
            )
            .unwrap();
        let nodes = registry.snapshot();
        assert!(nodes[0].is_worker());
        assert!(nodes[1].is_master());
    }

    #[test]
    fn mixed_roles_are_rejected() {
        let registry = NodeRegistry::new();
        let err = registry
            .register(
                vec![spec("a", 1).with_roles([Role::Master]), spec("b", 2)],
                &MeshOptions::default(),
                1,
            )
            .unwrap_err();
        assert!(matches!(err, MeshkubeError::Config(_)));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let registry = NodeRegistry::new();
        let err = registry
            .register(vec![spec("a", 1), spec("a", 2)], &MeshOptions::default(), 1)
            .unwrap_err();
        assert!(err.to_string().contains("duplicate node name"));
    }

    #[test]
    fn failed_nodes_drop_out_of_live_set() {
        let registry = NodeRegistry::new();
        registry
            .register(vec![spec("a", 1), spec("b", 2)], &MeshOptions::default(), 1)
            .unwrap();
        registry.advance(NodeIndex(0), NodeStatus::Provisioned).unwrap();
        registry.fail(NodeIndex(1), "dial timeout");

        let live = registry.live();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].name, "a");
        assert_eq!(registry.statuses()["b"], NodeStatus::Failed);
        assert!(registry.advance(NodeIndex(1), NodeStatus::Provisioned).is_err());
    }
}
