//! meshkube - Kubernetes over a WireGuard full mesh
//!
//! Takes machines from any mix of clouds and turns them into one cluster:
//! an optional hardened bastion, prepared nodes, a validated full mesh, and
//! a K3s/RKE2 control plane joined over mesh addresses. An [`Orchestrator`]
//! runs everything as an explicit phase graph and returns a [`RunReport`].

pub mod addons;
pub mod bastion;
pub mod cluster;
pub mod firewall;
pub mod infra;
pub mod mesh;
pub mod node;
pub mod options;
pub mod orchestrator;
pub mod provision;
pub mod remote;
pub mod retry;
pub mod util;

pub use meshkube_shared::errors::{MeshkubeError, MeshkubeResult};

pub use infra::{Infrastructure, StaticInfrastructure};
pub use node::{Node, NodeIndex, NodeRegistry, NodeSpec, NodeStatus, Provider, Role};
pub use options::ClusterOptions;
pub use orchestrator::{Orchestrator, RunOutcome, RunReport};
pub use remote::{ExecOutput, RemoteExecutor, RemoteScript, RemoteTarget, SharedExecutor, SshExecutor};
pub use retry::BackoffPolicy;
pub use util::{LoggingOptions, init_logging};
