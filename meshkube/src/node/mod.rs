//! Cluster node model.
//!
//! Nodes live in an arena ([`NodeRegistry`]) indexed `0..n`. Everything
//! that refers to another node (mesh peers, the cluster leader) does so by
//! [`NodeIndex`], never by holding a reference into the registry.

mod registry;
mod state;

pub use registry::NodeRegistry;
pub use state::{NodeState, NodeStatus};

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

/// Cloud a machine was created on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    DigitalOcean,
    Linode,
    Aws,
    Azure,
    Gcp,
}

impl Provider {
    /// Login user the provider's stock Ubuntu images ship with.
    pub fn default_ssh_user(&self) -> &'static str {
        match self {
            Provider::Azure => "azureuser",
            Provider::Aws | Provider::Gcp => "ubuntu",
            Provider::DigitalOcean | Provider::Linode => "root",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Provider::DigitalOcean => "digitalocean",
            Provider::Linode => "linode",
            Provider::Aws => "aws",
            Provider::Azure => "azure",
            Provider::Gcp => "gcp",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Worker,
}

/// Machine handed over by the infrastructure layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    pub provider: Provider,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub size: String,
    pub public_ip: IpAddr,
    #[serde(default)]
    pub private_ip: Option<IpAddr>,
    /// Explicit roles. Left empty, roles are assigned by position once at
    /// registration.
    #[serde(default)]
    pub roles: Vec<Role>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, provider: Provider, public_ip: IpAddr) -> Self {
        Self {
            name: name.into(),
            provider,
            region: String::new(),
            size: String::new(),
            public_ip,
            private_ip: None,
            roles: Vec::new(),
        }
    }

    pub fn with_roles(mut self, roles: impl IntoIterator<Item = Role>) -> Self {
        self.roles = roles.into_iter().collect();
        self
    }
}

/// Position of a node in the registry arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeIndex(pub usize);

impl fmt::Display for NodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A registered node. Values handed to phases are snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub index: NodeIndex,
    pub name: String,
    pub provider: Provider,
    pub region: String,
    pub size: String,
    pub public_ip: IpAddr,
    pub private_ip: Option<IpAddr>,
    pub mesh_ip: Ipv4Addr,
    pub roles: Vec<Role>,
    pub state: NodeState,
}

impl Node {
    pub fn is_master(&self) -> bool {
        self.roles.contains(&Role::Master)
    }

    pub fn is_worker(&self) -> bool {
        !self.is_master() && self.roles.contains(&Role::Worker)
    }

    pub fn status(&self) -> NodeStatus {
        self.state.status
    }

    pub fn is_live(&self) -> bool {
        !self.state.status.is_failed()
    }

    /// SSH login for this node, honoring a global override.
    pub fn ssh_user(&self, user_override: Option<&str>) -> String {
        user_override
            .unwrap_or_else(|| self.provider.default_ssh_user())
            .to_string()
    }
}

/// Positional roles: the first `masters` entries are masters, the rest workers.
pub fn positional_roles(count: usize, masters: usize) -> Vec<Role> {
    (0..count)
        .map(|i| if i < masters { Role::Master } else { Role::Worker })
        .collect()
}
