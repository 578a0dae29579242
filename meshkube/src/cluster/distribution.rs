use std::fmt;
use std::str::FromStr;

use meshkube_shared::constants::cluster;
use serde::{Deserialize, Serialize};

/// Kubernetes distribution installed on the nodes.
///
/// Both read `/etc/rancher/<name>/config.yaml`, which is how every install
/// is parameterized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distribution {
    #[default]
    K3s,
    Rke2,
}

impl Distribution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Distribution::K3s => "k3s",
            Distribution::Rke2 => "rke2",
        }
    }

    pub fn server_service(&self) -> &'static str {
        match self {
            Distribution::K3s => "k3s",
            Distribution::Rke2 => "rke2-server",
        }
    }

    pub fn agent_service(&self) -> &'static str {
        match self {
            Distribution::K3s => "k3s-agent",
            Distribution::Rke2 => "rke2-agent",
        }
    }

    pub fn config_dir(&self) -> &'static str {
        match self {
            Distribution::K3s => "/etc/rancher/k3s",
            Distribution::Rke2 => "/etc/rancher/rke2",
        }
    }

    pub fn token_path(&self) -> &'static str {
        match self {
            Distribution::K3s => "/var/lib/rancher/k3s/server/node-token",
            Distribution::Rke2 => "/var/lib/rancher/rke2/server/node-token",
        }
    }

    pub fn kubeconfig_path(&self) -> &'static str {
        match self {
            Distribution::K3s => "/etc/rancher/k3s/k3s.yaml",
            Distribution::Rke2 => "/etc/rancher/rke2/rke2.yaml",
        }
    }

    /// Port followers register against.
    pub fn join_port(&self) -> u16 {
        match self {
            Distribution::K3s => cluster::API_PORT,
            Distribution::Rke2 => cluster::RKE2_SUPERVISOR_PORT,
        }
    }

    pub fn kubectl(&self) -> &'static str {
        match self {
            Distribution::K3s => "k3s kubectl",
            Distribution::Rke2 => {
                "/var/lib/rancher/rke2/bin/kubectl --kubeconfig /etc/rancher/rke2/rke2.yaml"
            }
        }
    }

    /// Installer invocation. Services are started separately.
    pub fn install_command(&self, server: bool) -> &'static str {
        match (self, server) {
            (Distribution::K3s, true) => {
                "curl -sfL https://get.k3s.io | INSTALL_K3S_SKIP_START=true sh -s - server"
            }
            (Distribution::K3s, false) => {
                "curl -sfL https://get.k3s.io | INSTALL_K3S_SKIP_START=true sh -s - agent"
            }
            (Distribution::Rke2, true) => "curl -sfL https://get.rke2.io | INSTALL_RKE2_TYPE=server sh -",
            (Distribution::Rke2, false) => "curl -sfL https://get.rke2.io | INSTALL_RKE2_TYPE=agent sh -",
        }
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Distribution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "k3s" => Ok(Distribution::K3s),
            "rke2" => Ok(Distribution::Rke2),
            other => Err(format!("unknown distribution '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_ports_differ() {
        assert_eq!(Distribution::K3s.join_port(), 6443);
        assert_eq!(Distribution::Rke2.join_port(), 9345);
    }

    #[test]
    fn parse_and_display() {
        assert_eq!("RKE2".parse::<Distribution>().unwrap(), Distribution::Rke2);
        assert_eq!(Distribution::default().to_string(), "k3s");
        assert!("kubeadm".parse::<Distribution>().is_err());
    }
}
